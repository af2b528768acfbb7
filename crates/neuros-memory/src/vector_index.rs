//! Vector Index.
//!
//! Nearest-neighbour lookup over record embeddings. Each entry is keyed by
//! the canonical [`RecordId`] and remembers the embedding model version and
//! the record content version it was computed from, so the fusion layer can
//! evict vectors whose content has been superseded.
//!
//! Searches only compare vectors produced by the same model version as the
//! query; vectors from other models are invisible until re-embedded.
//!
//! # Example
//!
//! ```rust
//! use neuros_memory::vector_index::{InMemoryVectorIndex, VectorIndex};
//! use neuros_types::{Embedding, RecordId};
//!
//! let index = InMemoryVectorIndex::new(2);
//! let e = Embedding { vector: vec![1.0, 0.0], model_version: "m".into(), content_version: 1 };
//! index.upsert(RecordId(1), &e).unwrap();
//!
//! let hits = index.search(&[1.0, 0.0], "m", 5).unwrap();
//! assert_eq!(hits[0].id, RecordId(1));
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use neuros_types::{Embedding, NeurosError, RecordId};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl From<IndexError> for NeurosError {
    fn from(e: IndexError) -> Self {
        NeurosError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cosine similarity
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorIndex trait
// ─────────────────────────────────────────────────────────────────────────────

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub id: RecordId,
    pub similarity: f32,
    /// Record version the vector was computed from.
    pub content_version: u64,
}

/// Fixed-dimension nearest-neighbour index keyed by record id.
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Insert or replace the vector for `id`.
    ///
    /// Returns `Ok(false)` without changing anything when the index already
    /// holds a vector for a newer content version.
    fn upsert(&self, id: RecordId, embedding: &Embedding) -> Result<bool, IndexError>;

    /// Remove the vector for `id`. Returns whether one was present.
    fn remove(&self, id: RecordId) -> bool;

    /// Remove the vector for `id` only if it was computed from
    /// `content_version`.
    fn remove_if_version(&self, id: RecordId, content_version: u64) -> bool;

    /// The `m` nearest vectors of `model_version` by descending cosine
    /// similarity; ties keep insertion order.
    fn search(
        &self,
        query: &[f32],
        model_version: &str,
        m: usize,
    ) -> Result<Vec<VectorHit>, IndexError>;

    /// Content version of the vector held for `id`, if any.
    fn content_version(&self, id: RecordId) -> Option<u64>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryVectorIndex
// ─────────────────────────────────────────────────────────────────────────────

struct IndexedVector {
    vector: Vec<f32>,
    model_version: String,
    content_version: u64,
    /// Insertion order; reassigned when the vector is replaced.
    seq: u64,
}

#[derive(Default)]
struct IndexState {
    next_seq: u64,
    entries: HashMap<RecordId, IndexedVector>,
}

/// Exact (brute-force) cosine index held in memory.
///
/// Rebuilt on startup from the embeddings persisted in the record store.
pub struct InMemoryVectorIndex {
    dimension: usize,
    state: RwLock<IndexState>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(IndexState::default()),
        }
    }

    fn check_dimension(&self, len: usize) -> Result<(), IndexError> {
        if len == self.dimension {
            Ok(())
        } else {
            Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: len,
            })
        }
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn upsert(&self, id: RecordId, embedding: &Embedding) -> Result<bool, IndexError> {
        self.check_dimension(embedding.vector.len())?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.entries.get(&id) {
            if existing.content_version > embedding.content_version {
                return Ok(false);
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            IndexedVector {
                vector: embedding.vector.clone(),
                model_version: embedding.model_version.clone(),
                content_version: embedding.content_version,
                seq,
            },
        );
        Ok(true)
    }

    fn remove(&self, id: RecordId) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.remove(&id).is_some()
    }

    fn remove_if_version(&self, id: RecordId, content_version: u64) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get(&id) {
            Some(v) if v.content_version == content_version => {
                state.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn search(
        &self,
        query: &[f32],
        model_version: &str,
        m: usize,
    ) -> Result<Vec<VectorHit>, IndexError> {
        self.check_dimension(query.len())?;
        if m == 0 {
            return Ok(Vec::new());
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(u64, VectorHit)> = state
            .entries
            .iter()
            .filter(|(_, v)| v.model_version == model_version)
            .map(|(id, v)| {
                let hit = VectorHit {
                    id: *id,
                    similarity: cosine_similarity(&v.vector, query),
                    content_version: v.content_version,
                };
                (v.seq, hit)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.similarity
                .total_cmp(&a.1.similarity)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(m);
        Ok(scored.into_iter().map(|(_, hit)| hit).collect())
    }

    fn content_version(&self, id: RecordId) -> Option<u64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(&id).map(|v| v.content_version)
    }

    fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
