//! Embedding providers.
//!
//! The fusion layer treats embedding as a black box behind
//! [`EmbeddingProvider`]. Two implementations ship with the runtime:
//!
//! | Provider | Backing | Model version |
//! |---|---|---|
//! | [`HashingEmbedder`] | local feature hashing, no I/O | `hashing-v1-<dim>` |
//! | [`OllamaEmbedder`] | `POST {base}/api/embeddings` | `ollama:<model>` |
//!
//! The model version is part of every stored vector's identity, so
//! switching providers makes old vectors invisible until `reconcile`
//! re-embeds them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    #[error("Expected {expected}-dimensional vector, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identity of the model; stored alongside every vector it produces.
    fn model_version(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokenization
// ─────────────────────────────────────────────────────────────────────────────

/// Lowercase alphanumeric terms of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// HashingEmbedder
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_HASHING_DIMENSION: usize = 256;

/// Deterministic bag-of-words embedder.
///
/// Terms are hashed into fixed buckets with FNV-1a and weighted by term
/// frequency times `1 + ln(len)`, then L2-normalised. Identical text always
/// yields the identical vector, which keeps ranking reproducible.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_version: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_version: format!("hashing-v1-{dimension}"),
        }
    }

    fn bucket(term: &str, dimension: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % dimension as u64) as usize
    }

    /// Synchronous core of [`EmbeddingProvider::embed`].
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut out = vec![0.0f32; self.dimension];
        if tokens.is_empty() {
            return out;
        }

        let mut tf: BTreeMap<&str, f32> = BTreeMap::new();
        for tok in &tokens {
            *tf.entry(tok.as_str()).or_default() += 1.0;
        }
        let total = tokens.len() as f32;
        for (term, count) in tf {
            let weight = (count / total) * (1.0 + (term.chars().count() as f32).ln());
            out[Self::bucket(term, self.dimension)] += weight;
        }

        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vector(text))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OllamaEmbedder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for a local Ollama server's embedding endpoint.
///
/// The dimension is declared up front and every response is checked
/// against it; the vector index rejects mismatches anyway.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    model_version: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        let model = model.into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_version: format!("ollama:{model}"),
            model,
            dimension,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response: EmbeddingResponse = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.embedding.is_empty() {
            return Err(EmbeddingError::BadResponse("empty embedding".into()));
        }
        if response.embedding.len() != self.dimension {
            return Err(EmbeddingError::Dimension {
                expected: self.dimension,
                actual: response.embedding.len(),
            });
        }
        Ok(response.embedding)
    }
}
