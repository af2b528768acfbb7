//! Fused query results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RecordId;

/// The three retrieval legs of a hybrid query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Structured,
    Vector,
    Analytical,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Structured, Source::Vector, Source::Analytical];
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Structured => "structured",
            Source::Vector => "vector",
            Source::Analytical => "analytical",
        };
        f.write_str(s)
    }
}

/// Per-source scores that went into a fused score.
///
/// `None` means the leg did not score this record (no match, or the leg was
/// dropped).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub structured: Option<f32>,
    pub vector: Option<f32>,
    pub analytical: Option<f32>,
}

impl ScoreBreakdown {
    pub fn get(&self, source: Source) -> Option<f32> {
        match source {
            Source::Structured => self.structured,
            Source::Vector => self.vector,
            Source::Analytical => self.analytical,
        }
    }

    pub fn set(&mut self, source: Source, score: f32) {
        let slot = match source {
            Source::Structured => &mut self.structured,
            Source::Vector => &mut self.vector,
            Source::Analytical => &mut self.analytical,
        };
        *slot = Some(score);
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub id: RecordId,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
    /// Set when a leg answered from a view lagging beyond the staleness
    /// bound; the value is the point in time that view reflects.
    pub as_of: Option<DateTime<Utc>>,
}

/// Ranked output of a hybrid query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub hits: Vec<ScoredRecord>,
    /// `true` when at least one leg was dropped.
    pub degraded: bool,
    pub dropped_legs: Vec<Source>,
    pub as_of: Option<DateTime<Utc>>,
}

impl QueryResult {
    pub fn ids(&self) -> Vec<RecordId> {
        self.hits.iter().map(|h| h.id).collect()
    }

    pub fn position(&self, id: RecordId) -> Option<usize> {
        self.hits.iter().position(|h| h.id == id)
    }

    pub fn is_stale(&self) -> bool {
        self.as_of.is_some()
    }
}
