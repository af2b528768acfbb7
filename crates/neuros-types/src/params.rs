//! Tunable ranking and confidence parameters.
//!
//! A [`ParameterSnapshot`] is immutable. The preference learner is the only
//! component that builds new snapshots; readers hold an `Arc` to whichever
//! snapshot was current when they looked.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::Source;

/// Confidence assumed for a rule the learner has never adjusted.
pub const DEFAULT_RULE_CONFIDENCE: f32 = 1.0;

/// Weights of the linear combination used to fuse leg scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    pub structured: f32,
    pub vector: f32,
    pub analytical: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            structured: 0.3,
            vector: 0.5,
            analytical: 0.2,
        }
    }
}

impl RankingWeights {
    pub fn new(structured: f32, vector: f32, analytical: f32) -> Self {
        Self {
            structured,
            vector,
            analytical,
        }
    }

    pub fn get(&self, source: Source) -> f32 {
        match source {
            Source::Structured => self.structured,
            Source::Vector => self.vector,
            Source::Analytical => self.analytical,
        }
    }

    /// Build weights by evaluating `f` for each source.
    pub fn from_fn(mut f: impl FnMut(Source) -> f32) -> Self {
        Self {
            structured: f(Source::Structured),
            vector: f(Source::Vector),
            analytical: f(Source::Analytical),
        }
    }

    /// Weights rescaled to sum to one.
    ///
    /// Negative or non-finite components are treated as zero; if nothing is
    /// left, the defaults are returned.
    pub fn normalized(&self) -> Self {
        let clean = Self::from_fn(|s| {
            let w = self.get(s);
            if w.is_finite() && w > 0.0 { w } else { 0.0 }
        });
        let sum = clean.structured + clean.vector + clean.analytical;
        if sum <= f32::EPSILON {
            return Self::default();
        }
        Self::from_fn(|s| clean.get(s) / sum)
    }
}

/// Feedback on a finished reasoning trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "correction", rename_all = "lowercase")]
pub enum FeedbackSignal {
    Accept,
    Reject,
    /// The user corrected the answer; carries the corrected text.
    Edit(String),
}

/// Process-wide ranking/confidence state, versioned and immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    /// Incremented by every learner update.
    pub version: u64,
    pub weights: RankingWeights,
    /// Learned confidence per rule id; absent rules use
    /// [`DEFAULT_RULE_CONFIDENCE`].
    pub rule_confidences: BTreeMap<String, f32>,
}

impl ParameterSnapshot {
    pub fn new(weights: RankingWeights) -> Self {
        Self {
            version: 0,
            weights: weights.normalized(),
            rule_confidences: BTreeMap::new(),
        }
    }

    pub fn confidence(&self, rule: &str) -> f32 {
        self.rule_confidences
            .get(rule)
            .copied()
            .unwrap_or(DEFAULT_RULE_CONFIDENCE)
    }
}

impl Default for ParameterSnapshot {
    fn default() -> Self {
        Self::new(RankingWeights::default())
    }
}
