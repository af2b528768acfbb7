//! `neuros-types` – shared vocabulary of the NEUROS workspace.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//!
//! - [`record`] – canonical [`MemoryRecord`]s, their content, context and
//!   embedding, plus the change events fed to the analytical projector.
//! - [`filter`] – conjunctive [`Filter`]s over record context.
//! - [`query`] – fused query results and per-source score breakdowns.
//! - [`trace`] – append-only [`ReasoningTrace`]s produced by the orchestrator.
//! - [`params`] – ranking weights and rule confidences published by the
//!   preference learner.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod filter;
pub mod params;
pub mod query;
pub mod record;
pub mod trace;

pub use filter::{Filter, Predicate};
pub use params::{FeedbackSignal, ParameterSnapshot, RankingWeights};
pub use query::{QueryResult, ScoreBreakdown, ScoredRecord, Source};
pub use record::{
    ChangeEvent, ChangeKind, Content, Context, Embedding, EmbeddingStatus, MemoryRecord, Modality,
    NewRecord, RecordPatch,
};
pub use trace::{
    Answer, AnswerConfidence, EvidenceRef, ReasoningStep, ReasoningTrace, RuleFiring, TraceState,
    VerificationOutcome,
};

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Canonical identifier of a memory record.
///
/// Allocated by the record store, never reused, and shared by the
/// structured, vector and analytical representations of the record.
/// Rendered as `r<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = NeurosError;

    /// Accepts both `"r12"` and `"12"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('r').unwrap_or(s);
        digits
            .parse::<i64>()
            .map(RecordId)
            .map_err(|e| NeurosError::Serialization(format!("invalid record id {s:?}: {e}")))
    }
}

/// Identifier of a reasoning trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TraceId {
    type Err = NeurosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TraceId)
            .map_err(|e| NeurosError::Serialization(format!("invalid trace id {s:?}: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning storage, fanout, rule loading and reasoning.
///
/// Only synchronous write-path failures and load-time rule rejections are
/// fatal to the calling operation; timeouts on fanout or query legs degrade
/// results instead, and reasoning failures end the affected trace only.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NeurosError {
    #[error("Write conflict on {id}: expected version {expected}, found {actual}")]
    WriteConflict {
        id: RecordId,
        expected: u64,
        actual: u64,
    },

    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Embedding timed out for {0}")]
    EmbeddingTimeout(RecordId),

    #[error("Projection timed out after change {0}")]
    ProjectionTimeout(u64),

    #[error("Query leg timed out: {0}")]
    QueryLegTimeout(Source),

    #[error("Rule set rejected: {0}")]
    RuleCycle(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Reasoning depth {0} exhausted without a final answer")]
    ReasoningDepthExceeded(usize),

    #[error("Reasoning contradiction: {0}")]
    ReasoningContradiction(String),

    #[error("Inference provider error: {0}")]
    InferenceProvider(String),

    #[error("Derived-from edge {child} -> {parent} would create a cycle")]
    ProvenanceCycle { child: RecordId, parent: RecordId },

    #[error("Trace {0} is finalized and can no longer change")]
    TraceFinalized(TraceId),

    #[error("Trace {0} has not reached a terminal state")]
    TraceNotFinished(TraceId),

    #[error("Trace not found: {0}")]
    TraceNotFound(TraceId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type NeurosResult<T> = Result<T, NeurosError>;

impl From<serde_json::Error> for NeurosError {
    fn from(e: serde_json::Error) -> Self {
        NeurosError::Serialization(e.to_string())
    }
}
