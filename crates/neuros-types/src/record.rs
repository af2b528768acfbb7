//! Canonical memory records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RecordId;

/// Lowest importance a record may carry.
pub const MIN_IMPORTANCE: u8 = 1;
/// Highest importance a record may carry.
pub const MAX_IMPORTANCE: u8 = 10;

/// Clamp `importance` into `[MIN_IMPORTANCE, MAX_IMPORTANCE]`.
pub fn clamp_importance(importance: u8) -> u8 {
    importance.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE)
}

/// Free-form context attached to a record (provenance, tags, project, …).
///
/// A `BTreeMap` keeps key order stable so derived facts and exports are
/// deterministic.
pub type Context = BTreeMap<String, Value>;

/// Context key holding the record's tag list.
pub const TAGS_KEY: &str = "tags";

// ─────────────────────────────────────────────────────────────────────────────
// Content
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of payload a record carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    #[default]
    Text,
    Image,
    Audio,
    Document,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Modality::Text),
            "image" => Some(Modality::Image),
            "audio" => Some(Modality::Audio),
            "document" => Some(Modality::Document),
            _ => None,
        }
    }
}

/// Payload plus modality tag.
///
/// For non-text modalities the payload is a caption, transcript or
/// reference; it is what gets embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub payload: String,
    #[serde(default)]
    pub modality: Modality,
}

impl Content {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            modality: Modality::Text,
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::text(s)
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::text(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a record's embedding fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    /// Fanout has been enqueued but not yet acknowledged.
    Pending,
    /// The embedding matches the current content version.
    Ready,
    /// Fanout exhausted its retries; the record is only reachable
    /// structurally until it is re-embedded.
    Degraded,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Ready => "ready",
            EmbeddingStatus::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EmbeddingStatus::Pending),
            "ready" => Some(EmbeddingStatus::Ready),
            "degraded" => Some(EmbeddingStatus::Degraded),
            _ => None,
        }
    }
}

/// A dense vector together with the identity it was computed under.
///
/// The model version is part of the vector's identity: vectors from
/// different model versions are never compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model_version: String,
    /// Record version whose content produced this vector.
    pub content_version: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryRecord
// ─────────────────────────────────────────────────────────────────────────────

/// The canonical, authoritative form of one piece of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub content: Content,
    pub context: Context,
    /// Importance in `[1, 10]`.
    pub importance: u8,
    pub embedding: Option<Embedding>,
    pub embedding_status: EmbeddingStatus,
    /// Incremented on every content, context or importance mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the record has been tombstoned.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Earliest time at which a tombstoned record may be physically purged.
    pub purge_after: Option<DateTime<Utc>>,
    /// Records this one was derived from.
    pub derived_from: Vec<RecordId>,
}

impl MemoryRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Tags stored under the `tags` context key.
    pub fn tags(&self) -> Vec<String> {
        tags_of(&self.context)
    }

    /// `true` when the embedding exists and was computed from the current
    /// content version.
    pub fn embedding_is_current(&self) -> bool {
        self.embedding
            .as_ref()
            .is_some_and(|e| e.content_version == self.version)
    }
}

/// Extract the tag list from a context map.
///
/// A single string under `tags` is treated as a one-element list.
pub fn tags_of(context: &Context) -> Vec<String> {
    match context.get(TAGS_KEY) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Input for a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub content: Content,
    #[serde(default)]
    pub context: Context,
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(default)]
    pub derived_from: Vec<RecordId>,
}

fn default_importance() -> u8 {
    MIN_IMPORTANCE
}

impl NewRecord {
    pub fn new(content: impl Into<Content>, context: Context) -> Self {
        Self {
            content: content.into(),
            context,
            importance: MIN_IMPORTANCE,
            derived_from: Vec::new(),
        }
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = clamp_importance(importance);
        self
    }

    pub fn derived_from(mut self, parents: impl IntoIterator<Item = RecordId>) -> Self {
        self.derived_from.extend(parents);
        self
    }
}

/// Partial update applied under optimistic concurrency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub content: Option<Content>,
    pub context: Option<Context>,
    pub importance: Option<u8>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.context.is_none() && self.importance.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Change feed
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Write,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Write => "write",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "write" => Some(ChangeKind::Write),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// One entry of the record store's append-only change feed.
///
/// `seq` is strictly increasing; consumers use it as an idempotency
/// watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub record_id: RecordId,
    pub kind: ChangeKind,
    pub tags: Vec<String>,
    pub importance: u8,
    pub at: DateTime<Utc>,
}
