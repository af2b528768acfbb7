//! Conjunctive predicates over record context.
//!
//! A [`Filter`] is a list of [`Predicate`]s that must all hold. The empty
//! filter matches every live record.
//!
//! ```
//! use neuros_types::Filter;
//! use serde_json::json;
//!
//! let filter = Filter::new()
//!     .eq("project", json!("X"))
//!     .range("budget", Some(10.0), None);
//! assert_eq!(filter.predicates().len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::MemoryRecord;

/// A single condition on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// `context[key] == value`.
    Eq { key: String, value: Value },
    /// Numeric `context[key]` within `[min, max]` (either bound optional).
    Range {
        key: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// `context[key]` is an array containing `value`, or equals it.
    Contains { key: String, value: Value },
    /// `context[key]` is present.
    Exists { key: String },
    /// Record importance is at least `min`.
    MinImportance { min: u8 },
}

impl Predicate {
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            Predicate::Eq { key, value } => record.context.get(key) == Some(value),
            Predicate::Range { key, min, max } => {
                let Some(n) = record.context.get(key).and_then(Value::as_f64) else {
                    return false;
                };
                min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi)
            }
            Predicate::Contains { key, value } => match record.context.get(key) {
                Some(Value::Array(items)) => items.contains(value),
                Some(other) => other == value,
                None => false,
            },
            Predicate::Exists { key } => record.context.contains_key(key),
            Predicate::MinImportance { min } => record.importance >= *min,
        }
    }
}

/// Conjunction of [`Predicate`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn eq(self, key: impl Into<String>, value: Value) -> Self {
        self.with(Predicate::Eq {
            key: key.into(),
            value,
        })
    }

    pub fn range(self, key: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        self.with(Predicate::Range {
            key: key.into(),
            min,
            max,
        })
    }

    pub fn contains(self, key: impl Into<String>, value: Value) -> Self {
        self.with(Predicate::Contains {
            key: key.into(),
            value,
        })
    }

    /// Shorthand for `contains("tags", tag)`.
    pub fn tag(self, tag: impl Into<String>) -> Self {
        self.contains(crate::record::TAGS_KEY, Value::String(tag.into()))
    }

    pub fn exists(self, key: impl Into<String>) -> Self {
        self.with(Predicate::Exists { key: key.into() })
    }

    pub fn min_importance(self, min: u8) -> Self {
        self.with(Predicate::MinImportance { min })
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// `true` when every predicate holds for `record`.
    ///
    /// Tombstones are not considered here; stores exclude them before
    /// applying filters.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }
}
