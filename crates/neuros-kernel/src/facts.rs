//! Ground facts and the fact base.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use neuros_types::MemoryRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::parser::parse_fact;

/// Context key whose entries are parsed as explicit facts.
pub const FACTS_KEY: &str = "facts";

/// A ground tuple `predicate(arg, …)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fact {
    pub predicate: String,
    pub args: Vec<String>,
}

impl Fact {
    pub fn new<I, S>(predicate: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            predicate: predicate.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.predicate, self.args.join(", "))
    }
}

/// Facts indexed by predicate; iteration order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactSet {
    by_predicate: BTreeMap<String, BTreeSet<Vec<String>>>,
    len: usize,
}

impl FactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the fact was not already present.
    pub fn insert(&mut self, fact: Fact) -> bool {
        let added = self
            .by_predicate
            .entry(fact.predicate)
            .or_default()
            .insert(fact.args);
        if added {
            self.len += 1;
        }
        added
    }

    pub fn contains(&self, predicate: &str, args: &[String]) -> bool {
        self.by_predicate
            .get(predicate)
            .is_some_and(|tuples| tuples.contains(args))
    }

    /// Argument tuples stored for `predicate`.
    pub fn tuples(&self, predicate: &str) -> impl Iterator<Item = &Vec<String>> {
        self.by_predicate.get(predicate).into_iter().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = Fact> + '_ {
        self.by_predicate.iter().flat_map(|(p, tuples)| {
            tuples.iter().map(move |args| Fact {
                predicate: p.clone(),
                args: args.clone(),
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FromIterator<Fact> for FactSet {
    fn from_iter<T: IntoIterator<Item = Fact>>(iter: T) -> Self {
        let mut set = FactSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<Fact> for FactSet {
    fn extend<T: IntoIterator<Item = Fact>>(&mut self, iter: T) {
        for fact in iter {
            self.insert(fact);
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Facts describing a record.
///
/// Every scalar context entry `key: value` yields `key(rN, value)`, and every
/// scalar element of an array entry yields one such fact. Strings under the
/// `facts` key are parsed as explicit ground facts; unparsable ones are
/// logged and skipped.
pub fn facts_from_record(record: &MemoryRecord) -> Vec<Fact> {
    let subject = record.id.to_string();
    let mut facts = Vec::new();
    for (key, value) in &record.context {
        if key == FACTS_KEY {
            let sources: Vec<&str> = match value {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            for source in sources {
                match parse_fact(source) {
                    Ok(fact) => facts.push(fact),
                    Err(e) => warn!(record = %record.id, error = %e, "skipping unparsable fact"),
                }
            }
            continue;
        }
        let values: Vec<String> = match value {
            Value::Array(items) => items.iter().filter_map(scalar).collect(),
            other => scalar(other).into_iter().collect(),
        };
        for v in values {
            facts.push(Fact::new(key.clone(), [subject.clone(), v]));
        }
    }
    facts
}
