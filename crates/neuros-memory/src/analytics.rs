//! Analytical Projector.
//!
//! Event-sourced aggregates computed from the record store's change feed.
//!
//! ## Model
//!
//! For every record the projector tracks how often it was written, when it
//! was last touched, its importance and its tags. For every tag it counts
//! write/update activity per UTC day.
//!
//! ### Recency score
//!
//! The analytical boost of a record combines an exponential recency decay
//! with write frequency and importance:
//!
//! ```text
//! decay     = 0.5 ^ ((as_of − last_touched) / half_life)
//! frequency = 1 − 0.5 ^ touches
//! score     = decay × (frequency + importance / 10) / 2
//! ```
//!
//! `as_of` is the timestamp of the newest applied event, not the wall clock,
//! so scores only change when the projection does.
//!
//! ### Idempotency
//!
//! Events carry a strictly increasing `seq`. The projector keeps the highest
//! applied `seq` as a watermark and ignores anything at or below it, so the
//! feed can be replayed from any earlier point after a crash.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use neuros_types::record::MAX_IMPORTANCE;
use neuros_types::{ChangeEvent, ChangeKind, RecordId};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Aggregates
// ─────────────────────────────────────────────────────────────────────────────

/// Per-record aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAggregate {
    /// Number of write and update events.
    pub touches: u64,
    pub last_touched: DateTime<Utc>,
    pub importance: u8,
    pub tags: Vec<String>,
    pub deleted: bool,
}

/// Point-in-time view of the projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
    /// Highest applied change sequence number.
    pub watermark: u64,
    pub as_of: Option<DateTime<Utc>>,
    pub live_records: usize,
    pub tag_counts: BTreeMap<String, u64>,
}

#[derive(Default)]
struct ProjectionState {
    watermark: u64,
    as_of: Option<DateTime<Utc>>,
    records: BTreeMap<RecordId, RecordAggregate>,
    tag_days: BTreeMap<NaiveDate, BTreeMap<String, u64>>,
}

impl ProjectionState {
    fn apply(&mut self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Write | ChangeKind::Update => {
                let agg = self
                    .records
                    .entry(event.record_id)
                    .or_insert_with(|| RecordAggregate {
                        touches: 0,
                        last_touched: event.at,
                        importance: event.importance,
                        tags: Vec::new(),
                        deleted: false,
                    });
                agg.touches += 1;
                agg.last_touched = agg.last_touched.max(event.at);
                agg.importance = event.importance;
                agg.tags = event.tags.clone();
                agg.deleted = false;

                let day = self.tag_days.entry(event.at.date_naive()).or_default();
                for tag in &event.tags {
                    *day.entry(tag.clone()).or_insert(0) += 1;
                }
            }
            ChangeKind::Delete => {
                if let Some(agg) = self.records.get_mut(&event.record_id) {
                    agg.deleted = true;
                    agg.last_touched = agg.last_touched.max(event.at);
                }
            }
        }
        self.watermark = event.seq;
        self.as_of = Some(self.as_of.map_or(event.at, |t| t.max(event.at)));
    }

    fn tag_counts_through(&self, day: Option<NaiveDate>) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        let buckets = self
            .tag_days
            .iter()
            .take_while(|(d, _)| day.is_none_or(|limit| **d <= limit));
        for (_, counts) in buckets {
            for (tag, n) in counts {
                *totals.entry(tag.clone()).or_insert(0) += n;
            }
        }
        totals
    }
}

fn recency_score(agg: &RecordAggregate, as_of: DateTime<Utc>, half_life: Duration) -> f32 {
    let age = (as_of - agg.last_touched).num_milliseconds().max(0) as f64;
    let half_life = half_life.num_milliseconds().max(1) as f64;
    let decay = 0.5f64.powf(age / half_life);
    let frequency = 1.0 - 0.5f64.powi(agg.touches.min(64) as i32);
    let importance = f64::from(agg.importance) / f64::from(MAX_IMPORTANCE);
    (decay * (frequency + importance) / 2.0) as f32
}

// ─────────────────────────────────────────────────────────────────────────────
// AnalyticalProjector
// ─────────────────────────────────────────────────────────────────────────────

/// Incrementally maintained analytical view of the record store.
pub struct AnalyticalProjector {
    half_life: Duration,
    state: RwLock<ProjectionState>,
}

impl AnalyticalProjector {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life,
            state: RwLock::new(ProjectionState::default()),
        }
    }

    /// Apply `events` in order, skipping any at or below the watermark.
    ///
    /// Returns the number of events actually applied.
    pub fn apply(&self, events: &[ChangeEvent]) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut applied = 0;
        for event in events {
            if event.seq <= state.watermark {
                continue;
            }
            state.apply(event);
            applied += 1;
        }
        applied
    }

    pub fn watermark(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .watermark
    }

    /// Timestamp of the newest applied event.
    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_of
    }

    pub fn aggregate(&self, id: RecordId) -> Option<RecordAggregate> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.records.get(&id).cloned()
    }

    /// Recency score of a live record in `[0, 1]`.
    pub fn recency(&self, id: RecordId) -> Option<f32> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let as_of = state.as_of?;
        state
            .records
            .get(&id)
            .filter(|agg| !agg.deleted)
            .map(|agg| recency_score(agg, as_of, self.half_life))
    }

    /// Recency scores of every live record.
    pub fn scores(&self) -> BTreeMap<RecordId, f32> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(as_of) = state.as_of else {
            return BTreeMap::new();
        };
        state
            .records
            .iter()
            .filter(|(_, agg)| !agg.deleted)
            .map(|(id, agg)| (*id, recency_score(agg, as_of, self.half_life)))
            .collect()
    }

    /// Tag activity counted over every day up to and including `day`.
    pub fn tag_counts_as_of(&self, day: NaiveDate) -> BTreeMap<String, u64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.tag_counts_through(Some(day))
    }

    pub fn snapshot(&self) -> ProjectionSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        ProjectionSnapshot {
            watermark: state.watermark,
            as_of: state.as_of,
            live_records: state.records.values().filter(|a| !a.deleted).count(),
            tag_counts: state.tag_counts_through(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn event(seq: u64, id: i64, kind: ChangeKind, tags: &[&str], when: DateTime<Utc>) -> ChangeEvent {
        ChangeEvent {
            seq,
            record_id: RecordId(id),
            kind,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            importance: 1,
            at: when,
        }
    }

    fn feed() -> Vec<ChangeEvent> {
        vec![
            event(1, 1, ChangeKind::Write, &["work"], at(1, 9)),
            event(2, 2, ChangeKind::Write, &["work", "q2"], at(2, 9)),
            event(3, 1, ChangeKind::Update, &["work"], at(3, 9)),
            event(4, 3, ChangeKind::Write, &[], at(3, 10)),
        ]
    }

    #[test]
    fn replaying_applied_events_is_a_noop() {
        let p = AnalyticalProjector::new(Duration::days(7));
        assert_eq!(p.apply(&feed()), 4);
        let before = p.snapshot();
        assert_eq!(p.apply(&feed()), 0);
        assert_eq!(p.snapshot(), before);
        assert_eq!(p.watermark(), 4);
    }

    #[test]
    fn partial_replay_resumes_from_watermark() {
        let events = feed();
        let whole = AnalyticalProjector::new(Duration::days(7));
        whole.apply(&events);

        let resumed = AnalyticalProjector::new(Duration::days(7));
        resumed.apply(&events[..2]);
        // Crash after seq 2: the whole feed is replayed.
        assert_eq!(resumed.apply(&events), 2);
        assert_eq!(resumed.snapshot(), whole.snapshot());
        assert_eq!(resumed.scores(), whole.scores());
    }

    #[test]
    fn tag_counts_are_bucketed_by_day() {
        let p = AnalyticalProjector::new(Duration::days(7));
        p.apply(&feed());
        let day1 = p.tag_counts_as_of(at(1, 0).date_naive());
        assert_eq!(day1.get("work"), Some(&1));
        assert_eq!(day1.get("q2"), None);

        let day3 = p.tag_counts_as_of(at(3, 0).date_naive());
        assert_eq!(day3.get("work"), Some(&3));
        assert_eq!(day3.get("q2"), Some(&1));
    }

    #[test]
    fn recent_records_score_higher() {
        let p = AnalyticalProjector::new(Duration::days(1));
        p.apply(&[
            event(1, 1, ChangeKind::Write, &[], at(1, 0)),
            event(2, 2, ChangeKind::Write, &[], at(2, 0)),
        ]);
        let old = p.recency(RecordId(1)).unwrap();
        let fresh = p.recency(RecordId(2)).unwrap();
        // One half-life apart with equal frequency and importance.
        assert!((old * 2.0 - fresh).abs() < 1e-6);
    }

    #[test]
    fn frequent_writes_raise_the_score() {
        let p = AnalyticalProjector::new(Duration::days(1));
        p.apply(&[
            event(1, 1, ChangeKind::Write, &[], at(1, 0)),
            event(2, 2, ChangeKind::Write, &[], at(1, 0)),
            event(3, 2, ChangeKind::Update, &[], at(1, 0)),
        ]);
        assert!(p.recency(RecordId(2)).unwrap() > p.recency(RecordId(1)).unwrap());
        assert_eq!(p.aggregate(RecordId(2)).unwrap().touches, 2);
    }

    #[test]
    fn deleted_records_have_no_score() {
        let p = AnalyticalProjector::new(Duration::days(1));
        p.apply(&[
            event(1, 1, ChangeKind::Write, &[], at(1, 0)),
            event(2, 1, ChangeKind::Delete, &[], at(1, 1)),
        ]);
        assert!(p.recency(RecordId(1)).is_none());
        assert!(p.scores().is_empty());
        assert_eq!(p.snapshot().live_records, 0);
    }

    #[test]
    fn empty_projection() {
        let p = AnalyticalProjector::new(Duration::days(1));
        assert!(p.as_of().is_none());
        assert!(p.scores().is_empty());
        assert_eq!(p.snapshot().watermark, 0);
    }
}
