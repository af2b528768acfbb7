//! Preference Learner.
//!
//! The sole writer of [`ParameterSnapshot`]s. Feedback is queued on an mpsc
//! channel and applied one event at a time by a single task; every applied
//! event publishes a fresh `Arc` snapshot through a `watch` channel, so
//! readers either see the old snapshot or the new one, never a mix.
//!
//! ## Update rules
//!
//! Attribution comes from the trace the feedback refers to. The share of
//! each source in the fused scores of the trace's evidence is
//!
//! ```text
//! share_s = Σ w_s · breakdown_s / Σ_s Σ w_s · breakdown_s
//! ```
//!
//! and the weights move by an exponential moving average:
//!
//! | signal | target            | step |
//! |--------|-------------------|------|
//! | accept | `share`           | α    |
//! | reject | `(1 − share) / 2` | α    |
//! | edit   | `share`           | α/2  |
//!
//! then are floored at [`MIN_WEIGHT`] and renormalised. Rules that fired in
//! the trace move by β: `c += β(1 − c)` on accept, `c −= βc` on reject and
//! `c −= (β/2)c` on edit.

use std::collections::BTreeSet;
use std::sync::Arc;

use neuros_types::{
    EvidenceRef, FeedbackSignal, NeurosError, ParameterSnapshot, RankingWeights, ReasoningTrace,
    Source, TraceId,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// No source is ever weighted below this before renormalisation.
pub const MIN_WEIGHT: f32 = 0.05;

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRates {
    /// α, step of the weight EMA.
    pub weights: f32,
    /// β, step of rule confidence updates.
    pub confidence: f32,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            weights: 0.1,
            confidence: 0.2,
        }
    }
}

/// Feedback together with what the trace attributes it to.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackEvent {
    pub trace_id: TraceId,
    pub signal: FeedbackSignal,
    pub evidence: Vec<EvidenceRef>,
    pub fired_rules: BTreeSet<String>,
}

impl FeedbackEvent {
    /// Build the event for a finished trace.
    pub fn for_trace(trace: &ReasoningTrace, signal: FeedbackSignal) -> Result<Self, NeurosError> {
        if !trace.is_terminal() {
            return Err(NeurosError::TraceNotFinished(trace.id()));
        }
        Ok(Self {
            trace_id: trace.id(),
            signal,
            evidence: trace.evidence().cloned().collect(),
            fired_rules: trace.fired_rules(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Update arithmetic
// ─────────────────────────────────────────────────────────────────────────────

/// Per-source share of the evidence scores under `weights`, or `None` when
/// nothing contributed.
fn contribution_shares(weights: &RankingWeights, evidence: &[EvidenceRef]) -> Option<RankingWeights> {
    let raw = RankingWeights::from_fn(|s| {
        evidence
            .iter()
            .map(|e| weights.get(s) * e.breakdown.get(s).unwrap_or(0.0))
            .sum()
    });
    let total: f32 = Source::ALL.iter().map(|s| raw.get(*s)).sum();
    if !total.is_finite() || total <= f32::EPSILON {
        return None;
    }
    Some(RankingWeights::from_fn(|s| raw.get(s) / total))
}

/// The snapshot that results from applying `event` to `current`.
pub fn apply_feedback(
    current: &ParameterSnapshot,
    event: &FeedbackEvent,
    rates: LearningRates,
) -> ParameterSnapshot {
    let weights = current.weights.normalized();
    let (alpha, beta) = (rates.weights, rates.confidence);

    let weights = match contribution_shares(&weights, &event.evidence) {
        Some(share) => {
            let (target, step) = match event.signal {
                FeedbackSignal::Accept => (share, alpha),
                FeedbackSignal::Reject => (RankingWeights::from_fn(|s| (1.0 - share.get(s)) / 2.0), alpha),
                FeedbackSignal::Edit(_) => (share, alpha / 2.0),
            };
            RankingWeights::from_fn(|s| {
                ((1.0 - step) * weights.get(s) + step * target.get(s)).max(MIN_WEIGHT)
            })
            .normalized()
        }
        None => weights,
    };

    let mut rule_confidences = current.rule_confidences.clone();
    for rule in &event.fired_rules {
        let c = current.confidence(rule);
        let next = match event.signal {
            FeedbackSignal::Accept => c + beta * (1.0 - c),
            FeedbackSignal::Reject => c - beta * c,
            FeedbackSignal::Edit(_) => c - (beta / 2.0) * c,
        };
        rule_confidences.insert(rule.clone(), next.clamp(0.0, 1.0));
    }

    ParameterSnapshot {
        version: current.version + 1,
        weights,
        rule_confidences,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PreferenceLearner
// ─────────────────────────────────────────────────────────────────────────────

struct Submission {
    event: FeedbackEvent,
    ack: Option<oneshot::Sender<Arc<ParameterSnapshot>>>,
}

/// Handle to the learner task. Cheap to clone.
#[derive(Clone)]
pub struct PreferenceLearner {
    tx: mpsc::Sender<Submission>,
    snapshots: watch::Receiver<Arc<ParameterSnapshot>>,
}

impl PreferenceLearner {
    /// Start the learner task on the current Tokio runtime.
    pub fn spawn(initial: ParameterSnapshot, rates: LearningRates) -> Self {
        let (tx, mut rx) = mpsc::channel::<Submission>(QUEUE_DEPTH);
        let (publish, snapshots) = watch::channel(Arc::new(initial));

        tokio::spawn(async move {
            while let Some(Submission { event, ack }) = rx.recv().await {
                let current = publish.borrow().clone();
                let next = Arc::new(apply_feedback(&current, &event, rates));
                debug!(
                    trace = %event.trace_id,
                    version = next.version,
                    structured = next.weights.structured,
                    vector = next.weights.vector,
                    analytical = next.weights.analytical,
                    "parameters updated"
                );
                publish.send_replace(next.clone());
                if let Some(ack) = ack {
                    let _ = ack.send(next);
                }
            }
            info!("preference learner stopped");
        });

        Self { tx, snapshots }
    }

    /// The snapshot current at the time of the call.
    pub fn snapshot(&self) -> Arc<ParameterSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ParameterSnapshot>> {
        self.snapshots.clone()
    }

    /// Queue `event` without waiting for it to be applied.
    pub async fn submit(&self, event: FeedbackEvent) -> Result<(), NeurosError> {
        self.tx
            .send(Submission { event, ack: None })
            .await
            .map_err(|_| NeurosError::Storage("preference learner has stopped".into()))
    }

    /// Queue `event` and wait for the snapshot that includes it.
    pub async fn submit_and_wait(
        &self,
        event: FeedbackEvent,
    ) -> Result<Arc<ParameterSnapshot>, NeurosError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Submission {
                event,
                ack: Some(ack),
            })
            .await
            .map_err(|_| NeurosError::Storage("preference learner has stopped".into()))?;
        done.await
            .map_err(|_| NeurosError::Storage("preference learner dropped the update".into()))
    }
}
