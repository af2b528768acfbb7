//! Reasoning traces.
//!
//! A [`ReasoningTrace`] is an ordered, append-only record of one reasoning
//! session. While it is running the orchestrator appends steps and moves it
//! through `Planning → Retrieving → Verifying → Synthesizing`; once it
//! reaches `Done` or `Failed` every mutating method returns
//! [`NeurosError::TraceFinalized`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::query::ScoreBreakdown;
use crate::{NeurosError, RecordId, TraceId};

/// Lifecycle state of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceState {
    Planning,
    Retrieving,
    Verifying,
    Synthesizing,
    Done,
    Failed,
}

impl TraceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceState::Done | TraceState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceState::Planning => "planning",
            TraceState::Retrieving => "retrieving",
            TraceState::Verifying => "verifying",
            TraceState::Synthesizing => "synthesizing",
            TraceState::Done => "done",
            TraceState::Failed => "failed",
        }
    }
}

/// A record retrieved as evidence, with the scores that ranked it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub id: RecordId,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

/// A rule that derived at least one new fact during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFiring {
    pub rule: String,
    pub derived: usize,
}

/// Result of checking facts against the hard constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum VerificationOutcome {
    Consistent,
    Contradiction { explanation: String },
}

impl VerificationOutcome {
    pub fn is_consistent(&self) -> bool {
        matches!(self, VerificationOutcome::Consistent)
    }
}

/// One retrieve → verify → synthesize iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub index: usize,
    /// Query fragment used for retrieval in this step.
    pub fragment: String,
    pub evidence: Vec<EvidenceRef>,
    pub rule_firings: Vec<RuleFiring>,
    pub verification: VerificationOutcome,
    /// Intermediate conclusion (refined query rationale, final answer, or
    /// failure reason).
    pub conclusion: String,
    /// Retrieval for this step ran with at least one leg dropped.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerConfidence {
    Full,
    Low,
}

/// Answer attached to a `Done` trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub confidence: AnswerConfidence,
    /// The step budget ran out before the inference provider concluded.
    pub depth_exceeded: bool,
}

/// Append-only record of one reasoning session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    id: TraceId,
    question: String,
    max_depth: usize,
    state: TraceState,
    steps: Vec<ReasoningStep>,
    answer: Option<Answer>,
    explanation: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ReasoningTrace {
    pub fn new(id: TraceId, question: impl Into<String>, max_depth: usize) -> Self {
        Self {
            id,
            question: question.into(),
            max_depth,
            state: TraceState::Planning,
            steps: Vec::new(),
            answer: None,
            explanation: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> TraceId {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    pub fn answer(&self) -> Option<&Answer> {
        self.answer.as_ref()
    }

    /// Human-readable reason for a `Failed` trace.
    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Ids of every rule that fired in any step.
    pub fn fired_rules(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|s| s.rule_firings.iter().map(|f| f.rule.clone()))
            .collect()
    }

    /// All evidence across steps, in step order.
    pub fn evidence(&self) -> impl Iterator<Item = &EvidenceRef> {
        self.steps.iter().flat_map(|s| s.evidence.iter())
    }

    fn ensure_open(&self) -> Result<(), NeurosError> {
        if self.is_terminal() {
            Err(NeurosError::TraceFinalized(self.id))
        } else {
            Ok(())
        }
    }

    /// Move to a non-terminal state.
    pub fn transition(&mut self, state: TraceState) -> Result<(), NeurosError> {
        self.ensure_open()?;
        debug_assert!(!state.is_terminal(), "use complete() or fail()");
        self.state = state;
        Ok(())
    }

    /// Append a step; its index is assigned here.
    pub fn append_step(&mut self, mut step: ReasoningStep) -> Result<(), NeurosError> {
        self.ensure_open()?;
        step.index = self.steps.len();
        self.steps.push(step);
        Ok(())
    }

    /// Finish as `Done` with `answer`.
    pub fn complete(&mut self, answer: Answer) -> Result<(), NeurosError> {
        self.ensure_open()?;
        self.answer = Some(answer);
        self.state = TraceState::Done;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Finish as `Failed` with a human-readable `explanation`.
    pub fn fail(&mut self, explanation: impl Into<String>) -> Result<(), NeurosError> {
        self.ensure_open()?;
        self.explanation = Some(explanation.into());
        self.state = TraceState::Failed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(fragment: &str, rules: &[&str]) -> ReasoningStep {
        ReasoningStep {
            index: 99,
            fragment: fragment.into(),
            evidence: vec![EvidenceRef {
                id: RecordId(1),
                score: 0.5,
                breakdown: ScoreBreakdown::default(),
            }],
            rule_firings: rules
                .iter()
                .map(|r| RuleFiring {
                    rule: (*r).into(),
                    derived: 1,
                })
                .collect(),
            verification: VerificationOutcome::Consistent,
            conclusion: String::new(),
            degraded: false,
        }
    }

    #[test]
    fn steps_are_indexed_in_order() {
        let mut t = ReasoningTrace::new(TraceId::new(), "q", 3);
        t.append_step(step("a", &[])).unwrap();
        t.append_step(step("b", &[])).unwrap();
        assert_eq!(t.steps()[0].index, 0);
        assert_eq!(t.steps()[1].index, 1);
        assert_eq!(t.steps()[1].fragment, "b");
    }

    #[test]
    fn done_trace_is_immutable() {
        let mut t = ReasoningTrace::new(TraceId::new(), "q", 3);
        t.transition(TraceState::Retrieving).unwrap();
        t.complete(Answer {
            text: "yes".into(),
            confidence: AnswerConfidence::Full,
            depth_exceeded: false,
        })
        .unwrap();
        assert_eq!(t.state(), TraceState::Done);
        assert!(t.finished_at().is_some());
        assert!(matches!(
            t.append_step(step("late", &[])),
            Err(NeurosError::TraceFinalized(_))
        ));
        assert!(matches!(t.fail("nope"), Err(NeurosError::TraceFinalized(_))));
        assert!(matches!(
            t.transition(TraceState::Retrieving),
            Err(NeurosError::TraceFinalized(_))
        ));
        assert!(t.steps().is_empty());
    }

    #[test]
    fn failed_trace_keeps_explanation() {
        let mut t = ReasoningTrace::new(TraceId::new(), "q", 3);
        t.fail("two deadlines").unwrap();
        assert_eq!(t.state(), TraceState::Failed);
        assert_eq!(t.explanation(), Some("two deadlines"));
        assert!(t.answer().is_none());
    }

    #[test]
    fn fired_rules_are_collected_across_steps() {
        let mut t = ReasoningTrace::new(TraceId::new(), "q", 3);
        t.append_step(step("a", &["r1", "r2"])).unwrap();
        t.append_step(step("b", &["r2", "r3"])).unwrap();
        let fired: Vec<String> = t.fired_rules().into_iter().collect();
        assert_eq!(fired, vec!["r1", "r2", "r3"]);
        assert_eq!(t.evidence().count(), 2);
    }

    #[test]
    fn trace_serde_roundtrip_preserves_state() {
        let mut t = ReasoningTrace::new(TraceId::new(), "q", 2);
        t.append_step(step("a", &["r1"])).unwrap();
        t.fail("boom").unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: ReasoningTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
