//! [`Orchestrator`] – bounded retrieve → verify → synthesize loop.
//!
//! Each reasoning step:
//!
//! 1. **Retrieve** – [`FusionCoordinator::hybrid_query`] with the current
//!    query fragment (the question on the first step, the provider's refined
//!    query afterwards).
//! 2. **Verify** – facts of the retrieved records plus the facts gathered by
//!    earlier steps go through [`RuleEngine::verify`]. A violated constraint
//!    fails the trace with the constraint's explanation.
//! 3. **Synthesize** – the [`InferenceProvider`] sees the evidence, earlier
//!    conclusions and the verification outcome and either refines the query
//!    or concludes. A final answer's candidate facts are verified once more
//!    before the trace completes.
//!
//! The step is appended to the trace before the next one begins. When
//! `max_depth` steps pass without a final answer, the trace completes with a
//! low-confidence partial answer and `depth_exceeded` set.
//!
//! Provider calls run under a timeout and are retried with exponential
//! backoff while the error is transient. Cancellation is cooperative: the
//! flag is checked at step boundaries, and a provider result that arrives
//! after cancellation is discarded.
//!
//! A step that cannot complete (a storage error mid-step, say) fails its
//! own trace with the error as explanation; the trace still reaches the
//! log. Terminal traces are served from the [`TraceLog`]; the in-process
//! registry only holds traces the log could not take.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use neuros_kernel::{Fact, RuleEngine, Verification, facts_from_record, parse_fact};
use neuros_types::{
    Answer, AnswerConfidence, EvidenceRef, Filter, NeurosError, ReasoningStep, ReasoningTrace,
    TraceId, TraceState, VerificationOutcome,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::NeurosConfig;
use crate::fusion::FusionCoordinator;
use crate::inference::{
    Decision, EvidenceItem, InferenceError, InferenceProvider, InferenceRequest, NO_EVIDENCE_ANSWER,
};
use crate::trace_log::TraceLog;

pub const CANCELLED: &str = "cancelled";

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub inference_timeout: Duration,
    pub inference_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub inference_backoff: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&NeurosConfig::in_memory())
    }
}

impl From<&NeurosConfig> for OrchestratorSettings {
    fn from(cfg: &NeurosConfig) -> Self {
        Self {
            inference_timeout: cfg.inference_timeout(),
            inference_attempts: cfg.inference_attempts,
            inference_backoff: cfg.inference_backoff(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

pub struct Orchestrator {
    fusion: Arc<FusionCoordinator>,
    inference: Arc<dyn InferenceProvider>,
    rules: RwLock<Arc<RuleEngine>>,
    log: Arc<TraceLog>,
    settings: OrchestratorSettings,
    running: Mutex<HashMap<TraceId, Arc<AtomicBool>>>,
    /// Terminal traces whose log append failed.
    unlogged: Mutex<HashMap<TraceId, ReasoningTrace>>,
}

/// How one step ended.
enum StepOutcome {
    Continue(String),
    Finished,
}

impl Orchestrator {
    pub fn new(
        fusion: Arc<FusionCoordinator>,
        inference: Arc<dyn InferenceProvider>,
        rules: RuleEngine,
        log: Arc<TraceLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            fusion,
            inference,
            rules: RwLock::new(Arc::new(rules)),
            log,
            settings,
            running: Mutex::new(HashMap::new()),
            unlogged: Mutex::new(HashMap::new()),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TraceId, Arc<AtomicBool>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlogged(&self) -> MutexGuard<'_, HashMap<TraceId, ReasoningTrace>> {
        self.unlogged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The rule set new steps verify against.
    pub fn rules(&self) -> Arc<RuleEngine> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Swap the rule set. Traces already past a verification keep the
    /// results they got.
    pub fn set_rules(&self, rules: RuleEngine) {
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
    }

    /// Reserve a trace id so it can be cancelled before [`run`](Self::run)
    /// starts.
    pub fn begin(&self) -> TraceId {
        let id = TraceId::new();
        self.running().insert(id, Arc::new(AtomicBool::new(false)));
        id
    }

    /// Request cancellation of a running trace.
    pub fn cancel(&self, id: TraceId) -> Result<(), NeurosError> {
        if let Some(flag) = self.running().get(&id) {
            flag.store(true, Ordering::SeqCst);
            info!(trace = %id, "cancellation requested");
            return Ok(());
        }
        if self.unlogged().contains_key(&id) || self.log.get(id)?.is_some() {
            return Err(NeurosError::TraceFinalized(id));
        }
        Err(NeurosError::TraceNotFound(id))
    }

    /// A finished trace, from the registry or the trace log.
    pub fn trace(&self, id: TraceId) -> Result<ReasoningTrace, NeurosError> {
        if let Some(trace) = self.unlogged().get(&id) {
            return Ok(trace.clone());
        }
        if self.running().contains_key(&id) {
            return Err(NeurosError::TraceNotFinished(id));
        }
        self.log.get(id)?.ok_or(NeurosError::TraceNotFound(id))
    }

    /// Answer `question`, returning the terminal trace.
    ///
    /// Reasoning failures end up in the trace; the `Err` path is reserved
    /// for failures to persist it.
    pub async fn run(
        &self,
        id: TraceId,
        question: &str,
        filter: &Filter,
        k: usize,
        max_depth: usize,
    ) -> Result<ReasoningTrace, NeurosError> {
        let cancelled = self
            .running()
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        let mut trace = ReasoningTrace::new(id, question, max_depth);
        info!(trace = %id, max_depth, k, "reasoning started");

        if let Err(e) = self.reason(&mut trace, filter, k, &cancelled).await {
            warn!(trace = %id, error = %e, "reasoning aborted");
            // Only refused when the trace is already terminal.
            let _ = trace.fail(format!("reasoning aborted: {e}"));
        }
        self.finish(trace).await
    }

    /// Drive `trace` to a terminal state, one step at a time.
    async fn reason(
        &self,
        trace: &mut ReasoningTrace,
        filter: &Filter,
        k: usize,
        cancelled: &AtomicBool,
    ) -> Result<(), NeurosError> {
        let id = trace.id();
        let max_depth = trace.max_depth();
        let mut fragment = trace.question().to_string();
        let mut known: Vec<Fact> = Vec::new();
        let mut conclusions: Vec<String> = Vec::new();

        for step in 0..max_depth {
            if cancelled.load(Ordering::SeqCst) {
                return trace.fail(CANCELLED);
            }
            let outcome = self
                .step(trace, step, &fragment, filter, k, &mut known, &mut conclusions, cancelled)
                .await?;
            match outcome {
                StepOutcome::Continue(next) => {
                    if !next.trim().is_empty() {
                        fragment = next;
                    }
                }
                StepOutcome::Finished => return Ok(()),
            }
        }

        warn!(
            trace = %id,
            error = %NeurosError::ReasoningDepthExceeded(max_depth),
            "returning partial answer"
        );
        let text = conclusions
            .last()
            .cloned()
            .unwrap_or_else(|| NO_EVIDENCE_ANSWER.to_string());
        trace.complete(Answer {
            text,
            confidence: AnswerConfidence::Low,
            depth_exceeded: true,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn step(
        &self,
        trace: &mut ReasoningTrace,
        index: usize,
        fragment: &str,
        filter: &Filter,
        k: usize,
        known: &mut Vec<Fact>,
        conclusions: &mut Vec<String>,
        cancelled: &AtomicBool,
    ) -> Result<StepOutcome, NeurosError> {
        let id = trace.id();

        // ── Retrieve ─────────────────────────────────────────────────────────
        trace.transition(TraceState::Retrieving)?;
        let result = match self.fusion.hybrid_query(fragment, filter, k).await {
            Ok(result) => result,
            Err(e) => {
                trace.fail(format!("retrieval failed: {e}"))?;
                return Ok(StepOutcome::Finished);
            }
        };
        let mut evidence = Vec::with_capacity(result.hits.len());
        let mut items = Vec::with_capacity(result.hits.len());
        let mut evidence_facts = Vec::new();
        for hit in &result.hits {
            let Some(record) = self.fusion.get(hit.id).await? else {
                continue;
            };
            evidence_facts.extend(facts_from_record(&record));
            evidence.push(EvidenceRef {
                id: hit.id,
                score: hit.score,
                breakdown: hit.breakdown,
            });
            items.push(EvidenceItem {
                id: hit.id,
                score: hit.score,
                breakdown: hit.breakdown,
                content: record.content.payload,
            });
        }
        debug!(trace = %id, step = index, evidence = evidence.len(), degraded = result.degraded, "evidence retrieved");

        // ── Verify ───────────────────────────────────────────────────────────
        trace.transition(TraceState::Verifying)?;
        let rules = self.rules();
        let params = self.fusion.parameters();
        let checked = rules.verify(known.iter().cloned(), evidence_facts.iter().cloned(), |r| {
            params.confidence(r)
        });
        known.extend(evidence_facts);
        known.extend(checked.derived.iter().cloned());

        let mut step = ReasoningStep {
            index,
            fragment: fragment.to_string(),
            evidence,
            rule_firings: checked.firings.clone(),
            verification: checked.outcome.clone(),
            conclusion: String::new(),
            degraded: result.degraded,
        };
        if let VerificationOutcome::Contradiction { explanation } = &checked.outcome {
            warn!(trace = %id, step = index, %explanation, "evidence contradicts rules");
            step.conclusion = explanation.clone();
            trace.append_step(step)?;
            trace.fail(NeurosError::ReasoningContradiction(explanation.clone()).to_string())?;
            return Ok(StepOutcome::Finished);
        }

        // ── Synthesize ───────────────────────────────────────────────────────
        trace.transition(TraceState::Synthesizing)?;
        let request = InferenceRequest {
            question: trace.question().to_string(),
            fragment: fragment.to_string(),
            step: index,
            max_depth: trace.max_depth(),
            evidence: items,
            prior_conclusions: conclusions.clone(),
            verification: checked.outcome.clone(),
        };
        let decision = self.decide(id, &request).await;
        if cancelled.load(Ordering::SeqCst) {
            debug!(trace = %id, step = index, "discarding provider result of cancelled trace");
            trace.fail(CANCELLED)?;
            return Ok(StepOutcome::Finished);
        }

        match decision {
            Err(e) => {
                warn!(trace = %id, step = index, provider = self.inference.name(), error = %e, "inference failed");
                trace.append_step(step)?;
                trace.fail(NeurosError::InferenceProvider(e.to_string()).to_string())?;
                Ok(StepOutcome::Finished)
            }
            Ok(Decision::Continue {
                refined_query,
                rationale,
            }) => {
                step.conclusion = if rationale.trim().is_empty() {
                    format!("refine: {refined_query}")
                } else {
                    rationale
                };
                conclusions.push(step.conclusion.clone());
                trace.append_step(step)?;
                debug!(trace = %id, step = index, refined = %refined_query, "continuing");
                Ok(StepOutcome::Continue(refined_query))
            }
            Ok(Decision::Final { answer, facts }) => {
                let candidate: Vec<Fact> = facts
                    .iter()
                    .filter_map(|src| match parse_fact(src) {
                        Ok(fact) => Some(fact),
                        Err(e) => {
                            warn!(trace = %id, fact = %src, error = %e, "skipping unparsable candidate fact");
                            None
                        }
                    })
                    .collect();
                let Verification {
                    outcome, firings, ..
                } = rules.verify(known.iter().cloned(), candidate, |r| params.confidence(r));
                step.rule_firings.extend(firings);
                step.verification = outcome.clone();
                step.conclusion = answer.clone();
                trace.append_step(step)?;
                match outcome {
                    VerificationOutcome::Consistent => {
                        trace.complete(Answer {
                            text: answer,
                            confidence: AnswerConfidence::Full,
                            depth_exceeded: false,
                        })?;
                    }
                    VerificationOutcome::Contradiction { explanation } => {
                        warn!(trace = %id, step = index, %explanation, "final answer contradicts rules");
                        trace.fail(NeurosError::ReasoningContradiction(explanation).to_string())?;
                    }
                }
                Ok(StepOutcome::Finished)
            }
        }
    }

    async fn decide(&self, id: TraceId, request: &InferenceRequest) -> Result<Decision, InferenceError> {
        let attempts = self.settings.inference_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match timeout(self.settings.inference_timeout, self.inference.decide(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(InferenceError::Transient(format!(
                    "no decision within {:?}",
                    self.settings.inference_timeout
                ))),
            };
            match outcome {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self
                        .settings
                        .inference_backoff
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(trace = %id, attempt, ?delay, error = %e, "transient inference error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn finish(&self, trace: ReasoningTrace) -> Result<ReasoningTrace, NeurosError> {
        let id = trace.id();
        let log = self.log.clone();
        let logged = trace.clone();
        let appended = tokio::task::spawn_blocking(move || log.append(&logged))
            .await
            .map_err(|e| NeurosError::Storage(format!("blocking task failed: {e}")))
            .and_then(|r| r.map_err(NeurosError::from));

        self.running().remove(&id);
        if let Err(e) = appended {
            warn!(trace = %id, error = %e, "trace log append failed, keeping trace in memory");
            self.unlogged().insert(id, trace);
            return Err(e);
        }

        info!(
            trace = %id,
            state = trace.state().as_str(),
            steps = trace.steps().len(),
            "reasoning finished"
        );
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashingEmbedder};
    use crate::fusion::FusionSettings;
    use crate::inference::EvidenceSynthesizer;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use neuros_memory::{
        AnalyticalProjector, InMemoryVectorIndex, RecordStore, SqliteRecordStore, StoreCounts,
        StoreError,
    };
    use neuros_types::{
        ChangeEvent, Context, Embedding, MemoryRecord, NewRecord, ParameterSnapshot, RecordId,
        RecordPatch,
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Notify, watch};

    const ONE_DEADLINE: &str = "[one_deadline] :- deadline(P, A), deadline(P, B), A != B.";

    fn ctx(value: serde_json::Value) -> Context {
        serde_json::from_value(value).unwrap()
    }

    fn fusion() -> Arc<FusionCoordinator> {
        fusion_on(Arc::new(SqliteRecordStore::open_in_memory().unwrap()))
    }

    fn fusion_on(store: Arc<dyn RecordStore>) -> Arc<FusionCoordinator> {
        let embedder = Arc::new(HashingEmbedder::default());
        let (_tx, rx) = watch::channel(Arc::new(ParameterSnapshot::default()));
        Arc::new(FusionCoordinator::new(
            store,
            Arc::new(InMemoryVectorIndex::new(embedder.dimension())),
            Arc::new(AnalyticalProjector::new(chrono::Duration::days(7))),
            embedder,
            rx,
            FusionSettings::default(),
        ))
    }

    fn orchestrator(fusion: Arc<FusionCoordinator>, provider: Arc<dyn InferenceProvider>, rules: &str) -> Orchestrator {
        Orchestrator::new(
            fusion,
            provider,
            RuleEngine::load(rules).unwrap(),
            Arc::new(TraceLog::open_in_memory().unwrap()),
            OrchestratorSettings {
                inference_timeout: Duration::from_millis(200),
                inference_attempts: 3,
                inference_backoff: Duration::from_millis(1),
            },
        )
    }

    /// Replays a fixed script of results, repeating the last one.
    struct Scripted {
        script: Vec<Result<Decision, InferenceError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<Decision, InferenceError>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn decide(&self, _request: &InferenceRequest) -> Result<Decision, InferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let i = n.min(self.script.len() - 1);
            match &self.script[i] {
                Ok(d) => Ok(d.clone()),
                Err(InferenceError::Transient(m)) => Err(InferenceError::Transient(m.clone())),
                Err(e) => Err(InferenceError::Fatal(e.to_string())),
            }
        }
    }

    fn refine(query: &str) -> Result<Decision, InferenceError> {
        Ok(Decision::Continue {
            refined_query: query.into(),
            rationale: String::new(),
        })
    }

    fn conclude(answer: &str, facts: &[&str]) -> Result<Decision, InferenceError> {
        Ok(Decision::Final {
            answer: answer.into(),
            facts: facts.iter().map(|f| f.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn consistent_evidence_completes_with_full_confidence() {
        let fusion = fusion();
        fusion
            .write("Project X deadline moved to Q2", ctx(json!({"facts": ["deadline(x, q2)"]})))
            .await
            .unwrap();
        let orch = orchestrator(fusion, Arc::new(EvidenceSynthesizer), ONE_DEADLINE);

        let trace = orch.run(orch.begin(), "project X deadline", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.state(), TraceState::Done);
        assert_eq!(trace.steps().len(), 1);
        let answer = trace.answer().unwrap();
        assert_eq!(answer.confidence, AnswerConfidence::Full);
        assert!(answer.text.contains("deadline moved to Q2"));
    }

    #[tokio::test]
    async fn contradicting_evidence_fails_with_explanation() {
        let fusion = fusion();
        fusion
            .write("Deadline for X is Q1", ctx(json!({"facts": ["deadline(X, Q1)"]})))
            .await
            .unwrap();
        fusion
            .write("Deadline for X is Q2", ctx(json!({"facts": ["deadline(X, Q2)"]})))
            .await
            .unwrap();
        let provider = Scripted::new(vec![conclude("Q1", &[])]);
        let orch = orchestrator(fusion, provider.clone(), ONE_DEADLINE);

        let trace = orch.run(orch.begin(), "deadline for X", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.state(), TraceState::Failed);
        let explanation = trace.explanation().unwrap();
        assert!(explanation.contains("one_deadline"), "{explanation}");
        assert_eq!(trace.steps().len(), 1);
        assert!(!trace.steps()[0].verification.is_consistent());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn depth_bound_yields_low_confidence_partial_answer() {
        let fusion = fusion();
        fusion.write("some memory", Context::new()).await.unwrap();
        let provider = Scripted::new(vec![refine("more"), refine("even more")]);
        let orch = orchestrator(fusion, provider.clone(), "");

        let trace = orch.run(orch.begin(), "question", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(provider.calls(), 3);
        assert_eq!(trace.steps().len(), 3);
        assert_eq!(trace.steps()[1].fragment, "more");
        assert_eq!(trace.steps()[2].fragment, "even more");
        assert_eq!(trace.state(), TraceState::Done);
        let answer = trace.answer().unwrap();
        assert_eq!(answer.confidence, AnswerConfidence::Low);
        assert!(answer.depth_exceeded);
    }

    #[tokio::test]
    async fn contradicting_final_facts_fail_the_trace() {
        let fusion = fusion();
        fusion
            .write("Deadline for X is Q2", ctx(json!({"facts": ["deadline(X, Q2)"]})))
            .await
            .unwrap();
        let provider = Scripted::new(vec![conclude("Q3", &["deadline(X, Q3)", "not a fact("])]);
        let orch = orchestrator(fusion, provider, ONE_DEADLINE);

        let trace = orch.run(orch.begin(), "deadline", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.state(), TraceState::Failed);
        assert_eq!(trace.steps()[0].conclusion, "Q3");
        assert!(trace.explanation().unwrap().contains("one_deadline"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let provider = Scripted::new(vec![
            Err(InferenceError::Transient("busy".into())),
            conclude("ok", &[]),
        ]);
        let orch = orchestrator(fusion(), provider.clone(), "");
        let trace = orch.run(orch.begin(), "q", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.state(), TraceState::Done);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let provider = Scripted::new(vec![Err(InferenceError::Fatal("bad key".into()))]);
        let orch = orchestrator(fusion(), provider.clone(), "");
        let trace = orch.run(orch.begin(), "q", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.state(), TraceState::Failed);
        assert!(trace.explanation().unwrap().contains("bad key"));
        assert_eq!(provider.calls(), 1);
        assert_eq!(trace.steps().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_trace() {
        let provider = Scripted::new(vec![Err(InferenceError::Transient("busy".into()))]);
        let orch = orchestrator(fusion(), provider.clone(), "");
        let trace = orch.run(orch.begin(), "q", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.state(), TraceState::Failed);
        assert_eq!(provider.calls(), 3);
    }

    /// Blocks in `decide` until released.
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl InferenceProvider for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn decide(&self, _request: &InferenceRequest) -> Result<Decision, InferenceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Decision::Final {
                answer: "too late".into(),
                facts: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn cancellation_discards_in_flight_result() {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let mut orch = orchestrator(fusion(), gate.clone(), "");
        orch.settings.inference_timeout = Duration::from_secs(5);
        let orch = Arc::new(orch);

        let id = orch.begin();
        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(id, "q", &Filter::new(), 5, 3).await })
        };
        gate.entered.notified().await;
        orch.cancel(id).unwrap();
        gate.release.notify_one();

        let trace = runner.await.unwrap().unwrap();
        assert_eq!(trace.state(), TraceState::Failed);
        assert_eq!(trace.explanation(), Some(CANCELLED));
        assert!(trace.steps().is_empty());
        assert!(matches!(orch.cancel(id), Err(NeurosError::TraceFinalized(_))));
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_no_step() {
        let provider = Scripted::new(vec![conclude("x", &[])]);
        let orch = orchestrator(fusion(), provider.clone(), "");
        let id = orch.begin();
        orch.cancel(id).unwrap();
        let trace = orch.run(id, "q", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.explanation(), Some(CANCELLED));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn finished_traces_are_logged_and_resolvable() {
        let log = Arc::new(TraceLog::open_in_memory().unwrap());
        let orch = Orchestrator::new(
            fusion(),
            Arc::new(EvidenceSynthesizer),
            RuleEngine::empty(),
            log.clone(),
            OrchestratorSettings::default(),
        );
        let trace = orch.run(orch.begin(), "anything?", &Filter::new(), 5, 3).await.unwrap();
        assert_eq!(trace.answer().unwrap().text, NO_EVIDENCE_ANSWER);
        assert_eq!(log.get(trace.id()).unwrap().as_ref(), Some(&trace));
        assert_eq!(orch.trace(trace.id()).unwrap(), trace);
        assert!(matches!(orch.trace(TraceId::new()), Err(NeurosError::TraceNotFound(_))));
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_steps() {
        let fusion = fusion();
        for text in ["alpha beta", "beta gamma", "gamma delta"] {
            fusion.write(text, Context::new()).await.unwrap();
        }
        fusion.flush().await;
        let orch = orchestrator(fusion, Arc::new(EvidenceSynthesizer), "");
        let a = orch.run(orch.begin(), "beta", &Filter::new(), 3, 3).await.unwrap();
        let b = orch.run(orch.begin(), "beta", &Filter::new(), 3, 3).await.unwrap();
        assert_eq!(a.steps(), b.steps());
        assert_eq!(a.answer(), b.answer());
    }

    /// SQLite store whose point reads start failing once `broken` is set.
    struct BrokenReads {
        inner: SqliteRecordStore,
        broken: AtomicBool,
    }

    impl BrokenReads {
        fn check(&self) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            Ok(())
        }
    }

    impl RecordStore for BrokenReads {
        fn insert(&self, record: NewRecord) -> Result<MemoryRecord, StoreError> {
            self.inner.insert(record)
        }
        fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, StoreError> {
            self.check()?;
            self.inner.get(id)
        }
        fn get_including_deleted(&self, id: RecordId) -> Result<Option<MemoryRecord>, StoreError> {
            self.check()?;
            self.inner.get_including_deleted(id)
        }
        fn update(&self, id: RecordId, expected: u64, patch: RecordPatch) -> Result<MemoryRecord, StoreError> {
            self.inner.update(id, expected, patch)
        }
        fn delete(&self, id: RecordId, expected: u64, grace: chrono::Duration) -> Result<MemoryRecord, StoreError> {
            self.inner.delete(id, expected, grace)
        }
        fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordId>, StoreError> {
            self.inner.purge_expired(now)
        }
        fn query(&self, filter: &Filter) -> Result<Vec<MemoryRecord>, StoreError> {
            self.inner.query(filter)
        }
        fn list(&self, include_deleted: bool) -> Result<Vec<MemoryRecord>, StoreError> {
            self.inner.list(include_deleted)
        }
        fn add_edge(&self, child: RecordId, parent: RecordId) -> Result<(), StoreError> {
            self.inner.add_edge(child, parent)
        }
        fn attach_embedding(&self, id: RecordId, embedding: &Embedding) -> Result<bool, StoreError> {
            self.inner.attach_embedding(id, embedding)
        }
        fn mark_degraded(&self, id: RecordId, content_version: u64) -> Result<bool, StoreError> {
            self.inner.mark_degraded(id, content_version)
        }
        fn changes_since(&self, after_seq: u64, limit: usize) -> Result<Vec<ChangeEvent>, StoreError> {
            self.inner.changes_since(after_seq, limit)
        }
        fn latest_seq(&self) -> Result<u64, StoreError> {
            self.inner.latest_seq()
        }
        fn counts(&self) -> Result<StoreCounts, StoreError> {
            self.inner.counts()
        }
    }

    #[tokio::test]
    async fn storage_error_mid_step_fails_only_that_trace() {
        let store = Arc::new(BrokenReads {
            inner: SqliteRecordStore::open_in_memory().unwrap(),
            broken: AtomicBool::new(false),
        });
        let fusion = fusion_on(store.clone());
        fusion.write("memory of the launch", Context::new()).await.unwrap();
        fusion.flush().await;
        store.broken.store(true, Ordering::SeqCst);

        let log = Arc::new(TraceLog::open_in_memory().unwrap());
        let orch = Orchestrator::new(
            fusion,
            Arc::new(EvidenceSynthesizer),
            RuleEngine::empty(),
            log.clone(),
            OrchestratorSettings::default(),
        );
        let id = orch.begin();
        let trace = orch.run(id, "memory", &Filter::new(), 5, 3).await.unwrap();

        assert_eq!(trace.state(), TraceState::Failed);
        assert!(trace.explanation().unwrap().starts_with("reasoning aborted:"), "{:?}", trace.explanation());
        assert!(orch.running().is_empty());
        assert_eq!(orch.trace(id).unwrap(), trace);
        assert_eq!(log.get(id).unwrap().as_ref(), Some(&trace));
        assert!(matches!(orch.cancel(id), Err(NeurosError::TraceFinalized(_))));
    }

    #[tokio::test]
    async fn logged_traces_leave_the_in_memory_registry() {
        let fusion = fusion();
        fusion.write("alpha", Context::new()).await.unwrap();
        let log = Arc::new(TraceLog::open_in_memory().unwrap());
        let orch = Orchestrator::new(
            fusion,
            Arc::new(EvidenceSynthesizer),
            RuleEngine::empty(),
            log.clone(),
            OrchestratorSettings::default(),
        );

        let mut ids = Vec::new();
        for _ in 0..20 {
            let trace = orch.run(orch.begin(), "alpha", &Filter::new(), 5, 3).await.unwrap();
            ids.push(trace.id());
        }
        assert!(orch.running().is_empty());
        assert!(orch.unlogged().is_empty());
        for id in ids {
            assert_eq!(orch.trace(id).unwrap().state(), TraceState::Done);
        }
    }
}
