//! [`Neuros`] – the public entry point.
//!
//! Owns one of each component and wires them the way the configuration
//! says:
//!
//! ```text
//!            write/update/delete            query
//!                   │                         │
//!                   ▼                         ▼
//!          FusionCoordinator ◄──────── Orchestrator ──► InferenceProvider
//!     ┌─────────┼──────────┐                 │
//!     ▼         ▼          ▼                 ▼
//! RecordStore VectorIndex Projector     RuleEngine, TraceLog
//!                   ▲
//!                   │ watch (ParameterSnapshot)
//!            PreferenceLearner ◄── feedback
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use neuros_runtime::config::NeurosConfig;
//! use neuros_runtime::engine::Neuros;
//! use neuros_types::{Context, FeedbackSignal, Filter};
//!
//! # async fn demo() -> Result<(), neuros_types::NeurosError> {
//! let neuros = Neuros::open(NeurosConfig::in_memory()).await?;
//! neuros.write("Project X timeline extended to Q2", Context::new()).await?;
//! let trace = neuros.query("When is project X due?", &Filter::new(), 5, None).await?;
//! neuros.feedback(trace.id(), FeedbackSignal::Accept).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use neuros_kernel::RuleEngine;
use neuros_memory::{AnalyticalProjector, InMemoryVectorIndex, RecordStore, SqliteRecordStore};
use neuros_types::{
    Content, Context, FeedbackSignal, Filter, MemoryRecord, NeurosError, NewRecord,
    ParameterSnapshot, QueryResult, ReasoningTrace, RecordId, RecordPatch, TraceId,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{EmbeddingBackend, InferenceBackend, NeurosConfig};
use crate::embedding::{EmbeddingProvider, HashingEmbedder, OllamaEmbedder};
use crate::fusion::{FusionCoordinator, FusionSettings, FusionStats, ReconcileReport};
use crate::inference::{ChatCompletionsProvider, EvidenceSynthesizer, InferenceProvider};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::preference::{FeedbackEvent, LearningRates, PreferenceLearner};
use crate::trace_log::TraceLog;

const IN_MEMORY: &str = ":memory:";

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Text,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "json"),
            ExportFormat::Text => write!(f, "text"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = NeurosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "text" => Ok(ExportFormat::Text),
            other => Err(NeurosError::Config(format!("unsupported export format: {other}"))),
        }
    }
}

fn render_text(records: &[MemoryRecord]) -> String {
    let mut lines = Vec::with_capacity(records.len() * 5);
    for record in records {
        lines.push(format!("ID: {}", record.id));
        lines.push(format!("Content: {}", record.content.payload));
        lines.push(format!("Created: {}", record.created_at.to_rfc3339()));
        let tags = record.tags();
        if !tags.is_empty() {
            lines.push(format!("Tags: {}", tags.join(", ")));
        }
        lines.push("-".repeat(50));
    }
    lines.join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeurosStats {
    #[serde(flatten)]
    pub fusion: FusionStats,
    pub traces_logged: usize,
    pub parameters_version: u64,
    /// Loaded rules and constraints.
    pub rules: usize,
    pub embedding_model: String,
    pub inference_provider: String,
    pub db_path: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Neuros
// ─────────────────────────────────────────────────────────────────────────────

pub struct Neuros {
    config: NeurosConfig,
    fusion: Arc<FusionCoordinator>,
    orchestrator: Arc<Orchestrator>,
    learner: PreferenceLearner,
    log: Arc<TraceLog>,
    inference_name: String,
}

fn build_embedder(cfg: &NeurosConfig) -> Arc<dyn EmbeddingProvider> {
    match cfg.embedding_provider {
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(cfg.embedding_dimension)),
        EmbeddingBackend::Ollama => Arc::new(OllamaEmbedder::new(
            cfg.ollama_url.clone(),
            cfg.embedding_model.clone(),
            cfg.embedding_dimension,
        )),
    }
}

fn build_inference(cfg: &NeurosConfig) -> Arc<dyn InferenceProvider> {
    match cfg.inference_provider {
        InferenceBackend::Evidence => Arc::new(EvidenceSynthesizer),
        InferenceBackend::Chat => Arc::new(
            ChatCompletionsProvider::new(cfg.ollama_url.clone(), cfg.inference_model.clone())
                .with_api_key(cfg.inference_api_key.clone()),
        ),
    }
}

fn load_rule_file(cfg: &NeurosConfig) -> Result<RuleEngine, NeurosError> {
    let Some(path) = &cfg.rules_file else {
        return Ok(RuleEngine::empty().with_disable_threshold(cfg.rule_disable_threshold));
    };
    let source = std::fs::read_to_string(path)
        .map_err(|e| NeurosError::Config(format!("cannot read rules file {}: {e}", path.display())))?;
    Ok(RuleEngine::load(&source)?.with_disable_threshold(cfg.rule_disable_threshold))
}

fn open_stores(db_path: &str) -> Result<(SqliteRecordStore, TraceLog), NeurosError> {
    if db_path == IN_MEMORY {
        return Ok((SqliteRecordStore::open_in_memory()?, TraceLog::open_in_memory()?));
    }
    if let Some(dir) = Path::new(db_path).parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)
            .map_err(|e| NeurosError::Storage(format!("cannot create {}: {e}", dir.display())))?;
    }
    Ok((SqliteRecordStore::open(db_path)?, TraceLog::open(db_path)?))
}

impl Neuros {
    /// Open the stores named by `config`, rebuild the derived views and
    /// start the background tasks. Must be called inside a Tokio runtime.
    pub async fn open(config: NeurosConfig) -> Result<Self, NeurosError> {
        config.validate()?;
        let rules = load_rule_file(&config)?;
        let (store, log) = open_stores(&config.db_path)?;
        let store: Arc<dyn RecordStore> = Arc::new(store);
        let log = Arc::new(log);

        let embedder = build_embedder(&config);
        let inference = build_inference(&config);
        let inference_name = inference.name().to_string();

        let learner = PreferenceLearner::spawn(
            ParameterSnapshot::new(config.ranking_weights),
            LearningRates {
                weights: config.weight_learning_rate,
                confidence: config.confidence_learning_rate,
            },
        );
        let fusion = Arc::new(FusionCoordinator::new(
            store,
            Arc::new(InMemoryVectorIndex::new(embedder.dimension())),
            Arc::new(AnalyticalProjector::new(config.recency_half_life())),
            embedder,
            learner.subscribe(),
            FusionSettings::from(&config),
        ));
        fusion.reconcile().await?;

        let orchestrator = Arc::new(Orchestrator::new(
            fusion.clone(),
            inference,
            rules,
            log.clone(),
            OrchestratorSettings::from(&config),
        ));

        info!(
            db = %config.db_path,
            embedding = %config.embedding_provider,
            inference = %config.inference_provider,
            depth = config.max_depth(),
            "neuros opened"
        );
        Ok(Self {
            config,
            fusion,
            orchestrator,
            learner,
            log,
            inference_name,
        })
    }

    pub fn config(&self) -> &NeurosConfig {
        &self.config
    }

    // ── records ──────────────────────────────────────────────────────────────

    pub async fn write(&self, content: impl Into<Content>, context: Context) -> Result<RecordId, NeurosError> {
        self.fusion.write(content, context).await
    }

    pub async fn write_record(&self, record: NewRecord) -> Result<MemoryRecord, NeurosError> {
        self.fusion.write_record(record).await
    }

    pub async fn update(
        &self,
        id: RecordId,
        expected_version: u64,
        patch: RecordPatch,
    ) -> Result<MemoryRecord, NeurosError> {
        self.fusion.update(id, expected_version, patch).await
    }

    pub async fn delete(&self, id: RecordId, expected_version: u64) -> Result<MemoryRecord, NeurosError> {
        self.fusion.delete(id, expected_version).await
    }

    pub async fn get(&self, id: RecordId) -> Result<MemoryRecord, NeurosError> {
        self.fusion.get(id).await?.ok_or(NeurosError::NotFound(id))
    }

    /// Record that `child` was derived from `parent`.
    pub async fn link(&self, child: RecordId, parent: RecordId) -> Result<(), NeurosError> {
        self.fusion.link(child, parent).await
    }

    pub async fn purge_expired(&self) -> Result<Vec<RecordId>, NeurosError> {
        self.fusion.purge_expired().await
    }

    /// Wait for queued embedding and projection work to settle.
    pub async fn flush(&self) {
        self.fusion.flush().await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, NeurosError> {
        self.fusion.reconcile().await
    }

    // ── retrieval and reasoning ──────────────────────────────────────────────

    pub async fn hybrid_query(&self, text: &str, filter: &Filter, k: usize) -> Result<QueryResult, NeurosError> {
        self.fusion.hybrid_query(text, filter, k).await
    }

    /// Reason over the store. `max_depth` defaults to the configured tier.
    pub async fn query(
        &self,
        text: &str,
        filter: &Filter,
        k: usize,
        max_depth: Option<usize>,
    ) -> Result<ReasoningTrace, NeurosError> {
        let depth = max_depth.unwrap_or_else(|| self.config.max_depth());
        let id = self.orchestrator.begin();
        self.orchestrator.run(id, text, filter, k, depth).await
    }

    /// Start a query in the background. The id can be passed to
    /// [`cancel`](Self::cancel) right away.
    pub fn spawn_query(
        &self,
        text: impl Into<String>,
        filter: Filter,
        k: usize,
        max_depth: Option<usize>,
    ) -> (TraceId, JoinHandle<Result<ReasoningTrace, NeurosError>>) {
        let depth = max_depth.unwrap_or_else(|| self.config.max_depth());
        let id = self.orchestrator.begin();
        let orchestrator = self.orchestrator.clone();
        let text = text.into();
        let handle = tokio::spawn(async move { orchestrator.run(id, &text, &filter, k, depth).await });
        (id, handle)
    }

    pub fn cancel(&self, trace_id: TraceId) -> Result<(), NeurosError> {
        self.orchestrator.cancel(trace_id)
    }

    pub fn trace(&self, trace_id: TraceId) -> Result<ReasoningTrace, NeurosError> {
        self.orchestrator.trace(trace_id)
    }

    /// Most recently finished traces, newest first.
    pub async fn recent_traces(&self, limit: usize) -> Result<Vec<ReasoningTrace>, NeurosError> {
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || log.recent(limit))
            .await
            .map_err(|e| NeurosError::Storage(format!("blocking task failed: {e}")))?
            .map_err(Into::into)
    }

    /// Replace the rule set. On error the current rules stay in place.
    pub fn load_rules(&self, source: &str) -> Result<(), NeurosError> {
        let rules = RuleEngine::load(source)?.with_disable_threshold(self.config.rule_disable_threshold);
        self.orchestrator.set_rules(rules);
        Ok(())
    }

    // ── learning ─────────────────────────────────────────────────────────────

    /// Apply user feedback on a finished trace and return the parameters
    /// that result.
    pub async fn feedback(
        &self,
        trace_id: TraceId,
        signal: FeedbackSignal,
    ) -> Result<Arc<ParameterSnapshot>, NeurosError> {
        let trace = self.orchestrator.trace(trace_id)?;
        let event = FeedbackEvent::for_trace(&trace, signal)?;
        self.learner.submit_and_wait(event).await
    }

    pub fn parameters(&self) -> Arc<ParameterSnapshot> {
        self.learner.snapshot()
    }

    // ── inspection ───────────────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<NeurosStats, NeurosError> {
        let fusion = self.fusion.stats().await?;
        let log = self.log.clone();
        let traces_logged = tokio::task::spawn_blocking(move || log.len())
            .await
            .map_err(|e| NeurosError::Storage(format!("blocking task failed: {e}")))??;
        Ok(NeurosStats {
            fusion,
            traces_logged,
            parameters_version: self.parameters().version,
            rules: {
                let rules = self.orchestrator.rules();
                rules.program().rules.len() + rules.program().constraints.len()
            },
            embedding_model: self.fusion.embedding_model().to_string(),
            inference_provider: self.inference_name.clone(),
            db_path: self.config.db_path.clone(),
        })
    }

    /// Dump every live record.
    pub async fn export(&self, format: ExportFormat) -> Result<String, NeurosError> {
        let records = self.fusion.records(false).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&records)?),
            ExportFormat::Text => Ok(render_text(&records)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuros_types::{AnswerConfidence, Source, TraceState};
    use serde_json::json;

    const ONE_DEADLINE: &str = "[one_deadline] :- deadline(P, A), deadline(P, B), A != B.";

    fn ctx(value: serde_json::Value) -> Context {
        serde_json::from_value(value).unwrap()
    }

    async fn open() -> Neuros {
        Neuros::open(NeurosConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn write_then_filter_query_then_rank() {
        let neuros = open().await;
        neuros.write("Grocery list: eggs", Context::new()).await.unwrap();
        let id = neuros
            .write("Meeting notes: Project X timeline extended to Q2", ctx(json!({"project": "X"})))
            .await
            .unwrap();

        let filtered = neuros
            .hybrid_query("", &Filter::new().eq("project", json!("X")), 5)
            .await
            .unwrap();
        assert_eq!(filtered.ids(), vec![id]);

        neuros.flush().await;
        let ranked = neuros.hybrid_query("project X timeline", &Filter::new(), 2).await.unwrap();
        assert_eq!(ranked.hits[0].id, id);
        assert!(ranked.hits[0].breakdown.get(Source::Vector).is_some());
    }

    #[tokio::test]
    async fn conflicting_deadlines_fail_the_trace() {
        let neuros = open().await;
        neuros.load_rules(ONE_DEADLINE).unwrap();
        neuros
            .write("Project X is due in Q1", ctx(json!({"facts": ["deadline(X, Q1)"]})))
            .await
            .unwrap();
        neuros
            .write("Project X is due in Q2", ctx(json!({"facts": ["deadline(X, Q2)"]})))
            .await
            .unwrap();

        let trace = neuros.query("When is X due?", &Filter::new(), 5, None).await.unwrap();
        assert_eq!(trace.state(), TraceState::Failed);
        assert!(trace.explanation().unwrap().contains("one_deadline"));
        assert_eq!(neuros.trace(trace.id()).unwrap(), trace);
    }

    #[tokio::test]
    async fn rule_cycle_is_rejected_and_old_rules_stay() {
        let neuros = open().await;
        neuros.load_rules(ONE_DEADLINE).unwrap();
        let err = neuros
            .load_rules("p(X) :- q(X), not r(X).\nr(X) :- q(X), not p(X).")
            .unwrap_err();
        assert!(matches!(err, NeurosError::RuleCycle(_)));
        assert_eq!(neuros.stats().await.unwrap().rules, 1);
    }

    #[tokio::test]
    async fn accept_feedback_moves_parameters() {
        let neuros = open().await;
        neuros.write("rust ownership rules", Context::new()).await.unwrap();
        neuros.flush().await;
        let before = neuros.parameters();

        let trace = neuros.query("ownership", &Filter::new(), 3, None).await.unwrap();
        assert_eq!(trace.answer().unwrap().confidence, AnswerConfidence::Full);
        let after = neuros.feedback(trace.id(), FeedbackSignal::Accept).await.unwrap();
        assert_eq!(after.version, before.version + 1);
        assert_ne!(after.weights, before.weights);
        assert_eq!(neuros.parameters(), after);
    }

    #[tokio::test]
    async fn feedback_on_unknown_trace_is_rejected() {
        let neuros = open().await;
        let err = neuros.feedback(TraceId::new(), FeedbackSignal::Reject).await.unwrap_err();
        assert!(matches!(err, NeurosError::TraceNotFound(_)));
    }

    #[tokio::test]
    async fn get_missing_and_stale_update() {
        let neuros = open().await;
        assert!(matches!(neuros.get(RecordId(9)).await, Err(NeurosError::NotFound(_))));
        let id = neuros.write("v1", Context::new()).await.unwrap();
        neuros
            .update(id, 1, RecordPatch { content: Some("v2".into()), ..RecordPatch::default() })
            .await
            .unwrap();
        let err = neuros
            .update(id, 1, RecordPatch { content: Some("v3".into()), ..RecordPatch::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, NeurosError::WriteConflict { .. }));
        assert_eq!(neuros.get(id).await.unwrap().content.payload, "v2");
    }

    #[tokio::test]
    async fn export_formats() {
        let neuros = open().await;
        neuros
            .write("remember the milk", ctx(json!({"tags": ["errand", "home"]})))
            .await
            .unwrap();

        let text = neuros.export(ExportFormat::Text).await.unwrap();
        assert!(text.starts_with("ID: r1\nContent: remember the milk\nCreated: "));
        assert!(text.contains("Tags: errand, home"));
        assert!(text.ends_with(&"-".repeat(50)));

        let dumped: Vec<MemoryRecord> =
            serde_json::from_str(&neuros.export(ExportFormat::Json).await.unwrap()).unwrap();
        assert_eq!(dumped.len(), 1);
        assert_eq!("TEXT".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[tokio::test]
    async fn reopen_restores_records_index_and_traces() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NeurosConfig {
            db_path: dir.path().join("db").join("neuros.db").to_string_lossy().into_owned(),
            ..NeurosConfig::default()
        };

        let trace_id = {
            let neuros = Neuros::open(cfg.clone()).await.unwrap();
            neuros.write("persisted memory", Context::new()).await.unwrap();
            neuros.flush().await;
            neuros.query("persisted", &Filter::new(), 3, None).await.unwrap().id()
        };

        let neuros = Neuros::open(cfg).await.unwrap();
        let stats = neuros.stats().await.unwrap();
        assert_eq!(stats.fusion.live, 1);
        assert_eq!(stats.fusion.indexed, 1);
        assert_eq!(stats.traces_logged, 1);
        assert_eq!(neuros.trace(trace_id).unwrap().state(), TraceState::Done);
        assert_eq!(neuros.recent_traces(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spawned_query_can_be_awaited() {
        let neuros = open().await;
        let (id, handle) = neuros.spawn_query("anything", Filter::new(), 3, Some(2));
        let trace = handle.await.unwrap().unwrap();
        assert_eq!(trace.id(), id);
        assert!(matches!(neuros.cancel(id), Err(NeurosError::TraceFinalized(_))));
    }
}
