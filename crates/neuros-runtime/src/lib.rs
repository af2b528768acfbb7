//! `neuros-runtime` – Memory Fusion and the Reasoning Orchestrator
//!
//! Everything that moves: background fanout, concurrent retrieval,
//! multi-step reasoning and preference learning, behind the [`Neuros`]
//! facade.
//!
//! # Modules
//!
//! - [`engine`] – [`Neuros`][engine::Neuros]: opens the stores named by a
//!   [`NeurosConfig`][config::NeurosConfig] and exposes write, query,
//!   feedback, cancel, rule loading, stats and export.
//! - [`fusion`] – [`FusionCoordinator`][fusion::FusionCoordinator]: commits
//!   records to the structured store, fans embedding and projection out to
//!   background tasks, and fuses the three retrieval legs into one ranking.
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: the
//!   bounded retrieve → verify → synthesize loop that produces
//!   [`ReasoningTrace`][neuros_types::ReasoningTrace]s.
//! - [`preference`] – [`PreferenceLearner`][preference::PreferenceLearner]:
//!   single-writer task turning feedback into new parameter snapshots.
//! - [`embedding`] / [`inference`] – provider traits with a deterministic
//!   local implementation and an HTTP one each (Ollama embeddings,
//!   OpenAI-compatible chat completions with the decision JSON Schema
//!   injected via `response_format`).
//! - [`trace_log`] – [`TraceLog`][trace_log::TraceLog]: append-only SQLite
//!   log of finished traces.
//! - [`config`] – TOML configuration at `~/.neuros/config.toml` with
//!   `NEUROS_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod config;
pub mod embedding;
pub mod engine;
pub mod fusion;
pub mod inference;
pub mod orchestrator;
pub mod preference;
pub mod telemetry;
pub mod trace_log;

pub use config::{DepthTier, NeurosConfig};
pub use embedding::{EmbeddingError, EmbeddingProvider, HashingEmbedder, OllamaEmbedder};
pub use engine::{ExportFormat, Neuros, NeurosStats};
pub use fusion::{FusionCoordinator, FusionSettings, FusionStats, ReconcileReport};
pub use inference::{
    ChatCompletionsProvider, Decision, EvidenceSynthesizer, InferenceError, InferenceProvider,
    InferenceRequest,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use preference::{FeedbackEvent, LearningRates, PreferenceLearner};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use trace_log::{TraceLog, TraceLogError};
