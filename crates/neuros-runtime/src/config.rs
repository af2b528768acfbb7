//! Runtime configuration – reads/writes `~/.neuros/config.toml`.
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! `NEUROS_*` environment variables override file values after loading.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use neuros_types::{NeurosError, RankingWeights};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Enumerated settings
// ─────────────────────────────────────────────────────────────────────────────

/// Reasoning-depth tier; selects the default step budget of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthTier {
    #[default]
    Basic,
    Extended,
    Deep,
}

impl DepthTier {
    pub fn max_depth(&self) -> usize {
        match self {
            DepthTier::Basic => 3,
            DepthTier::Extended => 6,
            DepthTier::Deep => 10,
        }
    }
}

impl FromStr for DepthTier {
    type Err = NeurosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(DepthTier::Basic),
            "extended" => Ok(DepthTier::Extended),
            "deep" => Ok(DepthTier::Deep),
            other => Err(NeurosError::Config(format!("unknown depth tier {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Hashing,
    Ollama,
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingBackend::Hashing => write!(f, "hashing"),
            EmbeddingBackend::Ollama => write!(f, "ollama"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Evidence,
    Chat,
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceBackend::Evidence => write!(f, "evidence"),
            InferenceBackend::Chat => write!(f, "chat"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NeurosConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted runtime configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct NeurosConfig {
    /// SQLite database holding records and the trace log. `:memory:` keeps
    /// everything in process.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub depth_tier: DepthTier,

    /// Initial ranking weights; the preference learner adjusts them.
    #[serde(default)]
    pub ranking_weights: RankingWeights,

    /// Candidates each retrieval leg contributes before fusion.
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,

    #[serde(default = "default_leg_timeout_ms")]
    pub leg_timeout_ms: u64,

    /// Lag beyond which query hits carry an as-of marker.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,

    #[serde(default = "default_fanout_attempts")]
    pub fanout_attempts: u32,

    #[serde(default = "default_fanout_backoff_ms")]
    pub fanout_backoff_ms: u64,

    #[serde(default = "default_embedding_timeout_ms")]
    pub embedding_timeout_ms: u64,

    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,

    #[serde(default = "default_inference_attempts")]
    pub inference_attempts: u32,

    #[serde(default = "default_inference_backoff_ms")]
    pub inference_backoff_ms: u64,

    /// How long a tombstone stays resolvable before it may be purged.
    #[serde(default = "default_tombstone_grace_secs")]
    pub tombstone_grace_secs: u64,

    /// Half-life of the analytical recency decay.
    #[serde(default = "default_recency_half_life_secs")]
    pub recency_half_life_secs: u64,

    /// EMA step for ranking weights.
    #[serde(default = "default_weight_learning_rate")]
    pub weight_learning_rate: f32,

    /// Step for rule confidence updates.
    #[serde(default = "default_confidence_learning_rate")]
    pub confidence_learning_rate: f32,

    /// Rules whose learned confidence drops below this are skipped.
    #[serde(default = "default_rule_disable_threshold")]
    pub rule_disable_threshold: f32,

    #[serde(default)]
    pub embedding_provider: EmbeddingBackend,

    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub inference_provider: InferenceBackend,

    #[serde(default = "default_inference_model")]
    pub inference_model: String,

    /// Base URL of the Ollama / OpenAI-compatible server.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Bearer token for the chat endpoint, if it needs one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inference_api_key: String,

    /// Rule file loaded at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,
}

impl fmt::Debug for NeurosConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeurosConfig")
            .field("db_path", &self.db_path)
            .field("depth_tier", &self.depth_tier)
            .field("ranking_weights", &self.ranking_weights)
            .field("candidate_pool", &self.candidate_pool)
            .field("leg_timeout_ms", &self.leg_timeout_ms)
            .field("staleness_ms", &self.staleness_ms)
            .field("fanout_attempts", &self.fanout_attempts)
            .field("fanout_backoff_ms", &self.fanout_backoff_ms)
            .field("embedding_timeout_ms", &self.embedding_timeout_ms)
            .field("inference_timeout_ms", &self.inference_timeout_ms)
            .field("inference_attempts", &self.inference_attempts)
            .field("inference_backoff_ms", &self.inference_backoff_ms)
            .field("tombstone_grace_secs", &self.tombstone_grace_secs)
            .field("recency_half_life_secs", &self.recency_half_life_secs)
            .field("weight_learning_rate", &self.weight_learning_rate)
            .field("confidence_learning_rate", &self.confidence_learning_rate)
            .field("rule_disable_threshold", &self.rule_disable_threshold)
            .field("embedding_provider", &self.embedding_provider)
            .field("embedding_dimension", &self.embedding_dimension)
            .field("embedding_model", &self.embedding_model)
            .field("inference_provider", &self.inference_provider)
            .field("inference_model", &self.inference_model)
            .field("ollama_url", &self.ollama_url)
            .field(
                "inference_api_key",
                if self.inference_api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("rules_file", &self.rules_file)
            .finish()
    }
}

fn default_db_path() -> String {
    neuros_dir().join("neuros.db").to_string_lossy().into_owned()
}
fn default_candidate_pool() -> usize {
    50
}
fn default_leg_timeout_ms() -> u64 {
    2_000
}
fn default_staleness_ms() -> u64 {
    5_000
}
fn default_fanout_attempts() -> u32 {
    3
}
fn default_fanout_backoff_ms() -> u64 {
    50
}
fn default_embedding_timeout_ms() -> u64 {
    10_000
}
fn default_inference_timeout_ms() -> u64 {
    30_000
}
fn default_inference_attempts() -> u32 {
    3
}
fn default_inference_backoff_ms() -> u64 {
    200
}
fn default_tombstone_grace_secs() -> u64 {
    7 * 24 * 3600
}
fn default_recency_half_life_secs() -> u64 {
    7 * 24 * 3600
}
fn default_weight_learning_rate() -> f32 {
    0.1
}
fn default_confidence_learning_rate() -> f32 {
    0.2
}
fn default_rule_disable_threshold() -> f32 {
    neuros_kernel::DEFAULT_DISABLE_THRESHOLD
}
fn default_embedding_dimension() -> usize {
    crate::embedding::DEFAULT_HASHING_DIMENSION
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_inference_model() -> String {
    "llama3".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

impl Default for NeurosConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            depth_tier: DepthTier::default(),
            ranking_weights: RankingWeights::default(),
            candidate_pool: default_candidate_pool(),
            leg_timeout_ms: default_leg_timeout_ms(),
            staleness_ms: default_staleness_ms(),
            fanout_attempts: default_fanout_attempts(),
            fanout_backoff_ms: default_fanout_backoff_ms(),
            embedding_timeout_ms: default_embedding_timeout_ms(),
            inference_timeout_ms: default_inference_timeout_ms(),
            inference_attempts: default_inference_attempts(),
            inference_backoff_ms: default_inference_backoff_ms(),
            tombstone_grace_secs: default_tombstone_grace_secs(),
            recency_half_life_secs: default_recency_half_life_secs(),
            weight_learning_rate: default_weight_learning_rate(),
            confidence_learning_rate: default_confidence_learning_rate(),
            rule_disable_threshold: default_rule_disable_threshold(),
            embedding_provider: EmbeddingBackend::default(),
            embedding_dimension: default_embedding_dimension(),
            embedding_model: default_embedding_model(),
            inference_provider: InferenceBackend::default(),
            inference_model: default_inference_model(),
            ollama_url: default_ollama_url(),
            inference_api_key: String::new(),
            rules_file: None,
        }
    }
}

impl NeurosConfig {
    /// Defaults with an in-process database.
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            ..Self::default()
        }
    }

    pub fn max_depth(&self) -> usize {
        self.depth_tier.max_depth()
    }

    pub fn leg_timeout(&self) -> Duration {
        Duration::from_millis(self.leg_timeout_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn fanout_backoff(&self) -> Duration {
        Duration::from_millis(self.fanout_backoff_ms)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn inference_backoff(&self) -> Duration {
        Duration::from_millis(self.inference_backoff_ms)
    }

    pub fn tombstone_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.tombstone_grace_secs).unwrap_or(i64::MAX))
    }

    pub fn recency_half_life(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.recency_half_life_secs).unwrap_or(i64::MAX))
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), NeurosError> {
        let w = &self.ranking_weights;
        if [w.structured, w.vector, w.analytical]
            .iter()
            .any(|x| !x.is_finite() || *x < 0.0)
        {
            return Err(NeurosError::Config(
                "ranking weights must be finite and non-negative".into(),
            ));
        }
        if self.fanout_attempts == 0 || self.inference_attempts == 0 {
            return Err(NeurosError::Config("attempt counts must be at least 1".into()));
        }
        if self.embedding_dimension == 0 {
            return Err(NeurosError::Config("embedding_dimension must be positive".into()));
        }
        if self.recency_half_life_secs == 0 {
            return Err(NeurosError::Config("recency_half_life_secs must be positive".into()));
        }
        for (name, rate) in [
            ("weight_learning_rate", self.weight_learning_rate),
            ("confidence_learning_rate", self.confidence_learning_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(NeurosError::Config(format!("{name} must be within [0, 1]")));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn neuros_dir() -> PathBuf {
    PathBuf::from(home_dir()).join(".neuros")
}

/// Return the path to `~/.neuros/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".neuros").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<NeurosConfig>, NeurosError> {
    load_from(&config_path())
}

/// Load the config, falling back to defaults (plus env overrides) when the
/// file is missing.
pub fn load_or_default() -> Result<NeurosConfig, NeurosError> {
    if let Some(cfg) = load()? {
        return Ok(cfg);
    }
    let mut cfg = NeurosConfig::default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_from(path: &Path) -> Result<Option<NeurosConfig>, NeurosError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        NeurosError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: NeurosConfig = toml::from_str(&raw)
        .map_err(|e| NeurosError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `NEUROS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `NEUROS_DB_PATH` | `db_path` |
/// | `NEUROS_DEPTH_TIER` | `depth_tier` |
/// | `NEUROS_OLLAMA_URL` | `ollama_url` |
/// | `NEUROS_MODEL` | `inference_model` |
/// | `NEUROS_EMBEDDING_MODEL` | `embedding_model` |
/// | `NEUROS_EMBEDDING_PROVIDER` | `embedding_provider` (`hashing` or `ollama`) |
/// | `NEUROS_INFERENCE_PROVIDER` | `inference_provider` (`evidence` or `chat`) |
/// | `NEUROS_API_KEY` | `inference_api_key` |
/// | `NEUROS_LEG_TIMEOUT_MS` | `leg_timeout_ms` |
/// | `NEUROS_INFERENCE_TIMEOUT_MS` | `inference_timeout_ms` |
/// | `NEUROS_RULES_FILE` | `rules_file` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut NeurosConfig) {
    if let Ok(v) = std::env::var("NEUROS_DB_PATH") {
        cfg.db_path = v;
    }
    if let Ok(v) = std::env::var("NEUROS_DEPTH_TIER")
        && let Ok(tier) = v.parse::<DepthTier>()
    {
        cfg.depth_tier = tier;
    }
    if let Ok(v) = std::env::var("NEUROS_OLLAMA_URL") {
        cfg.ollama_url = v;
    }
    if let Ok(v) = std::env::var("NEUROS_MODEL") {
        cfg.inference_model = v;
    }
    if let Ok(v) = std::env::var("NEUROS_EMBEDDING_MODEL") {
        cfg.embedding_model = v;
    }
    if let Ok(v) = std::env::var("NEUROS_EMBEDDING_PROVIDER") {
        match v.to_ascii_lowercase().as_str() {
            "hashing" => cfg.embedding_provider = EmbeddingBackend::Hashing,
            "ollama" => cfg.embedding_provider = EmbeddingBackend::Ollama,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("NEUROS_INFERENCE_PROVIDER") {
        match v.to_ascii_lowercase().as_str() {
            "evidence" => cfg.inference_provider = InferenceBackend::Evidence,
            "chat" => cfg.inference_provider = InferenceBackend::Chat,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("NEUROS_API_KEY") {
        cfg.inference_api_key = v;
    }
    if let Ok(v) = std::env::var("NEUROS_LEG_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.leg_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("NEUROS_INFERENCE_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.inference_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("NEUROS_RULES_FILE") {
        cfg.rules_file = Some(PathBuf::from(v));
    }
}

/// Save the config to `~/.neuros/config.toml`.
pub fn save(cfg: &NeurosConfig) -> Result<(), NeurosError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &NeurosConfig, path: &Path) -> Result<(), NeurosError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NeurosError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                NeurosError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| NeurosError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| NeurosError::Config(format!("failed to write config at {}: {e}", path.display()));
    // The file may hold an API key: owner read/write only on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tiers_map_to_step_budgets() {
        assert_eq!(DepthTier::Basic.max_depth(), 3);
        assert_eq!(DepthTier::Extended.max_depth(), 6);
        assert_eq!(DepthTier::Deep.max_depth(), 10);
        assert_eq!("DEEP".parse::<DepthTier>().unwrap(), DepthTier::Deep);
        assert!("bottomless".parse::<DepthTier>().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut cfg = NeurosConfig::in_memory();
        assert!(format!("{cfg:?}").contains("<not set>"));
        cfg.inference_api_key = "sk-super-secret".into();
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("sk-super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = NeurosConfig::in_memory();
        cfg.depth_tier = DepthTier::Extended;
        cfg.rules_file = Some(PathBuf::from("/etc/neuros/rules.dl"));
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.depth_tier, DepthTier::Extended);
        assert_eq!(loaded.db_path, ":memory:");
        assert_eq!(loaded.ranking_weights, RankingWeights::default());
        assert_eq!(loaded.rules_file, cfg.rules_file);
        assert_eq!(loaded.fanout_attempts, 3);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "depth_tier = \"deep\"\ninference_provider = \"chat\"\n").unwrap();
        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.max_depth(), 10);
        assert_eq!(cfg.inference_provider, InferenceBackend::Chat);
        assert_eq!(cfg.embedding_provider, EmbeddingBackend::Hashing);
        assert_eq!(cfg.candidate_pool, 50);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "depth_tier = [").unwrap();
        assert!(matches!(load_from(&path), Err(NeurosError::Config(_))));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn validate_rejects_negative_weights_and_zero_attempts() {
        let mut cfg = NeurosConfig::in_memory();
        cfg.ranking_weights = RankingWeights::new(-0.1, 0.5, 0.5);
        assert!(cfg.validate().is_err());

        let mut cfg = NeurosConfig::in_memory();
        cfg.inference_attempts = 0;
        assert!(cfg.validate().is_err());

        assert!(NeurosConfig::in_memory().validate().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&NeurosConfig::in_memory(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: only this test touches these variables.
        unsafe {
            std::env::set_var("NEUROS_DEPTH_TIER", "extended");
            std::env::set_var("NEUROS_INFERENCE_TIMEOUT_MS", "not-a-number");
            std::env::set_var("NEUROS_EMBEDDING_PROVIDER", "ollama");
        }
        let mut cfg = NeurosConfig::in_memory();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.depth_tier, DepthTier::Extended);
        assert_eq!(cfg.inference_timeout_ms, default_inference_timeout_ms());
        assert_eq!(cfg.embedding_provider, EmbeddingBackend::Ollama);
        unsafe {
            std::env::remove_var("NEUROS_DEPTH_TIER");
            std::env::remove_var("NEUROS_INFERENCE_TIMEOUT_MS");
            std::env::remove_var("NEUROS_EMBEDDING_PROVIDER");
        }
    }
}
