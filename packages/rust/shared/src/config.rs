//! Application configuration for Gapwise.
//!
//! User config lives at `~/.gapwise/gapwise.toml`. A missing file means
//! defaults; every field carries a serde default so partial files load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GapwiseError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "gapwise.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".gapwise";

/// Tolerance for the confidence-weight sum check.
const WEIGHT_SUM_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Config structs (matching gapwise.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub coverage: CoverageConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub confidence: ConfidenceConfig,

    #[serde(default)]
    pub gaps: GapsConfig,

    #[serde(default)]
    pub research: ResearchConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub reload: ReloadConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Knowledge store database path; a leading `~/` expands to the home dir.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Database path with `~/` expanded.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| GapwiseError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.path)),
        }
    }
}

fn default_store_path() -> String {
    "~/.gapwise/gapwise.db".into()
}

/// `[coverage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Number of atoms requested from the retriever.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum score for an atom to count toward coverage.
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,

    /// Qualifying atoms needed for `STRONG`.
    #[serde(default = "default_strong_min_atoms")]
    pub strong_min_atoms: usize,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            relevance_floor: default_relevance_floor(),
            strong_min_atoms: default_strong_min_atoms(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_relevance_floor() -> f64 {
    0.05
}
fn default_strong_min_atoms() -> usize {
    3
}

/// `[routing]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Hard cap on similar-case retrieval for Route A.
    #[serde(default = "default_examples_timeout_ms")]
    pub examples_timeout_ms: u64,

    /// Number of similar past cases to fetch.
    #[serde(default = "default_examples_limit")]
    pub examples_limit: usize,

    /// Bound on the concurrent fan-out join for Routes B and C.
    #[serde(default = "default_fanout_timeout_ms")]
    pub fanout_timeout_ms: u64,

    /// Regex confidence below which deep extraction runs.
    #[serde(default = "default_deep_extraction_threshold")]
    pub deep_extraction_threshold: f64,

    /// Whether the classifier may call the completion provider at all.
    #[serde(default = "default_true")]
    pub deep_extraction: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            examples_timeout_ms: default_examples_timeout_ms(),
            examples_limit: default_examples_limit(),
            fanout_timeout_ms: default_fanout_timeout_ms(),
            deep_extraction_threshold: default_deep_extraction_threshold(),
            deep_extraction: true,
        }
    }
}

impl RoutingConfig {
    pub fn examples_timeout(&self) -> Duration {
        Duration::from_millis(self.examples_timeout_ms)
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }
}

fn default_examples_timeout_ms() -> u64 {
    2_000
}
fn default_examples_limit() -> usize {
    3
}
fn default_fanout_timeout_ms() -> u64 {
    30_000
}
fn default_deep_extraction_threshold() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

/// Dimension weights; must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    #[serde(default = "default_weight_accuracy")]
    pub accuracy: f64,
    #[serde(default = "default_weight_relevance")]
    pub relevance: f64,
    #[serde(default = "default_weight_completeness")]
    pub completeness: f64,
    #[serde(default = "default_weight_safety")]
    pub safety: f64,
    #[serde(default = "default_weight_clarity")]
    pub clarity: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            accuracy: default_weight_accuracy(),
            relevance: default_weight_relevance(),
            completeness: default_weight_completeness(),
            safety: default_weight_safety(),
            clarity: default_weight_clarity(),
        }
    }
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.accuracy + self.relevance + self.completeness + self.safety + self.clarity
    }
}

fn default_weight_accuracy() -> f64 {
    0.30
}
fn default_weight_relevance() -> f64 {
    0.25
}
fn default_weight_completeness() -> f64 {
    0.20
}
fn default_weight_safety() -> f64 {
    0.15
}
fn default_weight_clarity() -> f64 {
    0.10
}

/// `[confidence]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    #[serde(default)]
    pub weights: ConfidenceWeights,

    /// Overall score below which the answer is escalated.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,

    #[serde(default = "default_safety_floor")]
    pub safety_floor: f64,

    #[serde(default = "default_accuracy_floor")]
    pub accuracy_floor: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            weights: ConfidenceWeights::default(),
            escalation_threshold: default_escalation_threshold(),
            safety_floor: default_safety_floor(),
            accuracy_floor: default_accuracy_floor(),
        }
    }
}

fn default_escalation_threshold() -> f64 {
    0.7
}
fn default_safety_floor() -> f64 {
    0.5
}
fn default_accuracy_floor() -> f64 {
    0.6
}

/// `[gaps]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapsConfig {
    /// Run detection for every query and push the result to the audit queue.
    #[serde(default)]
    pub always_log: bool,

    /// Capacity of the gap audit queue.
    #[serde(default = "default_audit_queue_capacity")]
    pub audit_queue_capacity: usize,

    /// Feedback events required before the success rate is judged.
    #[serde(default = "default_feedback_min_samples")]
    pub feedback_min_samples: u32,

    /// Success rate below which a `LOW_SATISFACTION` gap is raised.
    #[serde(default = "default_feedback_success_floor")]
    pub feedback_success_floor: f64,
}

impl Default for GapsConfig {
    fn default() -> Self {
        Self {
            always_log: false,
            audit_queue_capacity: default_audit_queue_capacity(),
            feedback_min_samples: default_feedback_min_samples(),
            feedback_success_floor: default_feedback_success_floor(),
        }
    }
}

fn default_audit_queue_capacity() -> usize {
    256
}
fn default_feedback_min_samples() -> u32 {
    3
}
fn default_feedback_success_floor() -> f64 {
    0.30
}

/// `[research]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Hold proposed units for human review instead of inserting them.
    #[serde(default = "default_true")]
    pub require_approval: bool,

    /// Attempts per backend before falling through to the next.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base; the delay doubles after every failed attempt.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Per-task timeout.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Maximum gap fills running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Findings shorter than this are dropped.
    #[serde(default = "default_min_finding_chars")]
    pub min_finding_chars: usize,

    /// Web search URL; `{query}` is replaced by the encoded query.
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Result pages fetched per web sub-query.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            require_approval: true,
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            min_finding_chars: default_min_finding_chars(),
            search_url: default_search_url(),
            max_pages: default_max_pages(),
            user_agent: default_user_agent(),
        }
    }
}

impl ResearchConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_task_timeout_secs() -> u64 {
    1_800
}
fn default_max_concurrent() -> usize {
    2
}
fn default_min_finding_chars() -> usize {
    40
}
fn default_search_url() -> String {
    "https://html.duckduckgo.com/html/?q={query}".into()
}
fn default_max_pages() -> usize {
    3
}
fn default_user_agent() -> String {
    concat!("gapwise/", env!("CARGO_PKG_VERSION")).into()
}

/// `[completion]` section (OpenRouter-compatible chat API).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Model used by the premium research backend.
    #[serde(default = "default_research_model")]
    pub research_model: String,

    #[serde(default = "default_completion_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Fallback completion cache lifetime.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Price used for `chars / 4` token estimates.
    #[serde(default = "default_cost_per_1k_tokens")]
    pub cost_per_1k_tokens: f64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            research_model: default_research_model(),
            timeout_ms: default_completion_timeout_ms(),
            max_tokens: default_max_tokens(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            cost_per_1k_tokens: default_cost_per_1k_tokens(),
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_research_model() -> String {
    "perplexity/sonar".into()
}
fn default_completion_timeout_ms() -> u64 {
    20_000
}
fn default_max_tokens() -> u32 {
    1_024
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_capacity() -> u64 {
    1_000
}
fn default_cost_per_1k_tokens() -> f64 {
    0.002
}

/// What a full background queue does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room.
    #[default]
    DropOldest,
    /// Discard the incoming item.
    DropNewest,
}

/// `[trace]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1_024
}

/// `[reload]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between config file mtime checks.
    #[serde(default = "default_reload_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reload_interval_secs(),
        }
    }
}

fn default_reload_interval_secs() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject configurations the decision core cannot run with.
    pub fn validate(&self) -> Result<()> {
        let sum = self.confidence.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(GapwiseError::validation(format!(
                "confidence weights must sum to 1.0, got {sum:.6}"
            )));
        }

        let w = &self.confidence.weights;
        for (name, value) in [
            ("weights.accuracy", w.accuracy),
            ("weights.relevance", w.relevance),
            ("weights.completeness", w.completeness),
            ("weights.safety", w.safety),
            ("weights.clarity", w.clarity),
            ("escalation_threshold", self.confidence.escalation_threshold),
            ("safety_floor", self.confidence.safety_floor),
            ("accuracy_floor", self.confidence.accuracy_floor),
            ("coverage.relevance_floor", self.coverage.relevance_floor),
            ("routing.deep_extraction_threshold", self.routing.deep_extraction_threshold),
            ("gaps.feedback_success_floor", self.gaps.feedback_success_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GapwiseError::validation(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        for (name, value) in [
            ("coverage.top_k", self.coverage.top_k),
            ("coverage.strong_min_atoms", self.coverage.strong_min_atoms),
            ("trace.queue_capacity", self.trace.queue_capacity),
            ("gaps.audit_queue_capacity", self.gaps.audit_queue_capacity),
            ("research.max_concurrent", self.research.max_concurrent),
        ] {
            if value == 0 {
                return Err(GapwiseError::validation(format!("{name} must be at least 1")));
            }
        }

        if self.research.max_retries == 0 {
            return Err(GapwiseError::validation("research.max_retries must be at least 1"));
        }
        if self.gaps.feedback_min_samples == 0 {
            return Err(GapwiseError::validation("gaps.feedback_min_samples must be at least 1"));
        }
        if !self.research.search_url.contains("{query}") {
            return Err(GapwiseError::validation(
                "research.search_url must contain a {query} placeholder",
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.gapwise/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| GapwiseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.gapwise/gapwise.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GapwiseError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        GapwiseError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| GapwiseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| GapwiseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| GapwiseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the completion API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.completion.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(GapwiseError::config(format!(
            "completion API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("relevance_floor"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("drop_oldest"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed, config);
        assert_eq!(parsed.coverage.strong_min_atoms, 3);
        assert_eq!(parsed.completion.cache_ttl_secs, 300);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
[coverage]
relevance_floor = 0.1

[trace]
overflow = "drop_newest"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.coverage.relevance_floor, 0.1);
        assert_eq!(config.coverage.top_k, 10);
        assert_eq!(config.trace.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.routing.examples_timeout_ms, 2_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_weights_sum_to_one() {
        let weights = ConfidenceWeights::default();
        assert!((weights.sum() - 1.0).abs() < WEIGHT_SUM_EPSILON);
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unbalanced_weights() {
        let mut config = AppConfig::default();
        config.confidence.weights.safety = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn rejects_out_of_range_floor_and_zero_capacity() {
        let mut config = AppConfig::default();
        config.confidence.safety_floor = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.trace.queue_capacity = 0;
        assert!(config.validate().unwrap_err().to_string().contains("queue_capacity"));
    }

    #[test]
    fn load_from_file_validates() {
        let path = std::env::temp_dir().join(format!("gw_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[coverage]\nstrong_min_atoms = 0\n").expect("write");
        assert!(load_config_from(&path).is_err());

        std::fs::write(&path, "[coverage]\nstrong_min_atoms = 4\n").expect("write");
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.coverage.strong_min_atoms, 4);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn store_path_expands_home() {
        let store = StoreConfig {
            path: "/var/lib/gapwise.db".into(),
        };
        assert_eq!(store.resolved_path().unwrap(), PathBuf::from("/var/lib/gapwise.db"));
        if let Some(home) = dirs::home_dir() {
            let resolved = StoreConfig::default().resolved_path().unwrap();
            assert!(resolved.starts_with(home));
        }
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.completion.api_key_env = "GW_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
