use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MnemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub nli: NliConfig,
    pub search: SearchConfig,
    pub ranking: RankingConfig,
    pub stale: StaleConfig,
    pub working_memory: WorkingMemoryConfig,
    pub evaluator: EvaluatorConfig,
    pub consolidation: ConsolidationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Agent scope used when a request carries no agentId.
    pub default_agent: String,
    /// Directory for consolidation feedback reports.
    pub report_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"remote"` (OpenAI-compatible /embeddings endpoint) or `"none"`.
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Must agree with the vec0 column width in the schema.
    pub dims: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// `"ollama"`, `"openai"`, or `"none"`.
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NliConfig {
    /// `"local"` (ONNX cross-encoder), `"remote"` (HTTP /classify), or `"none"`.
    pub mode: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Cache directory holding model.onnx and tokenizer.json for local mode.
    pub cache_dir: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// L1 result count below which L2 runs.
    pub min_l1_results: usize,
    pub l2_limit: usize,
    pub l3_limit: usize,
    pub l3_min_similarity: f64,
    pub recall_token_budget: usize,
    pub context_token_budget: usize,
    /// One-hop cap for link expansion.
    pub linked_fragment_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RankingConfig {
    /// Composite score coefficients; must sum to 1.0.
    pub importance_weight: f64,
    pub recency_weight: f64,
    /// Store size at which composite ranking activates.
    pub activation_threshold: u64,
    /// Recency window in days (fragments older than this score 0 recency).
    pub recency_window_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StaleConfig {
    /// Days since verification before a fragment is annotated stale, per type.
    pub procedure_days: i64,
    pub fact_days: i64,
    pub decision_days: i64,
    pub default_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    /// Token ceiling per session queue.
    pub max_tokens: usize,
    /// Entries at or below this importance are evictable before their turn.
    pub eviction_importance: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub enabled: bool,
    /// Poll cadence when the evaluation queue is empty.
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub decay_factor: f64,
    pub decay_inactive_days: i64,
    pub expiry_importance_floor: f64,
    pub expiry_inactive_days: i64,
    pub embedding_backfill_batch: usize,
    pub anchor_access_count: u32,
    pub anchor_importance: f64,
    /// Same-topic cosine gate for contradiction candidates.
    pub contradiction_similarity: f64,
    /// Similarity above which unresolvable pairs are queued for a later pass.
    pub pending_similarity: f64,
    pub pending_drain_batch: usize,
    pub max_keyword_set_size: usize,
    pub stale_report_limit: usize,
}

impl Default for MnemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            nli: NliConfig::default(),
            search: SearchConfig::default(),
            ranking: RankingConfig::default(),
            stale: StaleConfig::default(),
            working_memory: WorkingMemoryConfig::default(),
            evaluator: EvaluatorConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            host: "127.0.0.1".into(),
            port: 8391,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_mnemon_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        let report_dir = default_mnemon_dir()
            .join("reports")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            default_agent: "default".into(),
            report_dir,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "none".into(),
            base_url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            model: "text-embedding-3-small".into(),
            dims: 1536,
            timeout_secs: 10,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "none".into(),
            base_url: "http://localhost:11434".into(),
            api_key: String::new(),
            model: "gemma3:4b".into(),
            timeout_secs: 30,
        }
    }
}

impl Default for NliConfig {
    fn default() -> Self {
        let cache_dir = default_mnemon_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            mode: "local".into(),
            endpoint: "http://localhost:8392".into(),
            timeout_secs: 3,
            cache_dir,
            model: "mDeBERTa-v3-base-xnli".into(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_l1_results: 3,
            l2_limit: 30,
            l3_limit: 10,
            l3_min_similarity: 0.3,
            recall_token_budget: 1000,
            context_token_budget: 2000,
            linked_fragment_limit: 10,
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            importance_weight: 0.6,
            recency_weight: 0.4,
            activation_threshold: 100,
            recency_window_days: 90,
        }
    }
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            procedure_days: 30,
            fact_days: 60,
            decision_days: 90,
            default_days: 60,
        }
    }
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            eviction_importance: 0.8,
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 5,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.995,
            decay_inactive_days: 1,
            expiry_importance_floor: 0.1,
            expiry_inactive_days: 90,
            embedding_backfill_batch: 5,
            anchor_access_count: 10,
            anchor_importance: 0.8,
            contradiction_similarity: 0.85,
            pending_similarity: 0.92,
            pending_drain_batch: 10,
            max_keyword_set_size: 1000,
            stale_report_limit: 20,
        }
    }
}

/// Returns `~/.mnemon/`
pub fn default_mnemon_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnemon")
}

/// Returns the default config file path: `~/.mnemon/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnemon_dir().join("config.toml")
}

impl MnemonConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemonConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (MNEMON_DB, MNEMON_AGENT, MNEMON_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMON_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMON_AGENT") {
            self.storage.default_agent = val;
        }
        if let Ok(val) = std::env::var("MNEMON_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MNEMON_EMBEDDING_API_KEY") {
            self.embedding.api_key = val;
        }
        if let Ok(val) = std::env::var("MNEMON_LLM_API_KEY") {
            self.llm.api_key = val;
        }
    }

    /// Reject configurations the ranking math cannot support.
    fn validate(&self) -> Result<()> {
        let sum = self.ranking.importance_weight + self.ranking.recency_weight;
        anyhow::ensure!(
            (sum - 1.0).abs() < 1e-9,
            "ranking.importance_weight + ranking.recency_weight must sum to 1.0, got {sum}"
        );
        anyhow::ensure!(
            self.embedding.dims > 0,
            "embedding.dims must be positive"
        );
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the report directory, expanding `~` if needed.
    pub fn resolved_report_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.report_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
