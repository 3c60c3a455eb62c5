//! Configuration loading, validation, and management for Threadloom.
//!
//! Loads configuration from `~/.threadloom/config.toml` with environment
//! variable overrides. Validated once at startup and then passed by
//! reference into the strategy factory; nothing reads process-wide state
//! after that.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use threadloom_core::oracle::ModelSettings;

/// The root configuration structure.
///
/// Maps directly to `~/.threadloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Iterative research loop settings
    #[serde(default)]
    pub research: ResearchConfig,

    /// Text-to-query settings
    #[serde(default)]
    pub tabular: TabularConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Backend kind; only "openai" compatible endpoints ship today
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_request_timeout() -> u64 {
    120
}

impl OracleConfig {
    /// Settings for calls that use the default model.
    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings::new(&self.model)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            max_tokens: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for OracleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Hard ceiling on executed plan steps before synthesis is forced
    #[serde(default = "default_step_budget")]
    pub step_budget: u32,

    /// Wall-clock ceiling; exceeding it forces synthesis like the budget does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner_model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_model: Option<String>,

    /// Tool rounds one executed step may use
    #[serde(default = "default_executor_rounds")]
    pub executor_max_tool_rounds: usize,
}

fn default_step_budget() -> u32 {
    15
}
fn default_executor_rounds() -> usize {
    5
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            step_budget: default_step_budget(),
            deadline_secs: None,
            planner_model: None,
            executor_model: None,
            synthesis_model: None,
            executor_max_tool_rounds: default_executor_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabularConfig {
    /// Generate-and-validate attempts before giving up
    #[serde(default = "default_query_attempts")]
    pub max_query_attempts: usize,

    /// sqlx connection string of the queried database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_query_attempts() -> usize {
    3
}

impl Default for TabularConfig {
    fn default() -> Self {
        Self {
            max_query_attempts: default_query_attempts(),
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Candidates considered before diversity selection
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,

    /// 1.0 ranks purely by relevance, 0.0 purely by diversity
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
}

fn default_top_k() -> usize {
    5
}
fn default_fetch_k() -> usize {
    20
}
fn default_mmr_lambda() -> f32 {
    0.5
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fetch_k: default_fetch_k(),
            mmr_lambda: default_mmr_lambda(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Prior turns replayed when an assistant does not say otherwise
    #[serde(default = "default_history_messages")]
    pub default_messages: usize,
}

fn default_history_messages() -> usize {
    10
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_messages: default_history_messages(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_api_key: Option<String>,

    #[serde(default = "default_search_base_url")]
    pub search_base_url: String,

    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,

    /// Base URL of the action API the tool agent may call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_base_url: Option<String>,
}

fn default_search_base_url() -> String {
    "https://api.tavily.com".into()
}
fn default_search_max_results() -> usize {
    3
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_api_key: None,
            search_base_url: default_search_base_url(),
            search_max_results: default_search_max_results(),
            action_base_url: None,
        }
    }
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("search_api_key", &redact(&self.search_api_key))
            .field("search_base_url", &self.search_base_url)
            .field("search_max_results", &self.search_max_results)
            .field("action_base_url", &self.action_base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// SQLite file; defaults to `~/.threadloom/threadloom.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("threadloom.db"))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42700
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.threadloom/config.toml).
    ///
    /// Then applies environment overrides:
    /// - `THREADLOOM_API_KEY`, falling back to `OPENAI_API_KEY`
    /// - `THREADLOOM_MODEL`, `THREADLOOM_BASE_URL`
    /// - `TAVILY_API_KEY` for the search tool
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if self.oracle.api_key.is_none() {
            self.oracle.api_key = env("THREADLOOM_API_KEY").or_else(|| env("OPENAI_API_KEY"));
        }
        if let Some(model) = env("THREADLOOM_MODEL") {
            self.oracle.model = model;
        }
        if let Some(url) = env("THREADLOOM_BASE_URL") {
            self.oracle.base_url = url;
        }
        if self.tools.search_api_key.is_none() {
            self.tools.search_api_key = env("TAVILY_API_KEY");
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".threadloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            return Err(ConfigError::ValidationError(
                "oracle.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.research.step_budget == 0 {
            return Err(ConfigError::ValidationError(
                "research.step_budget must be at least 1".into(),
            ));
        }
        if self.tabular.max_query_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "tabular.max_query_attempts must be at least 1".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.mmr_lambda) {
            return Err(ConfigError::ValidationError(
                "retrieval.mmr_lambda must be between 0.0 and 1.0".into(),
            ));
        }
        if !matches!(self.store.backend.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "store.backend must be 'memory' or 'sqlite', got '{}'",
                self.store.backend
            )));
        }
        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
