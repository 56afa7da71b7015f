//! Configuration schema for leadbot.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so that the JSON config
//! file can use camelCase keys while Rust code uses snake_case fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::helpers::expand_tilde;

// ---------------------------------------------------------------------------
// App config
// ---------------------------------------------------------------------------

/// Application identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_app_version")]
    pub version: String,
    /// Fallback `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_app_name() -> String {
    "Chatbot API".to_string()
}

fn default_app_version() -> String {
    "0.1.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent configs
// ---------------------------------------------------------------------------

/// Default model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-request HTTP timeout for the model endpoint.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transient model errors (429, 5xx, transport). 0 disables.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_model() -> String {
    "gemini-flash-latest".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> usize {
    3
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

// ---------------------------------------------------------------------------
// Provider configs
// ---------------------------------------------------------------------------

/// LLM provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// Configuration for LLM providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub gemini: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub vllm: ProviderConfig,
}

// ---------------------------------------------------------------------------
// Funnel config
// ---------------------------------------------------------------------------

/// Conversation funnel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Quiet period before a batch of user messages is answered (0 = answer immediately).
    #[serde(default = "default_batch_wait_secs")]
    pub batch_wait_secs: u64,
    /// Upper bound on a debounced batch window.
    #[serde(default = "default_batch_max_wait_secs")]
    pub batch_max_wait_secs: u64,
    /// Age after which a leftover batch flag is considered abandoned.
    #[serde(default = "default_batch_stale_secs")]
    pub batch_stale_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,
    /// Optional JSON file replacing the built-in stage catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<String>,
    /// Identity preamble placed at the top of every prompt.
    #[serde(default = "default_persona")]
    pub persona: String,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_batch_wait_secs() -> u64 {
    60
}

fn default_batch_max_wait_secs() -> u64 {
    180
}

fn default_batch_stale_secs() -> u64 {
    300
}

fn default_history_limit() -> usize {
    10
}

fn default_duplicate_window_secs() -> u64 {
    3
}

fn default_persona() -> String {
    "You are a friendly, professional sales assistant for a nutrition and food-psychology \
     coaching team. You chat with prospective clients on messaging apps, in their language, \
     with short warm messages. Your goal is to understand the lead and, when they are ready, \
     get them to book a free consultation. Never mention funnel stages to the lead."
        .to_string()
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            batch_wait_secs: default_batch_wait_secs(),
            batch_max_wait_secs: default_batch_max_wait_secs(),
            batch_stale_secs: default_batch_stale_secs(),
            history_limit: default_history_limit(),
            duplicate_window_secs: default_duplicate_window_secs(),
            catalog_path: None,
            persona: default_persona(),
        }
    }
}

impl FunnelConfig {
    pub fn catalog_path(&self) -> Option<PathBuf> {
        self.catalog_path.as_deref().map(expand_tilde)
    }
}

// ---------------------------------------------------------------------------
// Store config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.leadbot/leadbot.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

/// Root configuration for leadbot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub funnel: FunnelConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Get the expanded database path.
    pub fn db_path(&self) -> PathBuf {
        expand_tilde(&self.store.db_path)
    }

    /// Get the API key in priority order: Gemini > OpenAI > OpenRouter > vLLM.
    pub fn get_api_key(&self) -> Option<String> {
        let candidates = [
            &self.providers.gemini.api_key,
            &self.providers.openai.api_key,
            &self.providers.openrouter.api_key,
            &self.providers.vllm.api_key,
        ];
        candidates
            .into_iter()
            .find(|key| !key.is_empty())
            .cloned()
    }

    /// Get the API base URL for the active provider.
    ///
    /// Detection order matches `get_api_key()` priority so that the key and
    /// base always refer to the same provider.
    pub fn get_api_base(&self) -> Option<String> {
        let p = &self.providers;
        if !p.gemini.api_key.is_empty() {
            return Some(p.gemini.api_base.clone().unwrap_or_else(|| {
                "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
            }));
        }
        if !p.openai.api_key.is_empty() {
            return Some(
                p.openai
                    .api_base
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            );
        }
        if !p.openrouter.api_key.is_empty() {
            return Some(
                p.openrouter
                    .api_base
                    .clone()
                    .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            );
        }
        p.vllm.api_base.clone()
    }
}

/// Runtime knobs of the orchestrator, derived from [`FunnelConfig`].
#[derive(Debug, Clone)]
pub struct FunnelSettings {
    pub confidence_threshold: f64,
    pub batch_wait: Duration,
    pub batch_max_wait: Duration,
    pub batch_stale_after: Duration,
    pub history_limit: usize,
    pub duplicate_window: Duration,
    pub persona: String,
}

impl From<&FunnelConfig> for FunnelSettings {
    fn from(cfg: &FunnelConfig) -> Self {
        Self {
            confidence_threshold: cfg.confidence_threshold,
            batch_wait: Duration::from_secs(cfg.batch_wait_secs),
            batch_max_wait: Duration::from_secs(cfg.batch_max_wait_secs.max(cfg.batch_wait_secs)),
            batch_stale_after: Duration::from_secs(cfg.batch_stale_secs),
            history_limit: cfg.history_limit,
            duplicate_window: Duration::from_secs(cfg.duplicate_window_secs),
            persona: cfg.persona.clone(),
        }
    }
}

impl Default for FunnelSettings {
    fn default() -> Self {
        Self::from(&FunnelConfig::default())
    }
}
