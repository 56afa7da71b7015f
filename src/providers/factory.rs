//! Centralized model client construction.
//!
//! The orchestrator asks for a client per request (the caller may pick a
//! model name); this module resolves key, base URL and sampling settings
//! from the config in one place.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::config::schema::Config;
use crate::providers::base::{ModelClient, ModelFactory};
use crate::providers::openai_compat::OpenAICompatClient;
use crate::providers::retry::RetryPolicy;

/// Descriptor for creating model clients.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    /// API key (may be empty for local servers).
    pub api_key: String,
    /// API base URL. None = nothing configured.
    pub api_base: Option<String>,
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ProviderSpec {
    pub fn from_config(cfg: &Config) -> Self {
        let defaults = &cfg.agents.defaults;
        ProviderSpec {
            api_key: cfg.get_api_key().unwrap_or_default(),
            api_base: cfg.get_api_base(),
            default_model: defaults.model.clone(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            timeout: Duration::from_secs(defaults.timeout_secs),
            retry: RetryPolicy::with_max_retries(defaults.max_retries),
        }
    }
}

/// [`ModelFactory`] backed by an OpenAI-compatible endpoint.
pub struct ProviderModelFactory {
    spec: ProviderSpec,
}

impl ProviderModelFactory {
    pub fn new(spec: ProviderSpec) -> Self {
        Self { spec }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(ProviderSpec::from_config(cfg))
    }
}

impl ModelFactory for ProviderModelFactory {
    fn client_for(&self, model: Option<&str>) -> anyhow::Result<Arc<dyn ModelClient>> {
        let Some(base) = self.spec.api_base.as_deref() else {
            bail!("no model provider configured (set providers.gemini.apiKey or another provider)");
        };
        if self.spec.api_key.is_empty() && !is_local_base(base) {
            bail!("no API key configured for {}", base);
        }

        let requested = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.spec.default_model);
        let model = resolve_model_name(base, requested);

        let client = OpenAICompatClient::new(&self.spec.api_key, base, model, self.spec.timeout)
            .with_sampling(self.spec.max_tokens, self.spec.temperature)
            .with_retry(self.spec.retry);
        Ok(Arc::new(client))
    }

    fn default_model(&self) -> &str {
        &self.spec.default_model
    }
}

/// Determine whether an api_base URL points to a local server.
fn is_local_base(base: &str) -> bool {
    base.contains("localhost") || base.contains("127.0.0.1") || base.contains("0.0.0.0")
}

/// OpenRouter and local servers route on the full `org/model` id; other
/// cloud endpoints want the bare model name.
fn resolve_model_name<'a>(base: &str, model: &'a str) -> &'a str {
    if base.contains("openrouter") || base.starts_with("http://") {
        model
    } else {
        model.rsplit('/').next().unwrap_or(model)
    }
}
