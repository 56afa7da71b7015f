//! OpenAI-compatible chat completions client.
//!
//! Talks to any endpoint implementing `POST {api_base}/chat/completions`:
//! Google's Gemini OpenAI-compat endpoint (the default), OpenAI, OpenRouter,
//! vLLM and other local servers. Transient failures are retried here with
//! jittered exponential backoff; callers see at most one error per `run`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backon::Retryable;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::base::ModelClient;
use super::retry::{adjust_for_rate_limit, RetryPolicy};
use crate::errors::ProviderError;

/// Fallback wait for a 429 without a usable `Retry-After` header.
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// A model client bound to one model on an OpenAI-compatible endpoint.
pub struct OpenAICompatClient {
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    retry: RetryPolicy,
    client: Client,
}

impl OpenAICompatClient {
    pub fn new(api_key: &str, api_base: &str, model: &str, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self {
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            retry: RetryPolicy::default(),
            client,
        }
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(&self, body: &Value) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);

        let mut request = self.client.post(&url).json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(DEFAULT_RETRY_AFTER_MS);

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::ResponseReadError(e.to_string()))?;

        if !(200..300).contains(&status) {
            warn!("Model API returned status {} (base={}): {}", status, self.api_base, text);
            return Err(classify_status(status, text, retry_after_ms));
        }

        let data: Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::JsonParseError(e.to_string()))?;
        extract_content(&data)
    }
}

#[async_trait]
impl ModelClient for OpenAICompatClient {
    async fn run(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        debug!(
            "run: api_base={} model={} prompt_chars={}",
            self.api_base,
            self.model,
            prompt.len()
        );

        let content = (|| async { self.send_once(&body).await })
            .retry(self.retry.backoff())
            .when(ProviderError::is_transient)
            .adjust(adjust_for_rate_limit)
            .notify(|err: &ProviderError, dur: Duration| {
                warn!("Model call failed ({}), retrying in {:?}", err, dur);
            })
            .await?;

        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Map a non-2xx status to a typed error.
fn classify_status(status: u16, body: String, retry_after_ms: u64) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            status,
            retry_after_ms,
        },
        401 | 403 => ProviderError::AuthError {
            status,
            message: body,
        },
        500..=599 => ProviderError::ServerError {
            status,
            message: body,
        },
        _ => ProviderError::BadRequest {
            status,
            message: body,
        },
    }
}

/// Pull the assistant text out of a chat completions response, dropping
/// any inline `<think>` block some reasoning models emit.
fn extract_content(data: &Value) -> Result<String, ProviderError> {
    let raw = data
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let visible = strip_think_block(raw).trim().to_string();
    if visible.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(visible)
}

fn strip_think_block(text: &str) -> &str {
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        if text.trim_start().starts_with(open) {
            if let Some(end) = text.find(close) {
                return &text[end + close.len()..];
            }
        }
    }
    text
}
