//! Base model client interface.
//!
//! The orchestrator treats the model as a black-box text completion service:
//! one prompt in, one text blob out. Provider specifics (endpoints, auth,
//! retries) stay behind these traits.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// A text-completion client bound to one model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send `prompt` and return the raw completion text.
    async fn run(&self, prompt: &str) -> Result<String>;

    /// Model identifier this client talks to.
    fn model_name(&self) -> &str;
}

/// Builds model clients on demand, one per requested model name.
pub trait ModelFactory: Send + Sync {
    /// Client for `model`, or for the default model when `None`.
    fn client_for(&self, model: Option<&str>) -> Result<Arc<dyn ModelClient>>;

    fn default_model(&self) -> &str;
}
