//! Domain error types for leadbot.
//!
//! Typed errors at module boundaries replace string-encoded errors and
//! enable structured error handling via pattern matching.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Chat errors
// ---------------------------------------------------------------------------

/// Errors surfaced by [`crate::agent::orchestrator::Orchestrator::chat`].
///
/// The three variants mirror what a caller at the HTTP boundary needs to
/// tell apart: the model is down, the model answered garbage, or something
/// inside the bot broke. None of them carries fabricated reply content.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("AI service error: {0}")]
    Ai(String),

    #[error("Failed to parse model response: {message}")]
    Parsing { message: String, raw: String },

    #[error("Chatbot error: {0}")]
    Chatbot(String),
}

impl ChatError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Ai(_) => "AIError",
            ChatError::Parsing { .. } => "ParsingError",
            ChatError::Chatbot(_) => "ChatbotError",
        }
    }

    /// HTTP status a front end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ChatError::Ai(_) => 503,
            ChatError::Parsing { .. } => 502,
            ChatError::Chatbot(_) => 500,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        ChatError::Chatbot(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("store mutex poisoned")]
    Poisoned,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid stage stored: {0}")]
    InvalidStage(String),

    #[error(
        "non-monotonic transition {transition_id} in session {session_id}: {previous} -> {new}"
    )]
    NonMonotonic {
        session_id: String,
        transition_id: i64,
        previous: String,
        new: String,
    },

    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Errors from LLM provider operations.
///
/// Embedded in `anyhow::Error` so the `ModelClient` trait signature
/// (`-> anyhow::Result<String>`) stays unchanged while callers
/// can downcast: `e.downcast_ref::<ProviderError>()`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Failed to read response body: {0}")]
    ResponseReadError(String),

    #[error("Failed to parse response JSON: {0}")]
    JsonParseError(String),

    #[error("Rate limited (status {status}): retry after {retry_after_ms}ms")]
    RateLimited { status: u16, retry_after_ms: u64 },

    #[error("Authentication failed (status {status}): {message}")]
    AuthError { status: u16, message: String },

    #[error("Server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request rejected (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Model returned no content")]
    EmptyResponse,
}

impl ProviderError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::HttpError(_)
                | ProviderError::ResponseReadError(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::ServerError { .. }
        )
    }
}
