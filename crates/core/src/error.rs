//! Error types for the ClawLoop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all ClawLoop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The request itself is malformed; no other provider will accept it either.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The prompt no longer fits the model's context window.
    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// A single fallback candidate failed.
    #[error("{provider}/{model} failed on attempt {attempt}: {source}")]
    CandidateFailed {
        provider: String,
        model: String,
        attempt: usize,
        #[source]
        source: Box<ProviderError>,
    },

    /// Every fallback candidate failed or was cooling down.
    #[error("all fallback candidates exhausted ({attempted} tried, {skipped} cooling down): {last}")]
    Exhausted {
        attempted: usize,
        skipped: usize,
        #[source]
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Unwrap fallback wrappers down to the error a provider actually returned.
    pub fn root(&self) -> &ProviderError {
        match self {
            ProviderError::CandidateFailed { source, .. } => source.root(),
            ProviderError::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Unauthorized sender: {sender_id} on {channel}")]
    Unauthorized { channel: String, sender_id: String },

    #[error("Channel connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid chat id: {0}")]
    InvalidChatId(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Compaction point {keep_from} is past the end of session {key} ({len} messages)")]
    InvalidCompaction {
        key: String,
        keep_from: usize,
        len: usize,
    },
}
