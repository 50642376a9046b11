//! Failure classification for the fallback chain.
//!
//! Every provider error is sorted into one of two buckets: a retriable
//! failure with a [`FailoverReason`] (which sizes the cooldown window), or a
//! request the chain must not retry anywhere else.

use clawloop_core::error::ProviderError;
use std::fmt;

/// Why a provider was put into cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverReason {
    RateLimit,
    Auth,
    Timeout,
    Overloaded,
    Unknown,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::Auth => "auth",
            FailoverReason::Timeout => "timeout",
            FailoverReason::Overloaded => "overloaded",
            FailoverReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the chain should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Cool the provider down and try the next candidate.
    Failover(FailoverReason),
    /// Stop the chain and surface the error as-is.
    NonRetriable,
}

const OVERFLOW_PHRASES: [&str; 7] = [
    "context length",
    "context window",
    "maximum context",
    "too many tokens",
    "token limit",
    "context_length_exceeded",
    "prompt is too long",
];

/// Whether the error means the prompt no longer fits the model's window,
/// either as the typed variant or as provider error text.
pub fn is_context_overflow(err: &ProviderError) -> bool {
    let root = err.root();
    matches!(root, ProviderError::ContextOverflow(_))
        || is_overflow_message(&root.to_string().to_lowercase())
}

fn is_overflow_message(lowercase: &str) -> bool {
    OVERFLOW_PHRASES.iter().any(|p| lowercase.contains(p))
}

/// Classify a provider error, using the variant where it is decisive and
/// falling back to message heuristics otherwise.
pub fn classify_error(err: &ProviderError) -> ErrorClass {
    match err.root() {
        ProviderError::InvalidRequest(_) | ProviderError::ContextOverflow(_) => {
            ErrorClass::NonRetriable
        }
        ProviderError::RateLimited { .. } => ErrorClass::Failover(FailoverReason::RateLimit),
        ProviderError::AuthenticationFailed(_) => ErrorClass::Failover(FailoverReason::Auth),
        ProviderError::Timeout(_) => ErrorClass::Failover(FailoverReason::Timeout),
        ProviderError::ApiError {
            status_code,
            message,
        } => classify_message(&format!("{status_code} {message}")),
        other => classify_message(&other.to_string()),
    }
}

/// Substring heuristics over an error message.
///
/// Context overflow and messages mentioning both "invalid" and "request"
/// are never retried: every candidate would get the same prompt.
pub fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    if is_overflow_message(&msg) || (msg.contains("invalid") && msg.contains("request")) {
        return ErrorClass::NonRetriable;
    }

    let reason = if msg.contains("rate") || msg.contains("429") {
        FailoverReason::RateLimit
    } else if msg.contains("auth") || msg.contains("401") || msg.contains("403") {
        FailoverReason::Auth
    } else if msg.contains("timeout") || msg.contains("timed out") {
        FailoverReason::Timeout
    } else if msg.contains("overloaded") || msg.contains("529") {
        FailoverReason::Overloaded
    } else {
        FailoverReason::Unknown
    };
    ErrorClass::Failover(reason)
}
