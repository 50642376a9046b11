//! Turn states, outcomes, and failure types.

use clawloop_core::error::ProviderError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Where a turn is in its lifecycle.
///
/// ```text
/// BuildContext -> ModelCall -> (ToolExecuting -> ModelCall)* -> Completed
///                 ModelCall --overflow--> Compress -> ModelCall (once)
///                 any other error -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    BuildContext,
    ModelCall,
    ToolExecuting,
    Compress,
    Completed,
    Failed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::BuildContext => "build_context",
            TurnState::ModelCall => "model_call",
            TurnState::ToolExecuting => "tool_executing",
            TurnState::Compress => "compress",
            TurnState::Completed => "completed",
            TurnState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Failed)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// The final reply text.
    pub content: String,
    /// Completed model steps, across the retry if there was one.
    pub steps: usize,
    /// Whether the turn needed a compression-and-retry.
    pub compressed: bool,
    /// Whether the step bound stopped the turn.
    pub hit_step_limit: bool,
}

/// Why a turn ended in `Failed`.
#[derive(Debug, Error)]
pub enum TurnError {
    /// A provider error the fallback chain could not recover from.
    #[error("turn failed during {state}: {source}")]
    Provider {
        state: TurnState,
        #[source]
        source: ProviderError,
    },

    /// The context overflowed again after compressing the session.
    #[error("context still too large after compression: {0}")]
    OverflowAfterCompression(#[source] ProviderError),
}

impl TurnError {
    /// The state the turn was in when it failed.
    pub fn state(&self) -> TurnState {
        match self {
            TurnError::Provider { state, .. } => *state,
            TurnError::OverflowAfterCompression(_) => TurnState::ModelCall,
        }
    }

    pub fn provider_error(&self) -> &ProviderError {
        match self {
            TurnError::Provider { source, .. } => source,
            TurnError::OverflowAfterCompression(source) => source,
        }
    }
}

/// Whether a model-call failure means the prompt no longer fits.
pub use clawloop_providers::failover::is_context_overflow;
