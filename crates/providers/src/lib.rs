//! LLM provider implementations and the resilience layer for ClawLoop.
//!
//! - [`openai_compat`]: the HTTP adapter every protocol goes through
//! - [`fallback`]: ordered candidates with cooldown-based skipping
//! - [`cooldown`] and [`failover`]: per-provider health and error classification
//! - [`factory`]: builds the chain from configuration

pub mod cooldown;
pub mod factory;
pub mod failover;
pub mod fallback;
pub mod openai_compat;

pub use cooldown::{CooldownState, CooldownTracker, CooldownWindows};
pub use factory::{build_candidate, build_fallback_chain, default_api_base, parse_model_ref};
pub use failover::{
    ErrorClass, FailoverReason, classify_error, classify_message, is_context_overflow,
};
pub use fallback::{FallbackChain, ProviderCandidate};
pub use openai_compat::OpenAiCompatProvider;
