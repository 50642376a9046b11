//! Per-provider cooldown bookkeeping.
//!
//! After a classified failure a provider is unavailable for a window sized
//! by the failure reason. A success clears the window at once.

use crate::failover::FailoverReason;
use clawloop_config::CooldownConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Window length per failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownWindows {
    pub rate_limit: Duration,
    pub overloaded: Duration,
    pub auth: Duration,
    pub timeout: Duration,
    pub unknown: Duration,
}

impl CooldownWindows {
    pub fn for_reason(&self, reason: FailoverReason) -> Duration {
        match reason {
            FailoverReason::RateLimit => self.rate_limit,
            FailoverReason::Overloaded => self.overloaded,
            FailoverReason::Auth => self.auth,
            FailoverReason::Timeout => self.timeout,
            FailoverReason::Unknown => self.unknown,
        }
    }
}

impl Default for CooldownWindows {
    fn default() -> Self {
        Self::from(&CooldownConfig::default())
    }
}

impl From<&CooldownConfig> for CooldownWindows {
    fn from(config: &CooldownConfig) -> Self {
        Self {
            rate_limit: Duration::from_secs(config.rate_limit_secs),
            overloaded: Duration::from_secs(config.overloaded_secs),
            auth: Duration::from_secs(config.auth_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            unknown: Duration::from_secs(config.unknown_secs),
        }
    }
}

/// A provider's current cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownState {
    pub reason: FailoverReason,
    pub until: Instant,
    /// Consecutive failures since the last success
    pub failures: u32,
}

impl CooldownState {
    pub fn is_active(&self) -> bool {
        Instant::now() < self.until
    }
}

/// Shared health table for the providers of one agent.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    windows: CooldownWindows,
    states: Mutex<HashMap<String, CooldownState>>,
}

impl CooldownTracker {
    pub fn new(windows: CooldownWindows) -> Self {
        Self {
            windows,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the provider's cooldown window.
    pub fn mark_failure(&self, provider: &str, reason: FailoverReason) {
        let window = self.windows.for_reason(reason);
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let failures = states.get(provider).map_or(0, |s| s.failures) + 1;
        states.insert(
            provider.to_string(),
            CooldownState {
                reason,
                until: Instant::now() + window,
                failures,
            },
        );
        info!(
            provider = %provider,
            reason = %reason,
            window_secs = window.as_secs(),
            failures,
            "Provider entered cooldown"
        );
    }

    /// Clear any cooldown for the provider.
    pub fn mark_success(&self, provider: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if states.remove(provider).is_some() {
            debug!(provider = %provider, "Provider cooldown cleared");
        }
    }

    /// True iff no window is active or the window has elapsed.
    pub fn is_available(&self, provider: &str) -> bool {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(provider).is_none_or(|s| !s.is_active())
    }

    pub fn state(&self, provider: &str) -> Option<CooldownState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(provider).copied()
    }

    /// Time left in the provider's window, if one is active.
    pub fn remaining(&self, provider: &str) -> Option<Duration> {
        self.state(provider)
            .filter(|s| s.is_active())
            .map(|s| s.until - Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failure_starts_a_window_sized_by_reason() {
        let tracker = CooldownTracker::default();
        tracker.mark_failure("openai", FailoverReason::Timeout);
        assert!(!tracker.is_available("openai"));
        assert_eq!(tracker.remaining("openai"), Some(Duration::from_secs(15)));

        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(!tracker.is_available("openai"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.is_available("openai"));
        assert_eq!(tracker.remaining("openai"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_outlasts_timeout() {
        let tracker = CooldownTracker::default();
        tracker.mark_failure("a", FailoverReason::RateLimit);
        tracker.mark_failure("b", FailoverReason::Timeout);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!tracker.is_available("a"));
        assert!(tracker.is_available("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_immediately() {
        let tracker = CooldownTracker::default();
        tracker.mark_failure("openai", FailoverReason::Overloaded);
        tracker.mark_success("openai");
        assert!(tracker.is_available("openai"));
        assert!(tracker.state("openai").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_are_counted() {
        let tracker = CooldownTracker::default();
        tracker.mark_failure("groq", FailoverReason::Unknown);
        tracker.mark_failure("groq", FailoverReason::Auth);

        let state = tracker.state("groq").unwrap();
        assert_eq!(state.failures, 2);
        assert_eq!(state.reason, FailoverReason::Auth);
    }

    #[test]
    fn unknown_provider_is_available() {
        let tracker = CooldownTracker::default();
        assert!(tracker.is_available("never-seen"));
    }

    #[test]
    fn windows_follow_config() {
        let config = CooldownConfig {
            rate_limit_secs: 5,
            ..CooldownConfig::default()
        };
        let windows = CooldownWindows::from(&config);
        assert_eq!(windows.for_reason(FailoverReason::RateLimit), Duration::from_secs(5));
        assert_eq!(windows.for_reason(FailoverReason::Auth), Duration::from_secs(300));
    }
}
