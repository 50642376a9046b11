//! Provider fallback: an ordered chain of model candidates with cooldowns.
//!
//! Candidates are tried strictly in order. A candidate in cooldown is
//! skipped without a network call. A success clears the provider's cooldown
//! and ends the search; a retriable failure starts one and moves on. A
//! malformed request (or a context overflow, which the caller recovers
//! from) stops the chain immediately.

use crate::cooldown::CooldownTracker;
use crate::failover::{ErrorClass, classify_error};
use async_trait::async_trait;
use clawloop_core::error::ProviderError;
use clawloop_core::provider::{ChunkStream, Provider, ProviderRequest, ProviderResponse};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One model the chain may call.
#[derive(Clone)]
pub struct ProviderCandidate {
    pub provider: Arc<dyn Provider>,
    /// Cooldown key, e.g. "openrouter"
    pub provider_name: String,
    /// Model id sent to the provider
    pub model: String,
}

impl ProviderCandidate {
    pub fn new(
        provider: Arc<dyn Provider>,
        provider_name: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            provider_name: provider_name.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Debug for ProviderCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCandidate")
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .finish()
    }
}

/// A provider that tries its candidates in order, skipping those in cooldown.
pub struct FallbackChain {
    name: String,
    candidates: Vec<ProviderCandidate>,
    cooldown: Arc<CooldownTracker>,
    /// Most recent failure of any call, reported when a call finds every
    /// candidate cooling down
    last_error: Mutex<Option<ProviderError>>,
}

impl FallbackChain {
    /// `primary` is always tried first, then `fallbacks` in order.
    pub fn new(
        primary: ProviderCandidate,
        fallbacks: Vec<ProviderCandidate>,
        cooldown: Arc<CooldownTracker>,
    ) -> Self {
        let name = format!("fallback:{}", primary.provider_name);
        let mut candidates = Vec::with_capacity(fallbacks.len() + 1);
        candidates.push(primary);
        candidates.extend(fallbacks);
        Self {
            name,
            candidates,
            cooldown,
            last_error: Mutex::new(None),
        }
    }

    pub fn candidates(&self) -> &[ProviderCandidate] {
        &self.candidates
    }

    pub fn primary(&self) -> &ProviderCandidate {
        &self.candidates[0]
    }

    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        &self.cooldown
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    async fn run<T, F, Fut>(
        &self,
        request: ProviderRequest,
        mode: &'static str,
        call: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn Provider>, ProviderRequest) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempted = 0;
        let mut skipped = 0;
        let mut last = None;

        for (i, candidate) in self.candidates.iter().enumerate() {
            let provider = candidate.provider_name.as_str();
            let attempt = i + 1;

            if !self.cooldown.is_available(provider) {
                debug!(provider = %provider, model = %candidate.model, mode, "Skipping provider in cooldown");
                skipped += 1;
                continue;
            }

            attempted += 1;
            let mut req = request.clone();
            req.model = candidate.model.clone();

            match call(candidate.provider.clone(), req).await {
                Ok(value) => {
                    self.cooldown.mark_success(provider);
                    if i > 0 {
                        info!(provider = %provider, model = %candidate.model, attempt, mode, "Fallback succeeded");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let wrapped = ProviderError::CandidateFailed {
                        provider: provider.to_string(),
                        model: candidate.model.clone(),
                        attempt,
                        source: Box::new(e),
                    };
                    self.remember(&wrapped);

                    match classify_error(&wrapped) {
                        ErrorClass::NonRetriable => {
                            warn!(provider = %provider, model = %candidate.model, attempt, error = %wrapped, "Non-retriable error, aborting fallback chain");
                            return Err(wrapped);
                        }
                        ErrorClass::Failover(reason) => {
                            warn!(provider = %provider, model = %candidate.model, attempt, reason = %reason, error = %wrapped, "Fallback attempt failed");
                            self.cooldown.mark_failure(provider, reason);
                            last = Some(wrapped);
                        }
                    }
                }
            }
        }

        let last = last
            .or_else(|| self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_else(|| {
                ProviderError::NotConfigured("every candidate is cooling down".into())
            });

        Err(ProviderError::Exhausted {
            attempted,
            skipped,
            last: Box::new(last),
        })
    }

    fn remember(&self, err: &ProviderError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
    }
}

#[async_trait]
impl Provider for FallbackChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.run(request, "complete", |provider, req| async move {
            provider.complete(req).await
        })
        .await
    }

    /// Falls back only while opening the stream. Errors after the first
    /// chunk arrive inside the stream and are the caller's to handle.
    async fn stream(&self, request: ProviderRequest) -> Result<ChunkStream, ProviderError> {
        self.run(request, "stream", |provider, req| async move {
            provider.stream(req).await
        })
        .await
    }

    /// Structured output always goes to the primary candidate.
    async fn generate_object(
        &self,
        mut request: ProviderRequest,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let primary = self.primary();
        request.model = primary.model.clone();
        primary.provider.generate_object(request, schema).await
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        for candidate in &self.candidates {
            if let Ok(true) = candidate.provider.health_check().await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
