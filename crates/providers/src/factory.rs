//! Provider factory: turns `protocol/model` references into providers.
//!
//! Every protocol is served by [`OpenAiCompatProvider`]; the protocol only
//! selects the base URL and the API key.

use crate::cooldown::{CooldownTracker, CooldownWindows};
use crate::fallback::{FallbackChain, ProviderCandidate};
use crate::openai_compat::OpenAiCompatProvider;
use clawloop_config::AppConfig;
use clawloop_core::error::ProviderError;
use std::sync::Arc;
use tracing::warn;

/// Split `"openrouter/anthropic/claude-sonnet-4"` into
/// `("openrouter", "anthropic/claude-sonnet-4")`. No slash means `openai`.
pub fn parse_model_ref(model: &str) -> (String, String) {
    let model = model.trim();
    match model.split_once('/') {
        Some((protocol, id)) => (protocol.to_string(), id.to_string()),
        None => ("openai".to_string(), model.to_string()),
    }
}

/// Base URL for a known protocol.
pub fn default_api_base(protocol: &str) -> Option<&'static str> {
    Some(match protocol {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "mistral" => "https://api.mistral.ai/v1",
        "cerebras" => "https://api.cerebras.ai/v1",
        "nvidia" => "https://integrate.api.nvidia.com/v1",
        "moonshot" => "https://api.moonshot.cn/v1",
        "qwen" => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "gemini" => "https://generativelanguage.googleapis.com/v1beta/openai",
        "zhipu" => "https://open.bigmodel.cn/api/paas/v4",
        "volcengine" => "https://ark.cn-beijing.volces.com/api/v3",
        "ollama" => "http://localhost:11434/v1",
        "vllm" => "http://localhost:8000/v1",
        _ => return None,
    })
}

/// Build one candidate for a model reference.
pub fn build_candidate(config: &AppConfig, model_ref: &str) -> Result<ProviderCandidate, ProviderError> {
    let (protocol, model) = parse_model_ref(model_ref);
    if model.is_empty() {
        return Err(ProviderError::NotConfigured(format!(
            "model reference '{model_ref}' has no model id"
        )));
    }

    let base_url = config
        .providers
        .get(&protocol)
        .and_then(|p| p.api_url.clone())
        .or_else(|| default_api_base(&protocol).map(String::from))
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "unknown protocol '{protocol}' and no api_url configured"
            ))
        })?;

    let api_key = config.api_key_for(&protocol).unwrap_or_default();
    let provider = Arc::new(OpenAiCompatProvider::new(&protocol, base_url, api_key));
    Ok(ProviderCandidate::new(provider, protocol, model))
}

/// Build the agent's fallback chain: `default_model` first, then
/// `fallback_models` in order. Fallbacks that cannot be built are skipped.
pub fn build_fallback_chain(config: &AppConfig) -> Result<FallbackChain, ProviderError> {
    let primary = build_candidate(config, &config.default_model)?;

    let fallbacks = config
        .fallback_models
        .iter()
        .filter_map(|model_ref| match build_candidate(config, model_ref) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!(model = %model_ref, error = %e, "Skipping fallback model");
                None
            }
        })
        .collect();

    let cooldown = Arc::new(CooldownTracker::new(CooldownWindows::from(&config.cooldown)));
    Ok(FallbackChain::new(primary, fallbacks, cooldown))
}
