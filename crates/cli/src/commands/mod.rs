pub mod agent;
pub mod config_cmd;
pub mod gateway;

use std::sync::Arc;

use clawloop_agent::AgentLoop;
use clawloop_config::AppConfig;
use clawloop_core::bus::MessageBus;
use clawloop_core::provider::Provider;
use tracing::{info, warn};

/// The pieces every long-running command shares.
pub struct Runtime {
    pub config: AppConfig,
    pub bus: Arc<MessageBus>,
    pub agent: Arc<AgentLoop>,
}

/// Load config, then wire bus → providers → tools → agent loop.
pub fn build_runtime() -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    runtime_from_config(config)
}

pub fn runtime_from_config(config: AppConfig) -> Result<Runtime, Box<dyn std::error::Error>> {
    let workspace = config.workspace();
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        warn!(path = %workspace.display(), error = %e, "Could not create workspace");
    }

    let bus = Arc::new(MessageBus::new(config.bus.capacity()));
    let provider: Arc<dyn Provider> = Arc::new(
        clawloop_providers::build_fallback_chain(&config)
            .map_err(|e| format!("Failed to configure providers: {e}"))?,
    );
    let tools = Arc::new(clawloop_tools::default_registry(&config, bus.clone()));
    info!(
        model = %config.default_model,
        fallbacks = config.fallback_models.len(),
        tools = tools.len(),
        workspace = %workspace.display(),
        "Runtime ready"
    );

    let agent = Arc::new(AgentLoop::from_config(&config, bus.clone(), provider, tools));
    Ok(Runtime { config, bus, agent })
}
