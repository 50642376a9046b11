//! `clawloop gateway`: agent loop, enabled channels, and the HTTP server.

use std::sync::Arc;

use clawloop_channels::{BotApiClient, ChannelManager, TelegramChannel};
use clawloop_config::AppConfig;
use clawloop_gateway::GatewayState;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{Runtime, build_runtime};

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Runtime {
        mut config,
        bus,
        agent,
    } = build_runtime()?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let mut manager = ChannelManager::new(bus.clone());
    register_channels(&config, &mut manager);
    let manager = Arc::new(manager);
    manager.start_all().await?;

    println!("ClawLoop gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.default_model);
    println!("   Channels:  {}", display_list(&manager.list()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_task = tokio::spawn(agent.clone().run(shutdown_rx.clone()));
    let dispatch_task = tokio::spawn(manager.clone().run(shutdown_rx.clone()));

    let gateway_config = config.gateway.clone();
    let state = GatewayState::new(agent);
    let mut server =
        tokio::spawn(async move { clawloop_gateway::serve(&gateway_config, state, shutdown_rx).await });

    let server_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut server => Some(result),
    };

    let _ = shutdown_tx.send(true);
    manager.stop_all().await;
    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    let _ = tokio::join!(agent_task, dispatch_task);

    match server_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Gateway server failed");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Register every enabled channel that has what it needs to run.
fn register_channels(config: &AppConfig, manager: &mut ChannelManager) {
    if let Some(telegram) = config.channels_config.get("telegram").filter(|c| c.enabled) {
        match telegram.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => {
                let api = Arc::new(BotApiClient::new(token));
                manager.register(Arc::new(TelegramChannel::new(api, Some(telegram.clone()))));
            }
            None => warn!("Telegram channel enabled without a token, skipping"),
        }
    }
}

fn display_list(names: &[String]) -> String {
    if names.is_empty() {
        "none".into()
    } else {
        names.join(", ")
    }
}
