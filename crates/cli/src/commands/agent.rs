//! `clawloop agent`: one-shot or interactive chat.

use std::sync::Arc;

use clawloop_channels::{ChannelManager, CliChannel};
use clawloop_core::channel::Channel;
use tokio::sync::watch;

use super::build_runtime;

pub async fn run(message: Option<String>, session: String) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = build_runtime()?;

    if let Some(msg) = message {
        eprint!("  Thinking...");
        let result = runtime.agent.process_direct(&msg, &session).await;
        eprint!("\r              \r");
        println!("{}", result?);
        return Ok(());
    }

    println!();
    println!("  ClawLoop agent, interactive mode");
    println!("  Model:  {}", runtime.config.default_model);
    println!("  Type your message and press Enter. Type 'exit' or Ctrl+C to quit.");
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cli = Arc::new(CliChannel::new().with_session_key(session));
    let mut manager = ChannelManager::new(runtime.bus.clone());
    manager.register(cli.clone());
    let manager = Arc::new(manager);
    manager.start_all().await?;

    let agent_task = tokio::spawn(runtime.agent.clone().run(shutdown_rx.clone()));
    let dispatch_task = tokio::spawn(manager.clone().run(shutdown_rx));

    let interrupted = tokio::select! {
        _ = cli.closed() => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    let _ = shutdown_tx.send(true);
    cli.stop().await?;
    let _ = tokio::join!(agent_task, dispatch_task);

    println!();
    println!("  Goodbye!");
    if interrupted {
        // The stdin reader is still parked in a blocking read.
        std::process::exit(0);
    }
    Ok(())
}
