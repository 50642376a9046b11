//! Built-in tools for ClawLoop.
//!
//! - [`shell::ExecTool`]: sandboxed shell execution (`exec`)
//! - [`message::MessageTool`]: interim messages to the current chat (`message`)

pub mod message;
pub mod shell;

use clawloop_config::AppConfig;
use clawloop_core::bus::MessageBus;
use clawloop_core::tool::ToolRegistry;
use std::sync::Arc;

pub use message::MessageTool;
pub use shell::{ExecTool, sanitize_shell_command};

/// Registry with every built-in tool enabled by `config`.
pub fn default_registry(config: &AppConfig, bus: Arc<MessageBus>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    if config.tools.exec.enabled {
        registry.register(Box::new(ExecTool::from_config(
            config.workspace(),
            config.agent.restrict_to_workspace,
            &config.tools.exec,
        )));
    }
    registry.register(Box::new(MessageTool::new(bus)));
    registry
}
