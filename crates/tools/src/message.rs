//! Message tool: lets the model talk to the current chat mid-turn.

use async_trait::async_trait;
use clawloop_core::bus::{MessageBus, OutboundMessage};
use clawloop_core::error::ToolError;
use clawloop_core::tool::{Tool, ToolCapabilities, ToolContext, ToolResult};
use std::sync::Arc;

/// Sends an interim message through the bus. Contextual: the target defaults
/// to the chat the turn came from.
pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user right away, before the final answer."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message text"
                },
                "channel": {
                    "type": "string",
                    "description": "Optional target channel (defaults to the current one)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Optional target chat (defaults to the current one)"
                }
            },
            "required": ["content"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            contextual: true,
            asynchronous: false,
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let content = arguments["content"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        let channel = arguments["channel"].as_str().unwrap_or(&ctx.channel);
        let chat_id = arguments["chat_id"].as_str().unwrap_or(&ctx.chat_id);
        if channel.is_empty() || chat_id.is_empty() {
            return Ok(ToolResult::error("No target chat for this message"));
        }

        if !self
            .bus
            .publish_outbound(OutboundMessage::new(channel, chat_id, content))
            .await
        {
            return Ok(ToolResult::error("Message bus is closed"));
        }

        Ok(ToolResult::silent(format!("Message sent to {channel}:{chat_id}")))
    }
}
