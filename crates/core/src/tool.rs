//! Tool trait: the abstraction over agent capabilities.
//!
//! A tool receives structured arguments and returns a [`ToolResult`] with two
//! audiences: `for_llm` goes back to the model, `for_user` may be shown to the
//! human while the turn is still running. Policy violations are results, not
//! errors, so the model can read and react to them.
//!
//! Optional capabilities are declared through [`ToolCapabilities`] and read
//! once, when the tool is registered:
//! - `contextual` tools get the turn's channel and chat id in their context
//! - `asynchronous` tools get a sink for results that arrive after the turn.

use crate::error::ToolError;
use crate::message::MessageToolCall;
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    pub name: String,

    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Decode the arguments string the model produced.
    ///
    /// Empty arguments become `{}`. Arguments that are not valid JSON are
    /// passed through as `{"raw": "<string>"}` so the tool can try to salvage them.
    pub fn from_message_call(call: &MessageToolCall) -> Self {
        let arguments = if call.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| serde_json::json!({ "raw": call.arguments }))
        };
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        }
    }
}

/// The outcome of a tool execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text shown to the human, if any
    pub for_user: String,

    /// Text fed back to the model
    pub for_llm: String,

    pub is_error: bool,

    /// Suppresses `for_user` delivery
    pub silent: bool,
}

impl ToolResult {
    /// Same text for the user and the model.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            for_user: text.clone(),
            for_llm: text,
            is_error: false,
            silent: false,
        }
    }

    /// Only the model sees this result.
    pub fn silent(for_llm: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            silent: true,
            ..Self::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(text)
        }
    }

    pub fn with_user_text(mut self, for_user: impl Into<String>) -> Self {
        self.for_user = for_user.into();
        self
    }

    /// Whether this result should be published to the user's chat.
    pub fn should_notify_user(&self) -> bool {
        !self.silent && !self.for_user.is_empty()
    }
}

/// Callback for results produced after the turn has moved on.
pub type AsyncResultSink = Arc<dyn Fn(ToolResult) + Send + Sync>;

/// Per-call context handed to a tool.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    async_sink: Option<AsyncResultSink>,
}

impl ToolContext {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            async_sink: None,
        }
    }

    pub fn with_async_sink(mut self, sink: AsyncResultSink) -> Self {
        self.async_sink = Some(sink);
        self
    }

    pub fn async_sink(&self) -> Option<&AsyncResultSink> {
        self.async_sink.as_ref()
    }

    /// Narrow this context to what a tool declared it can use.
    fn scoped(&self, caps: ToolCapabilities) -> Self {
        Self {
            channel: if caps.contextual { self.channel.clone() } else { String::new() },
            chat_id: if caps.contextual { self.chat_id.clone() } else { String::new() },
            async_sink: if caps.asynchronous { self.async_sink.clone() } else { None },
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("channel", &self.channel)
            .field("chat_id", &self.chat_id)
            .field("async_sink", &self.async_sink.is_some())
            .finish()
    }
}

/// Optional capabilities a tool may declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolCapabilities {
    /// Receives the originating channel and chat id.
    pub contextual: bool,
    /// May complete after the turn through the async result sink.
    pub asynchronous: bool,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "exec").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }

    /// Execute the tool. `Err` is reserved for failures of the tool itself;
    /// refusals and command failures are `Ok(ToolResult::error(..))`.
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

struct RegisteredTool {
    tool: Box<dyn Tool>,
    capabilities: ToolCapabilities,
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up and execute tools when the LLM requests them
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        let capabilities = tool.capabilities();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, RegisteredTool { tool, capabilities });
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.tool.as_ref())
    }

    /// Capabilities recorded at registration time.
    pub fn capabilities(&self, name: &str) -> Option<ToolCapabilities> {
        self.tools.get(name).map(|t| t.capabilities)
    }

    /// Tool definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.tool.to_definition())
            .collect()
    }

    /// Execute a tool call. Never fails: unknown tools and tool errors come
    /// back as error results the model can see.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(entry) = self.tools.get(&call.name) else {
            return ToolResult::error(ToolError::NotFound(call.name.clone()).to_string());
        };

        let scoped = ctx.scoped(entry.capabilities);
        match entry.tool.execute(&scoped, call.arguments.clone()).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
