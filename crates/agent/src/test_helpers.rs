//! Shared test helpers for agent tests.

use async_trait::async_trait;
use clawloop_core::error::{ProviderError, ToolError};
use clawloop_core::message::{Message, MessageToolCall};
use clawloop_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use clawloop_core::tool::{Tool, ToolContext, ToolResult};
use std::collections::VecDeque;
use std::sync::Mutex;

pub type Scripted = Result<ProviderResponse, ProviderError>;

/// A mock provider that replays a script of responses and errors.
///
/// Each call to `complete` (and so the default `stream`) takes the next
/// entry. Panics if more calls are made than entries provided.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ProviderRequest>>,
    call_count: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            call_count: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut count = self.call_count.lock().unwrap();
        self.requests.lock().unwrap().push(request);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedProvider: no more responses (call #{})", *count));
        *count += 1;
        next
    }
}

fn response(message: Message) -> ProviderResponse {
    ProviderResponse {
        message,
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// A plain text answer.
pub fn text(content: &str) -> Scripted {
    Ok(response(Message::assistant(content)))
}

/// An assistant step that calls `calls`.
pub fn tool_calls(thought: &str, calls: Vec<MessageToolCall>) -> Scripted {
    Ok(response(Message::assistant_with_tools(thought, calls)))
}

pub fn overflow() -> Scripted {
    Err(ProviderError::ContextOverflow(
        "This model's maximum context length is 8192 tokens".into(),
    ))
}

pub fn call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

/// Echoes its `text` argument; `for_user` carries a copy when `notify` is set.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}, "notify": {"type": "boolean"}},
            "required": ["text"]
        })
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing text".into()))?;
        if arguments["notify"].as_bool().unwrap_or(false) {
            return Ok(ToolResult::new(format!("echo: {text}")).with_user_text(format!("> {text}")));
        }
        Ok(ToolResult::silent(format!("echo: {text}")))
    }
}
