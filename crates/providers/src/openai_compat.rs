//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Groq, DeepSeek, Mistral, Ollama, vLLM and
//! any other endpoint that speaks `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling, including incremental tool-call deltas
//! - Status mapping onto [`ProviderError`] so the fallback chain can
//!   classify failures by variant

use async_trait::async_trait;
use clawloop_core::error::ProviderError;
use clawloop_core::message::{Message, MessageToolCall, Role};
use clawloop_core::provider::{
    ChunkStream, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to a default HTTP client");
                reqwest::Client::new()
            });

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert our Message types to OpenAI API format, with the request's
    /// system prompt in front.
    fn to_api_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let system = system_prompt.map(|prompt| ApiMessage {
            role: Role::System.as_str().into(),
            content: Some(prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });

        system
            .into_iter()
            .chain(messages.iter().map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
                tool_calls: (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.clone(),
            }))
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request.system_prompt.as_deref(), &request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        body
    }

    async fn post(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(request, stream);

        debug!(provider = %self.name, model = %request.model, stream, "Sending completion request");

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let error_body = response.text().await.unwrap_or_default();
        warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
        Err(error_for_status(status, error_body, retry_after))
    }
}

/// Map a non-200 status and its body onto a [`ProviderError`].
fn error_for_status(status: u16, body: String, retry_after: Option<u64>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(5),
        },
        401 | 403 => ProviderError::AuthenticationFailed(if body.is_empty() {
            "Invalid API key or insufficient permissions".into()
        } else {
            body
        }),
        400 | 413 if mentions_context_overflow(&body) => ProviderError::ContextOverflow(body),
        400 => ProviderError::InvalidRequest(body),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

fn mentions_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    [
        "context_length_exceeded",
        "context length",
        "context window",
        "maximum context",
        "too many tokens",
        "prompt is too long",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self.post(&request, false).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let content = choice.message.content.unwrap_or_default();
        let message = if tool_calls.is_empty() {
            Message::assistant(content)
        } else {
            Message::assistant_with_tools(content, tool_calls)
        };

        Ok(ProviderResponse {
            message,
            usage: api_response.usage.map(Usage::from),
            model: api_response.model,
        })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.post(&request, true).await?;

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = SseParser::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for chunk in parser.feed(&bytes, &provider_name) {
                    let done = chunk.done;
                    if tx.send(Ok(chunk)).await.is_err() || done {
                        return;
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(parser.finish(None))).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

/// Incremental parser for the `data: {...}` lines of a streaming response.
#[derive(Default)]
struct SseParser {
    /// Bytes of the current incomplete line; a read may end mid-character
    buffer: Vec<u8>,
    /// Tool call fragments keyed by their index in the response
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finished: bool,
}

impl SseParser {
    /// Consume raw bytes and return every chunk they complete.
    fn feed(&mut self, bytes: &[u8], provider: &str) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if self.finished || line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };

            if data == "[DONE]" {
                out.push(self.finish(None));
                break;
            }

            let parsed: StreamResponse = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    trace!(provider = %provider, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                    continue;
                }
            };

            if let Some(choice) = parsed.choices.first() {
                for delta in choice.delta.tool_calls.iter().flatten() {
                    let acc = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = &delta.id {
                        acc.id = id.clone();
                    }
                    if let Some(func) = &delta.function {
                        if let Some(name) = &func.name {
                            acc.name.push_str(name);
                        }
                        if let Some(args) = &func.arguments {
                            acc.arguments.push_str(args);
                        }
                    }
                }

                if let Some(content) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
                    out.push(StreamChunk::text(content.clone()));
                }
            }

            // With include_usage the usage chunk is the last one before [DONE].
            if let Some(usage) = parsed.usage {
                out.push(self.finish(Some(usage.into())));
                break;
            }
        }

        out
    }

    /// The terminal chunk, carrying the assembled tool calls.
    fn finish(&mut self, usage: Option<Usage>) -> StreamChunk {
        self.finished = true;
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(ToolCallAccumulator::into_tool_call)
            .collect();
        StreamChunk {
            usage,
            ..StreamChunk::finished(tool_calls)
        }
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> MessageToolCall {
        MessageToolCall {
            id: if self.id.is_empty() {
                format!("call_{}", uuid::Uuid::new_v4().simple())
            } else {
                self.id
            },
            name: self.name,
            arguments: self.arguments,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: ApiDelta,
}

#[derive(Debug, Deserialize)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let provider = OpenAiCompatProvider::new("groq", "https://api.groq.com/openai/v1/", "k");
        assert_eq!(provider.name(), "groq");
        assert_eq!(provider.base_url(), "https://api.groq.com/openai/v1");
    }

    #[test]
    fn system_prompt_is_prepended() {
        let messages = vec![Message::user("Hello")];
        let api = OpenAiCompatProvider::to_api_messages(Some("You are helpful"), &messages);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[0].content.as_deref(), Some("You are helpful"));
        assert_eq!(api[1].role, "user");
    }

    #[test]
    fn tool_messages_keep_their_links() {
        let call = MessageToolCall {
            id: "call_1".into(),
            name: "exec".into(),
            arguments: r#"{"command":"ls"}"#.into(),
        };
        let messages = vec![
            Message::assistant_with_tools("", vec![call]),
            Message::tool_result("call_1", "a.txt"),
        ];
        let api = OpenAiCompatProvider::to_api_messages(None, &messages);
        assert_eq!(api[0].tool_calls.as_ref().unwrap()[0].function.name, "exec");
        assert_eq!(api[1].role, "tool");
        assert_eq!(api[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn request_body_includes_optional_fields() {
        let request = ProviderRequest::new("gpt-4o", vec![Message::user("hi")])
            .with_max_tokens(256)
            .with_tools(vec![ToolDefinition {
                name: "exec".into(),
                description: "Run a shell command".into(),
                parameters: serde_json::json!({"type": "object"}),
            }]);

        let body = OpenAiCompatProvider::request_body(&request, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["tools"][0]["function"]["name"], "exec");
        assert!(body.get("stop").is_none());

        let body = OpenAiCompatProvider::request_body(&request, false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_for_status(429, String::new(), Some(30)),
            ProviderError::RateLimited {
                retry_after_secs: 30
            }
        ));
        assert!(matches!(
            error_for_status(401, String::new(), None),
            ProviderError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            error_for_status(
                400,
                r#"{"error":{"code":"context_length_exceeded"}}"#.into(),
                None
            ),
            ProviderError::ContextOverflow(_)
        ));
        assert!(matches!(
            error_for_status(400, "messages must not be empty".into(), None),
            ProviderError::InvalidRequest(_)
        ));
        assert!(matches!(
            error_for_status(503, "unavailable".into(), None),
            ProviderError::ApiError {
                status_code: 503,
                ..
            }
        ));
    }

    #[test]
    fn sse_text_across_split_reads() {
        let mut parser = SseParser::default();
        let first = parser.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi",
            "test",
        );
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].content.as_deref(), Some("Hel"));

        let second = parser.feed(b"ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n", "test");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].content.as_deref(), Some("lo"));
        assert!(second[1].done);
        assert!(second[1].tool_calls.is_empty());
    }

    #[test]
    fn sse_character_split_across_reads_is_kept_whole() {
        let mut parser = SseParser::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café 🦀\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(parser.feed(&line[..split], "test").is_empty());
        let chunks = parser.feed(&line[split..], "test");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.as_deref(), Some("café 🦀"));
    }

    #[test]
    fn sse_tool_calls_are_assembled_in_index_order() {
        let mut parser = SseParser::default();
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_b\",\"function\":{\"name\":\"calc\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"exec\",\"arguments\":\"{\\\"command\\\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\": \\\"ls\\\"}\"}}]}}]}\n",
            ": keep-alive\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n",
        );
        let chunks = parser.feed(stream.as_bytes(), "test");
        assert_eq!(chunks.len(), 1);

        let done = &chunks[0];
        assert!(done.done);
        assert_eq!(done.usage.as_ref().unwrap().total_tokens, 15);
        assert_eq!(done.tool_calls.len(), 2);
        assert_eq!(done.tool_calls[0].id, "call_a");
        assert_eq!(done.tool_calls[0].arguments, r#"{"command": "ls"}"#);
        assert_eq!(done.tool_calls[1].name, "calc");
    }

    #[test]
    fn sse_ignores_garbage_and_lines_after_done() {
        let mut parser = SseParser::default();
        let chunks = parser.feed(b"data: not json\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n", "test");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert!(parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n", "test").is_empty());
    }

    #[test]
    fn missing_tool_call_id_is_generated() {
        let tc = ToolCallAccumulator {
            name: "exec".into(),
            ..ToolCallAccumulator::default()
        }
        .into_tool_call();
        assert!(tc.id.starts_with("call_"));
    }
}
