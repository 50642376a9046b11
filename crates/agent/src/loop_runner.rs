//! The agent loop and its turn executor.

use crate::compress::{Compressor, SummarizePolicy};
use crate::context::ContextBuilder;
use crate::session::SessionStore;
use crate::turn::{TurnError, TurnOutcome, TurnState, is_context_overflow};
use clawloop_config::AppConfig;
use clawloop_core::bus::{InboundMessage, MessageBus, OutboundMessage, StreamDelta};
use clawloop_core::error::ProviderError;
use clawloop_core::message::{Message, MessageToolCall};
use clawloop_core::provider::{Provider, ProviderRequest};
use clawloop_core::tool::{AsyncResultSink, ToolCall, ToolContext, ToolRegistry, ToolResult};
use clawloop_providers::parse_model_ref;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Channel and chat used by [`AgentLoop::process_direct`].
pub const DIRECT_CHANNEL: &str = "cli";
pub const DIRECT_CHAT: &str = "direct";

const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";
const STEP_LIMIT_REPLY: &str =
    "I've reached the maximum number of tool call iterations. Please provide further guidance.";

/// Routing and delivery options for one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Publish the reply (and tool `for_user` output) as outbound messages.
    pub send_response: bool,
}

impl TurnRequest {
    pub fn from_inbound(msg: &InboundMessage) -> Self {
        Self {
            session_key: msg.session_key(),
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            content: msg.content.clone(),
            send_response: true,
        }
    }
}

/// What one model step produced.
struct Step {
    text: String,
    tool_calls: Vec<MessageToolCall>,
}

/// Consumes inbound messages and runs one turn per message.
///
/// Turns on different sessions run concurrently; turns on the same session
/// queue behind that session's turn lock.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    context: ContextBuilder,
    compressor: Compressor,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_iterations: usize,
    summarize: SummarizePolicy,
}

impl AgentLoop {
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        Self {
            context: ContextBuilder::new(None).with_tools(&tools),
            compressor: Compressor::new(provider.clone(), model.clone()),
            bus,
            provider,
            tools,
            sessions: Arc::new(SessionStore::new()),
            model,
            temperature: 0.7,
            max_tokens: None,
            max_iterations: 20,
            summarize: SummarizePolicy::default(),
        }
    }

    /// Build the loop the way the config describes it.
    pub fn from_config(
        config: &AppConfig,
        bus: Arc<MessageBus>,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let (_, model) = parse_model_ref(&config.default_model);
        let context = ContextBuilder::new(Some(config.workspace()))
            .with_system_prompt(config.agent.system_prompt.clone())
            .with_tools(&tools);

        Self::new(bus, provider, tools, model)
            .with_context(context)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_max_iterations(config.agent.max_iterations)
            .with_summarize_policy(SummarizePolicy {
                message_threshold: config.agent.summarize_message_threshold,
                token_percent: config.agent.summarize_token_percent,
                context_window: config.agent.context_window,
            })
    }

    pub fn with_context(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of model steps per turn.
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_summarize_policy(mut self, policy: SummarizePolicy) -> Self {
        self.summarize = policy;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Consume inbound messages until shutdown or bus close. In-flight turns
    /// are cancelled on exit, which also kills their tool subprocesses.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(model = %self.model, tools = self.tools.len(), "Agent loop started");
        let mut turns = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Received shutdown signal");
                        break;
                    }
                }
                msg = self.bus.consume_inbound() => {
                    let Some(msg) = msg else {
                        info!("Inbound queue closed");
                        break;
                    };
                    let agent = self.clone();
                    turns.spawn(async move {
                        // Failures are already logged and reported to the chat.
                        let _ = agent.process_inbound(msg).await;
                    });
                }
                Some(_) = turns.join_next(), if !turns.is_empty() => {}
            }
        }

        if !turns.is_empty() {
            info!(in_flight = turns.len(), "Cancelling in-flight turns");
        }
        turns.shutdown().await;
        info!("Agent loop stopped");
    }

    /// Run a turn for a message from a channel and reply on that channel.
    pub async fn process_inbound(&self, msg: InboundMessage) -> Result<TurnOutcome, TurnError> {
        info!(
            channel = %msg.channel,
            chat_id = %msg.chat_id,
            sender = %msg.sender_id,
            "Processing inbound message"
        );
        self.process(TurnRequest::from_inbound(&msg)).await
    }

    /// Run a turn outside the bus (CLI one-shot mode). Deltas are still
    /// published; the reply is returned instead of sent.
    pub async fn process_direct(&self, content: &str, session_key: &str) -> Result<String, TurnError> {
        self.process_direct_with_channel(content, session_key, DIRECT_CHANNEL, DIRECT_CHAT)
            .await
    }

    pub async fn process_direct_with_channel(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, TurnError> {
        let request = TurnRequest {
            session_key: session_key.to_string(),
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            send_response: false,
        };
        self.process(request).await.map(|outcome| outcome.content)
    }

    /// Run one turn to a terminal state.
    ///
    /// Exactly one `Done` delta is published per turn, whether it completed
    /// or failed.
    pub async fn process(&self, request: TurnRequest) -> Result<TurnOutcome, TurnError> {
        let _turn = self.sessions.turn_lock(&request.session_key).await;
        let result = self.execute(&request).await;

        self.bus
            .publish_stream_delta(StreamDelta::done(&request.channel, &request.chat_id));

        match &result {
            Ok(outcome) => {
                info!(
                    session = %request.session_key,
                    steps = outcome.steps,
                    compressed = outcome.compressed,
                    state = %TurnState::Completed,
                    "Turn completed"
                );
                if request.send_response {
                    self.reply(&request, &outcome.content).await;
                }
                self.compressor
                    .maybe_summarize(&self.sessions, &request.session_key, &self.summarize)
                    .await;
            }
            Err(e) => {
                error!(
                    session = %request.session_key,
                    failed_in = %e.state(),
                    state = %TurnState::Failed,
                    error = %e,
                    "Turn failed"
                );
                if request.send_response {
                    self.reply(&request, &format!("Error processing message: {e}"))
                        .await;
                }
            }
        }

        result
    }

    async fn execute(&self, request: &TurnRequest) -> Result<TurnOutcome, TurnError> {
        let key = request.session_key.as_str();
        let mut state = TurnState::BuildContext;
        trace_state(key, state);

        self.sessions.append(key, Message::user(&request.content));
        let tool_ctx = self.tool_context(request);
        let mut steps = 0;
        let mut compressed = false;

        loop {
            let messages = self.context.build_messages(
                &self.sessions.history(key),
                &self.sessions.summary(key),
                None,
                &request.channel,
                &request.chat_id,
            );

            state = TurnState::ModelCall;
            trace_state(key, state);
            match self.run_steps(request, &tool_ctx, messages, &mut steps).await {
                Ok((content, hit_step_limit)) => {
                    return Ok(TurnOutcome {
                        content,
                        steps,
                        compressed,
                        hit_step_limit,
                    });
                }
                Err(e) if is_context_overflow(&e) && !compressed => {
                    state = TurnState::Compress;
                    trace_state(key, state);
                    warn!(session = %key, error = %e, "Context window exceeded, compressing session");
                    let outcome = self.compressor.force(&self.sessions, key).await;
                    debug!(session = %key, ?outcome, "Retrying model call after compression");
                    compressed = true;
                }
                Err(e) if is_context_overflow(&e) => {
                    return Err(TurnError::OverflowAfterCompression(e));
                }
                Err(e) => return Err(TurnError::Provider { state, source: e }),
            }
        }
    }

    /// Model/tool steps until the model answers without tools or the step
    /// bound is hit. Every step is appended to the session as it finishes.
    /// `steps` carries across a compression retry, so the bound is per turn.
    async fn run_steps(
        &self,
        request: &TurnRequest,
        tool_ctx: &ToolContext,
        mut messages: Vec<Message>,
        steps: &mut usize,
    ) -> Result<(String, bool), ProviderError> {
        let key = request.session_key.as_str();
        let definitions = self.tools.definitions();
        let mut buffer = String::new();

        while *steps < self.max_iterations {
            let mut provider_request = ProviderRequest::from_messages(&self.model, messages.clone())
                .with_temperature(self.temperature)
                .with_tools(definitions.clone());
            if let Some(max) = self.max_tokens {
                provider_request = provider_request.with_max_tokens(max);
            }

            let step = self.stream_step(request, provider_request, &mut buffer).await?;
            *steps += 1;
            debug!(session = %key, step = *steps, tool_calls = step.tool_calls.len(), "Model step finished");

            if step.tool_calls.is_empty() {
                if !step.text.is_empty() {
                    self.sessions.append(key, Message::assistant(&step.text));
                }
                return Ok((final_text(&step.text, &buffer, EMPTY_REPLY), false));
            }

            let assistant = Message::assistant_with_tools(&step.text, step.tool_calls.clone());
            self.sessions.append(key, assistant.clone());
            messages.push(assistant);

            trace_state(key, TurnState::ToolExecuting);
            for call in &step.tool_calls {
                let result = self.execute_tool(request, tool_ctx, call).await;
                let tool_msg = Message::tool_result(&call.id, &result.for_llm);
                self.sessions.append(key, tool_msg.clone());
                messages.push(tool_msg);
            }
        }

        warn!(session = %key, max = self.max_iterations, "Max tool iterations reached, ending turn");
        Ok((final_text("", &buffer, STEP_LIMIT_REPLY), true))
    }

    /// One streamed model call. Text deltas go out on the bus as they arrive.
    async fn stream_step(
        &self,
        request: &TurnRequest,
        provider_request: ProviderRequest,
        buffer: &mut String,
    ) -> Result<Step, ProviderError> {
        let mut chunks = self.provider.stream(provider_request).await?;
        let mut step = Step {
            text: String::new(),
            tool_calls: Vec::new(),
        };

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content.filter(|c| !c.is_empty()) {
                self.bus.publish_stream_delta(StreamDelta::text(
                    &request.channel,
                    &request.chat_id,
                    &delta,
                ));
                step.text.push_str(&delta);
                buffer.push_str(&delta);
            }
            step.tool_calls.extend(chunk.tool_calls);
            if chunk.done {
                return Ok(step);
            }
        }

        Err(ProviderError::StreamInterrupted(
            "stream ended before the final chunk".into(),
        ))
    }

    async fn execute_tool(
        &self,
        request: &TurnRequest,
        tool_ctx: &ToolContext,
        call: &MessageToolCall,
    ) -> ToolResult {
        let tool_call = ToolCall::from_message_call(call);
        info!(tool = %call.name, tool_call_id = %call.id, "Tool call");

        let start = std::time::Instant::now();
        let result = self.tools.execute(&tool_call, tool_ctx).await;
        debug!(
            tool = %call.name,
            is_error = result.is_error,
            duration_ms = start.elapsed().as_millis() as u64,
            "Tool result received"
        );

        if request.send_response && result.should_notify_user() {
            self.reply(request, &result.for_user).await;
        }
        result
    }

    /// Context for tool calls in this turn. Late results from asynchronous
    /// tools are published to the owning chat.
    fn tool_context(&self, request: &TurnRequest) -> ToolContext {
        let ctx = ToolContext::new(&request.channel, &request.chat_id);
        if !request.send_response {
            return ctx;
        }

        let bus = self.bus.clone();
        let channel = request.channel.clone();
        let chat_id = request.chat_id.clone();
        let sink: AsyncResultSink = Arc::new(move |result: ToolResult| {
            let content = if result.for_user.is_empty() {
                result.for_llm
            } else {
                result.for_user
            };
            if result.silent || content.is_empty() {
                return;
            }
            let msg = OutboundMessage::new(&channel, &chat_id, content);
            let bus = bus.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        bus.publish_outbound(msg).await;
                    });
                }
                Err(_) => warn!("Async tool result arrived outside the runtime, dropping it"),
            }
        });
        ctx.with_async_sink(sink)
    }

    async fn reply(&self, request: &TurnRequest, content: &str) {
        let msg = OutboundMessage::new(&request.channel, &request.chat_id, content);
        if !self.bus.publish_outbound(msg).await {
            warn!(channel = %request.channel, chat_id = %request.chat_id, "Bus closed, reply dropped");
        }
    }
}

fn trace_state(session: &str, state: TurnState) {
    debug!(session = %session, state = %state, "Turn state");
}

/// The step's own text, else everything streamed this attempt, else `fallback`.
fn final_text(step_text: &str, buffer: &str, fallback: &str) -> String {
    if !step_text.trim().is_empty() {
        step_text.to_string()
    } else if !buffer.trim().is_empty() {
        buffer.to_string()
    } else {
        fallback.to_string()
    }
}
