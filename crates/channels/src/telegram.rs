//! Telegram channel adapter.
//!
//! Platform calls go through the [`ChatApi`] trait ([`BotApiClient`] in
//! production). Each turn gets a "Thinking..." placeholder; streamed deltas
//! are buffered per chat and rendered by a timer-driven flush loop that
//! edits the placeholder in place. The final answer reuses that message
//! and is split to fit Telegram's length limit.
//!
//! [`BotApiClient`]: crate::telegram_api::BotApiClient

use async_trait::async_trait;
use clawloop_config::ChannelConfig;
use clawloop_core::bus::{InboundMessage, MessageBus, OutboundMessage, StreamDelta};
use clawloop_core::channel::{AttachmentKind, Channel, ChannelMessage};
use clawloop_core::error::ChannelError;
use clawloop_security::AllowlistPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const CHANNEL_NAME: &str = "telegram";

/// Telegram's limit for a single message.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Streaming previews are cut here; the final send carries the full text.
pub const PREVIEW_MAX_CHARS: usize = 3500;

pub const PLACEHOLDER_TEXT: &str = "Thinking...";

const MAX_POLL_BACKOFF_SECS: u64 = 60;

/// The subset of a chat platform's API the adapter needs.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send a message and return its id.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ChannelError>;

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError>;

    async fn send_typing(&self, _chat_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Wait for the next batch of platform messages.
    async fn get_updates(&self) -> Result<Vec<ChannelMessage>, ChannelError>;
}

/// Rendering state for one chat, alive from turn start to final send.
#[derive(Debug, Clone, Default, PartialEq)]
struct ChatState {
    placeholder_id: Option<String>,
    stream_message_id: Option<String>,
    buffer: String,
    dirty: bool,
}

/// Telegram channel adapter.
#[derive(Clone)]
pub struct TelegramChannel {
    api: Arc<dyn ChatApi>,
    config: Option<ChannelConfig>,
    chats: Arc<Mutex<HashMap<String, ChatState>>>,
    flush_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TelegramChannel {
    /// `config` is the `telegram` entry of `channels_config`; without one
    /// every sender is denied.
    pub fn new(api: Arc<dyn ChatApi>, config: Option<ChannelConfig>) -> Self {
        let flush_interval = config
            .as_ref()
            .map(ChannelConfig::flush_interval)
            .unwrap_or(Duration::from_millis(500));
        let (shutdown, _) = watch::channel(false);
        Self {
            api,
            config,
            chats: Arc::new(Mutex::new(HashMap::new())),
            flush_interval,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    fn chats(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChatState>> {
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check, normalize, and publish one platform message. Starts the
    /// chat's turn state with a placeholder message.
    pub async fn handle_message(&self, bus: &MessageBus, msg: ChannelMessage) -> bool {
        if !self.is_allowed(&msg.sender_id) {
            debug!(sender = %msg.sender_id, "Message rejected by allowlist");
            return false;
        }

        let (content, media_paths) = normalize_content(&msg);
        let (user_id, username) = split_sender(&msg.sender_id);
        debug!(
            sender = %user_id,
            chat_id = %msg.chat_id,
            preview = %content.chars().take(50).collect::<String>(),
            "Received message"
        );

        if let Err(e) = self.api.send_typing(&msg.chat_id).await {
            debug!(error = %e, "Failed to send chat action");
        }

        let placeholder_id = match self.api.send_message(&msg.chat_id, PLACEHOLDER_TEXT).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(chat_id = %msg.chat_id, error = %e, "Failed to send placeholder");
                None
            }
        };
        self.chats().insert(
            msg.chat_id.clone(),
            ChatState {
                placeholder_id,
                ..ChatState::default()
            },
        );

        let mut inbound = InboundMessage::new(CHANNEL_NAME, user_id, &msg.chat_id, content)
            .with_media(media_paths)
            .with_metadata("user_id", user_id)
            .with_metadata("username", username)
            .with_metadata("is_group", msg.is_group.to_string());
        if let Some(id) = &msg.message_id {
            inbound = inbound.with_metadata("message_id", id.as_str());
        }
        if let Some(name) = &msg.sender_name {
            inbound = inbound.with_metadata("first_name", name.as_str());
        }

        bus.publish_inbound(inbound).await
    }

    /// Render every chat with unflushed deltas.
    pub async fn flush(&self) {
        let pending: Vec<(String, String, Option<String>)> = {
            let mut chats = self.chats();
            chats
                .iter_mut()
                .filter(|(_, state)| state.dirty)
                .filter_map(|(chat_id, state)| {
                    state.dirty = false;
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let target = match (&state.stream_message_id, state.placeholder_id.take()) {
                        (Some(id), _) => Some(id.clone()),
                        (None, Some(placeholder)) => {
                            state.stream_message_id = Some(placeholder.clone());
                            Some(placeholder)
                        }
                        (None, None) => None,
                    };
                    Some((chat_id.clone(), preview(&state.buffer), target))
                })
                .collect()
        };

        for (chat_id, text, target) in pending {
            match target {
                Some(message_id) => {
                    if let Err(e) = self.api.edit_message(&chat_id, &message_id, &text).await {
                        debug!(chat_id = %chat_id, error = %e, "Stream edit failed");
                    }
                }
                None => match self.api.send_message(&chat_id, &text).await {
                    Ok(id) => {
                        if let Some(state) = self.chats().get_mut(&chat_id) {
                            state.stream_message_id.get_or_insert(id);
                        }
                    }
                    Err(e) => debug!(chat_id = %chat_id, error = %e, "Stream send failed"),
                },
            }
        }
    }

    async fn flush_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.flush().await,
            }
        }
        debug!("Telegram flush loop stopped");
    }

    async fn poll_loop(self, bus: Arc<MessageBus>, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                updates = self.api.get_updates() => match updates {
                    Ok(messages) => {
                        failures = 0;
                        for msg in messages {
                            self.handle_message(&bus, msg).await;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        let backoff = poll_backoff(failures);
                        warn!(attempt = failures, backoff_secs = backoff.as_secs(), error = %e, "Telegram polling failed");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                },
            }
        }
        info!("Telegram polling stopped");
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self, bus: Arc<MessageBus>) -> Result<(), ChannelError> {
        self.shutdown.send_replace(false);
        tokio::spawn(self.clone().flush_loop(self.shutdown.subscribe()));
        tokio::spawn(self.clone().poll_loop(bus, self.shutdown.subscribe()));
        info!(flush_ms = self.flush_interval.as_millis() as u64, "Telegram channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        info!("Telegram channel stopping");
        self.shutdown.send_replace(true);
        Ok(())
    }

    /// Final send: reuse the stream message or placeholder for the first
    /// chunk, send the rest as new messages, then drop the chat's state.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let state = self.chats().remove(&msg.chat_id).unwrap_or_default();
        if msg.content.trim().is_empty() {
            debug!(chat_id = %msg.chat_id, "Skipping empty message");
            return Ok(());
        }

        let mut edit_id = state.stream_message_id.or(state.placeholder_id);
        for chunk in split_message(&msg.content, MAX_MESSAGE_LEN) {
            if let Some(message_id) = edit_id.take() {
                match self.api.edit_message(&msg.chat_id, &message_id, &chunk).await {
                    Ok(()) => continue,
                    Err(e) => debug!(error = %e, "Final edit failed, sending a new message"),
                }
            }
            self.api.send_message(&msg.chat_id, &chunk).await?;
        }
        Ok(())
    }

    fn handle_stream_delta(&self, delta: &StreamDelta) {
        let mut chats = self.chats();
        if delta.done {
            // Ids stay so the final send can edit the streamed message.
            if let Some(state) = chats.get_mut(&delta.chat_id) {
                state.buffer.clear();
                state.dirty = false;
            }
            return;
        }
        // State exists only between the placeholder and the final send;
        // a delta dispatched after the reply has nothing left to update.
        let Some(state) = chats.get_mut(&delta.chat_id) else {
            debug!(chat_id = %delta.chat_id, "Ignoring delta for chat without an active turn");
            return;
        };
        state.buffer.push_str(&delta.delta);
        state.dirty = true;
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        AllowlistPolicy::check_sender(self.config.as_ref(), sender_id).is_allowed()
    }

    async fn health_check(&self) -> Result<bool, ChannelError> {
        Ok(!*self.shutdown.borrow())
    }
}

/// Turn text, caption, and attachments into the text the agent sees, plus
/// the local paths of downloaded media.
pub fn normalize_content(msg: &ChannelMessage) -> (String, Vec<String>) {
    let mut parts: Vec<String> = Vec::new();
    let mut media_paths = Vec::new();

    if !msg.text.is_empty() {
        parts.push(msg.text.clone());
    }
    if !msg.caption.is_empty() {
        parts.push(msg.caption.clone());
    }

    for attachment in &msg.attachments {
        // Failed downloads leave no trace.
        let Some(path) = &attachment.local_path else {
            continue;
        };
        media_paths.push(path.clone());
        parts.push(match attachment.kind {
            AttachmentKind::Photo => "[image: photo]".to_string(),
            AttachmentKind::Voice => match &attachment.transcript {
                Some(text) => format!("[voice transcription: {text}]"),
                None => "[voice]".to_string(),
            },
            AttachmentKind::Audio => "[audio]".to_string(),
            AttachmentKind::Document => "[file]".to_string(),
        });
    }

    let content = if parts.is_empty() {
        "[empty message]".to_string()
    } else {
        parts.join("\n")
    };
    (content, media_paths)
}

/// `"12345|alice"` → `("12345", "alice")`.
fn split_sender(sender_id: &str) -> (&str, &str) {
    sender_id.split_once('|').unwrap_or((sender_id, ""))
}

fn preview(content: &str) -> String {
    match content.char_indices().nth(PREVIEW_MAX_CHARS) {
        Some((cut, _)) => format!("{}\n\n...", &content[..cut]),
        None => content.to_string(),
    }
}

/// Split `text` into chunks of at most `limit` characters, preferring a
/// paragraph break, then a line break, in the second half of each window.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let Some((hard, _)) = remaining.char_indices().nth(limit) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..hard];
        let half = hard / 2;
        let cut = match window.rfind("\n\n") {
            Some(i) if i > half => i,
            _ => match window.rfind('\n') {
                Some(i) if i > half => i,
                _ => hard,
            },
        };

        let chunk = remaining[..cut].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[cut..].trim();
    }
    chunks
}

fn poll_backoff(failures: u32) -> Duration {
    let secs = 1u64 << failures.min(6);
    Duration::from_secs(secs.min(MAX_POLL_BACKOFF_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawloop_core::bus::BusCapacity;
    use clawloop_core::channel::Attachment;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum ApiCall {
        Send { chat_id: String, text: String },
        Edit { chat_id: String, message_id: String, text: String },
    }

    struct MockChatApi {
        calls: Mutex<Vec<ApiCall>>,
        next_id: Mutex<usize>,
        fail_edits: bool,
        updates: tokio::sync::Mutex<mpsc::Receiver<ChannelMessage>>,
    }

    impl MockChatApi {
        fn new() -> (Arc<Self>, mpsc::Sender<ChannelMessage>) {
            Self::build(false)
        }

        fn build(fail_edits: bool) -> (Arc<Self>, mpsc::Sender<ChannelMessage>) {
            let (tx, rx) = mpsc::channel(8);
            let api = Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
                fail_edits,
                updates: tokio::sync::Mutex::new(rx),
            });
            (api, tx)
        }

        fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatApi for MockChatApi {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ChannelError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.calls.lock().unwrap().push(ApiCall::Send {
                chat_id: chat_id.into(),
                text: text.into(),
            });
            Ok(next.to_string())
        }

        async fn edit_message(
            &self,
            chat_id: &str,
            message_id: &str,
            text: &str,
        ) -> Result<(), ChannelError> {
            self.calls.lock().unwrap().push(ApiCall::Edit {
                chat_id: chat_id.into(),
                message_id: message_id.into(),
                text: text.into(),
            });
            if self.fail_edits {
                return Err(ChannelError::DeliveryFailed {
                    channel: "telegram".into(),
                    reason: "message to edit not found".into(),
                });
            }
            Ok(())
        }

        async fn get_updates(&self) -> Result<Vec<ChannelMessage>, ChannelError> {
            match self.updates.lock().await.recv().await {
                Some(msg) => Ok(vec![msg]),
                None => std::future::pending().await,
            }
        }
    }

    fn open_config() -> Option<ChannelConfig> {
        Some(ChannelConfig {
            enabled: true,
            allowed_users: vec!["*".into()],
            ..ChannelConfig::default()
        })
    }

    fn text_message(text: &str) -> ChannelMessage {
        ChannelMessage {
            sender_id: "1001|alice".into(),
            sender_name: Some("Alice".into()),
            chat_id: "42".into(),
            text: text.into(),
            message_id: Some("7".into()),
            ..ChannelMessage::default()
        }
    }

    fn send(text: &str) -> ApiCall {
        ApiCall::Send {
            chat_id: "42".into(),
            text: text.into(),
        }
    }

    fn edit(id: &str, text: &str) -> ApiCall {
        ApiCall::Edit {
            chat_id: "42".into(),
            message_id: id.into(),
            text: text.into(),
        }
    }

    fn bus() -> MessageBus {
        MessageBus::new(BusCapacity::default())
    }

    #[test]
    fn normalization_tags_attachments() {
        let mut msg = text_message("");
        msg.caption = "look at this".into();
        msg.attachments = vec![
            Attachment::new(AttachmentKind::Photo, "/tmp/p.jpg"),
            Attachment {
                transcript: Some("call me back".into()),
                ..Attachment::new(AttachmentKind::Voice, "/tmp/v.ogg")
            },
            Attachment::new(AttachmentKind::Audio, "/tmp/a.mp3"),
            Attachment {
                kind: AttachmentKind::Document,
                local_path: None,
                transcript: None,
            },
        ];

        let (content, media) = normalize_content(&msg);
        assert_eq!(
            content,
            "look at this\n[image: photo]\n[voice transcription: call me back]\n[audio]"
        );
        assert_eq!(media, ["/tmp/p.jpg", "/tmp/v.ogg", "/tmp/a.mp3"]);
    }

    #[test]
    fn normalization_of_bare_voice_and_empty_messages() {
        let mut msg = text_message("");
        assert_eq!(normalize_content(&msg).0, "[empty message]");

        msg.attachments = vec![
            Attachment::new(AttachmentKind::Voice, "/tmp/v.ogg"),
            Attachment::new(AttachmentKind::Document, "/tmp/d.pdf"),
        ];
        assert_eq!(normalize_content(&msg).0, "[voice]\n[file]");
    }

    #[tokio::test]
    async fn inbound_is_published_with_placeholder_and_metadata() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        let bus = bus();

        assert!(channel.handle_message(&bus, text_message("hello")).await);

        let inbound = bus.consume_inbound_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(inbound.channel, "telegram");
        assert_eq!(inbound.sender_id, "1001");
        assert_eq!(inbound.chat_id, "42");
        assert_eq!(inbound.content, "hello");
        assert_eq!(inbound.metadata["username"], "alice");
        assert_eq!(inbound.metadata["message_id"], "7");
        assert_eq!(inbound.metadata["is_group"], "false");

        assert_eq!(api.calls(), [send(PLACEHOLDER_TEXT)]);
    }

    #[tokio::test]
    async fn denied_senders_are_dropped() {
        let (api, _updates) = MockChatApi::new();
        let config = ChannelConfig {
            enabled: true,
            allowed_users: vec!["@bob".into()],
            ..ChannelConfig::default()
        };
        let channel = TelegramChannel::new(api.clone(), Some(config));
        let bus = bus();

        assert!(!channel.handle_message(&bus, text_message("hi")).await);
        assert!(api.calls().is_empty());
        assert!(
            bus.consume_inbound_timeout(Duration::from_millis(20))
                .await
                .is_none()
        );

        let unconfigured = TelegramChannel::new(api, None);
        assert!(!unconfigured.is_allowed("1001|alice"));
    }

    #[tokio::test]
    async fn flush_claims_placeholder_then_edits_stream_message() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.handle_message(&bus(), text_message("hi")).await;

        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "Hel"));
        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "lo"));
        channel.flush().await;
        // Nothing new: no call.
        channel.flush().await;
        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", " there"));
        channel.flush().await;

        assert_eq!(
            api.calls(),
            [send(PLACEHOLDER_TEXT), edit("1", "Hello"), edit("1", "Hello there")]
        );
        let state = channel.chats().get("42").cloned().unwrap();
        assert_eq!(state.placeholder_id, None);
        assert_eq!(state.stream_message_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn flush_without_placeholder_sends_new_message() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        // A turn whose placeholder could not be sent.
        channel.chats().insert("42".into(), ChatState::default());

        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "partial"));
        channel.flush().await;
        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", " more"));
        channel.flush().await;

        assert_eq!(api.calls(), [send("partial"), edit("1", "partial more")]);
    }

    #[tokio::test]
    async fn long_previews_are_truncated() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.chats().insert("42".into(), ChatState::default());
        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "é".repeat(4000)));
        channel.flush().await;

        let ApiCall::Send { text, .. } = &api.calls()[0] else {
            panic!("expected a send");
        };
        assert_eq!(text.chars().count(), PREVIEW_MAX_CHARS + 5);
        assert!(text.ends_with("\n\n..."));
    }

    #[tokio::test]
    async fn final_send_reuses_stream_message_and_clears_state() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.handle_message(&bus(), text_message("hi")).await;
        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "Hello"));
        channel.flush().await;
        channel.handle_stream_delta(&StreamDelta::done("telegram", "42"));

        channel
            .send(&OutboundMessage::new("telegram", "42", "Hello world"))
            .await
            .unwrap();

        assert_eq!(api.calls().last(), Some(&edit("1", "Hello world")));
        assert!(channel.chats().get("42").is_none());
    }

    #[tokio::test]
    async fn late_deltas_after_the_reply_are_ignored() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.handle_message(&bus(), text_message("hi")).await;
        channel
            .send(&OutboundMessage::new("telegram", "42", "Hello"))
            .await
            .unwrap();

        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "Hello"));
        channel.handle_stream_delta(&StreamDelta::done("telegram", "42"));
        channel.flush().await;

        assert!(channel.chats().get("42").is_none());
        assert_eq!(api.calls(), [send(PLACEHOLDER_TEXT), edit("1", "Hello")]);
    }

    #[tokio::test]
    async fn final_send_edits_placeholder_when_nothing_streamed() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.handle_message(&bus(), text_message("hi")).await;

        channel
            .send(&OutboundMessage::new("telegram", "42", "Short answer"))
            .await
            .unwrap();
        assert_eq!(api.calls(), [send(PLACEHOLDER_TEXT), edit("1", "Short answer")]);
    }

    #[tokio::test]
    async fn long_final_answer_is_split() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.handle_message(&bus(), text_message("hi")).await;

        let first = "a".repeat(3000);
        let second = "b".repeat(3000);
        let content = format!("{first}\n\n{second}");
        channel
            .send(&OutboundMessage::new("telegram", "42", content))
            .await
            .unwrap();

        assert_eq!(
            api.calls(),
            [send(PLACEHOLDER_TEXT), edit("1", &first), send(&second)]
        );
    }

    #[tokio::test]
    async fn failed_edit_falls_back_to_send() {
        let (api, _updates) = MockChatApi::build(true);
        let channel = TelegramChannel::new(api.clone(), open_config());
        channel.handle_message(&bus(), text_message("hi")).await;

        channel
            .send(&OutboundMessage::new("telegram", "42", "answer"))
            .await
            .unwrap();
        assert_eq!(
            api.calls(),
            [send(PLACEHOLDER_TEXT), edit("1", "answer"), send("answer")]
        );
    }

    #[tokio::test]
    async fn done_clears_buffer_but_keeps_ids() {
        let (api, _updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api, open_config());
        channel.handle_message(&bus(), text_message("hi")).await;
        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "x"));
        channel.handle_stream_delta(&StreamDelta::done("telegram", "42"));

        let state = channel.chats().get("42").cloned().unwrap();
        assert!(state.buffer.is_empty());
        assert!(!state.dirty);
        assert_eq!(state.placeholder_id.as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn started_channel_polls_and_flushes_on_its_own() {
        let (api, updates) = MockChatApi::new();
        let channel = TelegramChannel::new(api.clone(), open_config());
        let bus = Arc::new(bus());
        channel.start(bus.clone()).await.unwrap();

        updates.send(text_message("ping")).await.unwrap();
        let inbound = bus.consume_inbound_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(inbound.content, "ping");

        channel.handle_stream_delta(&StreamDelta::text("telegram", "42", "pong"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(api.calls(), [send(PLACEHOLDER_TEXT), edit("1", "pong")]);

        channel.stop().await.unwrap();
        assert!(!channel.health_check().await.unwrap());
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hello", MAX_MESSAGE_LEN), ["hello"]);
    }

    #[test]
    fn split_prefers_line_break_past_half() {
        let text = format!("{}\n{}", "a".repeat(70), "b".repeat(50));
        assert_eq!(split_message(&text, 100), ["a".repeat(70), "b".repeat(50)]);

        // A break in the first half is ignored.
        let text = format!("{}\n{}", "a".repeat(20), "b".repeat(150));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0].chars().count(), 100);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn split_is_char_safe() {
        let text = "ж".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(poll_backoff(1), Duration::from_secs(2));
        assert_eq!(poll_backoff(3), Duration::from_secs(8));
        assert_eq!(poll_backoff(20), Duration::from_secs(60));
    }
}
