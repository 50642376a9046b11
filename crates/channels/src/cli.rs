//! CLI channel: interactive terminal chat.
//!
//! Reads lines from stdin and writes answers to stdout. Streamed deltas are
//! printed as they arrive; a final answer identical to what was just
//! streamed is not printed twice.

use async_trait::async_trait;
use clawloop_core::bus::{InboundMessage, MessageBus, OutboundMessage, StreamDelta};
use clawloop_core::channel::Channel;
use clawloop_core::error::ChannelError;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const CHANNEL_NAME: &str = "cli";
pub const CLI_SENDER: &str = "local_user";
pub const CLI_CHAT: &str = "direct";

const EXIT_COMMANDS: [&str; 5] = ["exit", "quit", "/exit", "/quit", ":q"];

type Input = Box<dyn AsyncBufRead + Send + Unpin>;

#[derive(Default)]
struct EchoState {
    current: String,
    last_streamed: Option<String>,
}

/// Interactive CLI channel for terminal-based chat.
pub struct CliChannel {
    input: Mutex<Option<Input>>,
    output: Mutex<Box<dyn Write + Send>>,
    echo: Mutex<EchoState>,
    closed: Arc<Notify>,
    session_key: Option<String>,
}

impl CliChannel {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(None),
            output: Mutex::new(Box::new(std::io::stdout())),
            echo: Mutex::new(EchoState::default()),
            closed: Arc::new(Notify::new()),
            session_key: None,
        }
    }

    /// Continue `key` instead of the default `cli:direct` session.
    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    /// Read from `input` instead of stdin.
    pub fn with_input(self, input: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        *self.input.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(input));
        self
    }

    /// Write to `output` instead of stdout.
    pub fn with_output(self, output: impl Write + Send + 'static) -> Self {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = Box::new(output);
        self
    }

    /// Resolves once the user quits or input ends.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    fn write(&self, text: &str) {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            debug!(error = %e, "CLI write failed");
        }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self, bus: Arc<MessageBus>) -> Result<(), ChannelError> {
        let input = self
            .input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| Box::new(BufReader::new(tokio::io::stdin())));
        let closed = self.closed.clone();
        let session_key = self.session_key.clone();

        tokio::spawn(async move {
            let mut lines = input.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if EXIT_COMMANDS.contains(&line) {
                            break;
                        }
                        let mut msg = InboundMessage::new(CHANNEL_NAME, CLI_SENDER, CLI_CHAT, line);
                        if let Some(key) = &session_key {
                            msg = msg.with_session_key(key.as_str());
                        }
                        if !bus.publish_inbound(msg).await {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF (Ctrl+D)
                    Err(e) => {
                        warn!(error = %e, "Failed to read from stdin");
                        break;
                    }
                }
            }
            closed.notify_one();
        });

        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let already_shown = {
            let mut echo = self.echo.lock().unwrap_or_else(|e| e.into_inner());
            echo.last_streamed.take().as_deref() == Some(msg.content.trim())
        };
        if !already_shown {
            self.write(&format!("{}\n", msg.content));
        }
        Ok(())
    }

    fn handle_stream_delta(&self, delta: &StreamDelta) {
        let mut echo = self.echo.lock().unwrap_or_else(|e| e.into_inner());
        if delta.done {
            if !echo.current.is_empty() {
                let streamed = std::mem::take(&mut echo.current);
                echo.last_streamed = Some(streamed.trim().to_string());
                drop(echo);
                self.write("\n");
            }
            return;
        }
        echo.current.push_str(&delta.delta);
        drop(echo);
        self.write(&delta.delta);
    }

    fn is_allowed(&self, _sender_id: &str) -> bool {
        true // local user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawloop_core::bus::BusCapacity;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cli_channel_properties() {
        let ch = CliChannel::new();
        assert_eq!(ch.name(), "cli");
        assert!(ch.is_allowed("anyone"));
    }

    #[tokio::test]
    async fn lines_are_published_until_exit() {
        let bus = Arc::new(MessageBus::new(BusCapacity::default()));
        let input: &'static [u8] = b"hello\n\n  second  \nexit\nignored\n";
        let ch = CliChannel::new().with_input(BufReader::new(input));
        ch.start(bus.clone()).await.unwrap();

        let first = bus.consume_inbound_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.channel, "cli");
        assert_eq!(first.chat_id, "direct");
        assert_eq!(first.content, "hello");
        assert_eq!(first.session_key(), "cli:direct");

        let second = bus.consume_inbound_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.content, "second");

        tokio::time::timeout(Duration::from_secs(1), ch.closed())
            .await
            .unwrap();
        assert!(
            bus.consume_inbound_timeout(Duration::from_millis(20))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn custom_session_key_is_attached() {
        let bus = Arc::new(MessageBus::new(BusCapacity::default()));
        let input: &'static [u8] = b"hi\n";
        let ch = CliChannel::new()
            .with_input(BufReader::new(input))
            .with_session_key("cli:project");
        ch.start(bus.clone()).await.unwrap();

        let msg = bus.consume_inbound_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.session_key(), "cli:project");
    }

    #[tokio::test]
    async fn streamed_answer_is_not_repeated() {
        let out = SharedBuffer::default();
        let ch = CliChannel::new().with_output(out.clone());

        ch.handle_stream_delta(&StreamDelta::text("cli", "direct", "Hel"));
        ch.handle_stream_delta(&StreamDelta::text("cli", "direct", "lo"));
        ch.handle_stream_delta(&StreamDelta::done("cli", "direct"));
        ch.send(&OutboundMessage::new("cli", "direct", "Hello"))
            .await
            .unwrap();
        assert_eq!(out.text(), "Hello\n");

        // Interim output that was never streamed is printed.
        ch.send(&OutboundMessage::new("cli", "direct", "> tool output"))
            .await
            .unwrap();
        assert_eq!(out.text(), "Hello\n> tool output\n");
    }
}
