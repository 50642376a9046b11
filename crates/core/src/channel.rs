//! Channel trait: the abstraction over chat platforms.
//!
//! A Channel connects ClawLoop to a messaging platform. It talks to the rest
//! of the system only through the [`MessageBus`]: user events go in with
//! `publish_inbound`, final answers come back through [`Channel::send`] and
//! token deltas through [`Channel::handle_stream_delta`].

use crate::bus::{MessageBus, OutboundMessage, StreamDelta};
use crate::error::ChannelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A platform event before it is normalized into an inbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Sender identifier (platform-specific user ID)
    pub sender_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,

    /// The chat/group/DM identifier within the channel
    pub chat_id: String,

    #[serde(default)]
    pub text: String,

    /// Caption attached to a media message
    #[serde(default)]
    pub caption: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(default)]
    pub is_group: bool,
}

/// A downloaded attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,

    /// Where the file was saved; `None` if the download failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,

    /// Speech-to-text result for voice notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, local_path: impl Into<String>) -> Self {
        Self {
            kind,
            local_path: Some(local_path.into()),
            transcript: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Voice,
    Audio,
    Document,
}

/// The core Channel trait.
///
/// Implementations handle platform-specific connection logic and formatting.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name used for routing (e.g., "telegram", "cli").
    fn name(&self) -> &str;

    /// Start receiving platform events and publishing them to `bus`.
    async fn start(&self, bus: Arc<MessageBus>) -> Result<(), ChannelError>;

    /// Stop the channel gracefully.
    async fn stop(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Deliver a final response.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;

    /// Accept a streamed delta for progressive rendering. Must not block;
    /// implementations buffer and render on their own schedule.
    fn handle_stream_delta(&self, _delta: &StreamDelta) {}

    /// Check if a sender is allowed (allowlist check).
    fn is_allowed(&self, sender_id: &str) -> bool;

    /// Health check: is the channel connected and operational?
    async fn health_check(&self) -> Result<bool, ChannelError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_serialization() {
        let attachment = Attachment::new(AttachmentKind::Photo, "/tmp/p.jpg");
        let json = serde_json::to_string(&attachment).unwrap();
        assert!(json.contains("photo"));
        assert!(!json.contains("transcript"));
    }

    #[test]
    fn channel_message_defaults() {
        let msg: ChannelMessage =
            serde_json::from_str(r#"{"sender_id": "1", "chat_id": "2"}"#).unwrap();
        assert!(msg.text.is_empty());
        assert!(msg.attachments.is_empty());
        assert!(!msg.is_group);
    }
}
