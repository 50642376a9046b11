//! # ClawLoop Core
//!
//! Domain types, traits, and error definitions for the ClawLoop agent runtime.
//! Everything else in the workspace depends inward on this crate.
//!
//! ## Layout
//!
//! - [`bus`]: the in-process message bus every other component meets on
//! - [`provider`]: the LLM backend trait (the fallback chain implements it too)
//! - [`tool`]: the tool trait, capabilities, and registry
//! - [`channel`]: the chat-platform adapter trait

pub mod bus;
pub mod channel;
pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bus::{
    BusCapacity, BusStats, InboundMessage, MessageBus, OutboundMessage, StreamDelta,
    StreamFilter, StreamSubscription, SubscriberId,
};
pub use channel::{Attachment, AttachmentKind, Channel, ChannelMessage};
pub use error::{ChannelError, Error, ProviderError, Result, SessionError, ToolError};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{ChunkStream, Provider, ProviderRequest, ProviderResponse, StreamChunk};
pub use tool::{Tool, ToolCall, ToolCapabilities, ToolContext, ToolRegistry, ToolResult};
