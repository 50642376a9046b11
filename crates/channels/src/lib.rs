//! Chat channel adapters for ClawLoop.
//!
//! Channels talk to the agent only through the message bus. The
//! [`ChannelManager`] starts them and routes outbound messages and stream
//! deltas back to the right adapter.
//!
//! Available channels:
//! - **CLI**: interactive terminal chat (stdin/stdout)
//! - **Telegram**: Bot API long polling with progressive message edits

pub mod cli;
pub mod manager;
pub mod telegram;
pub mod telegram_api;

pub use cli::CliChannel;
pub use manager::ChannelManager;
pub use telegram::{ChatApi, TelegramChannel, normalize_content, split_message};
pub use telegram_api::BotApiClient;
