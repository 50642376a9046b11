//! Sender allowlists for chat channels.
//!
//! A channel adapter checks every inbound sender here before publishing
//! to the bus. Sender ids may be compound (`"12345|alice"`): an entry
//! matches the whole id, the numeric part, or the username with or
//! without a leading `@`.

use clawloop_config::ChannelConfig;

/// Result of checking a sender against the allowlist.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderCheckResult {
    Allowed,
    Denied { sender_id: String, reason: String },
    /// The channel has no configuration at all (deny by default)
    NoConfig,
}

impl SenderCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

pub struct AllowlistPolicy;

impl AllowlistPolicy {
    /// Check if a sender may talk to a channel.
    ///
    /// Rules:
    /// - No config, or the channel is disabled → deny
    /// - Empty `allowed_users` → deny all
    /// - `"*"` in `allowed_users` → allow all
    /// - Otherwise one entry must match the sender
    pub fn check_sender(config: Option<&ChannelConfig>, sender_id: &str) -> SenderCheckResult {
        let Some(config) = config else {
            return SenderCheckResult::NoConfig;
        };

        if !config.enabled {
            return SenderCheckResult::Denied {
                sender_id: sender_id.into(),
                reason: "Channel is disabled".into(),
            };
        }

        if config.allowed_users.is_empty() {
            return SenderCheckResult::Denied {
                sender_id: sender_id.into(),
                reason: "No users configured (deny by default)".into(),
            };
        }

        if config
            .allowed_users
            .iter()
            .any(|entry| entry == "*" || entry_matches(entry, sender_id))
        {
            return SenderCheckResult::Allowed;
        }

        SenderCheckResult::Denied {
            sender_id: sender_id.into(),
            reason: format!(
                "Sender not in allowlist ({} users configured)",
                config.allowed_users.len()
            ),
        }
    }
}

fn entry_matches(entry: &str, sender_id: &str) -> bool {
    if entry == sender_id {
        return true;
    }
    let entry = entry.trim_start_matches('@');
    match sender_id.split_once('|') {
        Some((id, username)) => entry == id || (!username.is_empty() && entry == username),
        None => false,
    }
}
