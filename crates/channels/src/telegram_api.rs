//! Telegram Bot API client over HTTPS.

use async_trait::async_trait;
use clawloop_core::channel::{Attachment, AttachmentKind, ChannelMessage};
use clawloop_core::error::ChannelError;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::telegram::{CHANNEL_NAME, ChatApi};

const API_BASE: &str = "https://api.telegram.org";

/// Server-side long-poll wait for `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// [`ChatApi`] backed by the Telegram Bot API.
pub struct BotApiClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
    offset: AtomicI64,
    download_dir: PathBuf,
}

impl std::fmt::Debug for BotApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotApiClient")
            .field("token", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("download_dir", &self.download_dir)
            .finish()
    }
}

impl BotApiClient {
    pub fn new(token: impl Into<String>) -> Self {
        // The request timeout must outlast the long-poll wait.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            token: token.into(),
            base_url: API_BASE.to_string(),
            offset: AtomicI64::new(0),
            download_dir: std::env::temp_dir().join("clawloop_media"),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| delivery_failed(format!("{method}: {e}")))?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| delivery_failed(format!("{method}: invalid response: {e}")))?;

        if !data["ok"].as_bool().unwrap_or(false) {
            let description = data["description"].as_str().unwrap_or("unknown error");
            return Err(delivery_failed(format!("{method}: {description}")));
        }
        Ok(data["result"].clone())
    }

    /// Fetch a file by id into the download directory.
    async fn download(&self, file_id: &str) -> Result<String, ChannelError> {
        let file = self.call("getFile", json!({ "file_id": file_id })).await?;
        let remote_path = file["file_path"]
            .as_str()
            .ok_or_else(|| delivery_failed("getFile: missing file_path"))?;

        let url = format!("{}/file/bot{}/{}", self.base_url, self.token, remote_path);
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| delivery_failed(format!("download: {e}")))?
            .bytes()
            .await
            .map_err(|e| delivery_failed(format!("download: {e}")))?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| delivery_failed(format!("download dir: {e}")))?;
        let local = self.download_dir.join(remote_path.replace('/', "_"));
        tokio::fs::write(&local, &bytes)
            .await
            .map_err(|e| delivery_failed(format!("write {}: {e}", local.display())))?;

        Ok(local.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ChatApi for BotApiClient {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, ChannelError> {
        let result = self
            .call(
                "sendMessage",
                json!({ "chat_id": parse_chat_id(chat_id)?, "text": text }),
            )
            .await?;
        result["message_id"]
            .as_i64()
            .map(|id| id.to_string())
            .ok_or_else(|| delivery_failed("sendMessage: missing message_id"))
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| delivery_failed(format!("invalid message id '{message_id}'")))?;
        self.call(
            "editMessageText",
            json!({ "chat_id": parse_chat_id(chat_id)?, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str) -> Result<(), ChannelError> {
        self.call(
            "sendChatAction",
            json!({ "chat_id": parse_chat_id(chat_id)?, "action": "typing" }),
        )
        .await?;
        Ok(())
    }

    async fn get_updates(&self) -> Result<Vec<ChannelMessage>, ChannelError> {
        let body = json!({
            "offset": self.offset.load(Ordering::Relaxed),
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });
        let updates = self.call("getUpdates", body).await?;
        let Some(updates) = updates.as_array() else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for update in updates {
            if let Some(update_id) = update["update_id"].as_i64() {
                self.offset.fetch_max(update_id + 1, Ordering::Relaxed);
            }
            let Some((mut msg, files)) = parse_update(update) else {
                continue;
            };
            for (kind, file_id) in files {
                let local_path = match self.download(&file_id).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(error = %e, "Failed to download attachment");
                        None
                    }
                };
                msg.attachments.push(Attachment {
                    kind,
                    local_path,
                    transcript: None,
                });
            }
            messages.push(msg);
        }
        debug!(count = messages.len(), "Fetched Telegram updates");
        Ok(messages)
    }
}

/// Extract a [`ChannelMessage`] and its pending file downloads from one
/// `getUpdates` entry. Returns `None` for non-message updates.
pub(crate) fn parse_update(update: &Value) -> Option<(ChannelMessage, Vec<(AttachmentKind, String)>)> {
    let message = update.get("message")?;
    let from = message.get("from")?;
    let user_id = from["id"].as_i64()?;
    let chat_id = message["chat"]["id"].as_i64()?;

    let sender_id = match from["username"].as_str() {
        Some(username) => format!("{user_id}|{username}"),
        None => user_id.to_string(),
    };

    let mut files = Vec::new();
    // Telegram lists photo sizes smallest first.
    if let Some(photo) = message["photo"].as_array().and_then(|sizes| sizes.last()) {
        if let Some(id) = photo["file_id"].as_str() {
            files.push((AttachmentKind::Photo, id.to_string()));
        }
    }
    for (field, kind) in [
        ("voice", AttachmentKind::Voice),
        ("audio", AttachmentKind::Audio),
        ("document", AttachmentKind::Document),
    ] {
        if let Some(id) = message[field]["file_id"].as_str() {
            files.push((kind, id.to_string()));
        }
    }

    let msg = ChannelMessage {
        sender_id,
        sender_name: from["first_name"].as_str().map(str::to_string),
        chat_id: chat_id.to_string(),
        text: message["text"].as_str().unwrap_or_default().to_string(),
        caption: message["caption"].as_str().unwrap_or_default().to_string(),
        attachments: Vec::new(),
        message_id: message["message_id"].as_i64().map(|id| id.to_string()),
        is_group: message["chat"]["type"].as_str() != Some("private"),
    };
    Some((msg, files))
}

fn parse_chat_id(chat_id: &str) -> Result<i64, ChannelError> {
    chat_id
        .parse()
        .map_err(|_| ChannelError::InvalidChatId(chat_id.to_string()))
}

fn delivery_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::DeliveryFailed {
        channel: CHANNEL_NAME.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_message() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 55,
                "from": {"id": 1001, "username": "alice", "first_name": "Alice"},
                "chat": {"id": -200, "type": "group"},
                "text": "hello"
            }
        });
        let (msg, files) = parse_update(&update).unwrap();
        assert_eq!(msg.sender_id, "1001|alice");
        assert_eq!(msg.sender_name.as_deref(), Some("Alice"));
        assert_eq!(msg.chat_id, "-200");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.message_id.as_deref(), Some("55"));
        assert!(msg.is_group);
        assert!(files.is_empty());
    }

    #[test]
    fn parses_media_file_ids() {
        let update = json!({
            "update_id": 11,
            "message": {
                "message_id": 56,
                "from": {"id": 7},
                "chat": {"id": 7, "type": "private"},
                "caption": "what is this?",
                "photo": [{"file_id": "small"}, {"file_id": "large"}],
                "voice": {"file_id": "v1"}
            }
        });
        let (msg, files) = parse_update(&update).unwrap();
        assert_eq!(msg.sender_id, "7");
        assert!(!msg.is_group);
        assert_eq!(msg.caption, "what is this?");
        assert_eq!(
            files,
            [
                (AttachmentKind::Photo, "large".to_string()),
                (AttachmentKind::Voice, "v1".to_string()),
            ]
        );
    }

    #[test]
    fn non_message_updates_are_skipped() {
        assert!(parse_update(&json!({"update_id": 12, "edited_message": {}})).is_none());
    }

    #[test]
    fn chat_ids_must_be_numeric() {
        assert_eq!(parse_chat_id("-100123").unwrap(), -100123);
        assert!(matches!(
            parse_chat_id("general"),
            Err(ChannelError::InvalidChatId(_))
        ));
    }

    #[test]
    fn debug_redacts_token() {
        let client = BotApiClient::new("123:secret");
        assert!(!format!("{client:?}").contains("secret"));
        assert_eq!(
            client.method_url("getMe"),
            "https://api.telegram.org/bot123:secret/getMe"
        );
    }
}
