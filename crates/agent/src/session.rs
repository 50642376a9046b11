//! In-memory session store.
//!
//! A session is the running history of one conversation, keyed by the
//! inbound message's session key. Turns append to it step by step, and
//! compression replaces an old prefix with a summary.

use chrono::{DateTime, Utc};
use clawloop_core::error::SessionError;
use clawloop_core::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One conversation's history plus the summary of anything compacted away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    /// Summary of messages dropped by compaction; empty when none.
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            messages: Vec::new(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Thread-safe store of sessions keyed by session key.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    turn_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, creating the session on first use.
    pub fn append(&self, key: &str, message: Message) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        session.messages.push(message);
        session.updated_at = Utc::now();
    }

    /// A copy of the session's messages; empty for unknown keys.
    pub fn history(&self, key: &str) -> Vec<Message> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// The session's summary; empty when there is none.
    pub fn summary(&self, key: &str) -> String {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|s| s.summary.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Replace the first `keep_from` messages with `summary`.
    ///
    /// Only a prefix is ever dropped. Returns the number of messages removed.
    pub fn compact(
        &self,
        key: &str,
        summary: impl Into<String>,
        keep_from: usize,
    ) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;

        if keep_from > session.messages.len() {
            return Err(SessionError::InvalidCompaction {
                key: key.to_string(),
                keep_from,
                len: session.messages.len(),
            });
        }

        session.messages.drain(..keep_from);
        session.summary = summary.into();
        session.updated_at = Utc::now();
        Ok(keep_from)
    }

    /// Serialize turns on one session. Turns on other sessions never wait
    /// on this lock.
    pub async fn turn_lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.turn_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
