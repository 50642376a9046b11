//! Session compression.
//!
//! The older half of a session is folded into its summary, either forced
//! (after a context overflow) or automatically once a turn leaves the
//! session above its size thresholds.

use crate::session::SessionStore;
use clawloop_core::error::ProviderError;
use clawloop_core::message::{Message, Role, estimate_tokens};
use clawloop_core::provider::{Provider, ProviderRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SUMMARY_MAX_TOKENS: u32 = 1024;
pub const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Longest slice of one message that goes into a summarization prompt.
const MAX_TRANSCRIPT_CHARS: usize = 2000;

/// When auto-summarization kicks in.
#[derive(Debug, Clone, Copy)]
pub struct SummarizePolicy {
    pub message_threshold: usize,
    pub token_percent: u8,
    pub context_window: usize,
}

impl SummarizePolicy {
    pub fn should_summarize(&self, history: &[Message]) -> bool {
        if history.len() > self.message_threshold {
            return true;
        }
        let limit = self.context_window * usize::from(self.token_percent) / 100;
        estimate_tokens(history) > limit
    }
}

impl Default for SummarizePolicy {
    fn default() -> Self {
        Self {
            message_threshold: 20,
            token_percent: 75,
            context_window: 128_000,
        }
    }
}

/// What a compression pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    /// The prefix was replaced by a model-written summary.
    Summarized { dropped: usize },
    /// Summarization failed; the prefix was dropped with a note.
    Dropped { dropped: usize },
    /// Nothing old enough to compress.
    Skipped,
}

/// Index the kept tail starts at: the midpoint, moved forward to the next
/// user message so no tool result loses its call.
pub fn split_point(messages: &[Message]) -> usize {
    let mid = messages.len() / 2;
    if let Some(offset) = messages[mid..].iter().position(|m| m.role == Role::User) {
        return mid + offset;
    }
    // No later user message: at least never start the tail on a tool result.
    mid + messages[mid..]
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count()
}

fn dropped_note(previous: &str, dropped: usize) -> String {
    let note = format!("[{dropped} earlier messages were dropped to fit the context window]");
    if previous.trim().is_empty() {
        note
    } else {
        format!("{}\n\n{note}", previous.trim())
    }
}

fn transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages.iter().filter(|m| m.role != Role::System) {
        let content: String = msg.content.chars().take(MAX_TRANSCRIPT_CHARS).collect();
        out.push_str(&format!("{}: {content}\n", msg.role.as_str()));
        for call in &msg.tool_calls {
            out.push_str(&format!("  (called {} with {})\n", call.name, call.arguments));
        }
    }
    out
}

/// Summarizes sessions with the agent's provider.
pub struct Compressor {
    provider: Arc<dyn Provider>,
    model: String,
}

impl Compressor {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Ask the model for a summary of `messages`, merged with `previous`.
    pub async fn summarize(
        &self,
        previous: &str,
        messages: &[Message],
    ) -> Result<String, ProviderError> {
        let mut prompt = String::from(
            "Summarize the conversation below for your own future reference. \
             Keep facts about the user, decisions made, and unfinished tasks. \
             Be brief.\n\n",
        );
        if !previous.trim().is_empty() {
            prompt.push_str(&format!(
                "Existing summary (merge it into the new one):\n{}\n\n",
                previous.trim()
            ));
        }
        prompt.push_str("Conversation:\n");
        prompt.push_str(&transcript(messages));

        let request = ProviderRequest::new(&self.model, vec![Message::user(prompt)])
            .with_max_tokens(SUMMARY_MAX_TOKENS)
            .with_temperature(SUMMARY_TEMPERATURE);

        let response = self.provider.complete(request).await?;
        let summary = response.message.content.trim().to_string();
        if summary.is_empty() {
            return Err(ProviderError::ApiError {
                status_code: 200,
                message: "summarization returned no text".into(),
            });
        }
        Ok(summary)
    }

    /// Compress after an overflow. Always shrinks the session when there is
    /// anything to drop, falling back to a note if summarization fails.
    pub async fn force(&self, sessions: &SessionStore, key: &str) -> Compression {
        self.compress(sessions, key, true).await
    }

    /// Compress after a turn if `policy` says the session is too large.
    /// A failed summary leaves the session untouched.
    pub async fn maybe_summarize(
        &self,
        sessions: &SessionStore,
        key: &str,
        policy: &SummarizePolicy,
    ) -> Compression {
        if !policy.should_summarize(&sessions.history(key)) {
            return Compression::Skipped;
        }
        self.compress(sessions, key, false).await
    }

    async fn compress(&self, sessions: &SessionStore, key: &str, forced: bool) -> Compression {
        let history = sessions.history(key);
        let keep_from = split_point(&history);
        if keep_from == 0 {
            debug!(session = %key, "Nothing to compress");
            return Compression::Skipped;
        }

        let previous = sessions.summary(key);
        let (summary, outcome) = match self.summarize(&previous, &history[..keep_from]).await {
            Ok(summary) => (summary, Compression::Summarized { dropped: keep_from }),
            Err(e) if forced => {
                warn!(session = %key, error = %e, "Summarization failed, dropping old messages");
                (
                    dropped_note(&previous, keep_from),
                    Compression::Dropped { dropped: keep_from },
                )
            }
            Err(e) => {
                warn!(session = %key, error = %e, "Auto-summarization failed");
                return Compression::Skipped;
            }
        };

        // The history is only read under the session's turn lock, so the
        // prefix we summarized is still the prefix being dropped.
        match sessions.compact(key, summary, keep_from) {
            Ok(dropped) => {
                info!(session = %key, dropped, forced, "Session compressed");
                outcome
            }
            Err(e) => {
                warn!(session = %key, error = %e, "Compaction failed");
                Compression::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, text};
    use clawloop_core::message::MessageToolCall;

    fn tool_step() -> Vec<Message> {
        vec![
            Message::assistant_with_tools(
                "",
                vec![MessageToolCall {
                    id: "c1".into(),
                    name: "exec".into(),
                    arguments: "{}".into(),
                }],
            ),
            Message::tool_result("c1", "ok"),
        ]
    }

    #[test]
    fn split_moves_to_next_user_message() {
        let mut messages = vec![Message::user("q1")];
        messages.extend(tool_step());
        messages.push(Message::assistant("a1"));
        messages.push(Message::user("q2"));
        messages.push(Message::assistant("a2"));

        // mid = 3 lands on "a1"; the next user message is at 4.
        assert_eq!(split_point(&messages), 4);
    }

    #[test]
    fn split_skips_tool_results_without_user_message() {
        let mut messages = vec![Message::user("q1"), Message::assistant("a")];
        messages.extend(tool_step());
        messages.push(Message::tool_result("c2", "more"));

        // mid = 2 is the assistant call; nothing to skip.
        assert_eq!(split_point(&messages), 2);

        let messages = vec![
            Message::user("q1"),
            Message::assistant("a"),
            Message::tool_result("c1", "x"),
            Message::tool_result("c2", "y"),
        ];
        assert_eq!(split_point(&messages), 4);
    }

    #[test]
    fn split_of_empty_history_is_zero() {
        assert_eq!(split_point(&[]), 0);
        assert_eq!(split_point(&[Message::user("only")]), 0);
    }

    #[test]
    fn policy_thresholds() {
        let policy = SummarizePolicy {
            message_threshold: 3,
            token_percent: 50,
            context_window: 100,
        };
        assert!(!policy.should_summarize(&[Message::user("a"), Message::user("b")]));
        assert!(policy.should_summarize(&vec![Message::user("a"); 4]));
        // 50% of 100 tokens = 50 tokens = 200 chars.
        assert!(policy.should_summarize(&[Message::user("x".repeat(240))]));
    }

    fn seeded_store() -> SessionStore {
        let store = SessionStore::new();
        for i in 0..3 {
            store.append("s", Message::user(format!("question {i}")));
            store.append("s", Message::assistant(format!("answer {i}")));
        }
        store
    }

    #[tokio::test]
    async fn force_summarizes_older_half() {
        let store = seeded_store();
        let provider = Arc::new(ScriptedProvider::new(vec![text("User asked three questions.")]));
        let compressor = Compressor::new(provider.clone(), "mock-model");

        let outcome = compressor.force(&store, "s").await;
        assert_eq!(outcome, Compression::Summarized { dropped: 4 });
        assert_eq!(store.summary("s"), "User asked three questions.");
        assert_eq!(store.history("s")[0].content, "question 2");

        let request = &provider.requests()[0];
        assert_eq!(request.max_tokens, Some(SUMMARY_MAX_TOKENS));
        assert_eq!(request.temperature, SUMMARY_TEMPERATURE);
        assert!(request.messages[0].content.contains("user: question 0"));
        assert!(!request.messages[0].content.contains("question 2"));
    }

    #[tokio::test]
    async fn force_falls_back_to_note_on_failure() {
        let store = seeded_store();
        store.compact("s", "Earlier: greetings.", 0).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Timeout(
            "slow".into(),
        ))]));
        let compressor = Compressor::new(provider, "mock-model");

        let outcome = compressor.force(&store, "s").await;
        assert_eq!(outcome, Compression::Dropped { dropped: 4 });
        assert_eq!(
            store.summary("s"),
            "Earlier: greetings.\n\n[4 earlier messages were dropped to fit the context window]"
        );
        assert_eq!(store.history("s").len(), 2);
    }

    #[tokio::test]
    async fn previous_summary_is_merged() {
        let store = seeded_store();
        store.compact("s", "User is called Sam.", 0).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![text("Sam asked questions.")]));
        let compressor = Compressor::new(provider.clone(), "mock-model");

        compressor.force(&store, "s").await;
        let prompt = &provider.requests()[0].messages[0].content;
        assert!(prompt.contains("Existing summary (merge it into the new one):\nUser is called Sam."));
    }

    #[tokio::test]
    async fn auto_summary_failure_leaves_session() {
        let store = seeded_store();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Network(
            "down".into(),
        ))]));
        let compressor = Compressor::new(provider, "mock-model");
        let policy = SummarizePolicy {
            message_threshold: 2,
            ..SummarizePolicy::default()
        };

        let outcome = compressor.maybe_summarize(&store, "s", &policy).await;
        assert_eq!(outcome, Compression::Skipped);
        assert_eq!(store.history("s").len(), 6);
        assert!(store.summary("s").is_empty());
    }

    #[tokio::test]
    async fn auto_summary_below_threshold_does_nothing() {
        let store = seeded_store();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let compressor = Compressor::new(provider.clone(), "mock-model");

        let outcome = compressor
            .maybe_summarize(&store, "s", &SummarizePolicy::default())
            .await;
        assert_eq!(outcome, Compression::Skipped);
        assert_eq!(provider.call_count(), 0);
    }
}
