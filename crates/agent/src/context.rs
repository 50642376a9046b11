//! System prompt and message-list construction.
//!
//! The system prompt is layered (missing layers are skipped):
//!
//! 1. **Base identity**: configured override or the built-in prompt
//! 2. **Workspace bootstrap files**: `AGENTS.md`, `SOUL.md`, `USER.md`, `IDENTITY.md`
//! 3. **Tools**: names and descriptions of registered tools
//! 4. **Runtime**: current time, channel, chat
//! 5. **Summary**: the session summary left by compression

use chrono::Utc;
use clawloop_core::message::Message;
use clawloop_core::tool::ToolRegistry;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bootstrap files read from the workspace root, in prompt order.
pub const BOOTSTRAP_FILES: [(&str, &str); 4] = [
    ("AGENTS.md", "agent_instructions"),
    ("SOUL.md", "personality"),
    ("USER.md", "user_context"),
    ("IDENTITY.md", "identity"),
];

/// Heading the session summary is placed under.
pub const SUMMARY_HEADING: &str = "## Summary of Previous Conversation";

const BASE_IDENTITY: &str = concat!(
    "You are ClawLoop, a helpful AI assistant reachable from chat apps and the terminal. ",
    "You can call tools to act on the user's workspace. ",
    "Use them when they help, report what you did, and keep answers concise."
);

/// Builds the per-turn message list.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    workspace: Option<PathBuf>,
    system_prompt: Option<String>,
    tools: Vec<(String, String)>,
}

impl ContextBuilder {
    pub fn new(workspace: Option<PathBuf>) -> Self {
        Self {
            workspace,
            ..Self::default()
        }
    }

    /// Replace the built-in base identity.
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    /// Record the tools the model can call.
    pub fn with_tools(mut self, registry: &ToolRegistry) -> Self {
        self.tools = registry
            .definitions()
            .into_iter()
            .map(|d| (d.name, d.description))
            .collect();
        self
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    pub fn build_system_prompt(&self, channel: &str, chat_id: &str, summary: &str) -> String {
        let mut prompt = String::with_capacity(4096);
        prompt.push_str(self.system_prompt.as_deref().unwrap_or(BASE_IDENTITY));

        if let Some(workspace) = &self.workspace {
            prompt.push_str(&format!("\n\nWorkspace: {}", workspace.display()));
            for (file, tag) in BOOTSTRAP_FILES {
                if let Some(content) = read_bootstrap(workspace, file) {
                    prompt.push_str(&format!("\n\n<{tag}>\n{}\n</{tag}>", content.trim()));
                }
            }
        }

        if !self.tools.is_empty() {
            prompt.push_str("\n\n## Available Tools\n");
            for (name, description) in &self.tools {
                prompt.push_str(&format!("- {name}: {description}\n"));
            }
        }

        prompt.push_str(&format!(
            "\n\n## Runtime\nCurrent time: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M (%A) UTC")
        ));
        if !channel.is_empty() {
            prompt.push_str(&format!("Channel: {channel}\nChat: {chat_id}\n"));
        }

        if !summary.trim().is_empty() {
            prompt.push_str(&format!("\n{SUMMARY_HEADING}\n{}\n", summary.trim()));
        }

        prompt
    }

    /// System prompt first, then history, then `current` as a user message
    /// when given.
    pub fn build_messages(
        &self,
        history: &[Message],
        summary: &str,
        current: Option<&str>,
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.build_system_prompt(channel, chat_id, summary)));
        messages.extend_from_slice(history);
        if let Some(content) = current.filter(|c| !c.is_empty()) {
            messages.push(Message::user(content));
        }
        messages
    }
}

fn read_bootstrap(workspace: &Path, file: &str) -> Option<String> {
    let path = workspace.join(file);
    let content = std::fs::read_to_string(&path).ok()?;
    if content.trim().is_empty() {
        return None;
    }
    debug!(file = %path.display(), "Loaded bootstrap file");
    Some(content)
}
