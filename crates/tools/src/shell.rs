//! Exec tool: run shell commands inside a guarded sandbox.
//!
//! Every command passes through, in order:
//! 1. argument salvage (`{"raw": "..."}` from malformed tool calls)
//! 2. quote and code-fence sanitization
//! 3. working directory confinement, after symlink resolution
//! 4. the denylist and, when confined, the path-argument guard
//!
//! Refusals, failures and timeouts are returned as error results so the
//! model can see what happened.

use async_trait::async_trait;
use clawloop_config::ExecConfig;
use clawloop_core::error::ToolError;
use clawloop_core::tool::{Tool, ToolContext, ToolResult};
use clawloop_security::{contains_traversal, escapes_lexically, resolve_within};
use regex_lite::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[rf]{1,2}\b",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\b(format|mkfs|diskpart)\b\s",
    r"\bdd\s+if=",
    r">\s*/dev/sd[a-z]\b",
    r"\b(shutdown|reboot|poweroff)\b",
    r":\(\)\s*\{.*\};\s*:",
];

/// Device paths that are always fine to mention.
const HARMLESS_PATHS: &[&str] = &["/dev/null", "/dev/stdin", "/dev/stdout", "/dev/stderr"];

/// Execute shell commands with safety constraints.
pub struct ExecTool {
    workspace: PathBuf,
    restrict_to_workspace: bool,
    timeout: Duration,
    max_output_chars: usize,
    deny_patterns: Vec<Regex>,
}

impl ExecTool {
    /// An exec tool with default limits. An empty `workspace` means the
    /// process's current directory.
    pub fn new(workspace: impl Into<PathBuf>, restrict_to_workspace: bool) -> Self {
        Self::from_config(workspace, restrict_to_workspace, &ExecConfig::default())
    }

    pub fn from_config(
        workspace: impl Into<PathBuf>,
        restrict_to_workspace: bool,
        config: &ExecConfig,
    ) -> Self {
        let deny_patterns = DEFAULT_DENY_PATTERNS
            .iter()
            .copied()
            .chain(config.deny_patterns.iter().map(String::as_str))
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Ignoring invalid deny pattern");
                    None
                }
            })
            .collect();

        Self {
            workspace: workspace.into(),
            restrict_to_workspace,
            timeout: config.timeout(),
            max_output_chars: config.max_output_chars,
            deny_patterns,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_restrict_to_workspace(&mut self, restrict: bool) {
        self.restrict_to_workspace = restrict;
    }

    /// Check a command against the denylist and, when confined, against
    /// path arguments that leave `cwd`. Returns the refusal text.
    pub fn guard_command(&self, command: &str, cwd: &Path) -> Option<String> {
        let lower = command.to_lowercase();
        if self.deny_patterns.iter().any(|re| re.is_match(&lower)) {
            return Some("Command blocked by safety guard (dangerous pattern detected)".into());
        }

        if !self.restrict_to_workspace {
            return None;
        }

        if contains_traversal(command) {
            return Some("Command blocked by safety guard (path traversal detected)".into());
        }

        path_arguments(command)
            .into_iter()
            .find(|path| !HARMLESS_PATHS.contains(&path.as_str()) && escapes_lexically(cwd, Path::new(path)))
            .map(|path| format!("Command blocked by safety guard (path outside working dir: {path})"))
    }

    /// Pick the directory the command runs in.
    fn working_dir(&self, requested: Option<&str>) -> Result<PathBuf, String> {
        if self.restrict_to_workspace {
            let candidate = requested.map_or_else(|| self.workspace.clone(), PathBuf::from);
            return resolve_within(&self.workspace, &candidate).map_err(|e| {
                format!("Command blocked by safety guard (working directory outside workspace): {e}")
            });
        }

        Ok(match requested {
            Some(dir) => PathBuf::from(dir),
            None if self.workspace.as_os_str().is_empty() => PathBuf::from("."),
            None => self.workspace.clone(),
        })
    }

    async fn run(&self, command: &str, cwd: &Path) -> ToolResult {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ToolResult::error(format!("Failed to start command: {e}")),
        };
        // Killed on timeout, or when the turn drops this future.
        let mut group = ProcessGroupGuard::new(&child);

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                group.disarm();
                output
            }
            Ok(Err(e)) => return ToolResult::error(format!("Failed to run command: {e}")),
            Err(_) => {
                warn!(command = %command, timeout_secs = self.timeout.as_secs_f32(), "Command timed out");
                return ToolResult::error(format!(
                    "Command timed out after {:.1}s",
                    self.timeout.as_secs_f32()
                ));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\nSTDERR:\n");
            text.push_str(&stderr);
        }

        let success = output.status.success();
        if !success {
            let code = output.status.code().unwrap_or(-1);
            debug!(command = %command, exit_code = code, "Command exited with failure");
            text.push_str(&format!("\nExit code: {code}"));
        }

        if text.trim().is_empty() {
            text = "(no output)".into();
        }
        let text = truncate_output(text, self.max_output_chars);

        if success {
            ToolResult::new(text)
        } else {
            ToolResult::error(text)
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Use with care."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory for the command"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let Some(command) = extract_command(&arguments) else {
            return Ok(ToolResult::error("command is required"));
        };
        let command = sanitize_shell_command(&command);
        if command.is_empty() {
            return Ok(ToolResult::error("command is required"));
        }

        let cwd = match self.working_dir(arguments["working_dir"].as_str()) {
            Ok(cwd) => cwd,
            Err(reason) => {
                warn!(command = %command, reason = %reason, "Exec blocked");
                return Ok(ToolResult::error(reason));
            }
        };

        if let Some(reason) = self.guard_command(&command, &cwd) {
            warn!(command = %command, reason = %reason, "Exec blocked");
            return Ok(ToolResult::error(reason));
        }

        debug!(command = %command, cwd = %cwd.display(), "Executing shell command");
        Ok(self.run(&command, &cwd).await)
    }
}

/// Kills a command's whole process group on drop, so processes started by
/// the shell die with it.
#[cfg(unix)]
struct ProcessGroupGuard(Option<nix::unistd::Pid>);

#[cfg(unix)]
impl ProcessGroupGuard {
    fn new(child: &tokio::process::Child) -> Self {
        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(nix::unistd::Pid::from_raw);
        Self(pgid)
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

#[cfg(unix)]
impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};

        if let Some(pgid) = self.0.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
            }
        }
    }
}

#[cfg(not(unix))]
struct ProcessGroupGuard;

#[cfg(not(unix))]
impl ProcessGroupGuard {
    fn new(_child: &tokio::process::Child) -> Self {
        Self
    }

    fn disarm(&mut self) {}
}

/// The `command` argument, or one salvaged from a `raw` string.
fn extract_command(arguments: &serde_json::Value) -> Option<String> {
    if let Some(command) = arguments["command"].as_str() {
        return Some(command.to_string());
    }
    let raw = arguments["raw"].as_str()?;
    let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
    parsed["command"].as_str().map(String::from)
}

/// Strip Markdown fences and a duplicated trailing quote from a command.
pub fn sanitize_shell_command(command: &str) -> String {
    let mut cmd = command.trim();

    // A leading fence line such as "```bash" carries no command text.
    if let Some(rest) = cmd.strip_prefix("```")
        && let Some((lang, body)) = rest.split_once('\n')
        && lang.chars().all(|c| c.is_ascii_alphanumeric())
    {
        cmd = body;
    }

    let mut cmd = cmd.replace("```", "").trim().to_string();

    for quote in ['"', '\''] {
        let doubled = format!("{quote}{quote}");
        if count_unescaped(&cmd, quote) % 2 == 1 && cmd.ends_with(&doubled) {
            cmd.pop();
        }
    }
    cmd
}

fn count_unescaped(s: &str, quote: char) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in s.chars() {
        match c {
            '\\' if !escaped => escaped = true,
            c => {
                if c == quote && !escaped {
                    count += 1;
                }
                escaped = false;
            }
        }
    }
    count
}

/// Absolute paths a command passes as arguments.
///
/// Words are split the way a shell would, so quoted text stays one word.
/// Words containing whitespace (prose, JSON bodies, header values) and URLs
/// are not path arguments.
fn path_arguments(command: &str) -> Vec<String> {
    shell_words(command)
        .into_iter()
        .filter(|word| !word.chars().any(char::is_whitespace) && !word.contains("://"))
        .filter_map(|word| {
            let tail = word.rsplit(['=', '>', '<']).next().unwrap_or(&word);
            let tail = tail.trim_matches(|c| matches!(c, '(' | ')' | ';' | '|' | '&'));
            tail.starts_with('/').then(|| tail.to_string())
        })
        .collect()
}

fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn truncate_output(text: String, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(&format!("\n... (truncated, {} more chars)", total - max_chars));
    out
}
