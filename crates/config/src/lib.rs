//! Configuration loading, validation, and management for ClawLoop.
//!
//! Loads configuration from `~/.clawloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use clawloop_core::BusCapacity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.clawloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key used when a provider has no key of its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Primary model as `protocol/model` (e.g. `openrouter/anthropic/claude-sonnet-4`)
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Fallback models tried in order when the primary fails
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub tools: ToolsConfig,

    /// Cooldown windows per failure reason
    #[serde(default)]
    pub cooldown: CooldownConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations, keyed by protocol name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Channel configurations, keyed by channel name
    #[serde(default)]
    pub channels_config: HashMap<String, ChannelConfig>,
}

fn default_model() -> String {
    "openrouter/anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_model", &self.default_model)
            .field("fallback_models", &self.fallback_models)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("tools", &self.tools)
            .field("cooldown", &self.cooldown)
            .field("bus", &self.bus)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .field("channels_config", &self.channels_config)
            .finish()
    }
}

/// Per-agent behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum model steps per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Workspace root; defaults to `~/.clawloop/workspace`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,

    /// Confine tool execution to the workspace
    #[serde(default = "default_true")]
    pub restrict_to_workspace: bool,

    /// Summarize once history grows past this many messages
    #[serde(default = "default_summarize_threshold")]
    pub summarize_message_threshold: usize,

    /// ... or past this share of the context window
    #[serde(default = "default_summarize_percent")]
    pub summarize_token_percent: u8,

    /// Model context window in tokens
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Replaces the built-in identity prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_iterations() -> usize {
    20
}
fn default_summarize_threshold() -> usize {
    20
}
fn default_summarize_percent() -> u8 {
    75
}
fn default_context_window() -> usize {
    128_000
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            workspace: None,
            restrict_to_workspace: true,
            summarize_message_threshold: default_summarize_threshold(),
            summarize_token_percent: default_summarize_percent(),
            context_window: default_context_window(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub exec: ExecConfig,
}

/// Shell tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    /// Output beyond this many characters is truncated
    #[serde(default = "default_max_output")]
    pub max_output_chars: usize,

    /// Extra patterns to block, on top of the built-in denylist
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

fn default_exec_timeout() -> u64 {
    60
}
fn default_max_output() -> usize {
    10_000
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_exec_timeout(),
            max_output_chars: default_max_output(),
            deny_patterns: Vec::new(),
        }
    }
}

/// How long a provider stays unavailable after each kind of failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: u64,
    #[serde(default = "default_overloaded_secs")]
    pub overloaded_secs: u64,
    #[serde(default = "default_auth_secs")]
    pub auth_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_unknown_secs")]
    pub unknown_secs: u64,
}

fn default_rate_limit_secs() -> u64 {
    60
}
fn default_overloaded_secs() -> u64 {
    60
}
fn default_auth_secs() -> u64 {
    300
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_unknown_secs() -> u64 {
    10
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: default_rate_limit_secs(),
            overloaded_secs: default_overloaded_secs(),
            auth_secs: default_auth_secs(),
            timeout_secs: default_timeout_secs(),
            unknown_secs: default_unknown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

fn default_queue_capacity() -> usize {
    100
}
fn default_stream_capacity() -> usize {
    500
}

impl BusConfig {
    pub fn capacity(&self) -> BusCapacity {
        BusCapacity {
            inbound: self.inbound_capacity,
            outbound: self.outbound_capacity,
            stream: self.stream_capacity,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42617
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Overrides the protocol's default base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Allowlist of sender IDs. Empty = deny all. ["*"] = allow all.
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Bot token or similar credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Debounce interval for progressive message edits
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Channel-specific settings (varies by platform)
    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_flush_interval_ms() -> u64 {
    500
}

impl ChannelConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_users: Vec::new(),
            token: None,
            flush_interval_ms: default_flush_interval_ms(),
            settings: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("enabled", &self.enabled)
            .field("allowed_users", &self.allowed_users)
            .field("token", &redact(&self.token))
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("settings", &self.settings)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.clawloop/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `CLAWLOOP_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("CLAWLOOP_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("CLAWLOOP_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".clawloop")
    }

    /// The default workspace directory.
    pub fn default_workspace_dir() -> PathBuf {
        Self::config_dir().join("workspace")
    }

    /// The effective workspace, with a leading `~` expanded.
    pub fn workspace(&self) -> PathBuf {
        match self.agent.workspace.as_deref() {
            Some(path) => expand_home(path),
            None => Self::default_workspace_dir(),
        }
    }

    /// API key for a protocol: the provider's own key, else the global one.
    pub fn api_key_for(&self, protocol: &str) -> Option<String> {
        self.providers
            .get(protocol)
            .and_then(|p| p.api_key.clone())
            .or_else(|| self.api_key.clone())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_model must not be empty".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.summarize_token_percent == 0 || self.agent.summarize_token_percent > 100 {
            return Err(ConfigError::ValidationError(
                "agent.summarize_token_percent must be between 1 and 100".into(),
            ));
        }

        if self.tools.exec.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tools.exec.timeout_secs must be greater than 0".into(),
            ));
        }

        let bus = &self.bus;
        if bus.inbound_capacity == 0 || bus.outbound_capacity == 0 || bus.stream_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "bus capacities must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_model: default_model(),
            fallback_models: Vec::new(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentSettings::default(),
            tools: ToolsConfig::default(),
            cooldown: CooldownConfig::default(),
            bus: BusConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
            channels_config: HashMap::new(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs_home().join(rest),
        None if path == "~" => dirs_home(),
        None => PathBuf::from(path),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 42617);
        assert!(config.agent.restrict_to_workspace);
        assert_eq!(config.tools.exec.max_output_chars, 10_000);
        assert_eq!(config.bus.stream_capacity, 500);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_model, config.default_model);
        assert_eq!(parsed.gateway.port, config.gateway.port);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = AppConfig::default();
        config.bus.stream_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bus capacities"));
    }

    #[test]
    fn zero_exec_timeout_rejected() {
        let mut config = AppConfig::default();
        config.tools.exec.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.default_model, default_model());
    }

    #[test]
    fn load_from_file_with_fallbacks_and_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_model = "openai/gpt-4o"
fallback_models = ["groq/llama-3.3-70b-versatile", "openrouter/deepseek/deepseek-chat"]

[agent]
max_iterations = 8
workspace = "/srv/agent"

[cooldown]
rate_limit_secs = 120

[providers.groq]
api_key = "gsk-test"

[channels_config.telegram]
enabled = true
allowed_users = ["1001"]
token = "123:abc"
parse_mode = "html"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.fallback_models.len(), 2);
        assert_eq!(config.agent.max_iterations, 8);
        assert_eq!(config.workspace(), PathBuf::from("/srv/agent"));
        assert_eq!(config.cooldown.rate_limit_secs, 120);
        assert_eq!(config.cooldown.unknown_secs, 10);

        let telegram = &config.channels_config["telegram"];
        assert!(telegram.enabled);
        assert_eq!(telegram.flush_interval(), Duration::from_millis(500));
        assert_eq!(telegram.settings["parse_mode"], "html");
    }

    #[test]
    fn unparseable_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "default_model = [").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn provider_key_overrides_global_key() {
        let mut config = AppConfig {
            api_key: Some("global".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "groq".into(),
            ProviderConfig {
                api_key: Some("gsk".into()),
                api_url: None,
            },
        );
        assert_eq!(config.api_key_for("groq").as_deref(), Some("gsk"));
        assert_eq!(config.api_key_for("openai").as_deref(), Some("global"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        config.channels_config.insert(
            "telegram".into(),
            ChannelConfig {
                token: Some("bot-secret".into()),
                ..ChannelConfig::default()
            },
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("bot-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn bus_capacity_conversion() {
        let cap = BusConfig::default().capacity();
        assert_eq!((cap.inbound, cap.outbound, cap.stream), (100, 100, 500));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter"));
        assert!(toml_str.contains("42617"));
    }
}
