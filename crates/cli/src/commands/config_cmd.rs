//! `clawloop config`: configuration management commands.

use clawloop_config::AppConfig;

const REDACTED: &str = "[REDACTED]";

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", render(&config)?);
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

pub fn validate() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Config error: {e}"))?;
    config.validate()?;

    let mut warnings = Vec::new();
    if config.api_key.is_none() && config.providers.values().all(|p| p.api_key.is_none()) {
        warnings.push("No API key set (set CLAWLOOP_API_KEY, OPENROUTER_API_KEY or OPENAI_API_KEY)");
    }
    if config.gateway.host == "0.0.0.0" {
        warnings.push("Gateway is bound to all interfaces");
    }
    if config
        .channels_config
        .values()
        .any(|c| c.enabled && c.allowed_users.is_empty())
    {
        warnings.push("An enabled channel has an empty allowlist and will reject everyone");
    }

    println!("Config OK");
    for w in &warnings {
        println!("   warning: {w}");
    }
    Ok(())
}

/// The effective config as TOML, with credentials masked.
fn render(config: &AppConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&redacted(config))
}

fn redacted(config: &AppConfig) -> AppConfig {
    let mut config = config.clone();
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    for channel in config.channels_config.values_mut() {
        if channel.token.is_some() {
            channel.token = Some(REDACTED.into());
        }
    }
    config
}
