use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

const SETTINGS_FILE: &str = "client.toml";

/// Tunables for the engine. Every field has a default so `client.toml` may set any subset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
    pub mutation_timeout_ms: u64,
    pub call_end_grace_ms: u64,
    pub notification_snapshot_limit: usize,
    pub call_snapshot_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 8_000,
            retry_max_attempts: 6,
            mutation_timeout_ms: 10_000,
            call_end_grace_ms: 2_000,
            notification_snapshot_limit: 50,
            call_snapshot_limit: 20,
        }
    }
}

impl EngineSettings {
    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    pub fn call_end_grace(&self) -> Duration {
        Duration::from_millis(self.call_end_grace_ms)
    }
}

/// Defaults, then `client.toml` when present, then `APP__*` environment variables.
pub fn load_settings() -> anyhow::Result<EngineSettings> {
    let mut settings = if Path::new(SETTINGS_FILE).exists() {
        load_settings_from(SETTINGS_FILE)?
    } else {
        EngineSettings::default()
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn load_settings_from(path: impl AsRef<Path>) -> anyhow::Result<EngineSettings> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

/// Unparseable values are ignored and the previous value is kept.
pub fn apply_env_overrides(settings: &mut EngineSettings, lookup: impl Fn(&str) -> Option<String>) {
    fn parse<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
        target: &mut T,
    ) {
        if let Some(parsed) = lookup(key).and_then(|raw| raw.trim().parse().ok()) {
            *target = parsed;
        }
    }

    parse(&lookup, "APP__RETRY_BASE_DELAY_MS", &mut settings.retry_base_delay_ms);
    parse(&lookup, "APP__RETRY_MAX_DELAY_MS", &mut settings.retry_max_delay_ms);
    parse(&lookup, "APP__RETRY_MAX_ATTEMPTS", &mut settings.retry_max_attempts);
    parse(&lookup, "APP__MUTATION_TIMEOUT_MS", &mut settings.mutation_timeout_ms);
    parse(&lookup, "APP__CALL_END_GRACE_MS", &mut settings.call_end_grace_ms);
    parse(
        &lookup,
        "APP__NOTIFICATION_SNAPSHOT_LIMIT",
        &mut settings.notification_snapshot_limit,
    );
    parse(&lookup, "APP__CALL_SNAPSHOT_LIMIT", &mut settings.call_snapshot_limit);
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
