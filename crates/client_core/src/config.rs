use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::private::StaleEntryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub database_url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub presence_interval: Duration,
    pub stale_entry_policy: StaleEntryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            database_url: "sqlite://./data/client.db".into(),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(2),
            presence_interval: Duration::from_secs(10),
            stale_entry_policy: StaleEntryPolicy::RejectUntilClosed,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server_url: Option<String>,
    database_url: Option<String>,
    heartbeat_secs: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    presence_interval_secs: Option<u64>,
    stale_entry_policy: Option<StaleEntryPolicy>,
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_config() -> ClientConfig {
    load_config_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_config_from(path: &Path) -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(err) = apply_file_overrides(&mut config, &raw) {
            warn!(path = %path.display(), "config: ignoring unreadable file: {err}");
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn apply_file_overrides(config: &mut ClientConfig, raw: &str) -> Result<(), toml::de::Error> {
    let file_cfg: FileConfig = toml::from_str(raw)?;
    if let Some(v) = file_cfg.server_url {
        config.server_url = v;
    }
    if let Some(v) = file_cfg.database_url {
        config.database_url = v;
    }
    if let Some(v) = file_cfg
        .heartbeat_secs
        .and_then(|v| non_zero("heartbeat_secs", v))
    {
        config.heartbeat_interval = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        config.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg
        .presence_interval_secs
        .and_then(|v| non_zero("presence_interval_secs", v))
    {
        config.presence_interval = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.stale_entry_policy {
        config.stale_entry_policy = v;
    }
    Ok(())
}

fn apply_env_overrides(config: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        config.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        config.server_url = v;
    }

    if let Some(v) = var("APP__DATABASE_URL") {
        config.database_url = v;
    }

    if let Some(v) = var("APP__HEARTBEAT_SECS")
        .and_then(|v| v.parse().ok())
        .and_then(|v| non_zero("APP__HEARTBEAT_SECS", v))
    {
        config.heartbeat_interval = Duration::from_secs(v);
    }
    if let Some(v) = var("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        config.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = var("APP__PRESENCE_INTERVAL_SECS")
        .and_then(|v| v.parse().ok())
        .and_then(|v| non_zero("APP__PRESENCE_INTERVAL_SECS", v))
    {
        config.presence_interval = Duration::from_secs(v);
    }

    if let Some(v) = var("APP__EVICT_CLOSED_CONVERSATIONS") {
        config.stale_entry_policy = if matches!(v.trim(), "1" | "true" | "yes") {
            StaleEntryPolicy::EvictClosed
        } else {
            StaleEntryPolicy::RejectUntilClosed
        };
    }
}

/// Timer periods must be positive; a zero keeps whatever value was already set.
fn non_zero(key: &str, secs: u64) -> Option<u64> {
    if secs == 0 {
        warn!(key, "config: ignoring zero interval");
        return None;
    }
    Some(secs)
}
