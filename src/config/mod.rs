//! Process configuration, read from `FLOORCAST_`-prefixed environment
//! variables. A `.env` file is honored when present (loaded in `main`).

use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub snapshot_interval_seconds: u64,
    pub ha_websocket_token: String,
    pub ha_websocket_url: String,
    pub db_uri: String,
    pub entity_blocklist: Vec<String>,
    pub log_level: String,
    pub log_to_console: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            snapshot_interval_seconds: parsed_var("FLOORCAST_SNAPSHOT_INTERVAL_SECONDS", 300)?,
            ha_websocket_token: std::env::var("FLOORCAST_HA_WEBSOCKET_TOKEN")
                .map_err(|_| ConfigError::MissingVar("FLOORCAST_HA_WEBSOCKET_TOKEN"))?,
            ha_websocket_url: string_var(
                "FLOORCAST_HA_WEBSOCKET_URL",
                "ws://homeassistant.local:8123/api/websocket",
            ),
            db_uri: string_var("FLOORCAST_DB_URI", "floorcast.db"),
            entity_blocklist: std::env::var("FLOORCAST_ENTITY_BLOCKLIST")
                .map(|raw| parse_blocklist(&raw))
                .unwrap_or_else(|_| vec!["update.*".to_string()]),
            log_level: string_var("FLOORCAST_LOG_LEVEL", "info"),
            log_to_console: parsed_var("FLOORCAST_LOG_TO_CONSOLE", false)?,
        })
    }
}

fn string_var(var: &'static str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parsed_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var,
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// Comma-separated glob list; blank entries are dropped.
fn parse_blocklist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_string)
        .collect()
}
