use console_bridge_core::{ConsoleConfig, ConsoleError, Settings};
use serde_json::Value;

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:7755";
pub const DEFAULT_RECENT_OUTPUT: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` of the remote console's line channel.
    pub endpoint: String,
    /// Forwarded as the settings map of every connection-open event.
    pub settings: Settings,
    /// Capacity of the recent display output ring.
    pub recent_output: usize,
    pub console: ConsoleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            settings: Settings::new(),
            recent_output: DEFAULT_RECENT_OUTPUT,
            console: ConsoleConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConsoleError> {
        let endpoint =
            std::env::var("CONSOLE_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let settings = match std::env::var("CONSOLE_SETTINGS") {
            Ok(raw) => parse_settings(&raw)?,
            Err(_) => Settings::new(),
        };

        let recent_output = std::env::var("CONSOLE_RECENT_OUTPUT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_RECENT_OUTPUT);

        Ok(Self {
            endpoint,
            settings,
            recent_output,
            console: ConsoleConfig::from_env(),
        })
    }
}

/// Settings must be a JSON object.
pub fn parse_settings(raw: &str) -> Result<Settings, ConsoleError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(ConsoleError::InvalidConfig {
            key: "CONSOLE_SETTINGS".to_string(),
            value: raw.to_string(),
        }),
    }
}
