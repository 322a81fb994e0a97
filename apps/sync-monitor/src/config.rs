//! Environment-backed runtime configuration for `sync-monitor`.

use std::{env, fmt::Display, str::FromStr};

use sync_core::SyncConfig;
use thiserror::Error;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Runtime configuration used by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Base URL of the dashboard backend.
    pub api_url: String,
    /// Push channel URL; derived from `api_url` when unset.
    pub ws_url: Option<String>,
    /// Conversation to open after connecting.
    pub contact_id: Option<String>,
    /// Bearer token seeded into the credential store on startup.
    pub token: Option<String>,
    pub sync: SyncConfig,
}

impl MonitorConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_url = optional_trimmed_env("WACHAT_API_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned());
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "WACHAT_API_URL",
                value: api_url,
                reason: "must start with http:// or https://".to_owned(),
            });
        }

        let ws_url = optional_trimmed_env("WACHAT_WS_URL", &mut lookup);
        if let Some(ws_url) = &ws_url
            && !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://"))
        {
            return Err(ConfigError::InvalidValue {
                key: "WACHAT_WS_URL",
                value: ws_url.clone(),
                reason: "must start with ws:// or wss://".to_owned(),
            });
        }

        let contact_id = optional_trimmed_env("WACHAT_CONTACT", &mut lookup);
        let token = optional_trimmed_env("WACHAT_TOKEN", &mut lookup);

        let defaults = SyncConfig::default();
        let initial_window =
            parse_with_default("WACHAT_INITIAL_WINDOW", defaults.initial_window, &mut lookup)?;
        let older_window =
            parse_with_default("WACHAT_OLDER_WINDOW", defaults.older_window, &mut lookup)?;
        let reconnect_max_attempts = parse_with_default(
            "WACHAT_RECONNECT_MAX_ATTEMPTS",
            defaults.reconnect_max_attempts,
            &mut lookup,
        )?;
        let connect_debounce_ms = parse_with_default(
            "WACHAT_CONNECT_DEBOUNCE_MS",
            defaults.connect_debounce_ms,
            &mut lookup,
        )?;

        for (key, value) in [
            ("WACHAT_INITIAL_WINDOW", initial_window),
            ("WACHAT_OLDER_WINDOW", older_window),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        Ok(Self {
            api_url,
            ws_url,
            contact_id,
            token,
            sync: SyncConfig {
                initial_window,
                older_window,
                reconnect_max_attempts,
                connect_debounce_ms,
                ..defaults
            },
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}
