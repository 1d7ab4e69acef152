use opsdeck_core::{command::DEFAULT_COMMAND_TIMEOUT, RetryPolicy};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use url::Url;

pub const BASE_URL_ENV: &str = "OPSDECK_API_BASE";
pub const DEFAULT_STATUS_PATH: &str = "/ws/ui";
pub const COMMAND_PATH: &str = "/api/cmd";
pub const ITEMS_PATH: &str = "/api/items";
pub const SELECTION_PATH: &str = "/api/selection";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("OPSDECK_API_BASE is not set (pass --base-url or export OPSDECK_API_BASE)")]
    MissingBaseUrl,
    #[error("invalid base url {value:?}: {reason}")]
    InvalidBaseUrl { value: String, reason: String },
    #[error("unsupported base url scheme {0:?}; expected http or https")]
    UnsupportedScheme(String),
}

#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub base_url: Url,
    pub token: String,
    pub status_path: String,
    pub reconnect: RetryPolicy,
    pub command_timeout: Duration,
    pub log_dir: Option<PathBuf>,
    pub log_stderr: bool,
}

/// Values given on the command line; empty strings fall through to the environment.
#[derive(Clone, Debug, Default)]
pub struct ConfigFlags {
    pub base_url: String,
    pub token: String,
    pub status_path: String,
    pub log_dir: String,
    pub reconnect_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
}

impl ConsoleConfig {
    pub fn load(flags: &ConfigFlags) -> Result<Self, ConfigError> {
        Self::resolve(flags, |key| std::env::var(key).ok())
    }

    pub fn resolve<F>(flags: &ConfigFlags, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_base = resolve_value(&flags.base_url, env(BASE_URL_ENV))
            .ok_or(ConfigError::MissingBaseUrl)?;
        let base_url = parse_base_url(&raw_base)?;
        let token = resolve_value(&flags.token, env("OPSDECK_TOKEN")).unwrap_or_default();
        let status_path = resolve_value(&flags.status_path, env("OPSDECK_STATUS_PATH"))
            .unwrap_or_else(|| DEFAULT_STATUS_PATH.to_string());
        let reconnect = flags
            .reconnect_ms
            .or_else(|| env("OPSDECK_RECONNECT_MS").and_then(|value| value.trim().parse().ok()))
            .map(|ms| RetryPolicy::fixed(Duration::from_millis(ms)))
            .unwrap_or_default();
        let command_timeout = flags
            .command_timeout_ms
            .or_else(|| {
                env("OPSDECK_COMMAND_TIMEOUT_MS").and_then(|value| value.trim().parse().ok())
            })
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let log_dir = resolve_value(&flags.log_dir, env("OPSDECK_LOG_DIR")).map(PathBuf::from);
        let log_stderr = env("OPSDECK_LOG_STDERR")
            .and_then(|value| parse_bool_flag(&value))
            .unwrap_or(false);
        Ok(Self {
            base_url,
            token,
            status_path,
            reconnect,
            command_timeout,
            log_dir,
            log_stderr,
        })
    }
}

fn resolve_value(flag: &str, env_value: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidBaseUrl {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

/// `https://host/x` + `/ws/ui` -> `wss://host/ws/ui`.
pub fn ws_url(base: &Url, path: &str) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(base.scheme().to_string()))?;
    url.set_path(&absolute_path(path));
    Ok(url)
}

/// Resolve an absolute API path against the base, dropping any base query.
pub fn endpoint_url(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&absolute_path(path));
    url.set_query(None);
    url.set_fragment(None);
    url
}

fn absolute_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
