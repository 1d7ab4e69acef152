use crate::selection::StartPayload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const SCREENSHOT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const START_SCRIPT: &str = "start_script";

/// Body of a relayed command: `{cmd, args}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Value,
}

impl CommandRequest {
    pub fn new(cmd: impl Into<String>, args: Value) -> Self {
        Self {
            cmd: cmd.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("request timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("{message}")]
    Server { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("unreadable response: {0}")]
    Decode(String),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::TimedOut(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Parse a response body. An empty body is a valid `null` payload.
pub fn decode_body(text: &str) -> Result<Value, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text)
}

/// Message for a non-success response: server `error`, then `message`, then the status.
pub fn server_error_message(status: u16, body: &Value) -> String {
    ["error", "message"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .find(|text| !text.trim().is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageFormat {
    #[default]
    #[serde(rename = "PNG")]
    Png,
    #[serde(rename = "JPEG")]
    Jpeg,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_uppercase().as_str() {
            "PNG" => Ok(ImageFormat::Png),
            "JPEG" | "JPG" => Ok(ImageFormat::Jpeg),
            other => Err(format!("Unknown image format: {other}")),
        }
    }
}

/// Commands the agent understands, with their relay arguments and timeouts.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    GetConfig,
    ValidateConfig {
        content: String,
    },
    SetConfig {
        content: String,
    },
    PatchConfig {
        patch: Value,
    },
    Screenshot {
        monitor: u32,
        region: Option<[i64; 4]>,
        format: ImageFormat,
    },
    StartScript(StartPayload),
    Custom {
        name: String,
        args: Value,
    },
}

impl AgentCommand {
    pub fn screenshot() -> Self {
        AgentCommand::Screenshot {
            monitor: 1,
            region: None,
            format: ImageFormat::Png,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AgentCommand::GetConfig => "get_config",
            AgentCommand::ValidateConfig { .. } => "validate_config",
            AgentCommand::SetConfig { .. } => "set_config",
            AgentCommand::PatchConfig { .. } => "patch_config",
            AgentCommand::Screenshot { .. } => "screenshot",
            AgentCommand::StartScript(_) => START_SCRIPT,
            AgentCommand::Custom { name, .. } => name,
        }
    }

    pub fn args(&self) -> Value {
        match self {
            AgentCommand::GetConfig => json!({}),
            AgentCommand::ValidateConfig { content } | AgentCommand::SetConfig { content } => {
                json!({ "content": content })
            }
            AgentCommand::PatchConfig { patch } => json!({ "patch": patch }),
            AgentCommand::Screenshot {
                monitor,
                region,
                format,
            } => {
                let mut args = Map::new();
                args.insert("monitor".to_string(), json!(monitor));
                if let Some(region) = region {
                    args.insert("region".to_string(), json!(region));
                }
                args.insert("format".to_string(), json!(format));
                Value::Object(args)
            }
            AgentCommand::StartScript(payload) => {
                serde_json::to_value(payload).unwrap_or_else(|_| json!({}))
            }
            AgentCommand::Custom { args, .. } => args.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_or(DEFAULT_COMMAND_TIMEOUT)
    }

    /// Screenshots always get their own longer budget; every other command uses
    /// `default`, which may be shorter than [`DEFAULT_COMMAND_TIMEOUT`].
    pub fn timeout_or(&self, default: Duration) -> Duration {
        match self {
            AgentCommand::Screenshot { .. } => SCREENSHOT_TIMEOUT,
            _ => default,
        }
    }

    pub fn to_request(&self) -> CommandRequest {
        CommandRequest::new(self.name(), self.args())
    }
}
