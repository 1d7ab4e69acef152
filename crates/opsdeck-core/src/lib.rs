use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub mod command;
pub mod retry;
pub mod selection;
pub mod status_feed;

pub use command::{AgentCommand, CommandRequest, DispatchError, ImageFormat};
pub use retry::{Backoff, RetryPolicy};
pub use selection::{PayloadItem, SelectionStore, StartPayload};
pub use status_feed::{Frame, LogBuffer, LogEntry, StatusEvent};

pub type ResourceId = i64;

/// A selectable resource as served by the backend catalog.
///
/// Wire names follow the backend (`name_fr`, `slug_fr`, `img_blob`); the neutral
/// names are accepted on input so fixtures can stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    #[serde(deserialize_with = "deserialize_resource_id")]
    pub id: ResourceId,
    #[serde(default, rename = "name_fr", alias = "name", deserialize_with = "null_as_default")]
    pub display_name: String,
    #[serde(default, rename = "slug_fr", alias = "slug", deserialize_with = "null_as_default")]
    pub slug: String,
    #[serde(default, deserialize_with = "deserialize_level")]
    pub level: i64,
    /// Base64 image data without a `data:` prefix.
    #[serde(default, rename = "img_blob", alias = "thumbnail", deserialize_with = "null_as_default")]
    pub thumbnail: String,
}

impl Resource {
    pub fn new(id: ResourceId, display_name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            slug: slug.into(),
            level: 0,
            thumbnail: String::new(),
        }
    }

    pub fn with_level(mut self, level: i64) -> Self {
        self.level = level;
        self
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} (lvl {})", self.id, self.display_name, self.level)
    }
}

/// Envelope used by every catalog listing endpoint (`{"items": [...]}`).
///
/// Entries are decoded one at a time: a record that cannot be read is reported in
/// `skipped` and the rest of the listing is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub skipped: Vec<String>,
}

impl ResourceList {
    /// A `null` body or a missing `items` key is an empty listing. Anything that is not
    /// an object carrying an item array is an error.
    pub fn from_value(body: serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;

        let entries = match body {
            Value::Null => return Ok(Self::default()),
            Value::Object(mut envelope) => match envelope.remove("items") {
                None | Some(Value::Null) => return Ok(Self::default()),
                Some(Value::Array(entries)) => entries,
                Some(other) => {
                    return Err(format!("items should be an array, got {}", json_kind(&other)))
                }
            },
            other => {
                return Err(format!(
                    "expected an object with items, got {}",
                    json_kind(&other)
                ))
            }
        };

        let mut list = Self::default();
        for entry in entries {
            match serde_json::from_value::<Resource>(entry) {
                Ok(resource) => list.items.push(resource),
                Err(err) => list.skipped.push(err.to_string()),
            }
        }
        Ok(list)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveSelectionAck {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub count: usize,
}

/// Parse a comma separated id list (`"7, 3,9"`), rejecting anything non-numeric.
pub fn parse_id_list(input: &str) -> Result<Vec<ResourceId>, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<ResourceId>()
                .map_err(|_| format!("invalid resource id: {part}"))
        })
        .collect()
}

/// Deserialize an id that can be either a number or a numeric string
fn deserialize_resource_id<'de, D>(deserializer: D) -> Result<ResourceId, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Number(n) => integral(&n)
            .ok_or_else(|| serde::de::Error::custom("resource id is not an integer")),
        serde_json::Value::String(s) => s.trim().parse::<ResourceId>().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Levels are informative only: `null` and unreadable strings fall back to 0, floats
/// are truncated.
fn deserialize_level<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match val {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn integral(n: &serde_json::Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}
