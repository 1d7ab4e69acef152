use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;

pub const LOG_CAPACITY: usize = 100;
pub const AGENT_STATUS_TYPE: &str = "agent_status";

/// An inbound live-channel frame. Frames that fail to parse are kept verbatim so the
/// channel never drops data because of its shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T = Value> {
    Parsed(T),
    Raw(String),
}

impl<T: DeserializeOwned> Frame<T> {
    pub fn decode(text: &str) -> Self {
        match serde_json::from_str::<T>(text) {
            Ok(parsed) => Frame::Parsed(parsed),
            Err(_) => Frame::Raw(text.to_string()),
        }
    }
}

impl<T> Frame<T> {
    pub fn parsed(&self) -> Option<&T> {
        match self {
            Frame::Parsed(value) => Some(value),
            Frame::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Frame::Raw(_))
    }
}

impl Frame<Value> {
    /// Serialized form archived in the log buffer. Raw payloads are encoded as JSON
    /// strings so every log line is itself valid JSON.
    pub fn log_line(&self) -> String {
        match self {
            Frame::Parsed(value) => value.to_string(),
            Frame::Raw(raw) => Value::String(raw.clone()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    AgentStatus { connected: bool },
    /// Any other tag (or an untagged/raw frame). Archived, never interpreted.
    Opaque { kind: Option<String> },
}

impl StatusEvent {
    pub fn classify(frame: &Frame<Value>) -> Self {
        let Some(value) = frame.parsed() else {
            return StatusEvent::Opaque { kind: None };
        };
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some(AGENT_STATUS_TYPE) => StatusEvent::AgentStatus {
                connected: value.get("connected").map(truthy).unwrap_or(false),
            },
            other => StatusEvent::Opaque {
                kind: other.map(ToString::to_string),
            },
        }
    }

    pub fn agent_connected(&self) -> Option<bool> {
        match self {
            StatusEvent::AgentStatus { connected } => Some(*connected),
            StatusEvent::Opaque { .. } => None,
        }
    }
}

// Loose reading: non-zero numbers and non-empty strings count as connected.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub received_at: DateTime<Utc>,
    pub line: String,
}

/// Bounded, most-recent-first archive of received frames. Once full, the oldest entry
/// is evicted silently.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, frame: &Frame<Value>, received_at: DateTime<Utc>) {
        self.push(LogEntry {
            received_at,
            line: frame.log_line(),
        });
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Entries from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn malformed_frames_pass_through_raw() {
        let frame = Frame::<Value>::decode("agent rebooting");
        assert_eq!(frame, Frame::Raw("agent rebooting".to_string()));
        assert_eq!(frame.log_line(), "\"agent rebooting\"");
        assert_eq!(StatusEvent::classify(&frame), StatusEvent::Opaque { kind: None });
    }

    #[test]
    fn agent_status_is_the_only_interpreted_tag() {
        let online = Frame::decode(r#"{"type":"agent_status","connected":true}"#);
        assert_eq!(
            StatusEvent::classify(&online).agent_connected(),
            Some(true)
        );

        let missing = Frame::decode(r#"{"type":"agent_status"}"#);
        assert_eq!(
            StatusEvent::classify(&missing).agent_connected(),
            Some(false)
        );

        let numeric = Frame::decode(r#"{"type":"agent_status","connected":1}"#);
        assert_eq!(
            StatusEvent::classify(&numeric).agent_connected(),
            Some(true)
        );

        let other = Frame::decode(r#"{"type":"progress","connected":true}"#);
        assert_eq!(
            StatusEvent::classify(&other),
            StatusEvent::Opaque {
                kind: Some("progress".to_string())
            }
        );
    }

    #[test]
    fn log_buffer_keeps_newest_first_and_caps_at_capacity() {
        let mut log = LogBuffer::default();
        for idx in 0..250 {
            let frame = Frame::Parsed(serde_json::json!({"type": "tick", "n": idx}));
            log.record(&frame, at(idx));
            assert!(log.len() <= LOG_CAPACITY);
        }

        assert_eq!(log.len(), LOG_CAPACITY);
        let ns: Vec<i64> = log
            .iter()
            .map(|entry| {
                serde_json::from_str::<Value>(&entry.line).expect("json line")["n"]
                    .as_i64()
                    .expect("n")
            })
            .collect();
        let expected: Vec<i64> = (150..250).rev().collect();
        assert_eq!(ns, expected);
        assert_eq!(log.latest().map(|entry| entry.received_at), Some(at(249)));
    }

    #[test]
    fn zero_capacity_log_stays_empty() {
        let mut log = LogBuffer::new(0);
        log.record(&Frame::Raw("x".to_string()), at(0));
        assert!(log.is_empty());
    }
}
