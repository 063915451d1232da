//! Job events — immutable, sequence-numbered entries in a job's event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::JobStatus;

/// Suffix appended to strings shortened by payload truncation.
const TRUNCATION_MARKER: &str = "…[truncated]";

/// Minimum per-string cap the truncation passes will shrink down to.
const MIN_STRING_CAP: usize = 16;

/// Minimum per-collection cap the truncation passes will shrink down to.
const MIN_ITEM_CAP: usize = 4;

/// Minimum nesting depth the truncation passes will shrink down to.
/// Subtrees past the cap are replaced with the marker string.
const MIN_DEPTH_CAP: usize = 2;

/// Describes data dropped from the log or from an event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    /// Events evicted from the local buffer since the last annotation.
    pub truncated_events: u64,
    /// Serialized bytes dropped (evicted events plus shortened payloads).
    pub truncated_bytes: u64,
    /// Why data was dropped (`buffer_limit`, `payload_too_large`, or both).
    pub reason: String,
}

/// A single event in a job's log.
///
/// Producers set `kind` and payload fields; the manager stamps `sequence`,
/// `job_id`, the `job_status` snapshot, and `timestamp` on append. Once
/// appended an event is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub job_id: String,
    #[serde(default = "default_status")]
    pub job_status: JobStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation: Option<Truncation>,
    /// Arbitrary producer-defined fields, flattened into the wire form.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

fn default_status() -> JobStatus {
    JobStatus::Queued
}

impl Event {
    /// Emitted as sequence 1 of every job.
    pub const JOB_CREATED: &'static str = "job_created";
    /// Conventionally emitted by a runner when work begins.
    pub const JOB_STARTED: &'static str = "job_started";
    /// Emitted exactly once by `cancel_job`.
    pub const JOB_CANCELED: &'static str = "job_canceled";
    /// End-of-stream marker for resumable streaming consumers.
    pub const STREAM_END: &'static str = "stream_end";

    /// Create an event of the given kind with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            sequence: 0,
            job_id: String::new(),
            job_status: JobStatus::Queued,
            timestamp: Utc::now(),
            truncation: None,
            payload: serde_json::Map::new(),
        }
    }

    /// Add a payload field (builder style).
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replace the payload wholesale. Non-object values are stored under a
    /// `"data"` key so the flattened wire form stays an object.
    pub fn with_payload(mut self, payload: Value) -> Self {
        match payload {
            Value::Object(map) => self.payload = map,
            other => {
                self.payload = serde_json::Map::new();
                self.payload.insert("data".to_string(), other);
            }
        }
        self
    }

    /// Serialized size of this event in bytes.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Deep-truncate the payload until the serialized event fits `max_bytes`.
    ///
    /// Strings are shortened, arrays/objects capped, and nesting past the
    /// depth cap replaced with the marker, in passes with progressively
    /// harsher limits, until the event fits or the floor caps are reached.
    /// Returns the number of bytes shaved (0 = untouched).
    pub fn truncate_payload(&mut self, max_bytes: usize) -> u64 {
        let original = self.serialized_len();
        if original <= max_bytes {
            return 0;
        }

        let mut string_cap = 1024usize;
        let mut item_cap = 64usize;
        let mut depth_cap = 64usize;
        loop {
            for value in self.payload.values_mut() {
                truncate_value(value, string_cap, item_cap, depth_cap);
            }
            if self.serialized_len() <= max_bytes
                || (string_cap <= MIN_STRING_CAP
                    && item_cap <= MIN_ITEM_CAP
                    && depth_cap <= MIN_DEPTH_CAP)
            {
                break;
            }
            string_cap = (string_cap / 2).max(MIN_STRING_CAP);
            item_cap = (item_cap / 2).max(MIN_ITEM_CAP);
            depth_cap = (depth_cap / 2).max(MIN_DEPTH_CAP);
        }

        (original.saturating_sub(self.serialized_len())) as u64
    }
}

/// Recursively shorten strings and cap collections inside a JSON value.
/// Containers nested past `depth_cap` collapse to the marker string, so
/// breadth caps alone cannot be dodged by a deep single-key chain.
fn truncate_value(value: &mut Value, string_cap: usize, item_cap: usize, depth_cap: usize) {
    if depth_cap == 0 && (value.is_array() || value.is_object()) {
        *value = Value::String(TRUNCATION_MARKER.to_string());
        return;
    }
    match value {
        Value::String(s) => {
            if s.chars().count() > string_cap {
                let mut shortened: String = s.chars().take(string_cap).collect();
                shortened.push_str(TRUNCATION_MARKER);
                *s = shortened;
            }
        }
        Value::Array(items) => {
            items.truncate(item_cap);
            for item in items.iter_mut() {
                truncate_value(item, string_cap, item_cap, depth_cap - 1);
            }
        }
        Value::Object(map) => {
            if map.len() > item_cap {
                let keep: Vec<String> = map.keys().take(item_cap).cloned().collect();
                map.retain(|k, _| keep.contains(k));
            }
            for item in map.values_mut() {
                truncate_value(item, string_cap, item_cap, depth_cap - 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_and_wire_form() {
        let event = Event::new(Event::JOB_STARTED).field("step", "plan");
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "job_started");
        assert_eq!(wire["step"], "plan");
        assert!(wire.get("truncation").is_none());
    }

    #[test]
    fn roundtrip_preserves_payload() {
        let event = Event::new("tool_output")
            .field("tool", "shell")
            .field("exit_code", 0);
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "tool_output");
        assert_eq!(parsed.payload["tool"], "shell");
        assert_eq!(parsed.payload["exit_code"], 0);
    }

    #[test]
    fn scalar_payload_wrapped_under_data() {
        let event = Event::new("note").with_payload(json!("just a string"));
        assert_eq!(event.payload["data"], "just a string");
    }

    #[test]
    fn small_payload_untouched() {
        let mut event = Event::new("tick").field("n", 1);
        assert_eq!(event.truncate_payload(32 * 1024), 0);
        assert_eq!(event.payload["n"], 1);
    }

    #[test]
    fn oversized_string_shortened_and_counted() {
        let mut event = Event::new("tool_output").field("stdout", "x".repeat(100_000));
        let shaved = event.truncate_payload(4096);
        assert!(shaved > 0);
        assert!(event.serialized_len() <= 4096);
        let stdout = event.payload["stdout"].as_str().unwrap();
        assert!(stdout.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn oversized_array_capped() {
        let big: Vec<Value> = (0..10_000).map(|i| json!({"i": i})).collect();
        let mut event = Event::new("batch").field("items", Value::Array(big));
        event.truncate_payload(4096);
        assert!(event.serialized_len() <= 4096);
        assert!(event.payload["items"].as_array().unwrap().len() <= 64);
    }

    #[test]
    fn deeply_nested_payload_bounded() {
        let mut nested = json!("leaf");
        for _ in 0..300 {
            nested = json!({ "inner": nested });
        }
        let mut event = Event::new("trace").field("frames", nested);

        // A single-key chain has nothing for the breadth caps to cut; the
        // depth cap must collapse it.
        let shaved = event.truncate_payload(512);
        assert!(shaved > 0);
        assert!(event.serialized_len() <= 512);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut event = Event::new("note").field("text", "é".repeat(50_000));
        event.truncate_payload(2048);
        // Would panic on a byte-split if we cut inside a code point.
        let _ = event.payload["text"].as_str().unwrap().to_string();
    }
}
