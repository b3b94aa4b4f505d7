use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event published on the process-wide bus and mirrored to SSE observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
    pub timestamp_ms: u64,
}

impl RuntimeEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            timestamp_ms: crate::now_ms(),
        }
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}
