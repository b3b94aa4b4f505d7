use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type AgentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Broadcast,
    Heartbeat,
    Control,
}

/// Ordered lowest to highest so `Ord` matches dequeue precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub const ALL_DESCENDING: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    pub fn index(self) -> usize {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "agents", rename_all = "snake_case")]
pub enum Recipient {
    Agent(AgentId),
    Agents(Vec<AgentId>),
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: AgentId,
    pub to: Recipient,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Zero means the message never expires.
    #[serde(default)]
    pub ttl_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(
        from: impl Into<AgentId>,
        to: Recipient,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to,
            message_type,
            priority: MessagePriority::Normal,
            payload,
            timestamp: Utc::now(),
            ttl_ms: 0,
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Build the response to a request, correlated by the request id.
    pub fn response_to(request: &Message, from: impl Into<AgentId>, payload: Value) -> Self {
        let mut response = Message::new(
            from,
            Recipient::Agent(request.from.clone()),
            MessageType::Response,
            payload,
        );
        response.priority = request.priority;
        response.reply_to = Some(request.id.clone());
        response.correlation_id = Some(request.id.clone());
        response
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        let age_ms = now.signed_duration_since(self.timestamp).num_milliseconds();
        age_ms > self.ttl_ms as i64
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
