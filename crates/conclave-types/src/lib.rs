mod error;
mod event;
mod message;
mod provider;

pub use error::{Error, ErrorKind, Result, WireError};
pub use event::RuntimeEvent;
pub use message::{AgentId, Message, MessagePriority, MessageType, Recipient};
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, Cost, CostConstraints, CostEstimate,
    HealthResult, ModelPricing, ProviderCapabilities, ProviderStatus, StreamEvent, ToolCall,
    ToolSpec, Usage,
};

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
