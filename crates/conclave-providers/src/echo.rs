use async_trait::async_trait;
use uuid::Uuid;

use conclave_types::{
    CompletionRequest, CompletionResponse, Cost, HealthResult, ProviderCapabilities, Result, Usage,
};

use crate::provider::Provider;

/// In-process adapter that echoes the last user message. Lets the engine
/// boot and route without network credentials.
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self {
            name: "echo".to_string(),
        }
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let mut capabilities = ProviderCapabilities {
            supported_models: vec!["echo-1".to_string()],
            supports_streaming: true,
            supports_tools: false,
            ..Default::default()
        };
        capabilities.max_context_length.insert("echo-1".to_string(), 8_192);
        capabilities
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let content = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| format!("Echo: {}", m.content))
            .unwrap_or_else(|| "Echo:".to_string());
        let prompt_tokens: u64 = request
            .messages
            .iter()
            .map(|m| (m.content.len() as u64).div_ceil(4))
            .sum();
        let completion_tokens = (content.len() as u64).div_ceil(4);
        Ok(CompletionResponse {
            id: Uuid::new_v4().to_string(),
            model: request.model.clone(),
            provider: self.name.clone(),
            content,
            tool_calls: None,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            cost: Cost {
                currency: "USD".to_string(),
                ..Default::default()
            },
            finish_reason: "stop".to_string(),
            latency_ms: Some(0),
        })
    }

    async fn health_check(&self) -> HealthResult {
        HealthResult {
            healthy: true,
            latency_ms: 0,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::ChatMessage;

    #[tokio::test]
    async fn echoes_the_last_user_message() {
        let provider = EchoProvider::new();
        let request = CompletionRequest::new(
            "echo-1",
            vec![
                ChatMessage::new("user", "first"),
                ChatMessage::new("assistant", "ack"),
                ChatMessage::new("user", "second"),
            ],
        );
        let response = provider.complete(&request).await.unwrap();
        assert_eq!(response.content, "Echo: second");
        assert_eq!(response.provider, "echo");
        assert!(response.usage.total_tokens > 0);
    }
}
