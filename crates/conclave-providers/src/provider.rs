use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use conclave_types::{
    CompletionRequest, CompletionResponse, CostEstimate, HealthResult, ProviderCapabilities,
    Result, StreamEvent,
};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// The adapter contract over one LLM endpoint. Implementations stay thin;
/// routing, failover, caching, and accounting live in the manager.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Lazy, finite, not restartable. The default shape degrades a plain
    /// completion into a single content delta followed by `done`.
    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream> {
        let response = self.complete(request).await?;
        let events = vec![
            Ok(StreamEvent::Content {
                delta: response.content.clone(),
            }),
            Ok(StreamEvent::Usage {
                usage: response.usage,
            }),
            Ok(StreamEvent::Done {
                finish_reason: response.finish_reason.clone(),
                usage: Some(response.usage),
                cost: Some(response.cost.clone()),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn estimate_cost(&self, request: &CompletionRequest) -> CostEstimate {
        estimate_from_pricing(&self.capabilities(), request)
    }

    async fn health_check(&self) -> HealthResult;

    fn list_models(&self) -> Vec<String> {
        self.capabilities().supported_models
    }

    fn validate_model(&self, model: &str) -> bool {
        self.capabilities()
            .supported_models
            .iter()
            .any(|m| m == model)
    }

    async fn destroy(&self) {}
}

/// Rough token estimate: four characters per token on the prompt side, the
/// requested budget (or 512) on the completion side.
pub fn estimate_from_pricing(
    capabilities: &ProviderCapabilities,
    request: &CompletionRequest,
) -> CostEstimate {
    let pricing = capabilities
        .pricing
        .get(&request.model)
        .copied()
        .unwrap_or_default();
    let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let prompt_tokens = (prompt_chars as f64 / 4.0).ceil();
    let completion_tokens = f64::from(request.max_tokens.unwrap_or(512));
    let prompt_cost = prompt_tokens / 1_000.0 * pricing.prompt_per_1k;
    let completion_cost = completion_tokens / 1_000.0 * pricing.completion_per_1k;
    CostEstimate {
        prompt_cost,
        completion_cost,
        total: prompt_cost + completion_cost,
        currency: "USD".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::{ChatMessage, ModelPricing};

    #[test]
    fn estimate_scales_with_pricing_and_budget() {
        let mut capabilities = ProviderCapabilities {
            supported_models: vec!["m1".to_string()],
            supports_streaming: true,
            supports_tools: false,
            ..Default::default()
        };
        capabilities.pricing.insert(
            "m1".to_string(),
            ModelPricing {
                prompt_per_1k: 1.0,
                completion_per_1k: 2.0,
            },
        );

        let mut request = CompletionRequest::new(
            "m1",
            vec![ChatMessage::new("user", "x".repeat(4_000))],
        );
        request.max_tokens = Some(1_000);
        let estimate = estimate_from_pricing(&capabilities, &request);
        assert!((estimate.prompt_cost - 1.0).abs() < 1e-9);
        assert!((estimate.completion_cost - 2.0).abs() < 1e-9);
        assert!((estimate.total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_estimates_zero() {
        let request = CompletionRequest::new("mystery", vec![ChatMessage::new("user", "hi")]);
        let estimate = estimate_from_pricing(&ProviderCapabilities::default(), &request);
        assert_eq!(estimate.total, 0.0);
    }
}
