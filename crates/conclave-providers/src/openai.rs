use std::str;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conclave_types::{
    CompletionRequest, CompletionResponse, Cost, Error, HealthResult, ProviderCapabilities, Result,
    StreamEvent, Usage,
};

use crate::provider::{estimate_from_pricing, EventStream, Provider};

/// Minimal adapter for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    capabilities: ProviderCapabilities,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        capabilities: ProviderCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            capabilities,
            client: Client::new(),
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            body["stop"] = json!(stop);
        }
        if let Some(tools) = &request.tools {
            let wire_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect();
            if !wire_tools.is_empty() {
                body["tools"] = json!(wire_tools);
                body["tool_choice"] = json!("auto");
            }
        }
        body
    }

    fn provider_error(&self, message: impl Into<String>, retryable: bool) -> Error {
        Error::Provider {
            provider: self.name.clone(),
            message: message.into(),
            retryable,
            retried: false,
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started = std::time::Instant::now();
        let url = format!("{}/chat/completions", self.base_url);
        let mut http = self.client.post(url).json(&self.request_body(request, false));
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }
        let response = http
            .send()
            .await
            .map_err(|e| self.provider_error(format!("request failed: {e}"), true))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.provider_error(format!("invalid response body: {e}"), true))?;

        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("request failed with status {status}"));
            // Client errors are not worth a failover; server errors are.
            return Err(self.provider_error(detail, status.is_server_error()));
        }
        if let Some(detail) = extract_error(&value) {
            return Err(self.provider_error(detail, false));
        }

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let finish_reason = value["choices"][0]["finish_reason"]
            .as_str()
            .unwrap_or("stop")
            .to_string();
        let usage = extract_usage(&value);
        let estimate = estimate_from_pricing(&self.capabilities, request);

        Ok(CompletionResponse {
            id: value["id"]
                .as_str()
                .map(ToString::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            model: request.model.clone(),
            provider: self.name.clone(),
            content,
            tool_calls: None,
            usage,
            cost: Cost {
                prompt_cost: estimate.prompt_cost,
                completion_cost: estimate.completion_cost,
                total_cost: estimate.total,
                currency: estimate.currency,
            },
            finish_reason,
            latency_ms: Some(started.elapsed().as_millis() as u64),
        })
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut http = self.client.post(url).json(&self.request_body(request, true));
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }
        let response = http
            .send()
            .await
            .map_err(|e| self.provider_error(format!("stream request failed: {e}"), true))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.provider_error(
                format!("stream request failed with status {status}: {text}"),
                status.is_server_error(),
            ));
        }

        let mut bytes = response.bytes_stream();
        let provider = self.name.clone();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamEvent::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                        cost: None,
                    };
                    break;
                }
                let chunk = chunk.map_err(|e| Error::Provider {
                    provider: provider.clone(),
                    message: format!("stream read failed: {e}"),
                    retryable: true,
                    retried: false,
                })?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            yield StreamEvent::Done {
                                finish_reason: "stop".to_string(),
                                usage: None,
                                cost: None,
                            };
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        for choice in value["choices"].as_array().cloned().unwrap_or_default() {
                            if let Some(text) = choice["delta"]["content"].as_str() {
                                if !text.is_empty() {
                                    yield StreamEvent::Content {
                                        delta: text.to_string(),
                                    };
                                }
                            }
                            if let Some(reason) = choice["finish_reason"].as_str() {
                                if !reason.is_empty() {
                                    yield StreamEvent::Done {
                                        finish_reason: reason.to_string(),
                                        usage: value.get("usage").map(|_| extract_usage(&value)),
                                        cost: None,
                                    };
                                }
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> HealthResult {
        let started = std::time::Instant::now();
        let url = format!("{}/models", self.base_url);
        let mut http = self.client.get(url);
        if let Some(api_key) = &self.api_key {
            http = http.bearer_auth(api_key);
        }
        match http.send().await {
            Ok(response) if response.status().is_success() => HealthResult {
                healthy: true,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Ok(response) => HealthResult {
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                error: Some(format!("status {}", response.status())),
            },
            Err(e) => HealthResult {
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}

fn extract_usage(value: &serde_json::Value) -> Usage {
    let usage = &value["usage"];
    let prompt_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
    let total_tokens = usage["total_tokens"]
        .as_u64()
        .unwrap_or(prompt_tokens + completion_tokens);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value["error"]["message"]
        .as_str()
        .map(ToString::to_string)
        .or_else(|| value["message"].as_str().map(ToString::to_string))
}
