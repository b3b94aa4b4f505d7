use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use conclave_types::WireError;

use crate::server::SseServer;

/// Task lifecycle events. Progress updates are throttled per task.
pub struct TaskStream {
    server: Arc<SseServer>,
    progress_interval: Duration,
    last_progress: Mutex<HashMap<String, Instant>>,
}

impl TaskStream {
    pub fn new(server: Arc<SseServer>) -> Self {
        Self::with_progress_interval(server, Duration::from_secs(1))
    }

    pub fn with_progress_interval(server: Arc<SseServer>, progress_interval: Duration) -> Self {
        Self {
            server,
            progress_interval,
            last_progress: Mutex::new(HashMap::new()),
        }
    }

    async fn emit(&self, suffix: &str, task_id: &str, mut payload: Value) {
        payload["taskID"] = json!(task_id);
        self.server
            .broadcast(&format!("task:{suffix}"), payload)
            .await;
    }

    pub async fn created(&self, task_id: &str, payload: Value) {
        self.emit("created", task_id, payload).await;
    }

    pub async fn queued(&self, task_id: &str) {
        self.emit("queued", task_id, json!({})).await;
    }

    pub async fn assigned(&self, task_id: &str, agent_id: &str) {
        self.emit("assigned", task_id, json!({"agentID": agent_id}))
            .await;
    }

    pub async fn started(&self, task_id: &str) {
        self.emit("started", task_id, json!({})).await;
    }

    /// Dropped when a progress update for the task arrived within the
    /// throttle interval. Returns whether the update was emitted.
    pub async fn progress(&self, task_id: &str, percent: f64, detail: Option<&str>) -> bool {
        {
            let mut last = self.last_progress.lock().await;
            let now = Instant::now();
            if let Some(previous) = last.get(task_id) {
                if now.duration_since(*previous) < self.progress_interval {
                    return false;
                }
            }
            last.insert(task_id.to_string(), now);
        }
        self.emit(
            "progress",
            task_id,
            json!({"percent": percent, "detail": detail}),
        )
        .await;
        true
    }

    pub async fn intermediate(&self, task_id: &str, payload: Value) {
        self.emit("intermediate", task_id, payload).await;
    }

    pub async fn completed(&self, task_id: &str, payload: Value) {
        self.last_progress.lock().await.remove(task_id);
        self.emit("completed", task_id, payload).await;
    }

    pub async fn failed(&self, task_id: &str, error: &WireError) {
        self.last_progress.lock().await.remove(task_id);
        self.emit(
            "failed",
            task_id,
            json!({"error": serde_json::to_value(error).unwrap_or(Value::Null)}),
        )
        .await;
    }

    pub async fn cancelled(&self, task_id: &str) {
        self.last_progress.lock().await.remove(task_id);
        self.emit("cancelled", task_id, json!({})).await;
    }

    pub async fn metrics(&self, task_id: &str, payload: Value) {
        self.emit("metrics", task_id, payload).await;
    }
}

/// Agent lifecycle and console events. Output lines are ring-buffered per
/// agent for late observers.
pub struct AgentStream {
    server: Arc<SseServer>,
    output_lines: usize,
    output: Mutex<HashMap<String, VecDeque<String>>>,
}

impl AgentStream {
    pub fn new(server: Arc<SseServer>) -> Self {
        Self::with_output_lines(server, 100)
    }

    pub fn with_output_lines(server: Arc<SseServer>, output_lines: usize) -> Self {
        Self {
            server,
            output_lines,
            output: Mutex::new(HashMap::new()),
        }
    }

    async fn emit(&self, suffix: &str, agent_id: &str, mut payload: Value) {
        payload["agentID"] = json!(agent_id);
        self.server
            .broadcast(&format!("agent:{suffix}"), payload)
            .await;
    }

    pub async fn spawned(&self, agent_id: &str, payload: Value) {
        self.emit("spawned", agent_id, payload).await;
    }

    pub async fn started(&self, agent_id: &str) {
        self.emit("started", agent_id, json!({})).await;
    }

    pub async fn stopped(&self, agent_id: &str, reason: Option<&str>) {
        self.output.lock().await.remove(agent_id);
        self.emit("stopped", agent_id, json!({"reason": reason})).await;
    }

    pub async fn paused(&self, agent_id: &str) {
        self.emit("paused", agent_id, json!({})).await;
    }

    pub async fn error(&self, agent_id: &str, error: &WireError) {
        self.emit(
            "error",
            agent_id,
            json!({"error": serde_json::to_value(error).unwrap_or(Value::Null)}),
        )
        .await;
    }

    /// `stream` is `stdout` or `stderr`.
    pub async fn output(&self, agent_id: &str, stream: &str, line: &str) {
        {
            let mut output = self.output.lock().await;
            let buffer = output.entry(agent_id.to_string()).or_default();
            buffer.push_back(line.to_string());
            while buffer.len() > self.output_lines {
                buffer.pop_front();
            }
        }
        self.emit(
            &format!("output:{stream}"),
            agent_id,
            json!({"line": line}),
        )
        .await;
    }

    pub async fn log(&self, agent_id: &str, level: &str, message: &str) {
        self.emit(
            &format!("log:{level}"),
            agent_id,
            json!({"message": message}),
        )
        .await;
    }

    pub async fn metrics(&self, agent_id: &str, payload: Value) {
        self.emit("metrics", agent_id, payload).await;
    }

    pub async fn health(&self, agent_id: &str, healthy: bool) {
        self.emit("health", agent_id, json!({"healthy": healthy})).await;
    }

    pub async fn recent_output(&self, agent_id: &str) -> Vec<String> {
        self.output
            .lock()
            .await
            .get(agent_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// LLM request events. Tokens are buffered per request so the full response
/// can be reassembled.
pub struct LlmStream {
    server: Arc<SseServer>,
    token_buffer: usize,
    tokens: Mutex<HashMap<String, VecDeque<String>>>,
}

impl LlmStream {
    pub fn new(server: Arc<SseServer>) -> Self {
        Self::with_token_buffer(server, 1000)
    }

    pub fn with_token_buffer(server: Arc<SseServer>, token_buffer: usize) -> Self {
        Self {
            server,
            token_buffer,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    async fn emit(&self, suffix: &str, request_id: &str, mut payload: Value) {
        payload["requestID"] = json!(request_id);
        self.server
            .broadcast(&format!("llm:{suffix}"), payload)
            .await;
    }

    pub async fn request_started(&self, request_id: &str, provider: &str, model: &str) {
        self.tokens
            .lock()
            .await
            .insert(request_id.to_string(), VecDeque::new());
        self.emit(
            "request:started",
            request_id,
            json!({"provider": provider, "model": model}),
        )
        .await;
    }

    pub async fn token(&self, request_id: &str, token: &str) {
        {
            let mut tokens = self.tokens.lock().await;
            let buffer = tokens.entry(request_id.to_string()).or_default();
            buffer.push_back(token.to_string());
            while buffer.len() > self.token_buffer {
                buffer.pop_front();
            }
        }
        self.emit("token", request_id, json!({"token": token})).await;
    }

    pub async fn tool_call(&self, request_id: &str, name: &str, arguments: Value) {
        self.emit(
            "tool:call",
            request_id,
            json!({"name": name, "arguments": arguments}),
        )
        .await;
    }

    pub async fn tool_result(&self, request_id: &str, name: &str, result: Value) {
        self.emit(
            "tool:result",
            request_id,
            json!({"name": name, "result": result}),
        )
        .await;
    }

    pub async fn usage(&self, request_id: &str, usage: Value) {
        self.emit("usage", request_id, json!({"usage": usage})).await;
    }

    pub async fn request_completed(&self, request_id: &str, payload: Value) {
        self.emit("request:completed", request_id, payload).await;
    }

    pub async fn request_error(&self, request_id: &str, error: &WireError) {
        self.tokens.lock().await.remove(request_id);
        self.emit(
            "request:error",
            request_id,
            json!({"error": serde_json::to_value(error).unwrap_or(Value::Null)}),
        )
        .await;
    }

    /// Concatenation of the buffered tokens for the request.
    pub async fn full_response(&self, request_id: &str) -> Option<String> {
        self.tokens
            .lock()
            .await
            .get(request_id)
            .map(|buffer| buffer.iter().map(String::as_str).collect())
    }

    pub async fn forget(&self, request_id: &str) {
        self.tokens.lock().await.remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{SseFrame, SseServerConfig};

    fn server() -> Arc<SseServer> {
        Arc::new(SseServer::new(SseServerConfig::default()))
    }

    async fn recv_event(rx: &mut tokio::sync::mpsc::Receiver<SseFrame>) -> (String, Value) {
        match rx.recv().await.unwrap() {
            SseFrame::Event { event, data, .. } => {
                (event, serde_json::from_str(&data).unwrap_or(Value::Null))
            }
            SseFrame::Comment(_) => panic!("unexpected comment"),
        }
    }

    #[tokio::test]
    async fn progress_updates_are_throttled_per_task() {
        let server = server();
        let (_, mut rx) = server.connect(None, None).await.unwrap();
        let tasks = TaskStream::with_progress_interval(server, Duration::from_secs(60));

        assert!(tasks.progress("t1", 10.0, None).await);
        assert!(!tasks.progress("t1", 20.0, None).await);
        // A different task has its own throttle window.
        assert!(tasks.progress("t2", 5.0, None).await);

        let (event, data) = recv_event(&mut rx).await;
        assert_eq!(event, "task:progress");
        assert_eq!(data["taskID"], "t1");
        let (event, data) = recv_event(&mut rx).await;
        assert_eq!(event, "task:progress");
        assert_eq!(data["taskID"], "t2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn agent_output_is_ring_buffered() {
        let server = server();
        let agents = AgentStream::with_output_lines(server, 3);
        for n in 0..5 {
            agents.output("a1", "stdout", &format!("line {n}")).await;
        }
        let recent = agents.recent_output("a1").await;
        assert_eq!(recent, vec!["line 2", "line 3", "line 4"]);
        assert!(agents.recent_output("a2").await.is_empty());
    }

    #[tokio::test]
    async fn llm_tokens_reassemble_into_the_full_response() {
        let server = server();
        let (_, mut rx) = server.connect(Some(
            ["llm:*"].iter().map(ToString::to_string).collect(),
        ), None)
        .await
        .unwrap();
        let llm = LlmStream::new(server);

        llm.request_started("r1", "echo", "echo-1").await;
        for token in ["Hel", "lo ", "world"] {
            llm.token("r1", token).await;
        }
        llm.request_completed("r1", json!({"finishReason": "stop"})).await;

        assert_eq!(llm.full_response("r1").await.as_deref(), Some("Hello world"));

        let (event, data) = recv_event(&mut rx).await;
        assert_eq!(event, "llm:request:started");
        assert_eq!(data["provider"], "echo");
        let (event, _) = recv_event(&mut rx).await;
        assert_eq!(event, "llm:token");
    }

    #[tokio::test]
    async fn task_failure_carries_the_wire_error() {
        let server = server();
        let (_, mut rx) = server.connect(None, None).await.unwrap();
        let tasks = TaskStream::new(server);
        let error = conclave_types::Error::Timeout("task stalled".to_string()).to_wire();
        tasks.failed("t1", &error).await;

        let (event, data) = recv_event(&mut rx).await;
        assert_eq!(event, "task:failed");
        assert_eq!(data["error"]["kind"], "timeout");
        assert_eq!(data["error"]["retryable"], true);
    }
}
