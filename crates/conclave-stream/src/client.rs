use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::event::{parse_frames, SseEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SseClientConfig {
    pub url: String,
    /// Event-name filters passed as the `events` query parameter.
    pub filters: Vec<String>,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub backoff_factor: f64,
    pub max_reconnect_delay: Duration,
    /// Zero means retry forever.
    pub max_reconnect_attempts: u32,
}

impl SseClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filters: Vec::new(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 0,
        }
    }
}

/// Reconnecting SSE consumer. Parsed events arrive on the handed-out
/// channel; connection state transitions are observable on the watch.
pub struct SseClient {
    config: SseClientConfig,
    state_tx: watch::Sender<ClientState>,
    events_tx: mpsc::UnboundedSender<SseEvent>,
    http: reqwest::Client,
}

impl SseClient {
    pub fn new(
        config: SseClientConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SseEvent>,
        watch::Receiver<ClientState>,
    ) {
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                state_tx,
                events_tx,
                http: reqwest::Client::new(),
            },
            events_rx,
            state_rx,
        )
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Drive the connection until cancelled, the event channel closes, or
    /// the retry budget is exhausted.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut last_event_id: Option<String> = None;
        // Consecutive attempts that never reached Connected; drives backoff
        // and the retry budget.
        let mut failed_attempts: u32 = 0;
        let mut first_connect = true;
        loop {
            if cancel.is_cancelled() {
                self.set_state(ClientState::Disconnected);
                return;
            }
            self.set_state(if first_connect {
                ClientState::Connecting
            } else {
                ClientState::Reconnecting
            });

            match self.consume_once(&mut last_event_id, &cancel).await {
                StreamEnd::Cancelled | StreamEnd::ReceiverGone => {
                    self.set_state(ClientState::Disconnected);
                    return;
                }
                StreamEnd::Disconnected { was_connected } => {
                    self.set_state(ClientState::Disconnected);
                    if was_connected {
                        failed_attempts = 0;
                        first_connect = false;
                    } else {
                        failed_attempts += 1;
                    }
                }
            }

            if !self.config.auto_reconnect {
                return;
            }
            if self.config.max_reconnect_attempts > 0
                && failed_attempts > self.config.max_reconnect_attempts
            {
                self.set_state(ClientState::Failed);
                return;
            }
            let exponent = failed_attempts.min(16);
            let delay = self
                .config
                .reconnect_delay
                .mul_f64(self.config.backoff_factor.powi(exponent as i32))
                .min(self.config.max_reconnect_delay);
            tracing::debug!(failed_attempts, ?delay, "SSE client backing off before reconnect");
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ClientState::Disconnected);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn consume_once(
        &self,
        last_event_id: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut request = self
            .http
            .get(&self.config.url)
            .header("Accept", "text/event-stream");
        if !self.config.filters.is_empty() {
            request = request.query(&[("events", self.config.filters.join(","))]);
        }
        if let Some(id) = last_event_id.as_deref() {
            request = request.header("Last-Event-ID", id);
        }

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "SSE connect rejected");
                return StreamEnd::Disconnected {
                    was_connected: false,
                };
            }
            Err(err) => {
                tracing::warn!(error = %err, "SSE connect failed");
                return StreamEnd::Disconnected {
                    was_connected: false,
                };
            }
        };

        self.set_state(ClientState::Connected);
        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return StreamEnd::Disconnected {
                    was_connected: true,
                };
            };
            let Ok(chunk) = chunk else {
                return StreamEnd::Disconnected {
                    was_connected: true,
                };
            };
            buffer.push_str(std::str::from_utf8(&chunk).unwrap_or_default());
            for event in parse_frames(&mut buffer) {
                if let Some(id) = &event.id {
                    *last_event_id = Some(id.clone());
                }
                if self.events_tx.send(event).is_err() {
                    return StreamEnd::ReceiverGone;
                }
            }
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

enum StreamEnd {
    Disconnected { was_connected: bool },
    Cancelled,
    ReceiverGone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{spawn_keep_alive, SseServer, SseServerConfig};
    use serde_json::json;
    use std::sync::Arc;

    async fn serve(server: Arc<SseServer>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/events")
    }

    fn collect_states(mut state_rx: watch::Receiver<ClientState>) -> Arc<std::sync::Mutex<Vec<ClientState>>> {
        let states = Arc::new(std::sync::Mutex::new(vec![*state_rx.borrow()]));
        let sink = states.clone();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                sink.lock().unwrap().push(*state_rx.borrow());
            }
        });
        states
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receives_filtered_events_over_http() {
        let server = Arc::new(SseServer::new(SseServerConfig::default()));
        let url = serve(server.clone()).await;

        let mut config = SseClientConfig::new(url);
        config.filters = vec!["task:*".to_string()];
        let (client, mut events_rx, _state_rx) = SseClient::new(config);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { client.run(run_cancel).await });

        // Wait for the subscription before broadcasting.
        for _ in 0..100 {
            if server.client_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.broadcast("task:created", json!({"n": 1})).await;
        server.broadcast("agent:spawned", json!({"n": 2})).await;
        server.broadcast("task:completed", json!({"n": 3})).await;

        let hello = events_rx.recv().await.unwrap();
        assert_eq!(hello.event.as_deref(), Some("server:connected"));
        let first = events_rx.recv().await.unwrap();
        assert_eq!(first.event.as_deref(), Some("task:created"));
        let second = events_rx.recv().await.unwrap();
        assert_eq!(second.event.as_deref(), Some("task:completed"));
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnects_with_last_event_id_and_replays_the_gap() {
        let server = Arc::new(SseServer::new(SseServerConfig::default()));
        let url = serve(server.clone()).await;

        let mut config = SseClientConfig::new(url);
        config.filters = vec!["task:*".to_string()];
        config.reconnect_delay = Duration::from_millis(50);
        let (client, mut events_rx, state_rx) = SseClient::new(config);
        let states = collect_states(state_rx);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { client.run(run_cancel).await });

        for _ in 0..100 {
            if server.client_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.broadcast("task:created", json!({"n": 1})).await;
        server.broadcast("task:progress", json!({"n": 2})).await;

        let hello = events_rx.recv().await.unwrap();
        assert_eq!(hello.event.as_deref(), Some("server:connected"));
        let first = events_rx.recv().await.unwrap();
        assert_eq!(first.event.as_deref(), Some("task:created"));
        let second = events_rx.recv().await.unwrap();
        assert_eq!(second.event.as_deref(), Some("task:progress"));
        let resume_from = second.id.clone().unwrap();

        // Server-side drop after event 2.
        let victim = server.client_infos().await[0].id.clone();
        server.disconnect(&victim).await;

        // Emitted while the client is away; replayed from retention.
        server.broadcast("task:completed", json!({"n": 3})).await;

        let mut replayed = events_rx.recv().await.unwrap();
        // A fresh connection greets first; skip it.
        if replayed.event.as_deref() == Some("server:connected") {
            replayed = events_rx.recv().await.unwrap();
        }
        assert_eq!(replayed.event.as_deref(), Some("task:completed"));
        assert!(replayed.id.clone().unwrap().parse::<u64>().unwrap()
            > resume_from.parse::<u64>().unwrap());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = states.lock().unwrap().clone();
        let expect = [
            ClientState::Disconnected,
            ClientState::Connecting,
            ClientState::Connected,
            ClientState::Disconnected,
            ClientState::Reconnecting,
            ClientState::Connected,
        ];
        let mut cursor = 0;
        for state in seen {
            if cursor < expect.len() && state == expect[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(cursor, expect.len(), "missing transitions");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keep_alive_comments_do_not_surface_as_events() {
        let server = Arc::new(SseServer::new(SseServerConfig {
            keep_alive_interval: Duration::from_millis(30),
            ..Default::default()
        }));
        let url = serve(server.clone()).await;
        let keep_alive_cancel = CancellationToken::new();
        spawn_keep_alive(server.clone(), keep_alive_cancel.clone());

        let (client, mut events_rx, _state_rx) = SseClient::new(SseClientConfig::new(url));
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { client.run(run_cancel).await });

        for _ in 0..100 {
            if server.client_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let a few keep-alive ticks pass, then send a real event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.broadcast("agent:health", json!({"healthy": true})).await;

        let hello = events_rx.recv().await.unwrap();
        assert_eq!(hello.event.as_deref(), Some("server:connected"));
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.event.as_deref(), Some("agent:health"));
        cancel.cancel();
        keep_alive_cancel.cancel();
    }
}
