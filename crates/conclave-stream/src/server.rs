use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use conclave_bus::EventBus;
use conclave_types::{Error, Result};

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub max_clients: usize,
    pub keep_alive_interval: Duration,
    /// Broadcast frames retained for `Last-Event-ID` replay.
    pub retention: usize,
    /// Origins echoed back by CORS; empty means any.
    pub cors_origins: Vec<String>,
    /// Advisory retry interval pushed to clients on connect.
    pub retry_ms: u64,
    /// Queued frames per client before it is considered too slow.
    pub client_buffer: usize,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 1000,
            keep_alive_interval: Duration::from_secs(15),
            retention: 1024,
            cors_origins: Vec::new(),
            retry_ms: 3_000,
            client_buffer: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SseFrame {
    Event {
        seq: u64,
        event: String,
        data: String,
    },
    Comment(String),
}

/// Per-client session metadata, also exposed to broadcast filter callbacks.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub filters: Option<HashSet<String>>,
}

struct ClientHandle {
    info: ClientInfo,
    sender: mpsc::Sender<SseFrame>,
}

#[derive(Debug, Clone)]
struct StoredFrame {
    seq: u64,
    event: String,
    data: String,
}

/// Fan-out hub for server-sent events: bounded client registry, per-client
/// filters, retention ring for reconnect replay.
pub struct SseServer {
    config: SseServerConfig,
    clients: RwLock<HashMap<String, ClientHandle>>,
    retained: Mutex<VecDeque<StoredFrame>>,
    next_seq: AtomicU64,
}

impl SseServer {
    pub fn new(config: SseServerConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
            retained: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Register a client and hand back its frame receiver. Retained frames
    /// newer than `last_event_id` are queued first so reconnecting clients
    /// resume where they left off.
    pub async fn connect(
        &self,
        filters: Option<HashSet<String>>,
        last_event_id: Option<u64>,
    ) -> Result<(String, mpsc::Receiver<SseFrame>)> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_clients {
            return Err(Error::CapacityExceeded(format!(
                "SSE client limit of {} reached",
                self.config.max_clients
            )));
        }
        let (tx, rx) = mpsc::channel(self.config.client_buffer);
        let id = Uuid::new_v4().to_string();
        let info = ClientInfo {
            id: id.clone(),
            connected_at: Utc::now(),
            last_activity: Utc::now(),
            filters,
        };

        if let Some(resume_from) = last_event_id {
            let retained = self.retained.lock().await;
            for frame in retained.iter().filter(|f| f.seq > resume_from) {
                if !matches_filters(&info.filters, &frame.event) {
                    continue;
                }
                let _ = tx
                    .send(SseFrame::Event {
                        seq: frame.seq,
                        event: frame.event.clone(),
                        data: frame.data.clone(),
                    })
                    .await;
            }
        }

        clients.insert(id.clone(), ClientHandle { info, sender: tx });
        tracing::debug!(client = %id, total = clients.len(), "SSE client connected");
        Ok((id, rx))
    }

    pub async fn disconnect(&self, client_id: &str) -> bool {
        self.clients.write().await.remove(client_id).is_some()
    }

    pub async fn client_infos(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .await
            .values()
            .map(|client| client.info.clone())
            .collect()
    }

    /// Broadcast to every matching client. Slow or closed clients are
    /// dropped. Returns the assigned event sequence id.
    pub async fn broadcast(&self, event: &str, data: Value) -> u64 {
        self.broadcast_with(event, data, None::<fn(&ClientInfo) -> bool>)
            .await
    }

    pub async fn broadcast_with<F>(&self, event: &str, data: Value, filter: Option<F>) -> u64
    where
        F: Fn(&ClientInfo) -> bool,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let data = match data {
            Value::String(s) => s,
            other => other.to_string(),
        };

        {
            let mut retained = self.retained.lock().await;
            retained.push_back(StoredFrame {
                seq,
                event: event.to_string(),
                data: data.clone(),
            });
            while retained.len() > self.config.retention {
                retained.pop_front();
            }
        }

        let mut dropped = Vec::new();
        {
            let mut clients = self.clients.write().await;
            for (id, client) in clients.iter_mut() {
                if !matches_filters(&client.info.filters, event) {
                    continue;
                }
                if let Some(filter) = &filter {
                    if !filter(&client.info) {
                        continue;
                    }
                }
                let frame = SseFrame::Event {
                    seq,
                    event: event.to_string(),
                    data: data.clone(),
                };
                match client.sender.try_send(frame) {
                    Ok(()) => client.info.last_activity = Utc::now(),
                    Err(_) => dropped.push(id.clone()),
                }
            }
            for id in &dropped {
                clients.remove(id);
                tracing::warn!(client = %id, "dropping slow or closed SSE client");
            }
        }
        seq
    }

    async fn send_keep_alives(&self) {
        let comment = format!("keep-alive {}", Utc::now().timestamp_millis());
        let mut dropped = Vec::new();
        let mut clients = self.clients.write().await;
        for (id, client) in clients.iter() {
            if client.sender.try_send(SseFrame::Comment(comment.clone())).is_err() {
                dropped.push(id.clone());
            }
        }
        for id in &dropped {
            clients.remove(id);
        }
    }

    /// Axum router exposing `GET /events`. Non-GET methods fall out with 405
    /// from the method router.
    pub fn router(self: &Arc<Self>) -> Router {
        let cors = if self.config.cors_origins.is_empty() {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            let origins: Vec<axum::http::HeaderValue> = self
                .config
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(origins)
        };
        Router::new()
            .route("/events", get(events_handler))
            .layer(cors)
            .with_state(self.clone())
    }
}

fn matches_filters(filters: &Option<HashSet<String>>, event: &str) -> bool {
    let Some(filters) = filters else {
        return true;
    };
    filters.iter().any(|pattern| {
        pattern == "*"
            || pattern == event
            || pattern
                .strip_suffix('*')
                .map(|prefix| event.starts_with(prefix))
                .unwrap_or(false)
    })
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Comma-separated event-name filters, e.g. `events=task:*,agent:error`.
    #[serde(default)]
    events: Option<String>,
}

async fn events_handler(
    State(server): State<Arc<SseServer>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> std::result::Result<impl IntoResponse, StatusCode> {
    let filters: Option<HashSet<String>> = query.events.as_deref().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    });
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let (client_id, rx) = server
        .connect(filters, last_event_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    tracing::debug!(client = %client_id, "serving event stream");

    let retry_ms = server.config.retry_ms;
    let stream = frame_stream(rx, retry_ms);
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", "no-cache".parse().expect("static header"));
    headers.insert("X-Accel-Buffering", "no".parse().expect("static header"));
    Ok((headers, Sse::new(stream)))
}

fn frame_stream(
    rx: mpsc::Receiver<SseFrame>,
    retry_ms: u64,
) -> impl Stream<Item = std::result::Result<Event, std::convert::Infallible>> {
    let hello = tokio_stream::once(Ok(Event::default()
        .retry(Duration::from_millis(retry_ms))
        .event("server:connected")
        .data(json!({"connectedAt": Utc::now().timestamp_millis()}).to_string())));
    let live = ReceiverStream::new(rx).map(|frame| {
        Ok(match frame {
            SseFrame::Event { seq, event, data } => Event::default()
                .id(seq.to_string())
                .event(event)
                .data(data),
            SseFrame::Comment(text) => Event::default().comment(text),
        })
    });
    hello.chain(live)
}

/// Emits `: keep-alive <ts>` comments to every client on a fixed cadence.
pub fn spawn_keep_alive(
    server: Arc<SseServer>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(server.config.keep_alive_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            server.send_keep_alives().await;
        }
    })
}

/// Mirrors the process event bus onto the SSE fan-out.
pub fn spawn_event_pump(
    server: Arc<SseServer>,
    events: EventBus,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = events.subscribe();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };
            match event {
                Ok(event) => {
                    let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                    server.broadcast(&event.event_type, payload).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "SSE pump lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
