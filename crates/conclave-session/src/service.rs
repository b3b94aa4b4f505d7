use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use conclave_bus::{EventBus, MailboxConfig, MessageBus, RequestOptions};
use conclave_consensus::{Algorithm, ConsensusEngine, ConsensusInput, ConsensusOutcome};
use conclave_limits::LimitRegistry;
use conclave_types::{Error, Message, MessageType, Recipient, Result, RuntimeEvent};

use crate::session::{Session, SessionState};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_timeout_ms: u64,
    pub mailbox: MailboxConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            mailbox: MailboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub namespace: Option<String>,
    pub metadata: Option<Value>,
}

/// Owns the session registry. Every mutation flows through here; sessions are
/// partitioned behind their own mutex so unrelated sessions never contend.
pub struct SessionService {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    bus: Arc<MessageBus>,
    consensus: Arc<ConsensusEngine>,
    limits: Arc<LimitRegistry>,
    events: EventBus,
    config: SessionConfig,
}

impl SessionService {
    pub fn new(
        bus: Arc<MessageBus>,
        consensus: Arc<ConsensusEngine>,
        limits: Arc<LimitRegistry>,
        events: EventBus,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bus,
            consensus,
            limits,
            events,
            config,
        }
    }

    /// Per-sender message budget; denial surfaces as backpressure with the
    /// wait hint attached.
    async fn admit_message(&self, sender: &str) -> Result<()> {
        let decision = self.limits.for_agent(sender).await.can_send_message().await;
        if decision.allowed {
            return Ok(());
        }
        let wait = decision.wait_time_ms.unwrap_or(0);
        Err(Error::CapacityExceeded(format!(
            "{} (retry in {wait} ms)",
            decision
                .reason
                .unwrap_or_else(|| "message rate limit exceeded".to_string())
        )))
    }

    pub async fn create_session(&self, options: CreateSessionOptions) -> Session {
        let session = Session::new(
            options.namespace.unwrap_or_else(|| "default".to_string()),
            options.metadata.unwrap_or_else(|| json!({})),
        );
        let snapshot = session.clone();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        self.events.publish(RuntimeEvent::new(
            "session.created",
            json!({
                "sessionID": snapshot.id,
                "namespace": snapshot.namespace,
            }),
        ));
        snapshot
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session `{session_id}`")))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let entry = self.entry(session_id).await?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    pub async fn join(
        &self,
        session_id: &str,
        agent_id: &str,
        role: &str,
    ) -> Result<()> {
        let entry = self.entry(session_id).await?;
        {
            let mut session = entry.lock().await;
            session.add_participant(agent_id, role)?;
        }
        if self.bus.mailbox(agent_id).await.is_none() {
            self.bus
                .register_agent(agent_id, self.config.mailbox.clone())
                .await;
        }
        self.events.publish(RuntimeEvent::new(
            "session.participant.joined",
            json!({
                "sessionID": session_id,
                "agentID": agent_id,
                "role": role,
            }),
        ));
        Ok(())
    }

    pub async fn leave(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let removed = {
            let mut session = entry.lock().await;
            session.remove_participant(agent_id)
        };
        if removed {
            self.events.publish(RuntimeEvent::new(
                "session.participant.left",
                json!({
                    "sessionID": session_id,
                    "agentID": agent_id,
                }),
            ));
        }
        Ok(())
    }

    pub async fn start(&self, session_id: &str) -> Result<()> {
        self.transition(session_id, "session.started", Session::start)
            .await
    }

    pub async fn pause(&self, session_id: &str) -> Result<()> {
        self.transition(session_id, "session.paused", Session::pause)
            .await
    }

    pub async fn resume(&self, session_id: &str) -> Result<()> {
        self.transition(session_id, "session.resumed", Session::resume)
            .await
    }

    pub async fn complete(&self, session_id: &str) -> Result<()> {
        self.transition(session_id, "session.completed", Session::complete)
            .await
    }

    pub async fn fail(&self, session_id: &str, reason: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        {
            let mut session = entry.lock().await;
            session.fail(reason)?;
        }
        self.events.publish(RuntimeEvent::new(
            "session.failed",
            json!({
                "sessionID": session_id,
                "reason": reason,
            }),
        ));
        Ok(())
    }

    async fn transition(
        &self,
        session_id: &str,
        event_type: &str,
        apply: fn(&mut Session) -> Result<()>,
    ) -> Result<()> {
        let entry = self.entry(session_id).await?;
        {
            let mut session = entry.lock().await;
            apply(&mut session)?;
        }
        self.events.publish(RuntimeEvent::new(
            event_type,
            json!({ "sessionID": session_id }),
        ));
        Ok(())
    }

    pub async fn update_heartbeat(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        session.update_heartbeat(agent_id)
    }

    /// Send to an explicit recipient inside the session.
    pub async fn send_direct(&self, session_id: &str, message: Message) -> Result<String> {
        let entry = self.entry(session_id).await?;
        {
            let session = entry.lock().await;
            self.require_routable(&session, &message)?;
        }
        self.admit_message(&message.from).await?;
        let id = self.bus.send_direct(message).await?;
        let mut session = entry.lock().await;
        session.metrics.messages_exchanged += 1;
        Ok(id)
    }

    /// Deliver to every participant except the sender.
    pub async fn broadcast(&self, session_id: &str, mut message: Message) -> Result<usize> {
        let entry = self.entry(session_id).await?;
        let targets: Vec<String> = {
            let session = entry.lock().await;
            if session.state != SessionState::Active {
                return Err(Error::InvalidState(format!(
                    "session `{session_id}` is not active"
                )));
            }
            session
                .participants
                .keys()
                .filter(|id| **id != message.from)
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            return Ok(0);
        }
        self.admit_message(&message.from).await?;
        message.to = Recipient::Agents(targets.clone());
        self.bus.send_direct(message).await?;
        let mut session = entry.lock().await;
        session.metrics.messages_exchanged += 1;
        Ok(targets.len())
    }

    /// Request/response between two participants, tracked in the session's
    /// response-time average.
    pub async fn request(
        &self,
        session_id: &str,
        message: Message,
        options: RequestOptions,
        cancel: CancellationToken,
    ) -> Result<Message> {
        let entry = self.entry(session_id).await?;
        {
            let session = entry.lock().await;
            self.require_routable(&session, &message)?;
        }
        self.admit_message(&message.from).await?;
        let started = Instant::now();
        let response = self.bus.request(message, options, cancel).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let mut session = entry.lock().await;
        session.metrics.messages_exchanged += 1;
        session.record_response_time(elapsed_ms);
        Ok(response)
    }

    pub async fn request_consensus(
        &self,
        session_id: &str,
        proposer_id: &str,
        value: Value,
        algorithm: Algorithm,
    ) -> Result<ConsensusOutcome> {
        let participants: Vec<String> = {
            let entry = self.entry(session_id).await?;
            let session = entry.lock().await;
            if session.state != SessionState::Active {
                return Err(Error::InvalidState(format!(
                    "session `{session_id}` is not active"
                )));
            }
            if !session.participants.contains_key(proposer_id) {
                return Err(Error::NotFound(format!(
                    "proposer `{proposer_id}` is not in session `{session_id}`"
                )));
            }
            session.participants.keys().cloned().collect()
        };

        let outcome = self
            .consensus
            .propose(
                ConsensusInput {
                    session_id: session_id.to_string(),
                    proposer_id: proposer_id.to_string(),
                    value,
                    participants,
                    timeout_ms: None,
                },
                algorithm,
            )
            .await?;

        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        if outcome.approved {
            session.metrics.consensus_reached += 1;
        } else {
            session.metrics.consensus_failed += 1;
        }
        Ok(outcome)
    }

    pub async fn active_participant_count(&self, session_id: &str) -> Result<usize> {
        let entry = self.entry(session_id).await?;
        let session = entry.lock().await;
        Ok(session.active_participant_count())
    }

    pub async fn to_snapshot(&self, session_id: &str) -> Result<Value> {
        let entry = self.entry(session_id).await?;
        let session = entry.lock().await;
        Ok(session.to_snapshot())
    }

    /// Reconstructs a session from a snapshot, replacing any record with the
    /// same id.
    pub async fn restore_snapshot(&self, snapshot: Value) -> Result<Session> {
        let session = Session::from_snapshot(snapshot)?;
        let snapshot_copy = session.clone();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        Ok(snapshot_copy)
    }

    /// Remove a session record entirely (snapshot eviction).
    pub async fn evict(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    fn require_routable(&self, session: &Session, message: &Message) -> Result<()> {
        if session.state != SessionState::Active {
            return Err(Error::InvalidState(format!(
                "session `{}` is not active",
                session.id
            )));
        }
        if !session.participants.contains_key(&message.from) {
            return Err(Error::NotFound(format!(
                "sender `{}` is not in session `{}`",
                message.from, session.id
            )));
        }
        let recipients: Vec<&String> = match &message.to {
            Recipient::Agent(agent) => vec![agent],
            Recipient::Agents(agents) => agents.iter().collect(),
            Recipient::Broadcast => Vec::new(),
        };
        for recipient in recipients {
            if !session.participants.contains_key(recipient) {
                return Err(Error::NotFound(format!(
                    "recipient `{recipient}` is not in session `{}`",
                    session.id
                )));
            }
        }
        Ok(())
    }

    pub(crate) async fn sweep_all_heartbeats(&self) {
        let entries: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        for (session_id, entry) in entries {
            let disconnected = {
                let mut session = entry.lock().await;
                if session.state.is_terminal() {
                    continue;
                }
                session.sweep_heartbeats(chrono::Utc::now(), self.config.heartbeat_timeout_ms)
            };
            for agent_id in disconnected {
                self.events.publish(RuntimeEvent::new(
                    "session.participant.disconnected",
                    json!({
                        "sessionID": session_id,
                        "agentID": agent_id,
                    }),
                ));
            }
        }
    }
}

/// Flips silent participants to disconnected on a fixed cadence.
pub fn spawn_heartbeat_sweeper(
    service: Arc<SessionService>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            service.sweep_all_heartbeats().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BusVoteTransport;
    use conclave_consensus::ConsensusConfig;
    use conclave_types::MessagePriority;

    struct Harness {
        service: Arc<SessionService>,
        bus: Arc<MessageBus>,
        limits: Arc<LimitRegistry>,
        events: EventBus,
    }

    fn harness() -> Harness {
        let bus = Arc::new(MessageBus::new());
        let events = EventBus::new();
        let transport = Arc::new(BusVoteTransport::new(bus.clone(), 1_000));
        let consensus = Arc::new(ConsensusEngine::new(
            transport,
            events.clone(),
            ConsensusConfig::default(),
        ));
        let limits = Arc::new(LimitRegistry::new(conclave_limits::LimitConfig::default()));
        let service = Arc::new(SessionService::new(
            bus.clone(),
            consensus,
            limits.clone(),
            events.clone(),
            SessionConfig::default(),
        ));
        Harness {
            service,
            bus,
            limits,
            events,
        }
    }

    /// Spawn an agent task that answers every consensus ballot it receives.
    fn spawn_voter(bus: Arc<MessageBus>, agent_id: &str, approve: bool, confidence: f64) {
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let mailbox = bus.mailbox(&agent_id).await.expect("mailbox");
            loop {
                let request = mailbox.recv().await;
                if request.message_type != MessageType::Request {
                    continue;
                }
                let response = Message::response_to(
                    &request,
                    agent_id.clone(),
                    json!({ "approve": approve, "confidence": confidence }),
                );
                let _ = bus.send_direct(response).await;
            }
        });
    }

    #[tokio::test]
    async fn lifecycle_and_broadcast_scenario() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "coordinator").await.unwrap();
        h.service.join(&session.id, "a2", "worker").await.unwrap();
        h.service.join(&session.id, "a3", "worker").await.unwrap();
        h.service.start(&session.id).await.unwrap();

        let ping = Message::new(
            "a1",
            Recipient::Broadcast,
            MessageType::Notification,
            json!({"ping": 1}),
        );
        let delivered = h.service.broadcast(&session.id, ping).await.unwrap();
        assert_eq!(delivered, 2);

        for agent in ["a2", "a3"] {
            let mailbox = h.bus.mailbox(agent).await.unwrap();
            assert_eq!(mailbox.len(), 1);
            let got = mailbox.dequeue().unwrap();
            assert_eq!(got.payload["ping"], 1);
        }
        let a1 = h.bus.mailbox("a1").await.unwrap();
        assert!(a1.is_empty());

        let current = h.service.get_session(&session.id).await.unwrap();
        assert_eq!(current.metrics.messages_exchanged, 1);
        assert_eq!(
            h.service.active_participant_count(&session.id).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn broadcast_requires_an_active_session() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "coordinator").await.unwrap();
        let ping = Message::new(
            "a1",
            Recipient::Broadcast,
            MessageType::Notification,
            json!({}),
        );
        let err = h.service.broadcast(&session.id, ping).await.err().unwrap();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn send_direct_rejects_outsiders() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "coordinator").await.unwrap();
        h.service.start(&session.id).await.unwrap();
        let message = Message::new(
            "a1",
            Recipient::Agent("stranger".to_string()),
            MessageType::Notification,
            json!({}),
        );
        let err = h
            .service
            .send_direct(&session.id, message)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn quorum_consensus_with_unanimous_approval() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        for agent in ["a1", "a2", "a3"] {
            h.service.join(&session.id, agent, "worker").await.unwrap();
        }
        h.service.start(&session.id).await.unwrap();
        for agent in ["a1", "a2", "a3"] {
            spawn_voter(h.bus.clone(), agent, true, 1.0);
        }

        let outcome = h
            .service
            .request_consensus(&session.id, "a1", json!({"decision": "approve"}), Algorithm::Quorum)
            .await
            .unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.algorithm, Algorithm::Quorum);
        assert!((outcome.approval_rate - 1.0).abs() < 1e-9);

        let current = h.service.get_session(&session.id).await.unwrap();
        assert_eq!(current.metrics.consensus_reached, 1);
    }

    #[tokio::test]
    async fn quorum_consensus_tie_is_rejected() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        for agent in ["a1", "a2", "a3", "a4"] {
            h.service.join(&session.id, agent, "worker").await.unwrap();
        }
        h.service.start(&session.id).await.unwrap();
        spawn_voter(h.bus.clone(), "a1", true, 1.0);
        spawn_voter(h.bus.clone(), "a2", true, 1.0);
        spawn_voter(h.bus.clone(), "a3", false, 1.0);
        spawn_voter(h.bus.clone(), "a4", false, 1.0);

        let outcome = h
            .service
            .request_consensus(&session.id, "a1", json!({"decision": "split"}), Algorithm::Quorum)
            .await
            .unwrap();
        assert!(!outcome.approved);

        let current = h.service.get_session(&session.id).await.unwrap();
        assert_eq!(current.metrics.consensus_failed, 1);
    }

    #[tokio::test]
    async fn request_updates_response_time_average() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "coordinator").await.unwrap();
        h.service.join(&session.id, "a2", "worker").await.unwrap();
        h.service.start(&session.id).await.unwrap();
        spawn_voter(h.bus.clone(), "a2", true, 1.0);

        let request = Message::new(
            "a1",
            Recipient::Agent("a2".to_string()),
            MessageType::Request,
            json!({"work": true}),
        )
        .with_priority(MessagePriority::High);
        let response = h
            .service
            .request(
                &session.id,
                request,
                RequestOptions::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.message_type, MessageType::Response);

        let current = h.service.get_session(&session.id).await.unwrap();
        assert!(current.metrics.average_response_time_ms > 0.0);
        assert_eq!(current.metrics.messages_exchanged, 1);
    }

    #[tokio::test]
    async fn message_budget_denies_with_backpressure() {
        let h = harness();
        h.limits
            .set_agent_config(
                "a1",
                conclave_limits::LimitConfig {
                    messages_per_minute: 2,
                    ..Default::default()
                },
            )
            .await;
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "coordinator").await.unwrap();
        h.service.join(&session.id, "a2", "worker").await.unwrap();
        h.service.start(&session.id).await.unwrap();

        for _ in 0..2 {
            let note = Message::new(
                "a1",
                Recipient::Agent("a2".to_string()),
                MessageType::Notification,
                json!({}),
            );
            h.service.send_direct(&session.id, note).await.unwrap();
        }
        let note = Message::new(
            "a1",
            Recipient::Agent("a2".to_string()),
            MessageType::Notification,
            json!({}),
        );
        let err = h.service.send_direct(&session.id, note).await.err().unwrap();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert!(err.to_string().contains("retry in"));
    }

    #[tokio::test]
    async fn sweeper_emits_disconnect_events() {
        let h = harness();
        let mut rx = h.events.subscribe();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "worker").await.unwrap();

        {
            let entry = h.service.entry(&session.id).await.unwrap();
            let mut locked = entry.lock().await;
            locked.participants.get_mut("a1").unwrap().last_heartbeat =
                chrono::Utc::now() - chrono::Duration::milliseconds(60_000);
        }
        h.service.sweep_all_heartbeats().await;

        loop {
            let event = rx.recv().await.unwrap();
            if event.event_type == "session.participant.disconnected" {
                assert_eq!(event.property_str("agentID"), Some("a1"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn snapshot_restore_rebuilds_the_registry_entry() {
        let h = harness();
        let session = h.service.create_session(CreateSessionOptions::default()).await;
        h.service.join(&session.id, "a1", "worker").await.unwrap();
        let snapshot = h.service.to_snapshot(&session.id).await.unwrap();

        assert!(h.service.evict(&session.id).await);
        assert!(h.service.get_session(&session.id).await.is_err());

        let restored = h.service.restore_snapshot(snapshot).await.unwrap();
        assert_eq!(restored.id, session.id);
        assert!(h.service.get_session(&session.id).await.is_ok());
    }
}
