use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use conclave_types::{AgentId, Error, Result};

/// Smoothing factor shared by the response-time average.
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Idle,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub agent_id: AgentId,
    pub role: String,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub messages_exchanged: u64,
    pub consensus_reached: u64,
    pub consensus_failed: u64,
    pub average_response_time_ms: f64,
    #[serde(default)]
    response_samples: u64,
    /// active participants / total participants, in [0, 1].
    pub participation_rate: f64,
}

impl SessionMetrics {
    fn record_response_time(&mut self, elapsed_ms: f64) {
        if self.response_samples == 0 {
            self.average_response_time_ms = elapsed_ms;
        } else {
            self.average_response_time_ms =
                EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * self.average_response_time_ms;
        }
        self.response_samples += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub namespace: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub participants: HashMap<AgentId, Participant>,
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub metadata: Value,
}

impl Session {
    pub fn new(namespace: impl Into<String>, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            state: SessionState::Initializing,
            created_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
            participants: HashMap::new(),
            metrics: SessionMetrics::default(),
            metadata,
        }
    }

    fn transition(&mut self, from: &[SessionState], to: SessionState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(Error::InvalidState(format!(
                "cannot move session `{}` from {:?} to {to:?}",
                self.id, self.state
            )));
        }
        self.state = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(&[SessionState::Initializing], SessionState::Active)
    }

    pub fn pause(&mut self) -> Result<()> {
        self.transition(&[SessionState::Active], SessionState::Paused)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.transition(&[SessionState::Paused], SessionState::Active)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(
            &[SessionState::Active, SessionState::Paused],
            SessionState::Completed,
        )
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            &[
                SessionState::Initializing,
                SessionState::Active,
                SessionState::Paused,
            ],
            SessionState::Failed,
        )?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn add_participant(&mut self, agent_id: impl Into<AgentId>, role: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "session `{}` no longer accepts participants",
                self.id
            )));
        }
        let agent_id = agent_id.into();
        if self.participants.contains_key(&agent_id) {
            return Err(Error::InvalidInput(format!(
                "agent `{agent_id}` already joined session `{}`",
                self.id
            )));
        }
        let now = Utc::now();
        self.participants.insert(
            agent_id.clone(),
            Participant {
                agent_id,
                role: role.into(),
                joined_at: now,
                last_heartbeat: now,
                status: ParticipantStatus::Active,
            },
        );
        self.refresh_participation_rate();
        Ok(())
    }

    /// Idempotent; removing an absent agent is a no-op.
    pub fn remove_participant(&mut self, agent_id: &str) -> bool {
        let removed = self.participants.remove(agent_id).is_some();
        self.refresh_participation_rate();
        removed
    }

    pub fn update_heartbeat(&mut self, agent_id: &str) -> Result<()> {
        let participant = self.participants.get_mut(agent_id).ok_or_else(|| {
            Error::NotFound(format!(
                "agent `{agent_id}` is not in session `{}`",
                self.id
            ))
        })?;
        participant.last_heartbeat = Utc::now();
        if participant.status == ParticipantStatus::Disconnected {
            participant.status = ParticipantStatus::Active;
        }
        self.refresh_participation_rate();
        Ok(())
    }

    /// Flip participants whose heartbeat is older than the timeout.
    /// Returns the ids that just went dark.
    pub fn sweep_heartbeats(&mut self, now: DateTime<Utc>, timeout_ms: u64) -> Vec<AgentId> {
        let mut disconnected = Vec::new();
        for participant in self.participants.values_mut() {
            if participant.status == ParticipantStatus::Disconnected {
                continue;
            }
            let age = now
                .signed_duration_since(participant.last_heartbeat)
                .num_milliseconds();
            if age > timeout_ms as i64 {
                participant.status = ParticipantStatus::Disconnected;
                disconnected.push(participant.agent_id.clone());
            }
        }
        if !disconnected.is_empty() {
            self.refresh_participation_rate();
        }
        disconnected
    }

    pub fn active_participant_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Active)
            .count()
    }

    pub fn record_response_time(&mut self, elapsed_ms: f64) {
        self.metrics.record_response_time(elapsed_ms);
    }

    fn refresh_participation_rate(&mut self) {
        let total = self.participants.len();
        self.metrics.participation_rate = if total == 0 {
            0.0
        } else {
            self.active_participant_count() as f64 / total as f64
        };
    }

    pub fn to_snapshot(&self) -> Value {
        serde_json::to_value(self).expect("session serializes")
    }

    pub fn from_snapshot(snapshot: Value) -> Result<Self> {
        serde_json::from_value(snapshot)
            .map_err(|e| Error::InvalidInput(format!("invalid session snapshot: {e}")))
    }
}
