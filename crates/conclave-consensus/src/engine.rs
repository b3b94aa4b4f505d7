use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use conclave_bus::EventBus;
use conclave_types::{Error, Result, RuntimeEvent};

use crate::proposal::{Algorithm, ConsensusOutcome, Proposal, ProposalStatus};
use crate::raft::RaftState;
use crate::transport::VoteTransport;
use crate::{byzantine, gossip, quorum, raft};

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub default_timeout_ms: u64,
    /// Raft leader demotion threshold.
    pub heartbeat_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            heartbeat_timeout_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusInput {
    pub session_id: String,
    pub proposer_id: String,
    pub value: Value,
    pub participants: Vec<String>,
    pub timeout_ms: Option<u64>,
}

/// Runs proposals to an outcome and keeps their records queryable.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    transport: Arc<dyn VoteTransport>,
    proposals: RwLock<HashMap<String, Proposal>>,
    raft_states: Mutex<HashMap<String, RaftState>>,
    events: EventBus,
}

impl ConsensusEngine {
    pub fn new(transport: Arc<dyn VoteTransport>, events: EventBus, config: ConsensusConfig) -> Self {
        Self {
            config,
            transport,
            proposals: RwLock::new(HashMap::new()),
            raft_states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn propose(
        &self,
        input: ConsensusInput,
        algorithm: Algorithm,
    ) -> Result<ConsensusOutcome> {
        if input.participants.is_empty() {
            return Err(Error::InvalidInput(
                "consensus requires at least one participant".to_string(),
            ));
        }
        let timeout_ms = input.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let mut proposal = Proposal::new(input.proposer_id.clone(), input.value.clone(), timeout_ms);
        let proposal_id = proposal.id.clone();
        self.proposals
            .write()
            .await
            .insert(proposal_id.clone(), proposal.clone());

        let deadline = Duration::from_millis(timeout_ms);
        let run = self.run_algorithm(&input, algorithm, &mut proposal);
        let outcome = match tokio::time::timeout(deadline, run).await {
            Ok((approved, rounds, reason)) => {
                proposal.status = if approved {
                    ProposalStatus::Accepted
                } else {
                    ProposalStatus::Rejected
                };
                ConsensusOutcome {
                    proposal_id: proposal_id.clone(),
                    approved,
                    algorithm,
                    rounds,
                    votes: proposal.votes.values().cloned().collect(),
                    reason,
                    approval_rate: proposal.approval_rate(),
                }
            }
            Err(_) => {
                proposal.status = ProposalStatus::Expired;
                ConsensusOutcome {
                    proposal_id: proposal_id.clone(),
                    approved: false,
                    algorithm,
                    rounds: 0,
                    votes: proposal.votes.values().cloned().collect(),
                    reason: Some("timeout".to_string()),
                    approval_rate: proposal.approval_rate(),
                }
            }
        };

        self.proposals
            .write()
            .await
            .insert(proposal_id.clone(), proposal);

        let event_type = if outcome.reason.as_deref() == Some("timeout") {
            "consensus.proposal.expired"
        } else if outcome.approved {
            "consensus.proposal.accepted"
        } else {
            "consensus.proposal.rejected"
        };
        self.events.publish(RuntimeEvent::new(
            event_type,
            json!({
                "sessionID": input.session_id,
                "proposalID": outcome.proposal_id,
                "algorithm": algorithm,
                "approved": outcome.approved,
                "rounds": outcome.rounds,
            }),
        ));
        Ok(outcome)
    }

    async fn run_algorithm(
        &self,
        input: &ConsensusInput,
        algorithm: Algorithm,
        proposal: &mut Proposal,
    ) -> (bool, u32, Option<String>) {
        match algorithm {
            Algorithm::Quorum => {
                quorum::run(&self.transport, &input.participants, proposal).await
            }
            Algorithm::Byzantine => {
                byzantine::run(&self.transport, &input.participants, proposal).await
            }
            Algorithm::Gossip => gossip::run(&self.transport, &input.participants, proposal).await,
            Algorithm::Raft => {
                let mut states = self.raft_states.lock().await;
                let state = states
                    .entry(input.session_id.clone())
                    .or_insert_with(RaftState::new);
                raft::run(
                    &self.transport,
                    &input.participants,
                    proposal,
                    state,
                    self.config.heartbeat_timeout_ms,
                )
                .await
            }
        }
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> Option<Proposal> {
        self.proposals.read().await.get(proposal_id).cloned()
    }

    /// Flip overdue pending proposals to Expired. Returns the expired ids.
    pub async fn expire_due(&self) -> Vec<String> {
        let now = Utc::now();
        let mut proposals = self.proposals.write().await;
        let mut expired = Vec::new();
        for (id, proposal) in proposals.iter_mut() {
            if proposal.status == ProposalStatus::Pending && proposal.is_expired_at(now) {
                proposal.status = ProposalStatus::Expired;
                expired.push(id.clone());
            }
        }
        drop(proposals);
        for id in &expired {
            self.events.publish(RuntimeEvent::new(
                "consensus.proposal.expired",
                json!({ "proposalID": id }),
            ));
        }
        expired
    }
}

/// Reaps proposals whose timeout elapsed while no algorithm was driving them.
pub fn spawn_proposal_reaper(
    engine: Arc<ConsensusEngine>,
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
            let expired = engine.expire_due().await;
            if !expired.is_empty() {
                tracing::debug!(count = expired.len(), "expired stale proposals");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BlockingTransport, ScriptedTransport};

    fn input(participants: &[&str]) -> ConsensusInput {
        ConsensusInput {
            session_id: "s1".to_string(),
            proposer_id: "a1".to_string(),
            value: json!({"decision": "approve"}),
            participants: participants.iter().map(ToString::to_string).collect(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn quorum_outcome_is_recorded_and_published() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let engine = ConsensusEngine::new(
            Arc::new(ScriptedTransport::new(vec![
                ("a1", Some((true, 1.0))),
                ("a2", Some((true, 1.0))),
                ("a3", Some((true, 1.0))),
            ])),
            events,
            ConsensusConfig::default(),
        );

        let outcome = engine
            .propose(input(&["a1", "a2", "a3"]), Algorithm::Quorum)
            .await
            .unwrap();
        assert!(outcome.approved);
        assert!((outcome.approval_rate - 1.0).abs() < 1e-9);

        let stored = engine.get_proposal(&outcome.proposal_id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Accepted);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "consensus.proposal.accepted");
        assert_eq!(
            event.property_str("proposalID"),
            Some(outcome.proposal_id.as_str())
        );
    }

    #[tokio::test]
    async fn empty_participant_set_is_invalid() {
        let engine = ConsensusEngine::new(
            Arc::new(ScriptedTransport::new(Vec::new())),
            EventBus::new(),
            ConsensusConfig::default(),
        );
        let err = engine
            .propose(input(&[]), Algorithm::Quorum)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn stalled_transport_expires_the_proposal() {
        let engine = ConsensusEngine::new(
            Arc::new(BlockingTransport),
            EventBus::new(),
            ConsensusConfig::default(),
        );
        let mut request = input(&["a1", "a2"]);
        request.timeout_ms = Some(50);
        let outcome = engine
            .propose(request, Algorithm::Quorum)
            .await
            .unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason.as_deref(), Some("timeout"));

        let stored = engine.get_proposal(&outcome.proposal_id).await.unwrap();
        assert_eq!(stored.status, ProposalStatus::Expired);
    }

    #[tokio::test]
    async fn reaper_expires_orphaned_pending_proposals() {
        let events = EventBus::new();
        let engine = ConsensusEngine::new(
            Arc::new(ScriptedTransport::new(Vec::new())),
            events,
            ConsensusConfig::default(),
        );
        {
            let mut proposal = Proposal::new("a1", json!({}), 10);
            proposal.created_at = Utc::now() - chrono::Duration::milliseconds(100);
            engine
                .proposals
                .write()
                .await
                .insert(proposal.id.clone(), proposal);
        }
        let expired = engine.expire_due().await;
        assert_eq!(expired.len(), 1);
    }
}
