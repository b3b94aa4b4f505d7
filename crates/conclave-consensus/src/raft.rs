use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde_json::json;

use crate::proposal::Proposal;
use crate::transport::VoteTransport;

#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub term: u64,
    pub proposal_id: String,
}

/// Per-session replication state. A session keeps its leader across
/// proposals until heartbeats lapse.
#[derive(Debug, Clone)]
pub(crate) struct RaftState {
    pub term: u64,
    pub leader: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub log: Vec<LogEntry>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            term: 0,
            leader: None,
            last_heartbeat: Utc::now(),
            log: Vec::new(),
        }
    }

    pub fn leader_is_stale(&self, now: DateTime<Utc>, heartbeat_timeout_ms: u64) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            .num_milliseconds()
            > heartbeat_timeout_ms as i64
    }
}

/// Leader-based replication. Non-leaders forward to the leader (in-process
/// this is the same call path); the proposal is accepted once a majority of
/// followers acknowledge the appended entry.
pub(crate) async fn run(
    transport: &Arc<dyn VoteTransport>,
    participants: &[String],
    proposal: &mut Proposal,
    state: &mut RaftState,
    heartbeat_timeout_ms: u64,
) -> (bool, u32, Option<String>) {
    let n = participants.len();
    let majority = n / 2 + 1;
    let now = Utc::now();
    let mut rounds = 0;

    let leader_known = state
        .leader
        .as_ref()
        .map(|l| participants.contains(l))
        .unwrap_or(false);
    if !leader_known || state.leader_is_stale(now, heartbeat_timeout_ms) {
        rounds += 1;
        match elect_leader(transport, participants, state).await {
            Some(leader) => {
                state.leader = Some(leader);
                state.last_heartbeat = Utc::now();
            }
            None => {
                return (
                    false,
                    rounds,
                    Some(format!("no leader elected for term {}", state.term)),
                );
            }
        }
    }

    let leader = state.leader.clone().expect("leader set above");
    rounds += 1;
    state.log.push(LogEntry {
        term: state.term,
        proposal_id: proposal.id.clone(),
    });

    let followers: Vec<&String> = participants.iter().filter(|p| **p != leader).collect();
    let requests = followers
        .iter()
        .map(|follower| transport.request_vote(follower, proposal));
    let responses = join_all(requests).await;
    for vote in responses.into_iter().flatten() {
        proposal.record_vote(vote);
    }

    // The leader acknowledges its own entry.
    let acks = 1 + proposal.votes.values().filter(|v| v.approve).count();
    if acks >= majority {
        state.last_heartbeat = Utc::now();
        (true, rounds, None)
    } else {
        (
            false,
            rounds,
            Some(format!("{acks}/{majority} acknowledgements")),
        )
    }
}

/// Random-timeout election: every participant draws an election timeout and
/// the earliest timer becomes the candidate for the new term. The candidate
/// needs grants from a majority (counting its own vote).
async fn elect_leader(
    transport: &Arc<dyn VoteTransport>,
    participants: &[String],
    state: &mut RaftState,
) -> Option<String> {
    state.term += 1;
    let n = participants.len();
    let majority = n / 2 + 1;

    let mut rng = rand::thread_rng();
    let candidate = participants
        .iter()
        .map(|p| (p, rng.gen_range(150u32..300u32)))
        .min_by_key(|(_, timeout)| *timeout)
        .map(|(p, _)| p.clone())?;

    let ballot = Proposal::new(
        candidate.clone(),
        json!({ "raft_election": state.term, "candidate": candidate }),
        0,
    );
    let voters: Vec<&String> = participants.iter().filter(|p| **p != candidate).collect();
    let requests = voters
        .iter()
        .map(|voter| transport.request_vote(voter, &ballot));
    let responses = join_all(requests).await;
    let grants = 1 + responses
        .into_iter()
        .flatten()
        .filter(|v| v.approve)
        .count();

    if grants >= majority {
        tracing::debug!(term = state.term, leader = %candidate, "leader elected");
        Some(candidate)
    } else {
        None
    }
}
