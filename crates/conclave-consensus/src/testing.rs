use std::collections::HashMap;

use async_trait::async_trait;

use crate::proposal::{Proposal, Vote};
use crate::transport::VoteTransport;

/// Scripted per-participant votes; `None` simulates a silent participant.
/// Raft election ballots are always granted.
pub(crate) struct ScriptedTransport {
    votes: HashMap<String, Option<(bool, f64)>>,
}

impl ScriptedTransport {
    pub fn new(votes: Vec<(&str, Option<(bool, f64)>)>) -> Self {
        Self {
            votes: votes
                .into_iter()
                .map(|(id, vote)| (id.to_string(), vote))
                .collect(),
        }
    }
}

#[async_trait]
impl VoteTransport for ScriptedTransport {
    async fn request_vote(&self, participant: &str, proposal: &Proposal) -> Option<Vote> {
        if proposal.value.get("raft_election").is_some() {
            return Some(Vote::new(participant, true, 1.0));
        }
        match self.votes.get(participant) {
            Some(Some((approve, confidence))) => {
                Some(Vote::new(participant, *approve, *confidence))
            }
            _ => None,
        }
    }
}

/// Never answers; exercises timeout paths.
pub(crate) struct BlockingTransport;

#[async_trait]
impl VoteTransport for BlockingTransport {
    async fn request_vote(&self, _participant: &str, _proposal: &Proposal) -> Option<Vote> {
        futures::future::pending::<()>().await;
        None
    }
}
