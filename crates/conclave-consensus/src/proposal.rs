use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Raft,
    Quorum,
    Byzantine,
    Gossip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub approve: bool,
    /// Confidence in [0, 1]; clamped on construction.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    pub fn new(voter_id: impl Into<String>, approve: bool, confidence: f64) -> Self {
        Self {
            voter_id: voter_id.into(),
            approve,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub proposer_id: String,
    pub value: Value,
    pub status: ProposalStatus,
    pub votes: HashMap<String, Vote>,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

impl Proposal {
    pub fn new(proposer_id: impl Into<String>, value: Value, timeout_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            proposer_id: proposer_id.into(),
            value,
            status: ProposalStatus::Pending,
            votes: HashMap::new(),
            created_at: Utc::now(),
            timeout_ms,
        }
    }

    pub fn record_vote(&mut self, vote: Vote) {
        self.votes.insert(vote.voter_id.clone(), vote);
    }

    pub fn approval_rate(&self) -> f64 {
        if self.votes.is_empty() {
            return 0.0;
        }
        let approvals = self.votes.values().filter(|v| v.approve).count();
        approvals as f64 / self.votes.len() as f64
    }

    pub fn weighted_approval_rate(&self) -> f64 {
        let total: f64 = self.votes.values().map(|v| v.confidence).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let approving: f64 = self
            .votes
            .values()
            .filter(|v| v.approve)
            .map(|v| v.confidence)
            .sum();
        approving / total
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at)
            .num_milliseconds()
            >= self.timeout_ms as i64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusOutcome {
    pub proposal_id: String,
    pub approved: bool,
    pub algorithm: Algorithm,
    pub rounds: u32,
    pub votes: Vec<Vote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub approval_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weighted_rate_follows_confidence() {
        let mut proposal = Proposal::new("a1", json!({"decision": "ship"}), 1_000);
        proposal.record_vote(Vote::new("a1", true, 0.9));
        proposal.record_vote(Vote::new("a2", false, 0.1));
        let rate = proposal.weighted_approval_rate();
        assert!((rate - 0.9).abs() < 1e-9);
        assert!((proposal.approval_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_votes_means_zero_rates() {
        let proposal = Proposal::new("a1", json!({}), 1_000);
        assert_eq!(proposal.approval_rate(), 0.0);
        assert_eq!(proposal.weighted_approval_rate(), 0.0);
    }

    #[test]
    fn confidence_is_clamped() {
        let vote = Vote::new("a1", true, 4.2);
        assert_eq!(vote.confidence, 1.0);
        let vote = Vote::new("a1", true, -1.0);
        assert_eq!(vote.confidence, 0.0);
    }

    #[test]
    fn expiry_follows_timeout() {
        let proposal = Proposal::new("a1", json!({}), 100);
        assert!(!proposal.is_expired_at(proposal.created_at + chrono::Duration::milliseconds(99)));
        assert!(proposal.is_expired_at(proposal.created_at + chrono::Duration::milliseconds(100)));
    }
}
