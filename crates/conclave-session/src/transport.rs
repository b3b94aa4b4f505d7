use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use conclave_bus::{MessageBus, RequestOptions};
use conclave_consensus::{Proposal, Vote, VoteTransport};
use conclave_types::{Message, MessagePriority, MessageType, Recipient};

/// Carries consensus ballots over the message bus.
///
/// Each participant receives a high-priority request with the proposal value
/// and answers with `{approve, confidence}`. A missing or malformed answer
/// within the vote timeout counts as an abstention.
pub struct BusVoteTransport {
    bus: Arc<MessageBus>,
    vote_timeout_ms: u64,
}

impl BusVoteTransport {
    pub fn new(bus: Arc<MessageBus>, vote_timeout_ms: u64) -> Self {
        Self {
            bus,
            vote_timeout_ms,
        }
    }
}

#[async_trait]
impl VoteTransport for BusVoteTransport {
    async fn request_vote(&self, participant: &str, proposal: &Proposal) -> Option<Vote> {
        let request = Message::new(
            proposal.proposer_id.clone(),
            Recipient::Agent(participant.to_string()),
            MessageType::Request,
            json!({
                "kind": "consensus.vote",
                "proposalID": proposal.id,
                "value": proposal.value,
            }),
        )
        .with_priority(MessagePriority::High)
        .with_ttl_ms(self.vote_timeout_ms);

        let response = self
            .bus
            .request(
                request,
                RequestOptions {
                    timeout_ms: self.vote_timeout_ms,
                    retries: 0,
                },
                CancellationToken::new(),
            )
            .await
            .ok()?;

        let approve = response.payload.get("approve")?.as_bool()?;
        let confidence = response
            .payload
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        Some(Vote::new(participant, approve, confidence))
    }
}
