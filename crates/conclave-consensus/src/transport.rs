use async_trait::async_trait;

use crate::proposal::{Proposal, Vote};

/// How an algorithm reaches the participants of a session.
///
/// The production implementation rides the message bus (request/response
/// with a per-participant timeout); tests script it. Returning `None` means
/// the participant did not answer in time and is treated as an abstention.
#[async_trait]
pub trait VoteTransport: Send + Sync {
    async fn request_vote(&self, participant: &str, proposal: &Proposal) -> Option<Vote>;
}
