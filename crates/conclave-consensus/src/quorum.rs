use std::sync::Arc;

use futures::future::join_all;

use crate::proposal::Proposal;
use crate::transport::VoteTransport;

/// Acceptance threshold margin. A dead-even split stays rejected.
pub(crate) const EPSILON: f64 = 1e-9;

/// Weighted quorum voting: every participant is asked once, non-responders
/// abstain, and the proposal passes iff the confidence-weighted approval
/// rate clears one half.
pub(crate) async fn run(
    transport: &Arc<dyn VoteTransport>,
    participants: &[String],
    proposal: &mut Proposal,
) -> (bool, u32, Option<String>) {
    let requests = participants
        .iter()
        .map(|participant| transport.request_vote(participant, proposal));
    let responses = join_all(requests).await;

    for vote in responses.into_iter().flatten() {
        proposal.record_vote(vote);
    }

    if proposal.votes.is_empty() {
        return (false, 1, Some("no votes received".to_string()));
    }
    let approved = proposal.weighted_approval_rate() >= 0.5 + EPSILON;
    (approved, 1, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    async fn run_with(votes: Vec<(&str, Option<(bool, f64)>)>) -> (bool, Proposal) {
        let participants: Vec<String> = votes.iter().map(|(id, _)| id.to_string()).collect();
        let transport = ScriptedTransport::new(votes);
        let transport: Arc<dyn VoteTransport> = Arc::new(transport);
        let mut proposal = Proposal::new("a1", json!({"decision": "approve"}), 5_000);
        let (approved, rounds, _) = run(&transport, &participants, &mut proposal).await;
        assert_eq!(rounds, 1);
        (approved, proposal)
    }

    #[tokio::test]
    async fn unanimous_approval_passes_with_full_rate() {
        let (approved, proposal) = run_with(vec![
            ("a1", Some((true, 1.0))),
            ("a2", Some((true, 1.0))),
            ("a3", Some((true, 1.0))),
        ])
        .await;
        assert!(approved);
        assert!((proposal.approval_rate() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unanimous_rejection_fails() {
        let (approved, _) = run_with(vec![
            ("a1", Some((false, 1.0))),
            ("a2", Some((false, 1.0))),
        ])
        .await;
        assert!(!approved);
    }

    #[tokio::test]
    async fn exact_tie_is_rejected() {
        let (approved, _) = run_with(vec![
            ("a1", Some((true, 1.0))),
            ("a2", Some((true, 1.0))),
            ("a3", Some((false, 1.0))),
            ("a4", Some((false, 1.0))),
        ])
        .await;
        assert!(!approved);
    }

    #[tokio::test]
    async fn confidence_weights_can_flip_the_result() {
        let (approved, _) = run_with(vec![
            ("a1", Some((true, 0.9))),
            ("a2", Some((false, 0.2))),
            ("a3", Some((false, 0.2))),
        ])
        .await;
        assert!(approved);
    }

    #[tokio::test]
    async fn non_responders_count_as_abstentions() {
        let (approved, proposal) = run_with(vec![
            ("a1", Some((true, 1.0))),
            ("a2", None),
            ("a3", None),
        ])
        .await;
        assert!(approved);
        assert_eq!(proposal.votes.len(), 1);
    }

    #[tokio::test]
    async fn silence_from_everyone_rejects() {
        let (approved, proposal) = run_with(vec![("a1", None), ("a2", None)]).await;
        assert!(!approved);
        assert!(proposal.votes.is_empty());
    }
}
