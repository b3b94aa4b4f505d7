use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;

use crate::proposal::Proposal;
use crate::transport::VoteTransport;

const AGREEMENT_THRESHOLD: f64 = 2.0 / 3.0;

/// Epidemic agreement: each round every participant samples
/// `k = ceil(log2 n)` peers and adopts the majority belief it saw. After
/// `O(log n)` rounds the run commits if at least 2/3 of the beliefs agree.
pub(crate) async fn run(
    transport: &Arc<dyn VoteTransport>,
    participants: &[String],
    proposal: &mut Proposal,
) -> (bool, u32, Option<String>) {
    let n = participants.len();

    let requests = participants
        .iter()
        .map(|participant| transport.request_vote(participant, proposal));
    let responses = join_all(requests).await;
    for vote in responses.into_iter().flatten() {
        proposal.record_vote(vote);
    }

    let mut beliefs: HashMap<&str, bool> = participants
        .iter()
        .map(|p| {
            let belief = proposal.votes.get(p).map(|v| v.approve).unwrap_or(false);
            (p.as_str(), belief)
        })
        .collect();

    let log2_n = (n as f64).log2().ceil().max(1.0) as usize;
    let fanout = log2_n;
    let max_rounds = log2_n * 2 + 1;

    let mut rounds = 0;
    let mut rng = rand::thread_rng();
    for _ in 0..max_rounds {
        rounds += 1;
        let mut next: HashMap<&str, bool> = HashMap::with_capacity(n);
        for participant in participants {
            let own = beliefs[participant.as_str()];
            let peers: Vec<&String> = participants
                .iter()
                .filter(|p| *p != participant)
                .collect();
            let sampled = peers.choose_multiple(&mut rng, fanout.min(peers.len()));
            let mut approvals = usize::from(own);
            let mut total = 1;
            for peer in sampled {
                total += 1;
                if beliefs[peer.as_str()] {
                    approvals += 1;
                }
            }
            // Ties keep the participant's own belief.
            let adopted = if approvals * 2 == total {
                own
            } else {
                approvals * 2 > total
            };
            next.insert(participant.as_str(), adopted);
        }
        let unanimous = next.values().all(|b| *b) || next.values().all(|b| !*b);
        beliefs = next;
        if unanimous {
            break;
        }
    }

    let approvals = beliefs.values().filter(|b| **b).count();
    let approve_share = approvals as f64 / n as f64;
    let reject_share = 1.0 - approve_share;
    if approve_share >= AGREEMENT_THRESHOLD {
        (true, rounds, None)
    } else if reject_share >= AGREEMENT_THRESHOLD {
        (false, rounds, None)
    } else {
        (
            false,
            rounds,
            Some("beliefs did not reach 2/3 agreement".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::transport::VoteTransport;
    use serde_json::json;

    async fn run_with(votes: Vec<(&str, Option<(bool, f64)>)>) -> (bool, Option<String>) {
        let participants: Vec<String> = votes.iter().map(|(id, _)| id.to_string()).collect();
        let transport: Arc<dyn VoteTransport> = Arc::new(ScriptedTransport::new(votes));
        let mut proposal = Proposal::new("a1", json!({"v": 1}), 5_000);
        let (approved, _, reason) = run(&transport, &participants, &mut proposal).await;
        (approved, reason)
    }

    #[tokio::test]
    async fn uniform_approval_converges_to_acceptance() {
        let votes: Vec<(&str, Option<(bool, f64)>)> = vec![
            ("a1", Some((true, 1.0))),
            ("a2", Some((true, 1.0))),
            ("a3", Some((true, 1.0))),
            ("a4", Some((true, 1.0))),
            ("a5", Some((true, 1.0))),
        ];
        let (approved, reason) = run_with(votes).await;
        assert!(approved, "reason: {reason:?}");
    }

    #[tokio::test]
    async fn uniform_rejection_converges_to_rejection() {
        let votes: Vec<(&str, Option<(bool, f64)>)> = vec![
            ("a1", Some((false, 1.0))),
            ("a2", Some((false, 1.0))),
            ("a3", Some((false, 1.0))),
        ];
        let (approved, reason) = run_with(votes).await;
        assert!(!approved);
        assert!(reason.is_none());
    }

    #[tokio::test]
    async fn single_dissenter_is_absorbed() {
        // With 7 of 8 approving, sampled majorities overwhelm the dissenter
        // and the 2/3 bar is met regardless of sampling order.
        let votes: Vec<(&str, Option<(bool, f64)>)> = vec![
            ("a1", Some((true, 1.0))),
            ("a2", Some((true, 1.0))),
            ("a3", Some((true, 1.0))),
            ("a4", Some((true, 1.0))),
            ("a5", Some((true, 1.0))),
            ("a6", Some((true, 1.0))),
            ("a7", Some((true, 1.0))),
            ("a8", Some((false, 1.0))),
        ];
        let (approved, reason) = run_with(votes).await;
        assert!(approved, "reason: {reason:?}");
    }
}
