use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::proposal::Proposal;
use crate::transport::VoteTransport;

/// Byzantine agreement for `n` participants tolerating `f = (n-1)/3` faults.
///
/// Initial choices come from one vote round; then `f + 1` exchange rounds
/// where every honest participant adopts the majority it observed. A value
/// commits once it has been the majority in two consecutive rounds.
/// Participants that never answered are treated as faulty and contribute a
/// rejecting belief.
pub(crate) async fn run(
    transport: &Arc<dyn VoteTransport>,
    participants: &[String],
    proposal: &mut Proposal,
) -> (bool, u32, Option<String>) {
    let n = participants.len();
    let f = (n.saturating_sub(1)) / 3;

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

    let mut previous_majority = majority_of(&beliefs, n);
    let mut rounds = 0;
    let mut committed = false;
    for _ in 0..(f + 1) {
        rounds += 1;
        // Synchronous exchange: every honest node observes the full belief
        // vector and adopts its majority.
        let adopted = majority_of(&beliefs, n);
        for belief in beliefs.values_mut() {
            *belief = adopted;
        }
        if adopted == previous_majority {
            committed = true;
            break;
        }
        previous_majority = adopted;
    }

    let final_majority = majority_of(&beliefs, n);
    if !committed {
        return (
            false,
            rounds,
            Some("agreement did not stabilize within f+1 rounds".to_string()),
        );
    }
    (final_majority, rounds, None)
}

/// Strict majority of `true` beliefs over all `n` slots; ties reject.
fn majority_of(beliefs: &HashMap<&str, bool>, n: usize) -> bool {
    let approvals = beliefs.values().filter(|b| **b).count();
    approvals * 2 > n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::transport::VoteTransport;
    use serde_json::json;

    async fn run_with(votes: Vec<(&str, Option<(bool, f64)>)>) -> (bool, u32) {
        let participants: Vec<String> = votes.iter().map(|(id, _)| id.to_string()).collect();
        let transport: Arc<dyn VoteTransport> = Arc::new(ScriptedTransport::new(votes));
        let mut proposal = Proposal::new("a1", json!({"v": 1}), 5_000);
        let (approved, rounds, _) = run(&transport, &participants, &mut proposal).await;
        (approved, rounds)
    }

    #[tokio::test]
    async fn honest_majority_commits_approval() {
        let (approved, rounds) = run_with(vec![
            ("a1", Some((true, 1.0))),
            ("a2", Some((true, 1.0))),
            ("a3", Some((true, 1.0))),
            ("a4", Some((false, 1.0))),
        ])
        .await;
        assert!(approved);
        assert!(rounds >= 1);
    }

    #[tokio::test]
    async fn rejecting_majority_commits_rejection() {
        let (approved, _) = run_with(vec![
            ("a1", Some((false, 1.0))),
            ("a2", Some((false, 1.0))),
            ("a3", Some((true, 1.0))),
        ])
        .await;
        assert!(!approved);
    }

    #[tokio::test]
    async fn silent_faulty_nodes_count_against_approval() {
        // 2 approvals out of 4 slots is not a strict majority.
        let (approved, _) = run_with(vec![
            ("a1", Some((true, 1.0))),
            ("a2", Some((true, 1.0))),
            ("a3", None),
            ("a4", None),
        ])
        .await;
        assert!(!approved);
    }

    #[tokio::test]
    async fn single_participant_commits_immediately() {
        let (approved, rounds) = run_with(vec![("a1", Some((true, 1.0)))]).await;
        assert!(approved);
        assert_eq!(rounds, 1);
    }
}
