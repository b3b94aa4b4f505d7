mod byzantine;
mod engine;
mod gossip;
mod proposal;
mod quorum;
mod raft;
mod transport;

pub use engine::{spawn_proposal_reaper, ConsensusConfig, ConsensusEngine, ConsensusInput};
pub use proposal::{Algorithm, ConsensusOutcome, Proposal, ProposalStatus, Vote};
pub use transport::VoteTransport;

#[cfg(test)]
pub(crate) mod testing;
