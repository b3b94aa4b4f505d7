mod service;
mod session;
mod transport;

pub use service::{
    spawn_heartbeat_sweeper, CreateSessionOptions, SessionConfig, SessionService,
};
pub use session::{
    Participant, ParticipantStatus, Session, SessionMetrics, SessionState,
};
pub use transport::BusVoteTransport;
