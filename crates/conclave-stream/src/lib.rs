mod client;
mod event;
mod server;
mod typed;

pub use client::{ClientState, SseClient, SseClientConfig};
pub use event::{parse_frames, SseEvent};
pub use server::{
    spawn_event_pump, spawn_keep_alive, ClientInfo, SseFrame, SseServer, SseServerConfig,
};
pub use typed::{AgentStream, LlmStream, TaskStream};
