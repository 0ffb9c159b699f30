pub mod client;
pub mod stream;

pub use client::{AgentRole, ClientSettings, OpenRouterClient};
pub use stream::{SseBuffer, StreamEvent, StreamState, STALL_MARKER};
