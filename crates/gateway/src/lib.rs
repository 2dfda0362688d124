//! The parley WebSocket gateway.
//!
//! Hosts the per-connection session state machine and its collaborators: the
//! connection registry, the distributed rate limiter, the history buffer, and
//! the LLM streaming bridge. One task owns each connection; a bounded
//! per-connection channel is the sole writer to its transport.

pub mod error;
pub mod registry;
pub mod repo;
pub mod server;
pub mod session;
pub mod state;

pub use {
    registry::{ConnectionSnapshot, ConnectionState, Outbound, Registry, RegistryEvent},
    repo::{MemoryMessageRepository, MessageRepository, NoopMessageRepository},
    server::{build_app, serve},
    state::GatewayState,
};
