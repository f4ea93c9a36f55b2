//! Agent/controller session protocol.
//!
//! The protocol core ([`service::AgentService`]) only sees channels: an
//! inbound stream of [`AgentFrame`]s, an outbound stream of
//! [`ControllerFrame`]s and a cancellation token. The shipped transport
//! ([`server`], [`client`]) carries those frames as JSON lines over
//! mutual TLS.
//!
//! [`AgentFrame`]: vertera_proto::AgentFrame
//! [`ControllerFrame`]: vertera_proto::ControllerFrame

pub mod client;
mod framing;
pub mod server;
pub mod service;

pub use client::{Reporter, SessionClient};
pub use server::SessionServer;
pub use service::AgentService;

/// Frames buffered per direction on each session.
pub const SESSION_BUFFER: usize = 64;

/// Session failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Connect, handshake or socket IO failed.
    #[error("Session transport error: {0}")]
    Transport(String),

    /// The peer sent something the protocol does not allow.
    #[error("Session protocol error: {0}")]
    Protocol(String),

    /// The other side went away.
    #[error("Session closed")]
    Closed,
}
