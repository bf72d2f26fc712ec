//! Agent hub: the NDJSON transport between the control plane and its agents.

pub mod connection;
pub mod frame;
pub mod listener;

#[cfg(test)]
mod connection_tests;

pub use connection::AgentHub;
pub use listener::serve;

use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Protocol(#[from] tether_core::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
