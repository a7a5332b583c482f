//! Client connection lifecycle
//!
//! [`ConnectionManager`] owns at most one connection to a provider and
//! publishes its [`ConnectionStatus`].

pub mod manager;

use crate::communication::DialogError;
use crate::discovery::DiscoveryError;
use crate::session::SessionError;
use crate::tunnel::TunnelError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub use manager::{ConnectionManager, DialogEstablisherFactory};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection already exists")]
    AlreadyExists,

    #[error("No connection exists")]
    NoConnection,

    #[error("Node has no service proposals")]
    NoProposals,

    #[error("Node has no usable contacts")]
    NoContacts,

    #[error("Proposal discovery failed: {0}")]
    Discovery(#[source] DiscoveryError),

    #[error("Dialog creation failed: {0}")]
    Dialog(#[source] DialogError),

    #[error("Session negotiation failed: {0}")]
    SessionNegotiation(#[source] SessionError),

    #[error("Tunnel start failed: {0}")]
    TunnelStart(#[source] TunnelError),

    #[error("Tunnel stop failed: {0}")]
    TunnelStop(#[source] TunnelError),

    #[error("Dialog close failed: {0}")]
    DialogClose(#[source] DialogError),

    #[error("Tunnel exited abnormally: {0}")]
    TunnelExit(#[source] TunnelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::NotConnected => "NotConnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Externally observable connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Empty unless the tunnel reported connected and the state is
    /// `Connected` or `Reconnecting`
    pub session_id: String,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn not_connected() -> Self {
        Self::new(ConnectionState::NotConnected, "")
    }

    pub fn connecting() -> Self {
        Self::new(ConnectionState::Connecting, "")
    }

    pub fn connected(session_id: &str) -> Self {
        Self::new(ConnectionState::Connected, session_id)
    }

    pub fn reconnecting(session_id: &str) -> Self {
        Self::new(ConnectionState::Reconnecting, session_id)
    }

    pub fn disconnecting() -> Self {
        Self::new(ConnectionState::Disconnecting, "")
    }

    fn new(state: ConnectionState, session_id: &str) -> Self {
        Self {
            state,
            session_id: session_id.to_string(),
            last_error: None,
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::not_connected()
    }
}
