//! dVPN client - connection management for a decentralized VPN
//!
//! The client finds a provider's service proposals in a discovery
//! directory, negotiates a session with the provider over a dialog and
//! drives a local OpenVPN process for the negotiated session.
//!
//! # Architecture
//!
//! - `connection`: Connection lifecycle and status (the state machine)
//! - `discovery`: Proposal lookup and selection
//! - `communication`: Dialogs with provider nodes
//! - `session`: Session negotiation over a dialog
//! - `tunnel`: Tunnel adapters (OpenVPN process + management interface)
//! - `stats`: Per-session traffic counters
//! - `config`: Configuration file handling (TOML)

pub mod communication;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod identity;
pub mod session;
pub mod stats;
pub mod tunnel;

pub use config::Config;
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, ConnectionStatus};
pub use identity::Identity;
