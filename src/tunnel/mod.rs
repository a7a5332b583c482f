//! Tunnel adapter boundary
//!
//! A tunnel adapter controls an externally running tunnel process. It is
//! built per session by a [`TunnelFactory`] and reports its lifecycle through
//! a [`TunnelEventSink`]:
//!
//! - `Connecting`: the process is establishing the tunnel
//! - `Connected`: traffic flows through the tunnel
//! - `Reconnecting`: the tunnel dropped and is being re-established
//! - `Exiting`: the process is going away; always the last event

pub mod management;
pub mod openvpn;

use crate::identity::Identity;
use crate::session::SessionDescriptor;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

pub use openvpn::{OpenVpnSettings, OpenVpnTunnel, openvpn_tunnel_factory};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to launch {binary}: {source}")]
    Launch { binary: String, source: io::Error },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Tunnel already started")]
    AlreadyStarted,

    #[error("Tunnel not started")]
    NotStarted,

    #[error("Tunnel process exited with code {0:?}")]
    Exited(Option<i32>),

    #[error("Failed to signal tunnel process: {0}")]
    Signal(String),
}

/// Lifecycle event reported by a tunnel adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected,
    Reconnecting,
    Exiting,
}

/// Sending half of a tunnel's event channel.
///
/// Clones share one emission lock: the exit check and the send happen
/// under it, so once `Exiting` has been delivered every later emission is
/// dropped and `Exiting` is the last event the receiver sees.
#[derive(Clone, Debug)]
pub struct TunnelEventSink {
    tx: mpsc::Sender<TunnelState>,
    exited: Arc<Mutex<bool>>,
}

impl TunnelEventSink {
    /// Creates a sink and the receiver it feeds; `capacity` must be at least 1
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TunnelState>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            exited: Arc::new(Mutex::new(false)),
        };
        (sink, rx)
    }

    pub async fn emit(&self, state: TunnelState) {
        let mut exited = self.exited.lock().await;
        if *exited {
            debug!("Dropping tunnel event {:?} after exit", state);
            return;
        }
        if state == TunnelState::Exiting {
            *exited = true;
        }

        if self.tx.send(state).await.is_err() {
            debug!("Tunnel event {:?} has no listener", state);
        }
    }
}

/// Handle to a tunnel process
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Launches the process; failures are not retried
    async fn start(&self) -> Result<(), TunnelError>;

    /// Requests shutdown; the adapter emits `Exiting` once the process is gone
    async fn stop(&self) -> Result<(), TunnelError>;

    /// Waits until the process has fully exited
    async fn wait(&self) -> Result<(), TunnelError>;
}

/// Builds a tunnel for a negotiated session
pub type TunnelFactory = Arc<
    dyn Fn(&SessionDescriptor, &Identity, TunnelEventSink) -> Result<Box<dyn Tunnel>, TunnelError>
        + Send
        + Sync,
>;
