//! Peer-to-peer dialogs
//!
//! A dialog is a closable request/response channel between the consumer and
//! a provider. The connection manager opens one per connection attempt and
//! runs session negotiation over it.

pub mod http;

use crate::discovery::Contact;
use crate::identity::Identity;
use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpDialogEstablisher;

#[derive(Error, Debug)]
pub enum DialogError {
    #[error("Unsupported contact type: {0}")]
    UnsupportedContact(String),

    #[error("Invalid contact definition: {0}")]
    InvalidContact(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Peer responded with {status}: {body}")]
    PeerStatus { status: u16, body: String },

    #[error("Dialog is closed")]
    Closed,
}

/// An established channel to a peer
#[async_trait]
pub trait Dialog: Send + Sync {
    fn peer_id(&self) -> &Identity;

    /// Sends one request on `endpoint` and waits for the peer's reply
    async fn request(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, DialogError>;

    async fn close(&self) -> Result<(), DialogError>;
}

/// Opens dialogs on behalf of one local identity
#[async_trait]
pub trait DialogEstablisher: Send + Sync {
    async fn create_dialog(
        &self,
        peer: &Identity,
        contact: &Contact,
    ) -> Result<Box<dyn Dialog>, DialogError>;
}
