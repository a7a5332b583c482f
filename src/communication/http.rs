//! HTTP/JSON dialog transport
//!
//! Used for providers advertising an `http/v1` contact. Each request is a
//! JSON POST to `{address}/dialog/{endpoint}`; the caller and peer identities
//! travel in headers.

use super::{Dialog, DialogError, DialogEstablisher};
use crate::discovery::Contact;
use crate::identity::Identity;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub const CONTACT_TYPE: &str = "http/v1";

const CALLER_HEADER: &str = "X-Dialog-Caller";
const PEER_HEADER: &str = "X-Dialog-Peer";

pub struct HttpDialogEstablisher {
    http: Client,
    caller: Identity,
}

impl HttpDialogEstablisher {
    pub fn new(caller: Identity) -> Self {
        Self::with_client(Client::new(), caller)
    }

    pub fn with_client(http: Client, caller: Identity) -> Self {
        Self { http, caller }
    }
}

#[async_trait]
impl DialogEstablisher for HttpDialogEstablisher {
    async fn create_dialog(
        &self,
        peer: &Identity,
        contact: &Contact,
    ) -> Result<Box<dyn Dialog>, DialogError> {
        let address = contact_address(contact)?;
        info!("Opening dialog with {} at {}", peer, address);

        Ok(Box::new(HttpDialog {
            http: self.http.clone(),
            caller: self.caller.clone(),
            peer: peer.clone(),
            address,
            closed: AtomicBool::new(false),
        }))
    }
}

struct HttpDialog {
    http: Client,
    caller: Identity,
    peer: Identity,
    address: String,
    closed: AtomicBool,
}

#[async_trait]
impl Dialog for HttpDialog {
    fn peer_id(&self) -> &Identity {
        &self.peer
    }

    async fn request(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, DialogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DialogError::Closed);
        }

        let url = format!("{}/dialog/{}", self.address, endpoint);
        debug!("Dialog request to {}: {}", url, payload);

        let response = self
            .http
            .post(&url)
            .header(CALLER_HEADER, self.caller.address())
            .header(PEER_HEADER, self.peer.address())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DialogError::PeerStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    async fn close(&self) -> Result<(), DialogError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DialogError::Closed);
        }
        debug!("Dialog with {} closed", self.peer);
        Ok(())
    }
}

/// Extracts the base URL from an `http/v1` contact
fn contact_address(contact: &Contact) -> Result<String, DialogError> {
    if contact.kind != CONTACT_TYPE {
        return Err(DialogError::UnsupportedContact(contact.kind.clone()));
    }

    let address = contact
        .definition
        .get("address")
        .and_then(|a| a.as_str())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| DialogError::InvalidContact("missing address".to_string()))?;

    Ok(address.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_contact(definition: serde_json::Value) -> Contact {
        Contact {
            kind: CONTACT_TYPE.to_string(),
            definition,
        }
    }

    #[test]
    fn test_contact_address() {
        let contact = http_contact(json!({ "address": "http://10.1.1.1:4050/" }));
        assert_eq!(contact_address(&contact).unwrap(), "http://10.1.1.1:4050");
    }

    #[test]
    fn test_contact_wrong_type() {
        let contact = Contact {
            kind: "nats/v1".to_string(),
            definition: json!({ "broker_addresses": ["nats://a"] }),
        };
        assert!(matches!(
            contact_address(&contact),
            Err(DialogError::UnsupportedContact(kind)) if kind == "nats/v1"
        ));
    }

    #[test]
    fn test_contact_missing_address() {
        assert!(matches!(
            contact_address(&http_contact(json!({}))),
            Err(DialogError::InvalidContact(_))
        ));
        assert!(matches!(
            contact_address(&http_contact(json!({ "address": "" }))),
            Err(DialogError::InvalidContact(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_dialog_rejects_requests() {
        let establisher = HttpDialogEstablisher::new(Identity::from_address("me"));
        let dialog = establisher
            .create_dialog(
                &Identity::from_address("peer"),
                &http_contact(json!({ "address": "http://127.0.0.1:9" })),
            )
            .await
            .unwrap();

        assert_eq!(dialog.peer_id().address(), "peer");
        dialog.close().await.unwrap();

        assert!(matches!(
            dialog.request("session-create", json!({})).await,
            Err(DialogError::Closed)
        ));
        assert!(matches!(dialog.close().await, Err(DialogError::Closed)));
    }
}
