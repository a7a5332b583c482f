//! Session negotiation over an established dialog
//!
//! One request/response exchange: the consumer asks the provider to create a
//! session for a proposal, the provider answers with the session id and the
//! tunnel configuration to run it with.

use crate::communication::{Dialog, DialogError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const SESSION_CREATE_ENDPOINT: &str = "session-create";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Dialog request failed: {0}")]
    DialogError(#[from] DialogError),

    #[error("Malformed session response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Provider rejected session: {0}")]
    Rejected(String),
}

/// Negotiated session: its id and the opaque tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub config: String,
}

#[derive(Debug, Serialize)]
struct SessionCreateRequest {
    proposal_id: u64,
}

#[derive(Debug, Deserialize)]
struct SessionCreateResponse {
    success: bool,
    #[serde(default)]
    message: String,
    session: Option<SessionDescriptor>,
}

/// Asks the dialog's peer to create a session for `proposal_id`
pub async fn request_session_create(
    dialog: &dyn Dialog,
    proposal_id: u64,
) -> Result<SessionDescriptor, SessionError> {
    let request = serde_json::to_value(SessionCreateRequest { proposal_id })?;
    let reply = dialog.request(SESSION_CREATE_ENDPOINT, request).await?;
    let session = parse_session_response(reply)?;

    info!(
        "Session {} created with {} for proposal {}",
        session.id,
        dialog.peer_id(),
        proposal_id
    );
    Ok(session)
}

fn parse_session_response(reply: serde_json::Value) -> Result<SessionDescriptor, SessionError> {
    let response: SessionCreateResponse = serde_json::from_value(reply)?;

    if !response.success {
        warn!("Session request rejected: {}", response.message);
        return Err(SessionError::Rejected(response.message));
    }

    match response.session {
        Some(session) if !session.id.is_empty() => Ok(session),
        _ => Err(SessionError::Rejected(
            "response carries no session".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedDialog {
        peer: Identity,
        reply: serde_json::Value,
        seen: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl Dialog for ScriptedDialog {
        fn peer_id(&self) -> &Identity {
            &self.peer
        }

        async fn request(
            &self,
            endpoint: &str,
            payload: serde_json::Value,
        ) -> Result<serde_json::Value, DialogError> {
            self.seen.lock().unwrap().push((endpoint.to_string(), payload));
            Ok(self.reply.clone())
        }

        async fn close(&self) -> Result<(), DialogError> {
            Ok(())
        }
    }

    fn dialog(reply: serde_json::Value) -> ScriptedDialog {
        ScriptedDialog {
            peer: Identity::from_address("provider"),
            reply,
            seen: Mutex::new(vec![]),
        }
    }

    #[tokio::test]
    async fn test_session_created() {
        let dialog = dialog(json!({
            "success": true,
            "message": "Everything is great!",
            "session": { "id": "vpn-connection-id", "config": "vpn-connection-config" }
        }));

        let session = request_session_create(&dialog, 42).await.unwrap();

        assert_eq!(
            session,
            SessionDescriptor {
                id: "vpn-connection-id".to_string(),
                config: "vpn-connection-config".to_string(),
            }
        );
        let seen = dialog.seen.lock().unwrap();
        assert_eq!(seen[0].0, SESSION_CREATE_ENDPOINT);
        assert_eq!(seen[0].1, json!({ "proposal_id": 42 }));
    }

    #[tokio::test]
    async fn test_session_rejected() {
        let dialog = dialog(json!({ "success": false, "message": "proposal expired" }));

        let err = request_session_create(&dialog, 1).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(msg) if msg == "proposal expired"));
    }

    #[test]
    fn test_success_without_session_is_rejected() {
        let err = parse_session_response(json!({ "success": true })).unwrap_err();
        assert!(matches!(err, SessionError::Rejected(_)));
    }

    #[test]
    fn test_malformed_response() {
        let err = parse_session_response(json!({ "unexpected": 1 })).unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));
    }
}
