//! Service proposal discovery
//!
//! Providers advertise service proposals in a directory service. The
//! connection manager only needs one operation from it: list the proposals a
//! given provider currently offers.

pub mod client;
pub mod select;

use crate::identity::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub use client::DiscoveryClient;
pub use select::{FirstProposal, ProposalSelector, Selection};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Discovery service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid proposals response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// A way to reach a provider, e.g. a broker address or an HTTP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub definition: serde_json::Value,
}

/// A provider's advertised willingness to serve tunnel sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProposal {
    pub id: u64,
    pub provider_id: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub provider_contacts: Vec<Contact>,
}

/// Source of service proposals
#[async_trait]
pub trait ProposalResolver: Send + Sync {
    /// Returns every proposal of the provider; an empty list is not an error
    async fn find_proposals(
        &self,
        provider: &Identity,
    ) -> Result<Vec<ServiceProposal>, DiscoveryError>;
}

/// Resolver backed by proposals registered in memory
#[derive(Default)]
pub struct InMemoryProposals {
    proposals: Mutex<Vec<ServiceProposal>>,
}

impl InMemoryProposals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, proposal: ServiceProposal) {
        self.proposals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(proposal);
    }
}

#[async_trait]
impl ProposalResolver for InMemoryProposals {
    async fn find_proposals(
        &self,
        provider: &Identity,
    ) -> Result<Vec<ServiceProposal>, DiscoveryError> {
        let proposals = self.proposals.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(proposals
            .iter()
            .filter(|p| p.provider_id == provider.address())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(id: u64, provider: &str) -> ServiceProposal {
        ServiceProposal {
            id,
            provider_id: provider.to_string(),
            service_type: "openvpn".to_string(),
            provider_contacts: vec![],
        }
    }

    #[tokio::test]
    async fn test_in_memory_filters_by_provider() {
        let registry = InMemoryProposals::new();
        registry.register(proposal(1, "node-a"));
        registry.register(proposal(2, "node-b"));
        registry.register(proposal(3, "node-a"));

        let found = registry
            .find_proposals(&Identity::from_address("node-a"))
            .await
            .unwrap();

        let ids: Vec<u64> = found.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_in_memory_unknown_provider_is_empty() {
        let registry = InMemoryProposals::new();
        let found = registry
            .find_proposals(&Identity::from_address("nobody"))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_parse_proposal_json() {
        let json = r#"{
            "id": 7,
            "format": "service-proposal/v1",
            "provider_id": "0x1",
            "service_type": "openvpn",
            "provider_contacts": [
                {"type": "http/v1", "definition": {"address": "http://10.0.0.1:4050"}}
            ]
        }"#;

        let proposal: ServiceProposal = serde_json::from_str(json).unwrap();
        assert_eq!(proposal.id, 7);
        assert_eq!(proposal.provider_contacts.len(), 1);
        assert_eq!(proposal.provider_contacts[0].kind, "http/v1");
        assert_eq!(
            proposal.provider_contacts[0].definition["address"],
            "http://10.0.0.1:4050"
        );
    }
}
