//! Proposal and contact selection policy

use super::{Contact, ServiceProposal};

/// The proposal chosen for a connection attempt, and the contact to dial
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub proposal: ServiceProposal,
    pub contact: Contact,
}

/// Chooses which proposal and contact a connection attempt uses.
///
/// Returns `None` when nothing usable was offered.
pub trait ProposalSelector: Send + Sync {
    fn select(&self, proposals: &[ServiceProposal]) -> Option<Selection>;
}

/// Takes the first proposal and its first contact
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstProposal;

impl ProposalSelector for FirstProposal {
    fn select(&self, proposals: &[ServiceProposal]) -> Option<Selection> {
        let proposal = proposals.first()?;
        let contact = proposal.provider_contacts.first()?;
        Some(Selection {
            proposal: proposal.clone(),
            contact: contact.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(address: &str) -> Contact {
        Contact {
            kind: "http/v1".to_string(),
            definition: serde_json::json!({ "address": address }),
        }
    }

    #[test]
    fn test_first_proposal_and_first_contact() {
        let proposals = vec![
            ServiceProposal {
                id: 1,
                provider_id: "p".to_string(),
                service_type: "openvpn".to_string(),
                provider_contacts: vec![contact("http://c1"), contact("http://c2")],
            },
            ServiceProposal {
                id: 2,
                provider_id: "p".to_string(),
                service_type: "openvpn".to_string(),
                provider_contacts: vec![contact("http://c3")],
            },
        ];

        let selection = FirstProposal.select(&proposals).unwrap();
        assert_eq!(selection.proposal.id, 1);
        assert_eq!(selection.contact, contact("http://c1"));
    }

    #[test]
    fn test_nothing_selected_without_contacts() {
        let proposals = vec![ServiceProposal {
            id: 1,
            provider_id: "p".to_string(),
            service_type: "openvpn".to_string(),
            provider_contacts: vec![],
        }];

        assert!(FirstProposal.select(&proposals).is_none());
        assert!(FirstProposal.select(&[]).is_none());
    }
}
