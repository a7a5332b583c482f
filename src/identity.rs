//! Node and consumer identities

use serde::{Deserialize, Serialize};
use std::fmt;

/// An identity on the network, addressed by its public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity {
    address: String,
}

impl Identity {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_serializes_as_plain_address() {
        let id = Identity::from_address("0xabc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0xabc\"");

        let parsed: Identity = serde_json::from_str("\"0xdef\"").unwrap();
        assert_eq!(parsed.address(), "0xdef");
    }
}
