use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;
use crate::did::Did;
use crate::locker::Locker;

/// The role of an identity within an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityType {
    /// The account's root identity; its DID equals the account id
    Root,
    /// A public, verified identity
    Verinym,
    /// A public but unverified identity
    Persona,
    /// A machine counterpart of another identity
    DigitalTwin,
    /// A private identity used with exactly one correspondent
    #[serde(rename = "PairwiseIdentity")]
    Pairwise,
    /// A single-use identity
    #[serde(rename = "AnonymousIdentity")]
    Anonymous,
}

/// An identity owned by a wallet
///
/// Identities are created by the wallet and live until the account is
/// deleted; the only mutation they undergo is transient hydration of the
/// DID with its signing key after an unlock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub did: Did,
    pub created: DateTime<Utc>,
    pub name: String,
    #[serde(rename = "type")]
    pub identity_type: IdentityType,
    #[serde(rename = "accessLevel")]
    pub access_level: AccessLevel,
    /// Lockers travelling with the identity; only populated on import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockers: Option<Vec<Locker>>,
}

impl Identity {
    /// Creates a new identity with a fresh DID
    pub fn new(name: impl Into<String>, identity_type: IdentityType, access_level: AccessLevel) -> Self {
        Self {
            did: Did::generate(),
            created: Utc::now(),
            name: name.into(),
            identity_type,
            access_level,
            lockers: None,
        }
    }

    /// The identity's DID string, which is its id
    pub fn id(&self) -> &str {
        self.did.id()
    }

    /// Returns a copy safe to hand to other parties: signing key stripped,
    /// no lockers attached
    pub fn neutered(&self) -> Self {
        Self {
            did: self.did.neuter(),
            lockers: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_identity_owns_its_did() {
        let identity = Identity::new("home", IdentityType::Persona, AccessLevel::Managed);
        assert!(identity.id().starts_with("did:"));
        assert!(!identity.did.is_neutered());
    }

    #[test]
    fn neutered_copy_drops_secrets_and_lockers() {
        let mut identity = Identity::new("home", IdentityType::Root, AccessLevel::Hosted);
        identity.lockers = Some(vec![]);
        let neutered = identity.neutered();
        assert!(neutered.did.is_neutered());
        assert!(neutered.lockers.is_none());
        assert_eq!(neutered.id(), identity.id());
    }

    #[test]
    fn identity_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&IdentityType::Pairwise).unwrap(),
            "\"PairwiseIdentity\""
        );
        assert_eq!(
            serde_json::to_string(&IdentityType::Anonymous).unwrap(),
            "\"AnonymousIdentity\""
        );
        assert_eq!(serde_json::to_string(&IdentityType::Root).unwrap(), "\"Root\"");
    }

    #[test]
    fn identity_roundtrips_as_json() {
        let identity = Identity::new("twin", IdentityType::DigitalTwin, AccessLevel::Hosted);
        let json = serde_json::to_string(&identity).unwrap();
        let restored: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id(), identity.id());
        assert_eq!(restored.identity_type, identity.identity_type);
        assert!(!restored.did.is_neutered());
    }
}
