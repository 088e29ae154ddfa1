use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use metalocker_keys::{AesKey, LockerRootKey, LockerRootPub, RecordKeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512_256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::access::AccessLevel;
use crate::errors::{Error, Result};
use crate::expiry::Expiry;
use crate::utils::random_id;

/// Domain prefix of the per-record symmetric key derivation
const SYMMETRIC_KEY_PREFIX: &[u8] = b"Symmetrical key";

/// The pairwise shared secret of a locker
///
/// All participants of a locker compute the same 32-byte value from each
/// other's root public keys; it seeds every per-record symmetric key.
/// Wiped on drop; base64 on the wire.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl core::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl Serialize for SharedSecret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for SharedSecret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes of shared secret"))?;
        Ok(Self(bytes))
    }
}

/// A party joining a locker at generation time
///
/// Each party contributes a 32-byte seed for its root key; a fresh one is
/// drawn when none is given (the usual case when generating a locker on
/// behalf of both sides).
#[derive(Debug, Clone)]
pub struct Party {
    pub did: String,
    pub seed: Option<[u8; 32]>,
    pub us: bool,
}

impl Party {
    /// The party operating this wallet
    pub fn us(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            seed: None,
            us: true,
        }
    }

    /// A counterparty
    pub fn them(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            seed: None,
            us: false,
        }
    }

    pub fn with_seed(mut self, seed: [u8; 32]) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// One participant of a locker
///
/// The participant's extended public root key is the anchor the scanner
/// matches routing keys against; the private root is only present for the
/// wallet's own participant (or for all participants while the locker has
/// not yet been split into perspectives).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockerParticipant {
    pub id: String,
    #[serde(rename = "self", default)]
    pub self_: bool,
    #[serde(rename = "sharedSecret")]
    pub shared_secret: SharedSecret,
    #[serde(rename = "rootPublicKey")]
    pub root_public_key: LockerRootPub,
    #[serde(
        rename = "rootPrivateKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub root_private_key: Option<LockerRootKey>,
}

impl LockerParticipant {
    /// Derives the per-record keypair at `index`; requires the private root
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForbiddenOperation`] when this participant view
    /// holds no private root key.
    pub fn derive_record(&self, index: u32) -> Result<RecordKeyPair> {
        let root = self
            .root_private_key
            .as_ref()
            .ok_or(Error::ForbiddenOperation)?;
        Ok(root.derive_record(index)?)
    }

    /// Derives the routing key this participant would use at `index`
    pub fn derive_routing_key(&self, index: u32) -> Result<[u8; 33]> {
        Ok(self.root_public_key.derive_record(index)?)
    }

    /// The symmetric AES key protecting the record behind `routing_key`
    ///
    /// `SHA-256("Symmetrical key" || shared_secret || routing_key)`. Any
    /// participant of the locker derives the same key from the same
    /// routing key.
    pub fn record_symmetric_key(&self, routing_key: &[u8]) -> AesKey {
        let mut hasher = Sha256::new();
        hasher.update(SYMMETRIC_KEY_PREFIX);
        hasher.update(self.shared_secret.as_bytes());
        hasher.update(routing_key);
        AesKey::from_bytes(hasher.finalize().into())
    }
}

/// A symmetric, append-only communication channel between participants
///
/// A locker is defined by its participants and their pairwise shared
/// secret. A *uni-locker* has a single participant who is both producer
/// and consumer. Secrets held by the locker are wiped when it is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Locker {
    pub id: String,
    pub name: String,
    #[serde(rename = "accessLevel")]
    pub access_level: AccessLevel,
    pub created: DateTime<Utc>,
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Expiry::is_never")]
    pub expires_at: Expiry,
    #[serde(rename = "firstBlock")]
    pub first_block: u64,
    #[serde(
        rename = "acceptedAtBlock",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub accepted_at_block: Option<u64>,
    pub participants: Vec<LockerParticipant>,
}

/// Options for [`Locker::new`]
#[derive(Debug, Clone, Default)]
pub struct LockerOptions {
    pub expires_at: Expiry,
    pub first_block: u64,
}

impl Locker {
    /// Generates a locker for the given parties
    ///
    /// Seeds not supplied by a party are drawn fresh. All participants of
    /// the generated value carry their private root keys; use
    /// [`Locker::perspective`] to produce the copy each party actually
    /// keeps or transmits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocker`] if there are no parties, more than
    /// two, or more than one marked as us. A locker with no `us` party is
    /// third-party-delegated and valid.
    pub fn new(
        name: impl Into<String>,
        access_level: AccessLevel,
        parties: Vec<Party>,
        options: LockerOptions,
    ) -> Result<Self> {
        if parties.is_empty() || parties.len() > 2 {
            return Err(Error::InvalidLocker(
                "a locker has one or two participants",
            ));
        }
        if parties.iter().filter(|p| p.us).count() > 1 {
            return Err(Error::InvalidLocker("at most one participant is us"));
        }

        let roots = parties
            .iter()
            .map(|party| {
                let seed = party.seed.unwrap_or_else(rand::random);
                LockerRootKey::from_seed(&seed)
            })
            .collect::<core::result::Result<Vec<_>, _>>()?;

        let shared_secret = pairwise_shared_secret(
            &roots[0].neuter(),
            &roots.last().expect("at least one party").neuter(),
        );

        let participants = parties
            .iter()
            .zip(roots)
            .map(|(party, root)| LockerParticipant {
                id: party.did.clone(),
                self_: party.us,
                shared_secret: shared_secret.clone(),
                root_public_key: root.neuter(),
                root_private_key: Some(root),
            })
            .collect();

        Ok(Self {
            id: random_id(32),
            name: name.into(),
            access_level,
            created: Utc::now(),
            expires_at: options.expires_at,
            first_block: options.first_block,
            accepted_at_block: None,
            participants,
        })
    }

    /// A uni-locker has a single participant: producer equals consumer
    pub fn is_uni(&self) -> bool {
        self.participants.len() == 1
    }

    /// The participant marked as ourselves, if any
    pub fn us(&self) -> Option<&LockerParticipant> {
        self.participants.iter().find(|p| p.self_)
    }

    /// Looks up a participant by DID
    pub fn participant(&self, id: &str) -> Option<&LockerParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Returns the locker as seen by `participant_id`
    ///
    /// The copy keeps every participant's key material but flips the
    /// `self` flags so that only `participant_id` is marked. Transmitting
    /// the perspective to that party and importing it there yields an
    /// identical locker from the recipient's viewpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLocker`] if `participant_id` is not a
    /// participant.
    pub fn perspective(&self, participant_id: &str) -> Result<Self> {
        if self.participant(participant_id).is_none() {
            return Err(Error::InvalidLocker("unknown participant"));
        }
        let mut copy = self.clone();
        for participant in &mut copy.participants {
            participant.self_ = participant.id == participant_id;
        }
        Ok(copy)
    }

    /// True once the locker has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_expired(now)
    }
}

/// Computes the pairwise shared secret of two participant root keys
///
/// `SHA-512/256(min(pub_a, pub_b) || max(pub_a, pub_b))` over the 33-byte
/// compressed root public keys. The ordering makes the value symmetric;
/// for a uni-locker the participant's own key appears twice.
pub fn pairwise_shared_secret(a: &LockerRootPub, b: &LockerRootPub) -> SharedSecret {
    let ka = a.compressed();
    let kb = b.compressed();
    let (lo, hi) = if ka <= kb { (ka, kb) } else { (kb, ka) };
    let mut hasher = Sha512_256::new();
    hasher.update(lo);
    hasher.update(hi);
    SharedSecret(hasher.finalize().into())
}
