use core::fmt::Display;
use core::str::FromStr;

use bitcoin::bip32::{ChildNumber, ExtendedPrivKey, ExtendedPubKey};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Largest valid non-hardened child index
const MAX_RECORD_INDEX: u32 = 0x7FFF_FFFF;

/// Serialization tag for locker root keys
///
/// Extended secp256k1 keys carry a network marker in their base58 form. The
/// keys of this crate never touch a coin network; the marker is pinned and
/// never interpreted.
const KEY_NETWORK: Network = Network::Bitcoin;

/// The extended private root key of a locker participant
///
/// Derived from the participant's 32-byte locker seed. Per-record signing
/// keys are non-hardened children of this root, so the holder of the
/// matching [`LockerRootPub`] can enumerate the same public keys without
/// ever seeing private material. The inner key material is overwritten when
/// the value is dropped.
pub struct LockerRootKey(ExtendedPrivKey);

/// The shareable, neutered form of a [`LockerRootKey`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct LockerRootPub(ExtendedPubKey);

/// A per-record secp256k1 keypair derived at a non-hardened index
///
/// The compressed public key doubles as the record routing key on the
/// ledger; the private half seals the record and backs its authorising
/// commitment.
pub struct RecordKeyPair {
    index: u32,
    secret: SecretKey,
    public: PublicKey,
}

impl LockerRootKey {
    /// Builds the participant root from a 32-byte locker seed
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSeedLength`] if the seed is not 32 bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if seed.len() != 32 {
            return Err(Error::InvalidSeedLength(seed.len()));
        }
        Ok(Self(ExtendedPrivKey::new_master(KEY_NETWORK, seed)?))
    }

    /// Returns the neutered form suitable for sharing with other participants
    pub fn neuter(&self) -> LockerRootPub {
        let secp = Secp256k1::new();
        LockerRootPub(ExtendedPubKey::from_priv(&secp, &self.0))
    }

    /// Derives the record keypair at the non-hardened index `index`
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is in the hardened
    /// range.
    pub fn derive_record(&self, index: u32) -> Result<RecordKeyPair> {
        log::debug!("LockerRootKey::derive_record - index={index}");
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|_| Error::IndexOutOfRange(index))?;
        let secp = Secp256k1::new();
        let derived = self.0.ckd_priv(&secp, child)?;
        let public = derived.private_key.public_key(&secp);
        Ok(RecordKeyPair {
            index,
            secret: derived.private_key,
            public,
        })
    }
}

impl LockerRootPub {
    /// Derives the compressed record public key at `index`
    ///
    /// This is the scanner-side counterpart of
    /// [`LockerRootKey::derive_record`]: the same index yields the same
    /// public key on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is in the hardened
    /// range.
    pub fn derive_record(&self, index: u32) -> Result<[u8; 33]> {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|_| Error::IndexOutOfRange(index))?;
        let secp = Secp256k1::new();
        let derived = self.0.ckd_pub(&secp, child)?;
        Ok(derived.public_key.serialize())
    }

    /// Returns the compressed serialization of the root public key itself
    ///
    /// This is the value the pairwise shared-secret derivation is computed
    /// over.
    pub fn compressed(&self) -> [u8; 33] {
        self.0.public_key.serialize()
    }
}

impl RecordKeyPair {
    /// The non-hardened index this pair was derived at
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The record routing key: the 33-byte compressed public key
    pub fn routing_key(&self) -> [u8; 33] {
        self.public.serialize()
    }

    /// Returns the raw private scalar
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// Signs a 32-byte digest with the record private key (compact ECDSA)
    pub fn sign_digest(&self, digest: [u8; 32]) -> [u8; 64] {
        let secp = Secp256k1::new();
        let msg = Message::from_slice(&digest).expect("digest is 32 bytes");
        secp.sign_ecdsa(&msg, &self.secret).serialize_compact()
    }
}

/// Verifies a compact ECDSA record signature against a routing key
///
/// Returns `false` for malformed signatures or routing keys as well as for
/// honest verification failures; callers only care that the record cannot
/// be attributed to the key.
pub fn verify_record_signature(digest: [u8; 32], signature: &[u8], routing_key: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(msg) = Message::from_slice(&digest) else {
        return false;
    };
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    let Ok(key) = PublicKey::from_slice(routing_key) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &key).is_ok()
}

/// Draws a random non-hardened record index
pub fn random_record_index() -> u32 {
    rand::random::<u32>() & MAX_RECORD_INDEX
}

impl Drop for LockerRootKey {
    fn drop(&mut self) {
        // Overwrite the extended key material in place
        if let Ok(dummy) = ExtendedPrivKey::new_master(KEY_NETWORK, &[0xFFu8; 32]) {
            self.0 = dummy;
        }
    }
}

impl Clone for LockerRootKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl core::fmt::Debug for LockerRootKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockerRootKey").finish_non_exhaustive()
    }
}

impl Display for LockerRootKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

impl Display for LockerRootPub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<LockerRootPub> for String {
    fn from(value: LockerRootPub) -> Self {
        value.to_string()
    }
}

impl FromStr for LockerRootKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(ExtendedPrivKey::from_str(s)?))
    }
}

impl FromStr for LockerRootPub {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(ExtendedPubKey::from_str(s)?))
    }
}

impl Serialize for LockerRootKey {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LockerRootKey {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for LockerRootPub {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
