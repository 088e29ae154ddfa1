use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

/// Domain-separation key for master node generation
const MASTER_NODE_KEY: &[u8] = b"metalocker seed";

/// First hardened child index
const HARDENED_OFFSET: u32 = 0x8000_0000;

/// An extended node of the hardened-only account hierarchy
///
/// A node is a 64-byte value split into a 32-byte private key and a 32-byte
/// chain code. The master node is obtained from a seed with
/// [`ExtendedNode::new_master`]; children are derived with
/// [`ExtendedNode::derive_hardened`]. The private key doubles as an Ed25519
/// signing key through [`ExtendedNode::signing_key`].
///
/// Only hardened derivation is defined for this hierarchy: there is no
/// public-only child derivation, and [`ExtendedNode::derive_normal`] fails
/// explicitly. Key material is wiped when the node is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedNode {
    key: [u8; 32],
    chain_code: [u8; 32],
    depth: u8,
    child_index: u32,
}

impl ExtendedNode {
    /// Creates the master node from a seed
    ///
    /// The seed must be between 16 and 64 bytes; 32 bytes is the
    /// recommended size. The master node is the HMAC-SHA-512 of the seed
    /// under a fixed domain-separation key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSeedLength`] if the seed is out of bounds.
    pub fn new_master(seed: &[u8]) -> Result<Self> {
        if !(16..=64).contains(&seed.len()) {
            return Err(Error::InvalidSeedLength(seed.len()));
        }
        let mut mac = HmacSha512::new_from_slice(MASTER_NODE_KEY)
            .expect("HMAC accepts keys of any length");
        mac.update(seed);
        let digest = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        let mut chain_code = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            key,
            chain_code,
            depth: 0,
            child_index: 0,
        })
    }

    /// Derives the hardened child node at `index`
    ///
    /// The index is the logical child number; it is offset into the
    /// hardened range (`index + 2^31`) before being fed to the derivation
    /// MAC, so callers always pass values below 2^31.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index >= 2^31`.
    pub fn derive_hardened(&self, index: u32) -> Result<Self> {
        if index >= HARDENED_OFFSET {
            return Err(Error::IndexOutOfRange(index));
        }
        let hardened_index = HARDENED_OFFSET | index;

        let mut mac = HmacSha512::new_from_slice(&self.chain_code)
            .expect("HMAC accepts keys of any length");
        mac.update(&[0u8]);
        mac.update(&self.key);
        mac.update(&hardened_index.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        let mut chain_code = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            key,
            chain_code,
            depth: self.depth + 1,
            child_index: hardened_index,
        })
    }

    /// Non-hardened derivation is unsupported for account nodes
    ///
    /// # Errors
    ///
    /// Always returns [`Error::HardenedDerivationOnly`]. The method exists
    /// so the failure mode is explicit rather than a silent misuse of
    /// [`ExtendedNode::derive_hardened`].
    pub fn derive_normal(&self, _index: u32) -> Result<Self> {
        Err(Error::HardenedDerivationOnly)
    }

    /// Returns the node depth (0 for the master node)
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Returns the (hardened) child index this node was derived at
    pub fn child_index(&self) -> u32 {
        self.child_index
    }

    /// Returns the raw 32-byte private key of this node
    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Returns the Ed25519 signing key view of this node
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.key)
    }

    /// Returns the Ed25519 public key of this node
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }
}

impl core::fmt::Debug for ExtendedNode {
    /// Key material is never printed, only the position in the hierarchy
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtendedNode")
            .field("depth", &self.depth)
            .field("child_index", &self.child_index)
            .finish_non_exhaustive()
    }
}

impl ExtendedNode {
    /// Packs the node into its 69-byte base58 transport form
    ///
    /// Layout: `key(32) || chain_code(32) || depth(1) || BE32(child_index)`.
    /// The transport form only ever travels inside encrypted payloads.
    pub fn to_base58(&self) -> String {
        let mut bytes = zeroize::Zeroizing::new([0u8; 69]);
        bytes[..32].copy_from_slice(&self.key);
        bytes[32..64].copy_from_slice(&self.chain_code);
        bytes[64] = self.depth;
        bytes[65..].copy_from_slice(&self.child_index.to_be_bytes());
        bs58::encode(bytes.as_slice()).into_string()
    }

    /// Unpacks a node from its base58 transport form
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKeyMaterial`] if the input is not base58 of
    /// exactly 69 bytes.
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = zeroize::Zeroizing::new(
            bs58::decode(s)
                .into_vec()
                .map_err(|_| Error::InvalidKeyMaterial("node form is not base58"))?,
        );
        if bytes.len() != 69 {
            return Err(Error::InvalidKeyMaterial("node form has a wrong length"));
        }
        let mut key = [0u8; 32];
        let mut chain_code = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        chain_code.copy_from_slice(&bytes[32..64]);
        let child_index = u32::from_be_bytes(bytes[65..].try_into().expect("4 bytes remain"));
        Ok(Self {
            key,
            chain_code,
            depth: bytes[64],
            child_index,
        })
    }
}

impl serde::Serialize for ExtendedNode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> serde::Deserialize<'de> for ExtendedNode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(serde::de::Error::custom)
    }
}
