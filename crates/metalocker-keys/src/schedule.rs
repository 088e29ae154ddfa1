use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::node::ExtendedNode;

/// Domain prefix for the hosted crypto key
const CRYPTO_KEY_PREFIX: &[u8] = b"crypto key";
/// Domain prefix for the managed demotion of the hosted crypto key
const MANAGED_KEY_PREFIX: &[u8] = b"managed key";

macro_rules! key32_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Base64 transport form
            pub fn to_base64(&self) -> String {
                BASE64.encode(self.0)
            }

            /// Parses the base64 transport form
            pub fn from_base64(s: &str) -> Option<Self> {
                let bytes = BASE64.decode(s.as_bytes()).ok()?;
                let bytes: [u8; 32] = bytes.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::from_base64(&s).ok_or_else(|| {
                    serde::de::Error::custom(concat!(
                        "expected base64 of 32 bytes for ",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

key32_type! {
    /// A 256-bit AES-GCM key
    ///
    /// Used for envelope bodies, lease encryption, secret-store payloads
    /// and access-key material. Wiped on drop; base64 on the wire.
    AesKey
}

key32_type! {
    /// A 256-bit HMAC-SHA-512/256 key used for blind entity-id hashing
    HmacKey
}

/// Derives the hosted crypto key of an account root node
///
/// `SHA-256("crypto key" || node_private_key)`. The hosted crypto key wraps
/// the hosted secret-store payload.
pub fn hosted_crypto_key(node: &ExtendedNode) -> AesKey {
    let mut hasher = Sha256::new();
    hasher.update(CRYPTO_KEY_PREFIX);
    hasher.update(node.key_bytes());
    AesKey(hasher.finalize().into())
}

/// Demotes a hosted crypto key to the managed crypto key
///
/// `SHA-256("managed key" || hosted_key)`. The demotion is one-way: a
/// managed-only client derives the same managed key the hosted owner does,
/// but can never climb back to the hosted key.
pub fn managed_crypto_key(hosted: &AesKey) -> AesKey {
    let mut hasher = Sha256::new();
    hasher.update(MANAGED_KEY_PREFIX);
    hasher.update(hosted.as_bytes());
    AesKey(hasher.finalize().into())
}

/// Generates a fresh random envelope encryption key
pub fn generate_encryption_key() -> AesKey {
    AesKey(rand::random())
}

/// Generates a fresh random id-hashing key
pub fn generate_hmac_key() -> HmacKey {
    HmacKey(rand::random())
}

/// Draws a random hardened derivation index for a new sub-account
pub fn new_derivation_index() -> u32 {
    rand::random::<u32>() & 0x7FFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_key_chain_is_deterministic() {
        let node = ExtendedNode::new_master(&[3u8; 32]).unwrap();
        let hosted1 = hosted_crypto_key(&node);
        let hosted2 = hosted_crypto_key(&node);
        assert_eq!(hosted1, hosted2);

        let managed1 = managed_crypto_key(&hosted1);
        let managed2 = managed_crypto_key(&hosted2);
        assert_eq!(managed1, managed2);
        assert_ne!(hosted1, managed1);
    }

    #[test]
    fn demotion_matches_across_nodes_only_for_same_root() {
        let node_a = ExtendedNode::new_master(&[3u8; 32]).unwrap();
        let node_b = ExtendedNode::new_master(&[4u8; 32]).unwrap();
        assert_ne!(
            managed_crypto_key(&hosted_crypto_key(&node_a)),
            managed_crypto_key(&hosted_crypto_key(&node_b))
        );
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(generate_encryption_key(), generate_encryption_key());
        let h1 = generate_hmac_key();
        let h2 = generate_hmac_key();
        assert_ne!(h1.as_bytes(), h2.as_bytes());
    }

    #[test]
    fn base64_transport_roundtrip() {
        let key = generate_encryption_key();
        let restored = AesKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, restored);
        assert!(AesKey::from_base64("too short").is_none());
    }

    #[test]
    fn derivation_index_is_hardened_range_compatible() {
        for _ in 0..64 {
            assert!(new_derivation_index() < 0x8000_0000);
        }
    }
}
