use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};

/// Default scrypt cost: N = 2^11 = 2048
const DEFAULT_LOG_N: u8 = 11;
const DEFAULT_R: u32 = 8;
const DEFAULT_P: u32 = 1;
const DEFAULT_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// A password-derived 32-byte master key
///
/// Master keys wrap the payload key of a secret store. They are derived,
/// used and dropped; the bytes are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl core::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

/// The parameters of a password-derived master key
///
/// The parameters travel next to the ciphertext they protect, so the
/// derivation cost can be raised for new accounts without invalidating
/// existing ones: decryption always uses the stored parameters, never the
/// current defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyParams {
    /// Random salt, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    /// scrypt CPU/memory cost as log2(N)
    pub log_n: u8,
    /// scrypt block size
    pub r: u32,
    /// scrypt parallelism
    pub p: u32,
    /// Derived key length in bytes
    pub key_len: usize,
}

impl MasterKeyParams {
    /// Creates parameters with a fresh random salt and the current default
    /// cost
    pub fn generate() -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), salt.as_mut_slice());
        Self {
            salt,
            log_n: DEFAULT_LOG_N,
            r: DEFAULT_R,
            p: DEFAULT_P,
            key_len: DEFAULT_KEY_LEN,
        }
    }

    /// Derives the master key for `passphrase` under these parameters
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMasterKeyParams`] if the stored parameters
    /// are not a valid scrypt configuration or the key length is not 32
    /// bytes.
    pub fn derive(&self, passphrase: &[u8]) -> Result<MasterKey> {
        if self.key_len != DEFAULT_KEY_LEN {
            return Err(Error::InvalidMasterKeyParams("unsupported key length"));
        }
        let params = scrypt::Params::new(self.log_n, self.r, self.p, self.key_len)
            .map_err(|_| Error::InvalidMasterKeyParams("invalid scrypt cost"))?;
        let mut out = [0u8; 32];
        scrypt::scrypt(passphrase, &self.salt, &params, &mut out)
            .map_err(|_| Error::InvalidMasterKeyParams("invalid output length"))?;
        Ok(MasterKey(out))
    }
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let params = MasterKeyParams::generate();
        let k1 = params.derive(b"correct horse").unwrap();
        let k2 = params.derive(b"correct horse").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let k3 = params.derive(b"wrong horse").unwrap();
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn fresh_salts_give_fresh_keys() {
        let p1 = MasterKeyParams::generate();
        let p2 = MasterKeyParams::generate();
        assert_ne!(p1.salt, p2.salt);
        assert_ne!(
            p1.derive(b"pass").unwrap().as_bytes(),
            p2.derive(b"pass").unwrap().as_bytes()
        );
    }

    #[test]
    fn params_roundtrip_as_json() {
        let params = MasterKeyParams::generate();
        let json = serde_json::to_string(&params).unwrap();
        let restored: MasterKeyParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, restored);
        assert_eq!(
            params.derive(b"pass").unwrap().as_bytes(),
            restored.derive(b"pass").unwrap().as_bytes()
        );
    }

    #[test]
    fn stored_cost_is_honoured_over_defaults() {
        // A params blob written with a lower cost still derives, even if
        // the defaults move
        let params = MasterKeyParams {
            salt: vec![7u8; 16],
            log_n: 10,
            r: 8,
            p: 1,
            key_len: 32,
        };
        assert!(params.derive(b"pass").is_ok());

        let bad = MasterKeyParams {
            key_len: 16,
            ..params.clone()
        };
        assert!(bad.derive(b"pass").is_err());
    }
}
