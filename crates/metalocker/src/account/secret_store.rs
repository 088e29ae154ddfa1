use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use metalocker_keys::{AesKey, ExtendedNode, HmacKey, MasterKeyParams};
use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;
use crate::envelope::{decrypt_aes_gcm, encrypt_aes_gcm};
use crate::errors::{Error, Result};
use crate::identity::Identity;

/// The cleartext content of a secret store
///
/// The managed payload is a strict subset of the hosted one: hosted-only
/// fields stay `None` in a managed store. The account root key only ever
/// appears here, inside the encrypted hosted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStorePayload {
    #[serde(rename = "managedHMACKey")]
    pub managed_hmac_key: HmacKey,
    #[serde(rename = "managedEncryptionKey")]
    pub managed_encryption_key: AesKey,
    #[serde(rename = "hostedHMACKey", default, skip_serializing_if = "Option::is_none")]
    pub hosted_hmac_key: Option<HmacKey>,
    #[serde(
        rename = "hostedEncryptionKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hosted_encryption_key: Option<AesKey>,
    #[serde(rename = "accountRootKey", default, skip_serializing_if = "Option::is_none")]
    pub account_root_key: Option<ExtendedNode>,
    #[serde(
        rename = "managedRootLocker",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub managed_root_locker: Option<String>,
    #[serde(
        rename = "hostedRootLocker",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hosted_root_locker: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<Identity>,
}

impl SecretStorePayload {
    /// The managed subset of this payload
    pub fn managed_subset(&self) -> Self {
        Self {
            hosted_hmac_key: None,
            hosted_encryption_key: None,
            account_root_key: None,
            hosted_root_locker: None,
            ..self.clone()
        }
    }
}

/// An encrypted secret store
///
/// Three layers: the payload is gzip-then-AEAD under the payload key; the
/// payload key is wrapped by a password-derived master key whose
/// parameters travel alongside. Changing the passphrase re-wraps the
/// payload key but never touches the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStore {
    #[serde(rename = "accessLevel")]
    pub access_level: AccessLevel,
    #[serde(rename = "masterKeyParams")]
    pub master_key_params: MasterKeyParams,
    #[serde(rename = "encryptedPayloadKey")]
    pub encrypted_payload_key: String,
    #[serde(rename = "encryptedPayload")]
    pub encrypted_payload: String,
}

impl SecretStore {
    /// Seals `payload` under `payload_key`, wrapping the key for
    /// `passphrase`
    pub fn seal(
        access_level: AccessLevel,
        payload: &SecretStorePayload,
        payload_key: &AesKey,
        passphrase: &str,
    ) -> Result<Self> {
        let master_key_params = MasterKeyParams::generate();
        let master_key = master_key_params.derive(passphrase.as_bytes())?;
        let wrapping_key = AesKey::from_bytes(*master_key.as_bytes());
        let encrypted_payload_key =
            BASE64.encode(encrypt_aes_gcm(&wrapping_key, payload_key.as_bytes())?);

        let json = serde_json::to_vec(payload)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&json)
            .map_err(|e| Error::Unknown(format!("gzip failure: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Error::Unknown(format!("gzip failure: {e}")))?;

        Ok(Self {
            access_level,
            master_key_params,
            encrypted_payload_key,
            encrypted_payload: BASE64.encode(encrypt_aes_gcm(payload_key, &compressed)?),
        })
    }

    /// Unwraps the payload key with a passphrase
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPassphrase`] when the passphrase does not
    /// unwrap the stored key.
    pub fn unseal_payload_key(&self, passphrase: &str) -> Result<AesKey> {
        let master_key = self.master_key_params.derive(passphrase.as_bytes())?;
        let wrapping_key = AesKey::from_bytes(*master_key.as_bytes());
        let sealed = BASE64
            .decode(self.encrypted_payload_key.as_bytes())
            .map_err(|_| Error::InvalidSecretStore("payload key is not base64"))?;
        let key_bytes =
            decrypt_aes_gcm(&wrapping_key, &sealed).map_err(|_| Error::InvalidPassphrase)?;
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| Error::InvalidSecretStore("payload key has a wrong length"))?;
        Ok(AesKey::from_bytes(key_bytes))
    }

    /// Opens the payload with an already-unwrapped payload key
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] for a wrong key.
    pub fn open(&self, payload_key: &AesKey) -> Result<SecretStorePayload> {
        let sealed = BASE64
            .decode(self.encrypted_payload.as_bytes())
            .map_err(|_| Error::InvalidSecretStore("payload is not base64"))?;
        let compressed = decrypt_aes_gcm(payload_key, &sealed)?;
        let mut json = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut json)
            .map_err(|_| Error::InvalidSecretStore("payload is not gzip"))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Convenience: unwrap the payload key and open the payload
    pub fn open_with_passphrase(&self, passphrase: &str) -> Result<SecretStorePayload> {
        let payload_key = self.unseal_payload_key(passphrase)?;
        self.open(&payload_key)
    }

    /// Re-wraps the payload key for a new passphrase
    ///
    /// Writes fresh master key parameters and a fresh wrap; the encrypted
    /// payload itself is untouched, so the payload key never changes.
    pub fn change_passphrase(&mut self, old_passphrase: &str, new_passphrase: &str) -> Result<()> {
        let payload_key = self.unseal_payload_key(old_passphrase)?;
        self.rewrap_payload_key(&payload_key, new_passphrase)
    }

    /// Re-wraps a known payload key for a new passphrase (recovery path)
    pub fn rewrap_payload_key(&mut self, payload_key: &AesKey, new_passphrase: &str) -> Result<()> {
        let master_key_params = MasterKeyParams::generate();
        let master_key = master_key_params.derive(new_passphrase.as_bytes())?;
        let wrapping_key = AesKey::from_bytes(*master_key.as_bytes());
        self.encrypted_payload_key =
            BASE64.encode(encrypt_aes_gcm(&wrapping_key, payload_key.as_bytes())?);
        self.master_key_params = master_key_params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityType;
    use metalocker_keys::{generate_encryption_key, generate_hmac_key};

    fn test_payload() -> SecretStorePayload {
        SecretStorePayload {
            managed_hmac_key: generate_hmac_key(),
            managed_encryption_key: generate_encryption_key(),
            hosted_hmac_key: Some(generate_hmac_key()),
            hosted_encryption_key: Some(generate_encryption_key()),
            account_root_key: Some(ExtendedNode::new_master(&[9u8; 32]).unwrap()),
            managed_root_locker: Some("locker-m".to_owned()),
            hosted_root_locker: Some("locker-h".to_owned()),
            identities: vec![Identity::new(
                "root",
                IdentityType::Root,
                AccessLevel::Hosted,
            )],
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let payload = test_payload();
        let payload_key = generate_encryption_key();
        let store =
            SecretStore::seal(AccessLevel::Hosted, &payload, &payload_key, "hunter2").unwrap();

        let opened = store.open_with_passphrase("hunter2").unwrap();
        assert_eq!(
            opened.managed_hmac_key.as_bytes(),
            payload.managed_hmac_key.as_bytes()
        );
        assert_eq!(opened.identities.len(), 1);
        assert_eq!(
            opened.account_root_key.unwrap().key_bytes(),
            payload.account_root_key.as_ref().unwrap().key_bytes()
        );
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let store = SecretStore::seal(
            AccessLevel::Hosted,
            &test_payload(),
            &generate_encryption_key(),
            "hunter2",
        )
        .unwrap();
        assert!(matches!(
            store.unseal_payload_key("hunter3"),
            Err(Error::InvalidPassphrase)
        ));
    }

    #[test]
    fn changing_passphrase_keeps_the_payload_bytes() {
        let payload_key = generate_encryption_key();
        let mut store = SecretStore::seal(
            AccessLevel::Hosted,
            &test_payload(),
            &payload_key,
            "first",
        )
        .unwrap();
        let payload_before = store.encrypted_payload.clone();

        store.change_passphrase("first", "second").unwrap();
        assert_eq!(store.encrypted_payload, payload_before);
        assert!(store.unseal_payload_key("first").is_err());
        let unwrapped = store.unseal_payload_key("second").unwrap();
        assert_eq!(unwrapped, payload_key);

        // And back again: the payload is still byte-identical
        store.change_passphrase("second", "first").unwrap();
        assert_eq!(store.encrypted_payload, payload_before);
    }

    #[test]
    fn managed_subset_strips_hosted_material() {
        let payload = test_payload();
        let subset = payload.managed_subset();
        assert!(subset.hosted_hmac_key.is_none());
        assert!(subset.hosted_encryption_key.is_none());
        assert!(subset.account_root_key.is_none());
        assert!(subset.hosted_root_locker.is_none());
        assert_eq!(
            subset.managed_encryption_key.as_bytes(),
            payload.managed_encryption_key.as_bytes()
        );
        assert_eq!(subset.identities.len(), payload.identities.len());
    }

    #[test]
    fn rewrap_with_known_key_recovers_access() {
        let payload_key = generate_encryption_key();
        let mut store = SecretStore::seal(
            AccessLevel::Managed,
            &test_payload().managed_subset(),
            &payload_key,
            "forgotten",
        )
        .unwrap();

        store.rewrap_payload_key(&payload_key, "fresh start").unwrap();
        let opened = store.open_with_passphrase("fresh start").unwrap();
        assert!(opened.hosted_hmac_key.is_none());
    }
}
