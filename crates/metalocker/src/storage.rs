//! Off-chain operation storage and blob vaults.
//!
//! Records on the ledger only carry pointers; the operation payloads and
//! the dataset blobs themselves live off-chain behind these interfaces.
//! The in-memory implementations back the test suite.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use metalocker_keys::AesKey;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::envelope::{decrypt_aes_gcm, encrypt_aes_gcm};
use crate::errors::{Error, Result};
use crate::lease::StoredResource;
use crate::utils::random_id;

/// Storage for encrypted operation payloads referenced by ledger records
///
/// Addresses are opaque strings; nothing about them is interpreted by the
/// core.
pub trait OffChainStorage: Send + Sync {
    /// Stores an operation payload and returns its address
    fn send_operation(&self, data: &[u8]) -> Result<String>;
    /// Fetches an operation payload
    fn get_operation(&self, address: &str) -> Result<Vec<u8>>;
    /// Deletes an operation payload
    fn purge_operation(&self, address: &str) -> Result<()>;
}

/// Storage for opaque dataset blobs, organised into named vaults
pub trait BlobManager: Send + Sync {
    /// Stores a blob, encrypting it unless `cleartext`, and describes the
    /// result
    fn send_blob(
        &self,
        data: &mut dyn Read,
        cleartext: bool,
        vault_name: &str,
    ) -> Result<StoredResource>;
    /// Opens a blob for reading
    ///
    /// The access token is a short-lived MAC minted by the lease that
    /// references the blob; implementations decide how strictly to check
    /// it.
    fn get_blob(&self, resource: &StoredResource, access_token: &str)
        -> Result<Box<dyn Read + Send>>;
    /// Deletes a blob
    fn purge_blob(&self, resource: &StoredResource) -> Result<()>;
}

/// Computes the content fingerprint of a blob: its asset DID
pub fn asset_id(content: &[u8]) -> String {
    format!(
        "did:asset:{}",
        bs58::encode(Sha256::digest(content)).into_string()
    )
}

/// An in-memory [`OffChainStorage`]
#[derive(Default)]
pub struct MemoryOffChainStorage {
    operations: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryOffChainStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffChainStorage for MemoryOffChainStorage {
    fn send_operation(&self, data: &[u8]) -> Result<String> {
        let address = format!("op-{}", random_id(24));
        self.operations
            .lock()
            .expect("the storage mutex is never poisoned")
            .insert(address.clone(), data.to_vec());
        Ok(address)
    }

    fn get_operation(&self, address: &str) -> Result<Vec<u8>> {
        self.operations
            .lock()
            .expect("the storage mutex is never poisoned")
            .get(address)
            .cloned()
            .ok_or(Error::OperationNotFound)
    }

    fn purge_operation(&self, address: &str) -> Result<()> {
        self.operations
            .lock()
            .expect("the storage mutex is never poisoned")
            .remove(address)
            .map(|_| ())
            .ok_or(Error::OperationNotFound)
    }
}

/// Storage method tag of the in-memory vault
const MEMORY_METHOD: &str = "memory";

type HmacSha256 = Hmac<Sha256>;

/// An in-memory [`BlobManager`]
///
/// Non-cleartext blobs are sealed with a fresh AES key that travels in the
/// stored resource's `params`, so only holders of the lease can open them.
#[derive(Default)]
pub struct MemoryBlobManager {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobManager for MemoryBlobManager {
    fn send_blob(
        &self,
        data: &mut dyn Read,
        cleartext: bool,
        vault_name: &str,
    ) -> Result<StoredResource> {
        let mut content = Vec::new();
        data.read_to_end(&mut content)
            .map_err(|e| Error::Storage(format!("blob read failure: {e}")))?;
        let asset = asset_id(&content);
        let id = format!("blob-{}", random_id(24));

        let (stored_bytes, params, mac) = if cleartext {
            let mac = BASE64.encode(Sha256::digest(&content));
            (content, None, Some(mac))
        } else {
            let key = metalocker_keys::generate_encryption_key();
            let mut hmac = HmacSha256::new_from_slice(key.as_bytes())
                .expect("HMAC accepts keys of any length");
            hmac.update(&content);
            let mac = BASE64.encode(hmac.finalize().into_bytes());
            let sealed = encrypt_aes_gcm(&key, &content)?;
            (sealed, Some(json!({ "key": key.to_base64() })), Some(mac))
        };

        self.blobs
            .lock()
            .expect("the vault mutex is never poisoned")
            .insert(id.clone(), stored_bytes);

        Ok(StoredResource {
            asset,
            vault: vault_name.to_owned(),
            method: MEMORY_METHOD.to_owned(),
            id: Some(id),
            params,
            mac,
        })
    }

    fn get_blob(
        &self,
        resource: &StoredResource,
        _access_token: &str,
    ) -> Result<Box<dyn Read + Send>> {
        let id = resource.id.as_deref().ok_or(Error::BlobNotFound)?;
        let stored = self
            .blobs
            .lock()
            .expect("the vault mutex is never poisoned")
            .get(id)
            .cloned()
            .ok_or(Error::BlobNotFound)?;

        let content = match &resource.params {
            Some(params) => {
                let key = params
                    .get("key")
                    .and_then(serde_json::Value::as_str)
                    .and_then(AesKey::from_base64)
                    .ok_or(Error::InvalidKey)?;
                decrypt_aes_gcm(&key, &stored)?
            }
            None => stored,
        };
        Ok(Box::new(Cursor::new(content)))
    }

    fn purge_blob(&self, resource: &StoredResource) -> Result<()> {
        let id = resource.id.as_deref().ok_or(Error::BlobNotFound)?;
        self.blobs
            .lock()
            .expect("the vault mutex is never poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or(Error::BlobNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_chain_roundtrip_and_purge() {
        let storage = MemoryOffChainStorage::new();
        let address = storage.send_operation(b"lease bytes").unwrap();
        assert_eq!(storage.get_operation(&address).unwrap(), b"lease bytes");

        storage.purge_operation(&address).unwrap();
        assert!(matches!(
            storage.get_operation(&address),
            Err(Error::OperationNotFound)
        ));
        assert!(storage.purge_operation(&address).is_err());
    }

    #[test]
    fn blob_asset_id_is_content_addressed() {
        let vault = MemoryBlobManager::new();
        let a = vault
            .send_blob(&mut Cursor::new(b"same bytes".to_vec()), false, "local")
            .unwrap();
        let b = vault
            .send_blob(&mut Cursor::new(b"same bytes".to_vec()), false, "local")
            .unwrap();
        assert_eq!(a.asset, b.asset);
        assert_ne!(a.id, b.id);
        assert!(a.asset.starts_with("did:asset:"));
    }

    #[test]
    fn encrypted_blob_roundtrip() {
        let vault = MemoryBlobManager::new();
        let resource = vault
            .send_blob(&mut Cursor::new(b"payload".to_vec()), false, "local")
            .unwrap();
        assert!(resource.params.is_some());

        let mut reader = vault.get_blob(&resource, "").unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"payload");

        // Stripping the key parameters makes the blob unreadable
        let mut blinded = resource.clone();
        blinded.params = None;
        let mut reader = vault.get_blob(&blinded, "").unwrap();
        let mut sealed = Vec::new();
        reader.read_to_end(&mut sealed).unwrap();
        assert_ne!(sealed, b"payload");
    }

    #[test]
    fn cleartext_blob_is_stored_verbatim() {
        let vault = MemoryBlobManager::new();
        let resource = vault
            .send_blob(&mut Cursor::new(b"public".to_vec()), true, "local")
            .unwrap();
        assert!(resource.params.is_none());
        let mut reader = vault.get_blob(&resource, "").unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"public");
    }

    #[test]
    fn purged_blob_is_gone() {
        let vault = MemoryBlobManager::new();
        let resource = vault
            .send_blob(&mut Cursor::new(b"gone".to_vec()), false, "local")
            .unwrap();
        vault.purge_blob(&resource).unwrap();
        assert!(matches!(
            vault.get_blob(&resource, ""),
            Err(Error::BlobNotFound)
        ));
        assert!(vault.purge_blob(&resource).is_err());
    }
}
