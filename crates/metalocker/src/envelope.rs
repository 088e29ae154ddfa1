use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use metalocker_keys::{AesKey, HmacKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512, Sha512_256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::access::AccessLevel;
use crate::errors::{Error, Result};
use crate::utils::bytes_to_hex_string;

/// AES-GCM nonce size in bytes
const NONCE_LEN: usize = 12;
/// X25519 public key size in bytes
const X25519_PUB_LEN: usize = 32;

type HmacSha512_256 = Hmac<Sha512_256>;

/// Encrypts with AES-256-GCM; the output is `nonce || ciphertext`
pub fn encrypt_aes_gcm(key: &AesKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::InvalidKey)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `nonce || ciphertext` AES-256-GCM message
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] if the message is malformed or the AEAD
/// tag does not verify (wrong key or tampered data).
pub fn decrypt_aes_gcm(key: &AesKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::InvalidKey);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::InvalidKey)
}

/// Encrypts to an Ed25519 identity without revealing the sender
///
/// An ephemeral X25519 keypair performs a Diffie-Hellman exchange with the
/// Curve25519 form of the recipient's verification key; the shared point is
/// hashed into an AES-256-GCM key. The output layout is
/// `ephemeral_public || nonce || ciphertext`.
pub fn anon_encrypt(recipient: &VerifyingKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let recipient_mont = X25519Public::from(recipient.to_montgomery().to_bytes());
    let shared = ephemeral.diffie_hellman(&recipient_mont);

    let key = AesKey::from_bytes(Sha256::digest(shared.as_bytes()).into());
    let sealed = encrypt_aes_gcm(&key, plaintext)?;

    let mut out = Vec::with_capacity(X25519_PUB_LEN + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypts an [`anon_encrypt`] message with the recipient's signing key
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] if the message is malformed or was not
/// encrypted to this identity.
pub fn anon_decrypt(recipient: &SigningKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < X25519_PUB_LEN + NONCE_LEN {
        return Err(Error::InvalidKey);
    }
    let (ephemeral_bytes, sealed) = data.split_at(X25519_PUB_LEN);
    let ephemeral_bytes: [u8; 32] = ephemeral_bytes.try_into().expect("split at 32");
    let ephemeral_public = X25519Public::from(ephemeral_bytes);

    let scalar = StaticSecret::from(x25519_scalar(recipient));
    let shared = scalar.diffie_hellman(&ephemeral_public);

    let key = AesKey::from_bytes(Sha256::digest(shared.as_bytes()).into());
    decrypt_aes_gcm(&key, sealed)
}

/// The X25519 scalar of an Ed25519 signing key
///
/// RFC 8032 section 5.1.5: the scalar is the clamped lower half of
/// SHA-512(seed). The corresponding X25519 public key is the Montgomery
/// form of the Ed25519 verification key, so the Diffie-Hellman exchange in
/// [`anon_encrypt`] and [`anon_decrypt`] meets in the middle.
fn x25519_scalar(signing: &SigningKey) -> [u8; 32] {
    let digest: Zeroizing<[u8; 64]> = Zeroizing::new(Sha512::digest(signing.to_bytes()).into());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    scalar
}

/// Blind entity-id hash: hex of HMAC-SHA-512/256 over the entity id
///
/// The hash serves as the external lookup key of an envelope without
/// revealing the id it was computed from. Deterministic per key.
pub fn hash_id(entity_id: &str, key: &HmacKey) -> String {
    let mut mac = <HmacSha512_256 as Mac>::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(entity_id.as_bytes());
    bytes_to_hex_string(mac.finalize().into_bytes())
}

/// Transport normalization of a passphrase: base64 of a double SHA-256
///
/// This is never a key-stretching step; it only keeps raw passphrases off
/// the wire. Key derivation always goes through the scrypt master key.
pub fn password_hash(passphrase: &str) -> String {
    let first = Sha256::digest(passphrase.as_bytes());
    let second = Sha256::digest(first);
    BASE64.encode(second)
}

/// Constant-time comparison of two byte strings
///
/// Inputs of unequal length always compare unequal; the shorter input is
/// padded with a sentinel so the comparison runs in time proportional to
/// the longer input.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut acc = a.len() ^ b.len();
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0xFF);
        let y = b.get(i).copied().unwrap_or(0x00);
        acc |= (x ^ y) as usize;
    }
    acc == 0
}

/// An encrypted, blind-keyed wrapper around a stored entity
///
/// The envelope is what leaves the wallet: the server indexes it by `hash`
/// and never learns the entity id or body. The entity type (identity,
/// locker, property) is carried by the surrounding call, not embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub hash: String,
    #[serde(rename = "accessLevel")]
    pub access_level: AccessLevel,
    #[serde(rename = "encryptedID", default, skip_serializing_if = "Option::is_none")]
    pub encrypted_id: Option<String>,
    #[serde(rename = "encryptedBody")]
    pub encrypted_body: String,
}

impl DataEnvelope {
    /// Encrypts `entity` into an envelope keyed by the blind hash of
    /// `entity_id`
    pub fn seal<T: Serialize>(
        entity_id: &str,
        entity: &T,
        access_level: AccessLevel,
        encryption_key: &AesKey,
        hmac_key: &HmacKey,
    ) -> Result<Self> {
        let body = serde_json::to_vec(entity)?;
        let encrypted_body = BASE64.encode(encrypt_aes_gcm(encryption_key, &body)?);
        let encrypted_id = BASE64.encode(encrypt_aes_gcm(encryption_key, entity_id.as_bytes())?);
        Ok(Self {
            hash: hash_id(entity_id, hmac_key),
            access_level,
            encrypted_id: Some(encrypted_id),
            encrypted_body,
        })
    }

    /// Decrypts the envelope body back into the entity
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when decrypted with any key other than
    /// the one that sealed the envelope.
    pub fn open<T: DeserializeOwned>(&self, encryption_key: &AesKey) -> Result<T> {
        let sealed = BASE64
            .decode(self.encrypted_body.as_bytes())
            .map_err(|_| Error::InvalidKey)?;
        let body = decrypt_aes_gcm(encryption_key, &sealed)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Decrypts the entity id carried by the envelope, when present
    pub fn open_id(&self, encryption_key: &AesKey) -> Result<Option<String>> {
        let Some(encrypted_id) = &self.encrypted_id else {
            return Ok(None);
        };
        let sealed = BASE64
            .decode(encrypted_id.as_bytes())
            .map_err(|_| Error::InvalidKey)?;
        let id = decrypt_aes_gcm(encryption_key, &sealed)?;
        Ok(Some(
            String::from_utf8(id).map_err(|_| Error::InvalidKey)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metalocker_keys::{generate_encryption_key, generate_hmac_key};
    use serde_json::json;

    #[test]
    fn aes_gcm_roundtrip() {
        let key = generate_encryption_key();
        let sealed = encrypt_aes_gcm(&key, b"locker payload").unwrap();
        assert_eq!(decrypt_aes_gcm(&key, &sealed).unwrap(), b"locker payload");

        // Nonces are fresh per call
        let sealed2 = encrypt_aes_gcm(&key, b"locker payload").unwrap();
        assert_ne!(sealed, sealed2);
    }

    #[test]
    fn aes_gcm_rejects_wrong_key_and_tampering() {
        let key = generate_encryption_key();
        let other = generate_encryption_key();
        let mut sealed = encrypt_aes_gcm(&key, b"secret").unwrap();
        assert!(matches!(
            decrypt_aes_gcm(&other, &sealed),
            Err(Error::InvalidKey)
        ));
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(decrypt_aes_gcm(&key, &sealed).is_err());
        assert!(decrypt_aes_gcm(&key, &[1, 2, 3]).is_err());
    }

    #[test]
    fn anonymous_encryption_reaches_only_the_recipient() {
        let recipient = SigningKey::from_bytes(&[5u8; 32]);
        let eavesdropper = SigningKey::from_bytes(&[6u8; 32]);

        let sealed = anon_encrypt(&recipient.verifying_key(), b"recovery secret").unwrap();
        assert_eq!(
            anon_decrypt(&recipient, &sealed).unwrap(),
            b"recovery secret"
        );
        assert!(anon_decrypt(&eavesdropper, &sealed).is_err());

        // Sender anonymity: two messages to the same recipient share no
        // prefix (fresh ephemeral keys)
        let sealed2 = anon_encrypt(&recipient.verifying_key(), b"recovery secret").unwrap();
        assert_ne!(sealed[..32], sealed2[..32]);
    }

    #[test]
    fn hash_id_is_stable_and_keyed() {
        let k1 = generate_hmac_key();
        let k2 = generate_hmac_key();
        assert_eq!(hash_id("locker-1", &k1), hash_id("locker-1", &k1));
        assert_ne!(hash_id("locker-1", &k1), hash_id("locker-1", &k2));
        assert_ne!(hash_id("locker-1", &k1), hash_id("locker-2", &k1));
        // SHA-512/256 output, hex encoded
        assert_eq!(hash_id("locker-1", &k1).len(), 64);
    }

    #[test]
    fn password_hash_is_transport_stable() {
        let h = password_hash("pass1234");
        assert_eq!(h, password_hash("pass1234"));
        assert_ne!(h, password_hash("pass1235"));
        // base64 of 32 bytes
        assert_eq!(h.len(), 44);
    }

    #[test]
    fn secure_compare_semantics() {
        assert!(secure_compare(b"", b""));
        assert!(secure_compare(b"abc", b"abc"));
        assert!(!secure_compare(b"abc", b"abd"));
        assert!(!secure_compare(b"abc", b"abcd"));
        assert!(!secure_compare(b"abcd", b"abc"));
        // The sentinel never makes a longer input equal
        assert!(!secure_compare(b"abc\xff", b"abc"));
    }

    #[test]
    fn envelope_roundtrip_and_key_isolation() {
        let enc = generate_encryption_key();
        let hmac = generate_hmac_key();
        let entity = json!({"id": "locker-9", "name": "deliveries"});

        let envelope =
            DataEnvelope::seal("locker-9", &entity, AccessLevel::Managed, &enc, &hmac).unwrap();
        assert_eq!(envelope.hash, hash_id("locker-9", &hmac));

        let opened: serde_json::Value = envelope.open(&enc).unwrap();
        assert_eq!(opened, entity);
        assert_eq!(envelope.open_id(&enc).unwrap().unwrap(), "locker-9");

        let wrong = generate_encryption_key();
        assert!(envelope.open::<serde_json::Value>(&wrong).is_err());
    }

    #[test]
    fn envelope_wire_field_names() {
        let enc = generate_encryption_key();
        let hmac = generate_hmac_key();
        let envelope =
            DataEnvelope::seal("x", &json!({}), AccessLevel::Hosted, &enc, &hmac).unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();
        assert!(wire.get("accessLevel").is_some());
        assert!(wire.get("encryptedID").is_some());
        assert!(wire.get("encryptedBody").is_some());
    }
}
