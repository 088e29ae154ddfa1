//! Programmatic credentials: issuance and request authentication.
//!
//! An access key lets a non-interactive client unlock the wallet and call
//! the hosting service. The server keeps the key's HMAC secret encrypted
//! under an AES key only the client can derive (from its Ed25519
//! management key), so a stored access key is useless without the client
//! half.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use hmac::{Hmac, Mac};
use metalocker::envelope::{anon_decrypt, anon_encrypt, decrypt_aes_gcm, encrypt_aes_gcm, secure_compare};
use metalocker::AccessLevel;
use metalocker_keys::AesKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512_256};
use zeroize::Zeroizing;

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512_256 = Hmac<Sha512_256>;

/// Domain prefix for the client AES key derivation
const CLIENT_KEY_PREFIX: &[u8] = b"client key";
/// Fixed HMAC key of the body hash header
const BODY_HASH_KEY: &[u8] = b"body hash";
/// Authorization scheme name
const AUTH_SCHEME: &str = "Meta";
/// Accepted skew: a request is valid until this long past its date header
const DATE_TOLERANCE_MINUTES: i64 = 24 * 60 + 15;

/// The server-side access key record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    pub id: String,
    #[serde(rename = "accountID")]
    pub account_id: String,
    #[serde(rename = "accessLevel")]
    pub access_level: AccessLevel,
    #[serde(rename = "type")]
    pub key_type: String,
    /// Base64 Ed25519 public management key
    #[serde(rename = "managementKey")]
    pub management_key: String,
    /// Managed AES key, anonymously encrypted to the management key
    #[serde(
        rename = "encryptedManagedKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_managed_key: Option<String>,
    /// Hosted AES key, anonymously encrypted to the management key
    #[serde(
        rename = "encryptedHostedKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_hosted_key: Option<String>,
    /// The request-signing HMAC key, AES-encrypted under the client key
    pub secret: String,
}

/// The client-retained half of an access key
pub struct ClientAccessKey {
    pub id: String,
    signing: SigningKey,
    hmac_key: Zeroizing<[u8; 64]>,
}

/// The signed headers of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// `X-Meta-Date`
    pub date: String,
    /// `X-Meta-Client-Key`
    pub client_key: String,
    /// `X-Meta-Body-Hash`, present when the request has a body
    pub body_hash: Option<String>,
    /// `Authorization`
    pub authorization: String,
}

/// Issues a fresh access key for an account
///
/// Returns the server-side record and the client secret string. The
/// managed/hosted AES keys given here become recoverable by the client
/// through anonymous hybrid decryption with its management key.
pub fn issue_access_key(
    account_id: &str,
    access_level: AccessLevel,
    managed_key: Option<&AesKey>,
    hosted_key: Option<&AesKey>,
) -> Result<(AccessKey, ClientAccessKey)> {
    let seed: [u8; 32] = rand::random();
    let signing = SigningKey::from_bytes(&seed);
    let verifying = signing.verifying_key();
    let hmac_key = Zeroizing::new({
        let mut buf = [0u8; 64];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
        buf
    });

    let client = ClientAccessKey {
        id: bs58::encode(rand::random::<[u8; 16]>()).into_string(),
        signing,
        hmac_key,
    };

    let secret = BASE64.encode(encrypt_aes_gcm(
        &client.client_key(),
        client.hmac_key.as_slice(),
    )?);
    let encrypted_managed_key = managed_key
        .map(|key| -> Result<String> {
            Ok(BASE64.encode(anon_encrypt(&verifying, key.as_bytes())?))
        })
        .transpose()?;
    let encrypted_hosted_key = hosted_key
        .map(|key| -> Result<String> {
            Ok(BASE64.encode(anon_encrypt(&verifying, key.as_bytes())?))
        })
        .transpose()?;

    let access_key = AccessKey {
        id: client.id.clone(),
        account_id: account_id.to_owned(),
        access_level,
        key_type: "AccessKey".to_owned(),
        management_key: BASE64.encode(verifying.as_bytes()),
        encrypted_managed_key,
        encrypted_hosted_key,
        secret,
    };
    Ok((access_key, client))
}

impl ClientAccessKey {
    /// Reconstructs the client key from its transport secret
    ///
    /// The secret is `base64(signing seed):base64(hmac key)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAccessKeySecret`] for malformed secrets.
    pub fn parse(id: &str, secret: &str) -> Result<Self> {
        let (seed_part, hmac_part) = secret
            .split_once(':')
            .ok_or(Error::InvalidAccessKeySecret)?;
        let seed = Zeroizing::new(
            BASE64
                .decode(seed_part.as_bytes())
                .map_err(|_| Error::InvalidAccessKeySecret)?,
        );
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidAccessKeySecret)?;
        let hmac = Zeroizing::new(
            BASE64
                .decode(hmac_part.as_bytes())
                .map_err(|_| Error::InvalidAccessKeySecret)?,
        );
        let hmac: [u8; 64] = hmac
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidAccessKeySecret)?;
        Ok(Self {
            id: id.to_owned(),
            signing: SigningKey::from_bytes(&seed),
            hmac_key: Zeroizing::new(hmac),
        })
    }

    /// The transport form of the client secret
    pub fn secret_string(&self) -> String {
        format!(
            "{}:{}",
            BASE64.encode(self.signing.to_bytes()),
            BASE64.encode(self.hmac_key.as_slice())
        )
    }

    /// The Ed25519 management signing key
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// The AES key derived from the management key
    ///
    /// `SHA-256("client key" || signing seed)`. Sent to the server per
    /// request so it can unwrap the stored HMAC secret.
    pub fn client_key(&self) -> AesKey {
        let mut hasher = Sha256::new();
        hasher.update(CLIENT_KEY_PREFIX);
        hasher.update(self.signing.to_bytes());
        AesKey::from_bytes(hasher.finalize().into())
    }

    /// Signs a request at `when`
    ///
    /// The signature chains `HMAC(hmac_key, date)` through the URL and,
    /// when a body is present, its body hash header value.
    pub fn sign_request(&self, url: &str, body: Option<&[u8]>, when: DateTime<Utc>) -> SignedRequest {
        let date = when.format("%Y%m%d").to_string();
        let body_hash = body.map(body_hash);
        let signature = chain_signature(self.hmac_key.as_slice(), &date, url, body_hash.as_deref());
        SignedRequest {
            client_key: self.client_key().to_base64(),
            authorization: format!("{AUTH_SCHEME} {}:{signature}", self.id),
            date,
            body_hash,
        }
    }
}

impl core::fmt::Debug for ClientAccessKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientAccessKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// The body hash header value: `base64(HMAC-SHA-512/256("body hash", body))`
pub fn body_hash(body: &[u8]) -> String {
    let mut mac =
        HmacSha512_256::new_from_slice(BODY_HASH_KEY).expect("HMAC accepts keys of any length");
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

fn hmac_step(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

fn chain_signature(hmac_key: &[u8], date: &str, url: &str, body_hash: Option<&str>) -> String {
    let mut key = hmac_step(hmac_key, date.as_bytes());
    key = hmac_step(&key, url.as_bytes());
    if let Some(body_hash) = body_hash {
        key = hmac_step(&key, body_hash.as_bytes());
    }
    BASE64.encode(key)
}

/// Decrypts the access key's stored HMAC secret with the client-supplied
/// AES key
pub fn unwrap_secret(access_key: &AccessKey, client_key_b64: &str) -> Result<Zeroizing<[u8; 64]>> {
    let client_key =
        AesKey::from_base64(client_key_b64).ok_or(Error::InvalidAccessKeySecret)?;
    let sealed = BASE64
        .decode(access_key.secret.as_bytes())
        .map_err(|_| Error::InvalidAccessKeySecret)?;
    let hmac = Zeroizing::new(
        decrypt_aes_gcm(&client_key, &sealed).map_err(|_| Error::InvalidAccessKeySecret)?,
    );
    let hmac: [u8; 64] = hmac
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidAccessKeySecret)?;
    Ok(Zeroizing::new(hmac))
}

/// Recovers the wallet key material carried by an access key
///
/// Returns `(managed, hosted)` AES keys, each present when the key was
/// issued with it.
pub fn open_key_material(
    access_key: &AccessKey,
    client: &ClientAccessKey,
) -> Result<(Option<AesKey>, Option<AesKey>)> {
    let open = |sealed: &Option<String>| -> Result<Option<AesKey>> {
        let Some(sealed) = sealed else {
            return Ok(None);
        };
        let sealed = BASE64
            .decode(sealed.as_bytes())
            .map_err(|_| Error::InvalidAccessKeySecret)?;
        let bytes = anon_decrypt(client.signing_key(), &sealed)
            .map_err(|_| Error::InvalidAccessKeySecret)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidAccessKeySecret)?;
        Ok(Some(AesKey::from_bytes(bytes)))
    };
    Ok((
        open(&access_key.encrypted_managed_key)?,
        open(&access_key.encrypted_hosted_key)?,
    ))
}

/// Verifies a signed request on the server side
///
/// Unwraps the stored HMAC secret with the client-supplied AES key,
/// recomputes the signature chain and checks the date window (`now` must
/// not be past `date + 24h15m`).
pub fn verify_request(
    access_key: &AccessKey,
    request: &SignedRequest,
    url: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let date = NaiveDate::parse_from_str(&request.date, "%Y%m%d")
        .map_err(|_| Error::RequestDateSkew)?;
    let date_start = Utc.from_utc_datetime(
        &date
            .and_hms_opt(0, 0, 0)
            .expect("midnight always exists"),
    );
    if now > date_start + Duration::minutes(DATE_TOLERANCE_MINUTES) {
        return Err(Error::RequestDateSkew);
    }

    let (scheme_and_id, signature) = request
        .authorization
        .rsplit_once(':')
        .ok_or(Error::RequestSignatureMismatch)?;
    let expected_prefix = format!("{AUTH_SCHEME} {}", access_key.id);
    if scheme_and_id != expected_prefix {
        return Err(Error::RequestSignatureMismatch);
    }

    let hmac_key = unwrap_secret(access_key, &request.client_key)?;
    let expected = chain_signature(
        hmac_key.as_slice(),
        &request.date,
        url,
        request.body_hash.as_deref(),
    );
    if !secure_compare(expected.as_bytes(), signature.as_bytes()) {
        log::warn!(
            "verify_request - signature mismatch for access key {}",
            access_key.id
        );
        return Err(Error::RequestSignatureMismatch);
    }
    Ok(())
}
