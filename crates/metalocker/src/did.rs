use core::fmt::Display;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::{Error, Result};

/// The DID method used for identities minted by this implementation
pub const DID_METHOD: &str = "metalocker";

/// A decentralised identifier bound to an Ed25519 keypair
///
/// The identifier string is self-describing: `did:<method>:<base58(pub)>`,
/// so the verification key is always recoverable from the id alone. A DID
/// may be *neutered*, retaining only the public half; neutered DIDs verify
/// but never sign.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "DidSerde", into = "DidSerde")]
pub struct Did {
    id: String,
    verifying: VerifyingKey,
    signing: Option<SigningKey>,
}

/// Wire form of a [`Did`]
///
/// `sign_key` is the base58 of the 32-byte Ed25519 seed and is only present
/// for non-neutered DIDs.
#[derive(Serialize, Deserialize)]
struct DidSerde {
    id: String,
    #[serde(rename = "verKey")]
    ver_key: String,
    #[serde(rename = "signKey", default, skip_serializing_if = "Option::is_none")]
    sign_key: Option<String>,
}

impl Did {
    /// Generates a fresh DID with a random Ed25519 keypair
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Builds a DID around an existing signing key
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self {
            id: did_string(&verifying),
            verifying,
            signing: Some(signing),
        }
    }

    /// Builds a neutered DID around a verification key
    pub fn from_verifying_key(verifying: VerifyingKey) -> Self {
        Self {
            id: did_string(&verifying),
            verifying,
            signing: None,
        }
    }

    /// Recovers a neutered DID from its identifier string
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDidString`] if the string is not of the form
    /// `did:<method>:<base58(32-byte key)>`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (scheme, _method, key) = (parts.next(), parts.next(), parts.next());
        let (Some("did"), Some(key)) = (scheme, key) else {
            return Err(Error::InvalidDidString(s.to_owned()));
        };
        let bytes = bs58::decode(key)
            .into_vec()
            .map_err(|_| Error::InvalidDidString(s.to_owned()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidDidString(s.to_owned()))?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| Error::InvalidDidString(s.to_owned()))?;
        Ok(Self {
            id: s.to_owned(),
            verifying,
            signing: None,
        })
    }

    /// The full identifier string
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The Ed25519 verification key
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// True if this DID carries no signing key
    pub fn is_neutered(&self) -> bool {
        self.signing.is_none()
    }

    /// Returns a copy with the signing key stripped
    pub fn neuter(&self) -> Self {
        Self {
            id: self.id.clone(),
            verifying: self.verifying,
            signing: None,
        }
    }

    /// Signs a message with the DID's key
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForbiddenOperation`] for neutered DIDs.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signing = self.signing.as_ref().ok_or(Error::ForbiddenOperation)?;
        Ok(signing.sign(message))
    }

    /// Verifies a signature made by this DID
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify_strict(message, signature).is_ok()
    }

    /// The signing key, when present
    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.signing.as_ref()
    }
}

fn did_string(verifying: &VerifyingKey) -> String {
    format!(
        "did:{}:{}",
        DID_METHOD,
        bs58::encode(verifying.as_bytes()).into_string()
    )
}

impl TryFrom<DidSerde> for Did {
    type Error = Error;

    fn try_from(value: DidSerde) -> Result<Self> {
        let ver_bytes = bs58::decode(&value.ver_key)
            .into_vec()
            .map_err(|_| Error::InvalidDidString(value.id.clone()))?;
        let ver_bytes: [u8; 32] = ver_bytes
            .try_into()
            .map_err(|_| Error::InvalidDidString(value.id.clone()))?;
        let verifying = VerifyingKey::from_bytes(&ver_bytes)
            .map_err(|_| Error::InvalidDidString(value.id.clone()))?;
        let signing = value
            .sign_key
            .as_deref()
            .map(|s| -> Result<SigningKey> {
                let bytes = Zeroizing::new(
                    bs58::decode(s)
                        .into_vec()
                        .map_err(|_| Error::InvalidDidString(value.id.clone()))?,
                );
                let bytes: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidDidString(value.id.clone()))?;
                Ok(SigningKey::from_bytes(&bytes))
            })
            .transpose()?;
        if let Some(signing) = &signing {
            if signing.verifying_key() != verifying {
                return Err(Error::InvalidDidString(value.id));
            }
        }
        Ok(Self {
            id: value.id,
            verifying,
            signing,
        })
    }
}

impl From<Did> for DidSerde {
    fn from(value: Did) -> Self {
        Self {
            id: value.id.clone(),
            ver_key: bs58::encode(value.verifying.as_bytes()).into_string(),
            sign_key: value
                .signing
                .as_ref()
                .map(|k| bs58::encode(k.to_bytes()).into_string()),
        }
    }
}

impl Display for Did {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.id)
    }
}

impl core::fmt::Debug for Did {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Did")
            .field("id", &self.id)
            .field("neutered", &self.is_neutered())
            .finish()
    }
}

impl PartialEq for Did {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Did {}
