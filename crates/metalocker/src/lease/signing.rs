use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::did::Did;
use crate::errors::{Error, Result};

/// DID method of content-addressable entity ids
const STAMP_METHOD: &str = "stamp";

/// A content-addressable signature over an entity's merkle root
///
/// The creator is a self-describing DID, so verification needs no key
/// registry: the verification key is recovered from the id string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleSignature {
    pub creator: String,
    #[serde(rename = "signatureValue")]
    pub signature_value: String,
}

/// Canonical byte form of a JSON value
///
/// Object keys are sorted (the default `serde_json` map is ordered), so
/// serialization is deterministic for any value that has passed through
/// [`serde_json::Value`].
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("a Value always serializes")
}

/// Computes the merkle root of an entity's canonical field map
///
/// Each top-level field is a leaf: `SHA-256(key || canonical(value))`,
/// taken in key order. Leaves are folded pairwise (the last leaf is
/// duplicated at odd levels) down to a single 32-byte root.
pub fn merkle_root(fields: &Map<String, Value>) -> [u8; 32] {
    let mut layer: Vec<[u8; 32]> = fields
        .iter()
        .map(|(key, value)| {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            hasher.update(canonical_bytes(value));
            hasher.finalize().into()
        })
        .collect();
    if layer.is_empty() {
        return Sha256::digest([]).into();
    }
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = *pair.last().expect("chunk is never empty");
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            })
            .collect();
    }
    layer[0]
}

/// The content-addressable id of a merkle root
pub fn stamp_id(root: &[u8; 32]) -> String {
    format!("did:{}:{}", STAMP_METHOD, bs58::encode(root).into_string())
}

/// Signs a JSON entity in place, making it content-addressable
///
/// The entity's `id` and `signature` fields are excluded from the signed
/// image and then overwritten: the id becomes the stamp of the merkle
/// root, the signature an Ed25519 signature of the root by `creator`.
/// Returns the new id.
///
/// # Errors
///
/// Returns [`Error::InvalidLease`] if the value is not a JSON object, or
/// [`Error::ForbiddenOperation`] if the creator DID is neutered.
pub fn sign_entity(value: &mut Value, creator: &Did) -> Result<String> {
    let Some(fields) = value.as_object_mut() else {
        return Err(Error::InvalidLease("only objects can be signed"));
    };
    fields.remove("id");
    fields.remove("signature");

    let root = merkle_root(fields);
    let id = stamp_id(&root);
    let signature = creator.sign(&root)?;

    fields.insert("id".to_owned(), Value::String(id.clone()));
    fields.insert(
        "signature".to_owned(),
        serde_json::to_value(MerkleSignature {
            creator: creator.id().to_owned(),
            signature_value: bs58::encode(signature.to_bytes()).into_string(),
        })?,
    );
    Ok(id)
}

/// Verifies a content-addressable entity
///
/// Recomputes the merkle root over the entity minus `id` and `signature`,
/// checks that the id is the stamp of the root, and verifies the Ed25519
/// signature under the creator DID's embedded key. Any mutation of any
/// field invalidates both checks.
pub fn verify_entity(value: &Value) -> Result<bool> {
    let Some(fields) = value.as_object() else {
        return Err(Error::InvalidLease("only objects can be verified"));
    };
    let Some(id) = fields.get("id").and_then(Value::as_str) else {
        return Ok(false);
    };
    let Some(signature) = fields.get("signature") else {
        return Ok(false);
    };
    let signature: MerkleSignature = serde_json::from_value(signature.clone())?;

    let mut unsigned = fields.clone();
    unsigned.remove("id");
    unsigned.remove("signature");
    let root = merkle_root(&unsigned);
    if stamp_id(&root) != id {
        return Ok(false);
    }

    let creator = Did::parse(&signature.creator)?;
    let sig_bytes = bs58::decode(&signature.signature_value)
        .into_vec()
        .map_err(|_| Error::InvalidSignature)?;
    let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|_| Error::InvalidSignature)?;
    Ok(creator.verify(&root, &ed25519_dalek::Signature::from_bytes(&sig_bytes)))
}
