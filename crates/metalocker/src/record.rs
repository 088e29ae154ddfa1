use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use metalocker_keys::{verify_record_signature, RecordKeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::expiry::Expiry;

/// Record flag bit 0: the operation payload is cleartext
pub const FLAG_PUBLIC: u32 = 1;

/// The kind of operation a ledger record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RecordOperation {
    Lease = 1,
    LeaseRevocation = 2,
    AssetHead = 3,
}

impl From<RecordOperation> for u8 {
    fn from(value: RecordOperation) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for RecordOperation {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordOperation::Lease),
            2 => Ok(RecordOperation::LeaseRevocation),
            3 => Ok(RecordOperation::AssetHead),
            _ => Err(Error::InvalidRecord("unknown operation")),
        }
    }
}

/// Algorithm tag of a record commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum CommitmentType {
    #[default]
    None = 0,
    /// SHA-256 over the concatenated preimage
    Algo1 = 1,
}

impl From<CommitmentType> for u8 {
    fn from(value: CommitmentType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for CommitmentType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CommitmentType::None),
            1 => Ok(CommitmentType::Algo1),
            _ => Err(Error::InvalidRecord("unknown commitment type")),
        }
    }
}

/// Lifecycle status of a record on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Pending,
    Published,
    Failed,
    Revoked,
}

/// An append-only ledger entry
///
/// A record is immutable once sealed: its signature covers every field
/// except `id`, `signature` and the ledger-assigned `status` and
/// `blockNumber`, and its id is the hash of the sealed body. The routing
/// key is the one-time public key the record was sealed under; scanners
/// use it to attribute records without learning anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(rename = "routingKey")]
    pub routing_key: String,
    #[serde(rename = "keyIndex")]
    pub key_index: u32,
    pub operation: RecordOperation,
    #[serde(rename = "operationAddress")]
    pub operation_address: String,
    #[serde(rename = "authorisingCommitment")]
    pub authorising_commitment: String,
    #[serde(rename = "authorisingCommitmentType")]
    pub authorising_commitment_type: CommitmentType,
    #[serde(
        rename = "requestingCommitment",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub requesting_commitment: String,
    #[serde(
        rename = "requestingCommitmentType",
        default,
        skip_serializing_if = "commitment_type_is_none"
    )]
    pub requesting_commitment_type: CommitmentType,
    #[serde(rename = "subjectRecord", default, skip_serializing_if = "Option::is_none")]
    pub subject_record: Option<String>,
    #[serde(
        rename = "revocationProof",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub revocation_proof: Option<Vec<String>>,
    #[serde(rename = "headID", default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<String>,
    #[serde(rename = "headBody", default, skip_serializing_if = "Option::is_none")]
    pub head_body: Option<String>,
    #[serde(rename = "dataAssets", default, skip_serializing_if = "Vec::is_empty")]
    pub data_assets: Vec<String>,
    #[serde(default, skip_serializing_if = "flags_are_empty")]
    pub flags: u32,
    pub signature: String,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(rename = "blockNumber", default)]
    pub block_number: u64,
}

fn commitment_type_is_none(value: &CommitmentType) -> bool {
    *value == CommitmentType::None
}

fn flags_are_empty(value: &u32) -> bool {
    *value == 0
}

/// The unsealed fields of a record under construction
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    pub operation_address: String,
    pub requesting_commitment: String,
    pub requesting_commitment_type: CommitmentType,
    pub subject_record: Option<String>,
    pub revocation_proof: Option<Vec<String>>,
    pub head_id: Option<String>,
    pub head_body: Option<String>,
    pub data_assets: Vec<String>,
    pub flags: u32,
}

impl RecordBuilder {
    /// Seals the record under a per-record keypair
    ///
    /// Derives the routing key and authorising commitment from the
    /// keypair, signs the canonical pre-sign image with ECDSA, and sets
    /// the record id to the hash of the sealed body.
    pub fn seal(self, operation: RecordOperation, keypair: &RecordKeyPair) -> Result<Record> {
        let mut record = Record {
            id: String::new(),
            routing_key: bs58::encode(keypair.routing_key()).into_string(),
            key_index: keypair.index(),
            operation,
            authorising_commitment: authorising_commitment(
                &keypair.secret_bytes(),
                &self.operation_address,
            ),
            authorising_commitment_type: CommitmentType::Algo1,
            operation_address: self.operation_address,
            requesting_commitment: self.requesting_commitment,
            requesting_commitment_type: self.requesting_commitment_type,
            subject_record: self.subject_record,
            revocation_proof: self.revocation_proof,
            head_id: self.head_id,
            head_body: self.head_body,
            data_assets: self.data_assets,
            flags: self.flags,
            signature: String::new(),
            status: RecordStatus::Pending,
            block_number: 0,
        };
        let digest = record.presign_digest()?;
        record.signature = BASE64.encode(keypair.sign_digest(digest));
        record.id = bs58::encode(Sha256::digest(record.sealed_body()?)).into_string();
        log::debug!(
            "RecordBuilder::seal - id={} routing_key={} operation={:?}",
            record.id,
            record.routing_key,
            record.operation
        );
        Ok(record)
    }
}

impl Record {
    /// True if the record's payload is cleartext
    pub fn is_public(&self) -> bool {
        self.flags & FLAG_PUBLIC != 0
    }

    /// The decoded 33-byte routing key
    pub fn routing_key_bytes(&self) -> Result<Vec<u8>> {
        bs58::decode(&self.routing_key)
            .into_vec()
            .map_err(|_| Error::InvalidRecord("routing key is not base58"))
    }

    /// Verifies the seal: signature over the pre-sign image under the
    /// routing key, and the id against the sealed body
    pub fn verify(&self) -> Result<bool> {
        let digest = self.presign_digest()?;
        let signature = BASE64
            .decode(self.signature.as_bytes())
            .map_err(|_| Error::InvalidSignature)?;
        let routing_key = self.routing_key_bytes()?;
        if !verify_record_signature(digest, &signature, &routing_key) {
            return Ok(false);
        }
        let expected_id = bs58::encode(Sha256::digest(self.sealed_body()?)).into_string();
        Ok(expected_id == self.id)
    }

    /// Canonical JSON of the record without id, signature and ledger state
    fn presign_image(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        let fields = value
            .as_object_mut()
            .expect("a record serializes to an object");
        fields.remove("id");
        fields.remove("signature");
        fields.remove("status");
        fields.remove("blockNumber");
        Ok(serde_json::to_vec(&value)?)
    }

    fn presign_digest(&self) -> Result<[u8; 32]> {
        Ok(Sha256::digest(self.presign_image()?).into())
    }

    /// Canonical JSON of the sealed record (signature included, ledger
    /// state and id excluded); its hash is the record id
    fn sealed_body(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        let fields = value
            .as_object_mut()
            .expect("a record serializes to an object");
        fields.remove("id");
        fields.remove("status");
        fields.remove("blockNumber");
        Ok(serde_json::to_vec(&value)?)
    }
}

/// The authorising commitment of a record
///
/// `SHA-256(record_private_key || operation_address)`, base64. Proves the
/// submitter held the per-record private key; revocations reveal the
/// preimage.
pub fn authorising_commitment(record_private_key: &[u8; 32], operation_address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record_private_key);
    hasher.update(operation_address.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The requesting commitment of a lease record
///
/// `SHA-256(lease_id || canonical_expiry_string)`, base64, tagged
/// [`CommitmentType::Algo1`]. A "never" expiry contributes the empty
/// string.
pub fn requesting_commitment(lease_id: &str, expires_at: &Expiry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lease_id.as_bytes());
    hasher.update(expires_at.canonical_string().as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Builds the revocation proof for a subject record
///
/// `base64(record_private_key || subject_operation_address)`: exactly the
/// preimage of the subject's authorising commitment.
pub fn revocation_proof(record_private_key: &[u8; 32], subject_operation_address: &str) -> String {
    let mut preimage = Vec::with_capacity(32 + subject_operation_address.len());
    preimage.extend_from_slice(record_private_key);
    preimage.extend_from_slice(subject_operation_address.as_bytes());
    BASE64.encode(preimage)
}

/// Verifies a revocation proof against the subject record
///
/// The proof must hash to the subject's authorising commitment and name
/// the subject's operation address, which together prove the revoker held
/// the subject's per-record private key.
pub fn verify_revocation_proof(proof: &str, subject: &Record) -> bool {
    let Ok(preimage) = BASE64.decode(proof.as_bytes()) else {
        return false;
    };
    if preimage.len() < 32 {
        return false;
    }
    if &preimage[32..] != subject.operation_address.as_bytes() {
        return false;
    }
    BASE64.encode(Sha256::digest(&preimage)) == subject.authorising_commitment
}

/// The id of a named asset head
///
/// `SHA-256(asset_id || locker_id || participant_id || head_name)`,
/// base58. The head id is stable, so successive head records form a
/// single-writer chain under one id.
pub fn head_id(asset_id: &str, locker_id: &str, participant_id: &str, head_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(asset_id.as_bytes());
    hasher.update(locker_id.as_bytes());
    hasher.update(participant_id.as_bytes());
    hasher.update(head_name.as_bytes());
    bs58::encode(hasher.finalize()).into_string()
}

/// The encrypted payload of an asset-head record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadBody {
    #[serde(rename = "assetID")]
    pub asset_id: String,
    #[serde(rename = "lockerID")]
    pub locker_id: String,
    #[serde(rename = "participantID")]
    pub participant_id: String,
    #[serde(rename = "headName")]
    pub head_name: String,
    #[serde(rename = "recordID")]
    pub record_id: String,
}
