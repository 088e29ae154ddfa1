use thiserror::Error;

/// Convenience type alias for Results using this crate's Error type
pub type Result<T> = core::result::Result<T, Error>;

/// Main error type for the MetaLocker core
///
/// Validation failures and not-found kinds are surfaced to the caller.
/// Cryptographic verification failures (bad signature, wrong passphrase,
/// AEAD tag mismatch) are fatal to the operation they occur in, never to
/// the wallet as a whole.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Account already exists")]
    AccountExists,
    #[error("Account not found")]
    AccountNotFound,
    #[error("DID already exists")]
    DidExists,
    #[error("DID not found")]
    DidNotFound,
    #[error("Invalid passphrase")]
    InvalidPassphrase,
    #[error("Invalid access level: {0}")]
    InvalidAccessLevel(u8),
    #[error("Operation requires access level {required:?}, account has {actual:?}")]
    InsufficientAccessLevel {
        required: crate::access::AccessLevel,
        actual: crate::access::AccessLevel,
    },
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid DID string: {0}")]
    InvalidDidString(String),
    #[error("Invalid expiry string: {0}")]
    InvalidExpiryString(String),
    #[error("Record not found")]
    RecordNotFound,
    #[error("Block not found")]
    BlockNotFound,
    #[error("Data asset not found")]
    DataAssetNotFound,
    #[error("Asset head not found")]
    AssetHeadNotFound,
    #[error("Operation not found")]
    OperationNotFound,
    #[error("Blob not found")]
    BlobNotFound,
    #[error("The lease was revoked and its data assets purged")]
    LeaseRevokedAndPurged,
    #[error("Recovery code not found")]
    RecoveryCodeNotFound,
    #[error("Forbidden operation")]
    ForbiddenOperation,
    #[error("Invalid record: {0}")]
    InvalidRecord(&'static str),
    #[error("Invalid locker: {0}")]
    InvalidLocker(&'static str),
    #[error("Invalid lease: {0}")]
    InvalidLease(&'static str),
    #[error("Invalid secret store: {0}")]
    InvalidSecretStore(&'static str),
    #[error("Key schedule error: {0}")]
    KeySchedule(#[from] metalocker_keys::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Ledger error: {0}")]
    Ledger(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}
