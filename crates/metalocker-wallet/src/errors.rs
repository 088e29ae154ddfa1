use thiserror::Error;

/// Convenience type alias for Results using this crate's Error type
pub type Result<T> = core::result::Result<T, Error>;

/// Main error type for wallet orchestration
///
/// Core cryptographic and ledger errors are wrapped by [`Error::Core`];
/// the variants here cover the wallet's own state machine, caches and
/// local storage. [`Error::IndexResultPending`] is signaling, not a
/// failure: the scanner consumes it to pause a subscription.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Identity not found")]
    IdentityNotFound,
    #[error("Locker not found")]
    LockerNotFound,
    #[error("Access key not found")]
    AccessKeyNotFound,
    #[error("Property not found")]
    PropertyNotFound,
    #[error("The wallet is locked")]
    WalletLocked,
    #[error("Operation requires lock level {required:?}, wallet is at {actual:?}")]
    InsufficientLockLevel {
        required: crate::wallet::LockLevel,
        actual: crate::wallet::LockLevel,
    },
    #[error("Data set not found")]
    DataSetNotFound,
    #[error("Index not found")]
    IndexNotFound,
    #[error("Locker state already registered")]
    LockerStateExists,
    #[error("Index result pending")]
    IndexResultPending,
    #[error("Subscription not found")]
    SubscriptionNotFound,
    #[error("Timed out waiting for record confirmation")]
    ConfirmationTimeout,
    #[error("Record failed on the ledger: {0}")]
    RecordFailed(String),
    #[error("Invalid access key secret")]
    InvalidAccessKeySecret,
    #[error("Request signature mismatch")]
    RequestSignatureMismatch,
    #[error("Request date outside the tolerated window")]
    RequestDateSkew,
    #[error(transparent)]
    Core(#[from] metalocker::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::Database(value.to_string())
    }
}

impl From<metalocker_keys::Error> for Error {
    fn from(value: metalocker_keys::Error) -> Self {
        Error::Core(metalocker::Error::KeySchedule(value))
    }
}
