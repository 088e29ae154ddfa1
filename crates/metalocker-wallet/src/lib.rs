//! Wallet orchestration for the MetaLocker core.
//!
//! Composes the `metalocker` crate's data model and backend interfaces
//! into a working data wallet: lock state and unlock paths, the
//! ledger-facing data store, incremental lease assembly, the ledger
//! scanner, access keys with HMAC request signing, and the wallet's local
//! root index.

pub mod access_key;
pub mod data_store;
pub mod errors;
pub mod index;
pub mod lease_builder;
pub mod notification;
pub mod scanner;
pub mod wallet;

pub use access_key::{AccessKey, ClientAccessKey, SignedRequest};
pub use data_store::{DataSet, DataStore, RecordFuture, SubmitOptions};
pub use errors::{Error, Result};
pub use index::{LocalRootIndex, MemoryRootIndex, RecordIndexEntry, RootIndex};
pub use lease_builder::{CopyMode, LeaseBuilder};
pub use notification::LocalNotificationService;
pub use scanner::{
    BlockNotification, DatasetNotification, IndexConsumer, LockerConfig, ScanReport, Scanner,
    SubscriptionStatus,
};
pub use wallet::{
    AccountBackend, LockLevel, MemoryAccountBackend, Wallet, WalletServices,
    ACCOUNT_UPDATES_TOPIC,
};

pub use metalocker;
