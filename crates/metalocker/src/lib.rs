//! Cryptographic core of the MetaLocker data wallet.
//!
//! MetaLocker distributes datasets as signed, encrypted *leases* placed into
//! append-only ledger records keyed by one-time public keys, and retrieved
//! through shared symmetric channels called *lockers*. This crate holds the
//! core data model and cryptography: accounts and their secret stores,
//! identities, lockers and their participant key agreement, leases with
//! content-addressable impressions, sealed ledger records, and the narrow
//! interfaces of the external collaborators (ledger, off-chain storage,
//! blob vaults, notifications). Orchestration lives in the
//! `metalocker-wallet` crate.

pub mod access;
pub mod account;
pub mod did;
pub mod envelope;
pub mod errors;
pub mod expiry;
pub mod identity;
pub mod lease;
pub mod ledger;
pub mod locker;
pub mod notification;
pub mod record;
pub mod storage;
pub mod utils;

pub use access::AccessLevel;
pub use account::{
    Account, AccountState, AccountTemplate, GenerateOptions, GeneratedAccount, SecretStore,
    SecretStorePayload,
};
pub use did::Did;
pub use envelope::DataEnvelope;
pub use errors::{Error, Result};
pub use expiry::Expiry;
pub use identity::{Identity, IdentityType};
pub use lease::{Impression, Lease, MerkleSignature, ProvenanceEntity, StoredResource};
pub use ledger::{Block, BlockRecord, DataAssetState, Ledger, RecordState};
pub use locker::{Locker, LockerOptions, LockerParticipant, Party, SharedSecret};
pub use notification::{NotificationMessage, NotificationService, PublishMode, SubscriptionId};
pub use record::{
    CommitmentType, HeadBody, Record, RecordBuilder, RecordOperation, RecordStatus, FLAG_PUBLIC,
};
pub use storage::{BlobManager, OffChainStorage};

pub use metalocker_keys as keys;
