//! Hierarchical key schedule primitives for the MetaLocker data wallet.
//!
//! This crate contains the pure key-derivation building blocks: the
//! hardened-only extended node hierarchy used for account roots, the
//! secp256k1 extended keys used for locker participants and per-record
//! routing keys, the password-derived master key parameters, and the
//! recovery-phrase derivation. Nothing in this crate performs I/O.

pub mod errors;
mod locker_root;
mod master_key;
mod node;
mod recovery;
mod schedule;

pub use errors::{Error, Result};
pub use locker_root::{
    random_record_index, verify_record_signature, LockerRootKey, LockerRootPub, RecordKeyPair,
};
pub use master_key::{MasterKey, MasterKeyParams};
pub use node::ExtendedNode;
pub use recovery::RecoveryKit;
pub use schedule::{
    generate_encryption_key, generate_hmac_key, hosted_crypto_key, managed_crypto_key,
    new_derivation_index, AesKey, HmacKey,
};

pub use bip39::{Language, Mnemonic};
