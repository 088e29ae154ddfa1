use thiserror::Error;

/// Convenience type alias for Results using this crate's Error type
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by key-schedule operations
///
/// All derivation functions in this crate are pure; every failure is a
/// validation failure of the inputs, never an I/O problem.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Seed length must be between 16 and 64 bytes (got {0})")]
    InvalidSeedLength(usize),
    #[error("Derivation index {0} is out of range (must be less than 2^31)")]
    IndexOutOfRange(u32),
    #[error("Extended nodes only support hardened derivation")]
    HardenedDerivationOnly,
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(&'static str),
    #[error("Invalid recovery phrase: {0}")]
    InvalidRecoveryPhrase(#[from] bip39::Error),
    #[error("Extended key error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
    #[error("Invalid master key parameters: {0}")]
    InvalidMasterKeyParams(&'static str),
}
