use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// The minimum unlock level required to read or write an entity
///
/// Levels form a total order: `None < Restricted < Managed < Local <
/// Hosted`. An entity stored at a given level can only be opened by a
/// wallet unlocked at that level or above; the level also selects which
/// HMAC and encryption keys protect the entity's envelope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum AccessLevel {
    #[default]
    None = 0,
    Restricted = 1,
    Managed = 2,
    Local = 3,
    Hosted = 4,
}

impl AccessLevel {
    /// True for the levels an account itself can be created at
    pub fn is_account_level(self) -> bool {
        matches!(
            self,
            AccessLevel::Restricted | AccessLevel::Managed | AccessLevel::Local | AccessLevel::Hosted
        )
    }
}

impl From<AccessLevel> for u8 {
    fn from(value: AccessLevel) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for AccessLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AccessLevel::None),
            1 => Ok(AccessLevel::Restricted),
            2 => Ok(AccessLevel::Managed),
            3 => Ok(AccessLevel::Local),
            4 => Ok(AccessLevel::Hosted),
            other => Err(Error::InvalidAccessLevel(other)),
        }
    }
}

impl core::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            AccessLevel::None => "none",
            AccessLevel::Restricted => "restricted",
            AccessLevel::Managed => "managed",
            AccessLevel::Local => "local",
            AccessLevel::Hosted => "hosted",
        };
        f.write_str(s)
    }
}
