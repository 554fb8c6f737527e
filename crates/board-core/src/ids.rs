//! Identifiers used across the collaboration core.
//!
//! `CollaboratorId` identifies a participant (and therefore a replica and a
//! peer link). It wraps a random non-zero u64 and displays as a 16-character
//! hex string so it stays readable in logs and signaling envelopes.
//!
//! Boards, tiles and changes are identified by random v4 UUIDs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CollaboratorIdError {
    #[error("Invalid collaborator ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
    #[error("Collaborator ID cannot be zero")]
    Zero,
}

/// A unique identifier for a collaborator in a shared board session.
///
/// Ordering is meaningful: several tie-breaks (offer glare, concurrent lock
/// acquisition, same-tile edit contention) compare collaborator ids so every
/// replica picks the same winner.
///
/// # Examples
/// ```
/// use board_core::CollaboratorId;
///
/// let id = CollaboratorId::generate();
/// let parsed: CollaboratorId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollaboratorId(u64);

impl CollaboratorId {
    /// Generate a new random collaborator ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for CollaboratorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for CollaboratorId {
    type Err = CollaboratorIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CollaboratorIdError::InvalidFormat);
        }
        let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
        if id == 0 {
            return Err(CollaboratorIdError::Zero);
        }
        Ok(Self(id))
    }
}

impl From<u64> for CollaboratorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for CollaboratorId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for CollaboratorId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifies a shared board.
    BoardId
);
uuid_id!(
    /// Identifies a tile on a board.
    TileId
);
uuid_id!(
    /// Identifies a single board change record.
    ChangeId
);
uuid_id!(
    /// Identifies a collaboration session.
    SessionId
);
