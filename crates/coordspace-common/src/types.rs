//! Core type definitions for coordspace
//!
//! Identifiers, space addresses and the reference types that name
//! containers, transactions, requests and aspects across process boundaries.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of a space: `scheme://authority[/path]`
///
/// The scheme selects the transport used to reach the space. A URI without
/// `://` is accepted and has no scheme; senders then fall back to the
/// configured default scheme.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceUri {
    raw: String,
    scheme_len: Option<usize>,
}

impl SpaceUri {
    /// Parse a space URI
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidUri {
                uri: raw,
                reason: "empty",
            });
        }
        if trimmed.len() != raw.len() {
            return Err(Error::InvalidUri {
                uri: raw,
                reason: "surrounding whitespace",
            });
        }

        let scheme_len = match raw.find("://") {
            Some(0) => {
                return Err(Error::InvalidUri {
                    uri: raw,
                    reason: "empty scheme",
                });
            }
            Some(pos) => {
                let scheme = &raw[..pos];
                if !scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                {
                    return Err(Error::InvalidUri {
                        uri: raw,
                        reason: "invalid scheme characters",
                    });
                }
                if raw.len() == pos + 3 {
                    return Err(Error::InvalidUri {
                        uri: raw,
                        reason: "empty authority",
                    });
                }
                Some(pos)
            }
            None => None,
        };

        Ok(Self { raw, scheme_len })
    }

    /// The transport scheme, if the URI carries one
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.scheme_len.map(|len| &self.raw[..len])
    }

    /// Everything between `://` and the first `/`, or the whole URI when it
    /// has no scheme
    #[must_use]
    pub fn authority(&self) -> &str {
        let rest = match self.scheme_len {
            Some(len) => &self.raw[len + 3..],
            None => self.raw.as_str(),
        };
        rest.split('/').next().unwrap_or(rest)
    }

    /// The full URI string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for SpaceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceUri({})", self.raw)
    }
}

impl fmt::Display for SpaceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SpaceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SpaceUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SpaceUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(de::Error::custom)
    }
}

/// Identifier of an entry inside a container; doubles as its durable key
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct EntryId(u64);

impl EntryId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Transaction identifier; also the creation sequence number, so a larger
/// id is a younger transaction
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct TxId(u64);

impl TxId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

macro_rules! reference_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            id: String,
            space: SpaceUri,
        }

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>, space: SpaceUri) -> Self {
                Self {
                    id: id.into(),
                    space,
                }
            }

            /// Identifier, unique within the owning space
            #[must_use]
            pub fn id(&self) -> &str {
                &self.id
            }

            /// The space owning the referenced object
            #[must_use]
            pub const fn space(&self) -> &SpaceUri {
                &self.space
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", self.space, self.id)
            }
        }

        // Written as the (id, space URI string) pair; the URI is re-parsed on
        // the way back in.
        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                (self.id.as_str(), self.space.as_str()).serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let (id, space) = <(String, String)>::deserialize(deserializer)?;
                let space = SpaceUri::parse(space).map_err(de::Error::custom)?;
                Ok(Self { id, space })
            }
        }
    };
}

reference_type!(
    /// Reference to a container living in some space
    ContainerRef
);
reference_type!(
    /// Reference to a transaction living in some space
    TransactionRef
);
reference_type!(
    /// Reference identifying one request, used to correlate responses and
    /// to cancel blocked operations
    RequestRef
);
reference_type!(
    /// Reference to an aspect registered in some space
    AspectRef
);

impl TransactionRef {
    /// Build the reference for a transaction id
    #[must_use]
    pub fn for_tx(tx: TxId, space: SpaceUri) -> Self {
        Self::new(tx.to_string(), space)
    }

    /// The transaction id, when the reference was produced by [`Self::for_tx`]
    #[must_use]
    pub fn tx_id(&self) -> Option<TxId> {
        self.id.parse::<u64>().ok().map(TxId)
    }
}
