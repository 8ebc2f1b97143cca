//! Content-hash identifiers for revisions.

use std::fmt;
use std::str::FromStr;

use git2::Oid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Length of a full hex revision id.
const HEX_LEN: usize = 40;

/// Length used when showing a revision to the user.
const SHORT_LEN: usize = 12;

/// Identifier of an immutable revision.
///
/// Serializes as the full lowercase hex string, so it can be used as a
/// JSON map key in persisted state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevId(Oid);

impl RevId {
    /// Wrap a git object id.
    #[must_use]
    pub const fn from_oid(oid: Oid) -> Self {
        Self(oid)
    }

    /// Build an id from its 20 raw bytes.
    ///
    /// # Errors
    /// Returns `InvalidRevision` if the slice has the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Oid::from_bytes(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidRevision(format!("{bytes:02x?}")))
    }

    /// The underlying git object id.
    #[must_use]
    pub const fn oid(self) -> Oid {
        self.0
    }

    /// Abbreviated hex form for messages.
    #[must_use]
    pub fn short(self) -> String {
        let mut hex = self.0.to_string();
        hex.truncate(SHORT_LEN);
        hex
    }
}

impl From<Oid> for RevId {
    fn from(oid: Oid) -> Self {
        Self(oid)
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({})", self.short())
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Oid::from_str zero-pads short input, which would silently
        // produce a different revision.
        if s.len() != HEX_LEN {
            return Err(Error::InvalidRevision(s.to_string()));
        }
        Oid::from_str(s)
            .map(Self)
            .map_err(|_| Error::InvalidRevision(s.to_string()))
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
