//! Aggregate identities.

use std::{
    fmt::{self, Debug, Display},
    hash::Hash,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bound every aggregate identifier satisfies.
///
/// The [`Display`] form is the stable string representation used as the
/// join key in durable stores, so it must round-trip for the store's
/// identifier type.
pub trait Identity: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> Identity for T where T: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// A 128-bit aggregate identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// A fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// A deterministic identifier derived from `content` within `namespace`.
    ///
    /// The same inputs always produce the same id, which suits aggregates
    /// keyed by a natural value (an email address, an IBAN).
    #[must_use]
    pub fn from_content(namespace: &Uuid, content: impl AsRef<[u8]>) -> Self {
        Self(Uuid::new_v5(namespace, content.as_ref()))
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for AggregateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for AggregateId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
