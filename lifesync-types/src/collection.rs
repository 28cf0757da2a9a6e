//! Collection names and the per-user channel key.

use crate::{Error, Result, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_COLLECTION_LEN: usize = 63;

/// Name of a remote collection (one per feature, e.g. `meals`).
///
/// Restricted to lowercase ASCII letters, digits, `_` and `-` so it can be
/// used verbatim as a table name and as part of a channel topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    /// Validates and wraps a collection name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_COLLECTION_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if valid {
            Ok(Self(name))
        } else {
            Err(Error::InvalidCollection(name))
        }
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CollectionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for CollectionName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<CollectionName> for String {
    fn from(name: CollectionName) -> Self {
        name.0
    }
}

/// Identifies one change feed: a collection as seen by one owning user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub collection: CollectionName,
    pub user: UserId,
}

impl ChannelKey {
    /// Creates a channel key.
    #[must_use]
    pub fn new(collection: CollectionName, user: UserId) -> Self {
        Self { collection, user }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.user)
    }
}
