//! Core type definitions for lifesync.
//!
//! This crate defines the fundamental, feature-agnostic types shared by the
//! sync layer:
//! - User and entity identifiers
//! - Collection names and per-user channel keys
//! - The remote row shape and its wire-level change notification
//! - Typed change events delivered to reconciliation
//!
//! Feature-specific entities (meals, priorities, mood entries, ...) belong in
//! their feature modules, not here.

mod change;
mod collection;
mod ids;
mod row;

pub use change::{ChangeEvent, ChangeKind, RowChange};
pub use collection::{ChannelKey, CollectionName};
pub use ids::{EntityId, UserId};
pub use row::{Row, ID_COLUMN, OWNER_COLUMN};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("row is not a JSON object")]
    NotAnObject,

    #[error("row has no `id` column")]
    MissingId,

    #[error("invalid entity id: {0}")]
    InvalidId(String),
}
