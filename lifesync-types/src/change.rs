//! Change notifications for a collection.
//!
//! [`RowChange`] is what the realtime transport delivers: an operation tag
//! and the affected row. [`ChangeEvent`] is the same notification after the
//! row has been mapped into a client entity.

use crate::{EntityId, Row};
use serde::{Deserialize, Serialize};

/// The kind of remote operation that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A raw change notification from the transport.
///
/// For deletes the row usually carries only the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub row: Row,
}

impl RowChange {
    /// An insert notification.
    #[must_use]
    pub fn insert(row: Row) -> Self {
        Self { kind: ChangeKind::Insert, row }
    }

    /// An update notification.
    #[must_use]
    pub fn update(row: Row) -> Self {
        Self { kind: ChangeKind::Update, row }
    }

    /// A delete notification.
    #[must_use]
    pub fn delete(row: Row) -> Self {
        Self { kind: ChangeKind::Delete, row }
    }
}

/// A change to one entity of a collection, already mapped to the client shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<E> {
    /// The entity was created remotely.
    Inserted(E),
    /// The entity was modified remotely.
    Updated(E),
    /// The entity with this id was removed remotely.
    Deleted(EntityId),
}

impl<E> ChangeEvent<E> {
    /// The kind of operation this event carries.
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Inserted(_) => ChangeKind::Insert,
            Self::Updated(_) => ChangeKind::Update,
            Self::Deleted(_) => ChangeKind::Delete,
        }
    }

    /// Maps the entity payload, keeping the operation.
    pub fn map<F, T>(self, f: F) -> ChangeEvent<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::Inserted(e) => ChangeEvent::Inserted(f(e)),
            Self::Updated(e) => ChangeEvent::Updated(f(e)),
            Self::Deleted(id) => ChangeEvent::Deleted(id),
        }
    }
}
