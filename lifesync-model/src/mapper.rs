//! Row ⇄ entity translation.

use crate::{Entity, Record};
use lifesync_types::{ChangeEvent, ChangeKind, CollectionName, Row, RowChange, ID_COLUMN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// A row from the remote service could not be translated.
///
/// Always recoverable: the offending row or event is dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("row is not a JSON object")]
    NotAnObject,

    #[error("malformed {collection} row: {reason}")]
    Malformed { collection: String, reason: String },
}

impl From<lifesync_types::Error> for MappingError {
    fn from(err: lifesync_types::Error) -> Self {
        use lifesync_types::Error;
        match err {
            Error::MissingId => Self::MissingField(ID_COLUMN.to_string()),
            Error::InvalidId(value) => Self::InvalidField {
                field: ID_COLUMN.to_string(),
                reason: format!("unusable id {value}"),
            },
            Error::NotAnObject => Self::NotAnObject,
            other => Self::InvalidField {
                field: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

/// Translates rows of one collection into entities and patches back into rows.
///
/// Implementations must be pure: no I/O, no clocks, no shared state.
pub trait EntityMapper: Send + Sync + 'static {
    /// The client-side entity shape.
    type Entity: Entity;

    /// The partial shape accepted by inserts and updates.
    type Patch: Send + Sync;

    /// The collection this mapper translates.
    fn collection(&self) -> &CollectionName;

    /// Maps a full remote row to an entity.
    fn to_entity(&self, row: &Row) -> Result<Self::Entity, MappingError>;

    /// Maps a (possibly partial) patch to the columns it writes.
    fn to_row(&self, patch: &Self::Patch) -> Result<Row, MappingError>;

    /// Maps a transport notification to a typed change event.
    ///
    /// Deletes only need the row's id; inserts and updates need a full row.
    fn to_event(&self, change: &RowChange) -> Result<ChangeEvent<Self::Entity>, MappingError> {
        match change.kind {
            ChangeKind::Insert => self.to_entity(&change.row).map(ChangeEvent::Inserted),
            ChangeKind::Update => self.to_entity(&change.row).map(ChangeEvent::Updated),
            ChangeKind::Delete => Ok(ChangeEvent::Deleted(change.row.entity_id()?)),
        }
    }
}

/// Serde-driven mapper.
///
/// Field renames, defaults and column types are declared with serde
/// attributes on `E` (and on the patch type `P`), typically together with the
/// helpers in [`crate::fields`].
pub struct JsonMapper<E, P = E> {
    collection: CollectionName,
    _marker: PhantomData<fn() -> (E, P)>,
}

impl<E, P> JsonMapper<E, P> {
    /// Creates a mapper for the given collection.
    pub fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            _marker: PhantomData,
        }
    }
}

impl<E, P> Clone for JsonMapper<E, P> {
    fn clone(&self) -> Self {
        Self::new(self.collection.clone())
    }
}

impl<E, P> fmt::Debug for JsonMapper<E, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonMapper")
            .field("collection", &self.collection)
            .field("entity", &std::any::type_name::<E>())
            .finish()
    }
}

impl<E, P> EntityMapper for JsonMapper<E, P>
where
    E: Entity + DeserializeOwned,
    P: Serialize + Send + Sync + 'static,
{
    type Entity = E;
    type Patch = P;

    fn collection(&self) -> &CollectionName {
        &self.collection
    }

    fn to_entity(&self, row: &Row) -> Result<E, MappingError> {
        // Reject id-less rows up front so the error names the column.
        row.entity_id()?;
        serde_json::from_value(row.to_value()).map_err(|e| MappingError::Malformed {
            collection: self.collection.to_string(),
            reason: e.to_string(),
        })
    }

    fn to_row(&self, patch: &P) -> Result<Row, MappingError> {
        let value = serde_json::to_value(patch).map_err(|e| MappingError::Malformed {
            collection: self.collection.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Row::from_value(value)?)
    }
}

/// Mapper for schemaless [`Record`]s. Patches are plain rows.
#[derive(Debug, Clone)]
pub struct RecordMapper {
    collection: CollectionName,
}

impl RecordMapper {
    pub fn new(collection: CollectionName) -> Self {
        Self { collection }
    }
}

impl EntityMapper for RecordMapper {
    type Entity = Record;
    type Patch = Row;

    fn collection(&self) -> &CollectionName {
        &self.collection
    }

    fn to_entity(&self, row: &Row) -> Result<Record, MappingError> {
        let id = row.entity_id()?;
        let mut data = row.clone().into_inner();
        data.remove(ID_COLUMN);
        Ok(Record { id, data })
    }

    fn to_row(&self, patch: &Row) -> Result<Row, MappingError> {
        Ok(patch.clone())
    }
}
