//! Remote data service abstraction: row-level CRUD scoped by owner.

use crate::error::{SyncResult, WriteError};
use async_trait::async_trait;
use lifesync_types::{CollectionName, EntityId, Row, UserId};

/// Row-level CRUD against the remote relational service.
///
/// Every call names the owning user explicitly; access control is enforced
/// by the service, never assumed here.
#[async_trait]
pub trait DataService: Send + Sync + 'static {
    /// Fetches every row of `collection` owned by `owner`.
    async fn fetch_all(&self, collection: &CollectionName, owner: &UserId) -> SyncResult<Vec<Row>>;

    /// Inserts a row and returns the stored, authoritative row.
    async fn insert(
        &self,
        collection: &CollectionName,
        owner: &UserId,
        row: Row,
    ) -> Result<Row, WriteError>;

    /// Applies `patch` to the row `id` and returns the stored row.
    async fn update(
        &self,
        collection: &CollectionName,
        owner: &UserId,
        id: &EntityId,
        patch: Row,
    ) -> Result<Row, WriteError>;

    /// Deletes the row `id`.
    async fn delete(
        &self,
        collection: &CollectionName,
        owner: &UserId,
        id: &EntityId,
    ) -> Result<(), WriteError>;
}
