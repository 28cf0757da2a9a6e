//! In-process backend implementing both [`DataService`] and
//! [`RealtimeTransport`].
//!
//! Writes go to per-collection tables and are echoed to every open feed of
//! the owning user, the way the remote service echoes committed rows. Tests
//! use the extra hooks to inject events, drop feeds and fail writes.

use crate::error::{SubscriptionError, SyncError, SyncResult, WriteError};
use crate::lock;
use crate::service::DataService;
use crate::transport::{ChangeFeed, RealtimeTransport};
use async_trait::async_trait;
use lifesync_types::{
    ChannelKey, CollectionName, EntityId, Row, RowChange, UserId, ID_COLUMN, OWNER_COLUMN,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct BackendState {
    tables: HashMap<CollectionName, Vec<Row>>,
    next_id: u64,
    feeds: HashMap<ChannelKey, Vec<mpsc::Sender<RowChange>>>,
    opens: HashMap<ChannelKey, usize>,
    closes: HashMap<ChannelKey, usize>,
    failing_writes: VecDeque<WriteError>,
    failing_opens: usize,
}

impl BackendState {
    fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId::from(self.next_id.to_string())
    }

    fn broadcast(&mut self, collection: &CollectionName, owner: &UserId, change: RowChange) -> usize {
        let key = ChannelKey::new(collection.clone(), *owner);
        let Some(senders) = self.feeds.get_mut(&key) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in senders.iter() {
            match tx.try_send(change.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Feed for {} not accepting changes: {}", key, e),
            }
        }
        delivered
    }

    fn find(&self, collection: &CollectionName, owner: &UserId, id: &EntityId) -> Option<usize> {
        self.tables.get(collection)?.iter().position(|row| {
            row.entity_id().is_ok_and(|rid| rid == *id)
                && row.owner().ok().flatten().as_ref() == Some(owner)
        })
    }
}

/// Rows and change feeds held in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryBackend")
            .field("tables", &state.tables.len())
            .field("feeds", &state.feeds.len())
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds rows to a collection without emitting change events.
    pub fn seed(&self, collection: &CollectionName, rows: impl IntoIterator<Item = Row>) {
        lock(&self.state)
            .tables
            .entry(collection.clone())
            .or_default()
            .extend(rows);
    }

    /// Every row currently stored in `collection`.
    pub fn rows(&self, collection: &CollectionName) -> Vec<Row> {
        lock(&self.state)
            .tables
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Pushes a change onto every open feed for `key`, bypassing the
    /// tables. Returns how many feeds received it.
    pub fn emit(&self, key: &ChannelKey, change: RowChange) -> usize {
        lock(&self.state).broadcast(&key.collection, &key.user, change)
    }

    /// Drops every open feed for `key`, as a lost connection would.
    pub fn disconnect(&self, key: &ChannelKey) {
        let dropped = lock(&self.state).feeds.remove(key).map_or(0, |s| s.len());
        debug!("Disconnected {} feeds for {}", dropped, key);
    }

    /// Fails the next write (insert, update or delete) with `error`.
    pub fn fail_next_write(&self, error: WriteError) {
        lock(&self.state).failing_writes.push_back(error);
    }

    /// Fails the next `count` channel opens.
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).failing_opens = count;
    }

    /// How many times a feed for `key` was opened.
    pub fn open_count(&self, key: &ChannelKey) -> usize {
        lock(&self.state).opens.get(key).copied().unwrap_or(0)
    }

    /// How many times a feed for `key` was closed.
    pub fn close_count(&self, key: &ChannelKey) -> usize {
        lock(&self.state).closes.get(key).copied().unwrap_or(0)
    }

    /// Feeds for `key` whose receiver is still alive.
    pub fn live_feeds(&self, key: &ChannelKey) -> usize {
        lock(&self.state)
            .feeds
            .get(key)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl DataService for MemoryBackend {
    async fn fetch_all(&self, collection: &CollectionName, owner: &UserId) -> SyncResult<Vec<Row>> {
        let state = lock(&self.state);
        Ok(state
            .tables
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.owner().ok().flatten().as_ref() == Some(owner))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        collection: &CollectionName,
        owner: &UserId,
        mut row: Row,
    ) -> Result<Row, WriteError> {
        let mut state = lock(&self.state);
        if let Some(e) = state.failing_writes.pop_front() {
            return Err(e);
        }

        let id = match row.entity_id() {
            Ok(id) => id,
            Err(_) => state.allocate_id(),
        };
        if state.find(collection, owner, &id).is_some() {
            return Err(WriteError::Rejected {
                code: Some("23505".into()),
                message: format!("duplicate key value violates unique constraint: id={id}"),
            });
        }
        row.insert(ID_COLUMN, Value::String(id.to_string()));
        row.set_owner(*owner);

        state
            .tables
            .entry(collection.clone())
            .or_default()
            .push(row.clone());
        state.broadcast(collection, owner, RowChange::insert(row.clone()));
        Ok(row)
    }

    async fn update(
        &self,
        collection: &CollectionName,
        owner: &UserId,
        id: &EntityId,
        mut patch: Row,
    ) -> Result<Row, WriteError> {
        let mut state = lock(&self.state);
        if let Some(e) = state.failing_writes.pop_front() {
            return Err(e);
        }

        let pos = state
            .find(collection, owner, id)
            .ok_or_else(|| WriteError::NotFound(id.clone()))?;
        patch.remove(ID_COLUMN);
        patch.remove(OWNER_COLUMN);
        let row = {
            let Some(row) = state.tables.get_mut(collection).and_then(|t| t.get_mut(pos)) else {
                return Err(WriteError::NotFound(id.clone()));
            };
            row.merge(&patch);
            row.clone()
        };
        state.broadcast(collection, owner, RowChange::update(row.clone()));
        Ok(row)
    }

    async fn delete(
        &self,
        collection: &CollectionName,
        owner: &UserId,
        id: &EntityId,
    ) -> Result<(), WriteError> {
        let mut state = lock(&self.state);
        if let Some(e) = state.failing_writes.pop_front() {
            return Err(e);
        }

        let pos = state
            .find(collection, owner, id)
            .ok_or_else(|| WriteError::NotFound(id.clone()))?;
        let removed = state
            .tables
            .get_mut(collection)
            .map(|table| table.remove(pos))
            .ok_or_else(|| WriteError::NotFound(id.clone()))?;

        let mut old = Row::new();
        if let Some(value) = removed.get(ID_COLUMN) {
            old.insert(ID_COLUMN, value.clone());
        }
        old.set_owner(*owner);
        state.broadcast(collection, owner, RowChange::delete(old));
        Ok(())
    }
}

#[async_trait]
impl RealtimeTransport for MemoryBackend {
    async fn open(&self, key: &ChannelKey) -> SyncResult<ChangeFeed> {
        let mut state = lock(&self.state);
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(SyncError::Subscription(SubscriptionError::OpenFailed {
                key: key.clone(),
                reason: "injected failure".into(),
            }));
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        state.feeds.entry(key.clone()).or_default().push(tx);
        *state.opens.entry(key.clone()).or_default() += 1;
        debug!("Opened memory feed for {}", key);
        Ok(rx)
    }

    async fn close(&self, key: &ChannelKey) {
        let mut state = lock(&self.state);
        *state.closes.entry(key.clone()).or_default() += 1;
        if let Some(senders) = state.feeds.get_mut(key) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                state.feeds.remove(key);
            }
        }
        debug!("Closed memory feed for {}", key);
    }
}
