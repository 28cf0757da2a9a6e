//! Reconciliation engine: the single writer of a feature's local view.
//!
//! Three inputs feed one [`LocalView`]:
//! 1. Full loads from the data service (the baseline).
//! 2. Local writes: an optional optimistic change, the remote write, then
//!    either the server-confirmed entity or a rollback.
//! 3. Change events from the channel registry.
//!
//! The view sits behind a synchronous mutex that is never held across an
//! `.await`, so writes and loads can be in flight while events keep being
//! applied. Every asynchronous result is checked against the engine's
//! generation before it touches the view; stopping sync advances the
//! generation, which discards results that resolve afterwards.
//!
//! Conflicts are last-writer-wins: an update event replaces the entity as
//! delivered, without comparing timestamps or versions.

use crate::error::{SyncError, SyncResult, WriteError};
use crate::listener::{ChangeListener, ChannelStatus};
use crate::lock;
use crate::registry::{ChannelRegistry, Subscription};
use crate::service::DataService;
use crate::view::{LocalView, ViewOp, ViewOrder};
use lifesync_model::{Entity, EntityMapper};
use lifesync_types::{
    ChangeEvent, ChannelKey, CollectionName, EntityId, Row, RowChange, UserId, ID_COLUMN,
    OWNER_COLUMN,
};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sync health of an engine, as a feature module should present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not listening to the change feed.
    Idle,
    /// Waiting for the change feed to open.
    Connecting,
    /// Change feed is open.
    Live,
    /// Change feed dropped; reconnecting.
    Reconnecting,
    /// Change feed came back after a gap; the view may be stale until the
    /// next [`ReconciliationEngine::load`].
    ReloadRequired,
    /// Change feed is gone for good; prompt the user to reload.
    Degraded(String),
}

/// What a [`ReconciliationEngine::load`] did with its fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The fetch replaced the view.
    Applied {
        /// Rows returned by the data service.
        fetched: usize,
        /// Entities in the view afterwards, replayed changes included.
        loaded: usize,
    },
    /// A newer load started first; its result (or error) decides the view.
    /// The fetch was not applied and its error, if any, was not reported.
    Superseded,
    /// Sync stopped while the fetch was in flight.
    Discarded,
}

impl LoadOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// An optimistic change applied before the remote write resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimistic<E> {
    /// A provisional entity, usually carrying [`EntityId::temporary`].
    Insert(E),
    /// The expected new state of an existing entity.
    Update(E),
}

/// How to take an optimistic change back.
enum Undo<E> {
    Inserted { provisional: EntityId },
    Updated { previous: E },
    Deleted { id: EntityId, previous: Option<(usize, E)> },
}

struct EngineState<E> {
    view: LocalView<E>,
    generation: u64,
    load_ticket: u64,
    /// Ops applied while a load is in flight, replayed onto its result.
    journal: Option<Vec<ViewOp<E>>>,
}

impl<E: Entity> EngineState<E> {
    fn apply(&mut self, op: ViewOp<E>) -> bool {
        if let Some(journal) = &mut self.journal {
            journal.push(op.clone());
        }
        op.apply_to(&mut self.view)
    }
}

struct EngineInner<M: EntityMapper> {
    mapper: M,
    service: Arc<dyn DataService>,
    registry: ChannelRegistry,
    state: Mutex<EngineState<M::Entity>>,
    status: watch::Sender<SyncStatus>,
    revision: watch::Sender<u64>,
}

/// Reconciles one collection for one feature module.
///
/// Cheap to clone; clones share the same view.
pub struct ReconciliationEngine<M: EntityMapper> {
    inner: Arc<EngineInner<M>>,
}

impl<M: EntityMapper> Clone for ReconciliationEngine<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: EntityMapper> fmt::Debug for ReconciliationEngine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("collection", self.collection())
            .field("len", &self.len())
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl<M: EntityMapper> ReconciliationEngine<M> {
    /// Creates an engine whose view keeps arrival order.
    pub fn new(mapper: M, service: Arc<dyn DataService>, registry: ChannelRegistry) -> Self {
        Self::with_order(mapper, service, registry, ViewOrder::Arrival)
    }

    /// Creates an engine with a feature-defined view order.
    pub fn with_order(
        mapper: M,
        service: Arc<dyn DataService>,
        registry: ChannelRegistry,
        order: ViewOrder<M::Entity>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(EngineInner {
                mapper,
                service,
                registry,
                state: Mutex::new(EngineState {
                    view: LocalView::new(order),
                    generation: 0,
                    load_ticket: 0,
                    journal: None,
                }),
                status,
                revision,
            }),
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    /// The collection this engine reconciles.
    pub fn collection(&self) -> &CollectionName {
        self.inner.mapper.collection()
    }

    /// The mapper in use.
    pub fn mapper(&self) -> &M {
        &self.inner.mapper
    }

    /// Copy of the current view, in view order.
    pub fn snapshot(&self) -> Vec<M::Entity> {
        lock(&self.inner.state).view.to_vec()
    }

    /// Ids of the current view, in view order.
    pub fn ids(&self) -> Vec<EntityId> {
        lock(&self.inner.state).view.ids()
    }

    pub fn get(&self, id: &EntityId) -> Option<M::Entity> {
        lock(&self.inner.state).view.get(id).cloned()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        lock(&self.inner.state).view.contains(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).view.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.state).view.is_empty()
    }

    /// Watches the sync status.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Watches a counter bumped on every view change.
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    // ── Load ─────────────────────────────────────────────────────

    /// Replaces the view with a full fetch of `user`'s rows.
    ///
    /// Changes applied while the fetch is in flight are replayed on top of
    /// the result. If a newer load starts before this one resolves, this
    /// one returns [`LoadOutcome::Superseded`] without touching the view;
    /// await the newer load to learn whether the view was refreshed.
    pub async fn load(&self, user: &UserId) -> SyncResult<LoadOutcome> {
        let (generation, ticket) = {
            let mut state = lock(&self.inner.state);
            state.load_ticket += 1;
            state.journal.get_or_insert_with(Vec::new);
            (state.generation, state.load_ticket)
        };

        let fetched = self
            .inner
            .service
            .fetch_all(self.collection(), user)
            .await;

        let mut state = lock(&self.inner.state);
        if state.load_ticket != ticket {
            debug!("Load of {} superseded by a newer load", self.collection());
            return Ok(LoadOutcome::Superseded);
        }
        let journal = state.journal.take().unwrap_or_default();
        if state.generation != generation {
            debug!("Discarding load of {}: sync stopped", self.collection());
            return Ok(LoadOutcome::Discarded);
        }

        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to load {}: {}", self.collection(), e);
                return Err(e);
            }
        };

        let fetched_count = rows.len();
        let entities = self.inner.map_rows(user, &rows);
        let duplicates = state.view.replace_all(entities);
        if duplicates > 0 {
            warn!(
                "Load of {} returned {} duplicate ids; kept first occurrences",
                self.collection(),
                duplicates
            );
        }
        let replayed = journal.len();
        for op in journal {
            op.apply_to(&mut state.view);
        }
        let loaded = state.view.len();
        drop(state);

        self.inner.bump_revision();
        self.inner.status.send_if_modified(|status| {
            if *status == SyncStatus::ReloadRequired {
                *status = SyncStatus::Live;
                true
            } else {
                false
            }
        });
        info!(
            "Loaded {} {} rows ({} in view, {} replayed changes)",
            fetched_count,
            self.collection(),
            loaded,
            replayed
        );
        Ok(LoadOutcome::Applied {
            fetched: fetched_count,
            loaded,
        })
    }

    /// Loads again if the change feed reported a gap. Returns whether a
    /// load ran and refreshed the view.
    pub async fn reload_if_required(&self, user: &UserId) -> SyncResult<bool> {
        if *self.inner.status.borrow() != SyncStatus::ReloadRequired {
            return Ok(false);
        }
        Ok(self.load(user).await?.is_applied())
    }

    // ── Local writes ─────────────────────────────────────────────

    /// Applies `optimistic` (if any), awaits `write`, then swaps in the
    /// server-confirmed entity or rolls the optimistic change back.
    ///
    /// `write` must resolve to the authoritative row as stored remotely.
    /// Without an optimistic change the confirmed entity is upserted.
    pub async fn mutate<F>(
        &self,
        optimistic: Option<Optimistic<M::Entity>>,
        write: F,
    ) -> SyncResult<M::Entity>
    where
        F: Future<Output = Result<Row, WriteError>>,
    {
        let (generation, undo) = self.inner.apply_optimistic(optimistic);

        let confirmed = write
            .await
            .map_err(SyncError::from)
            .and_then(|row| self.inner.mapper.to_entity(&row).map_err(SyncError::from));

        match confirmed {
            Ok(entity) => {
                self.inner.confirm(generation, undo, entity.clone());
                Ok(entity)
            }
            Err(e) => {
                warn!("Write to {} failed: {}", self.collection(), e);
                if let Some(undo) = undo {
                    self.inner.rollback(generation, undo);
                }
                Err(e)
            }
        }
    }

    /// Optimistically removes `id`, awaits `write`, and restores the entity
    /// if the write fails.
    pub async fn delete<F>(&self, id: &EntityId, write: F) -> SyncResult<()>
    where
        F: Future<Output = Result<(), WriteError>>,
    {
        let (generation, undo) = {
            let mut state = lock(&self.inner.state);
            let previous = state
                .view
                .position(id)
                .and_then(|pos| state.view.get(id).cloned().map(|e| (pos, e)));
            state.apply(ViewOp::Remove(id.clone()));
            (
                state.generation,
                Undo::Deleted {
                    id: id.clone(),
                    previous,
                },
            )
        };
        self.inner.bump_revision();

        match write.await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Delete of {} in {} failed: {}", id, self.collection(), e);
                self.inner.rollback(generation, undo);
                Err(e.into())
            }
        }
    }

    /// Inserts through the data service. The owner column is stamped with
    /// `user`.
    pub async fn insert(
        &self,
        user: &UserId,
        draft: &M::Patch,
        optimistic: Option<M::Entity>,
    ) -> SyncResult<M::Entity> {
        let mut row = self.inner.mapper.to_row(draft)?;
        row.set_owner(*user);
        let service = self.inner.service.clone();
        let collection = self.collection().clone();
        let owner = *user;
        self.mutate(optimistic.map(Optimistic::Insert), async move {
            service.insert(&collection, &owner, row).await
        })
        .await
    }

    /// Updates through the data service. The patch cannot move the row to
    /// another id or owner.
    pub async fn update(
        &self,
        user: &UserId,
        id: &EntityId,
        patch: &M::Patch,
        optimistic: Option<M::Entity>,
    ) -> SyncResult<M::Entity> {
        let mut row = self.inner.mapper.to_row(patch)?;
        row.remove(ID_COLUMN);
        row.remove(OWNER_COLUMN);
        let service = self.inner.service.clone();
        let collection = self.collection().clone();
        let owner = *user;
        let target = id.clone();
        self.mutate(optimistic.map(Optimistic::Update), async move {
            service.update(&collection, &owner, &target, row).await
        })
        .await
    }

    /// Deletes through the data service.
    pub async fn remove(&self, user: &UserId, id: &EntityId) -> SyncResult<()> {
        let service = self.inner.service.clone();
        let collection = self.collection().clone();
        let owner = *user;
        let target = id.clone();
        self.delete(id, async move { service.delete(&collection, &owner, &target).await })
            .await
    }

    // ── Inbound events ───────────────────────────────────────────

    /// Applies an already-mapped change event. Returns whether the view
    /// changed.
    pub fn apply_event(&self, event: ChangeEvent<M::Entity>) -> bool {
        let changed = lock(&self.inner.state).apply(event.into());
        if changed {
            self.inner.bump_revision();
        }
        changed
    }

    /// Maps and applies a raw transport change. Returns whether the view
    /// changed.
    pub fn apply_change(&self, change: &RowChange) -> SyncResult<bool> {
        let event = self.inner.mapper.to_event(change)?;
        Ok(self.apply_event(event))
    }

    // ── Realtime ─────────────────────────────────────────────────

    /// Starts listening to `user`'s change feed for this collection.
    ///
    /// Stop with [`SyncHandle::stop`] (or by dropping the handle) when the
    /// feature module goes away.
    pub fn start_sync(&self, user: UserId) -> SyncHandle {
        let generation = lock(&self.inner.state).generation;
        let key = ChannelKey::new(self.collection().clone(), user);
        let listener = Arc::new(EngineListener {
            engine: Arc::downgrade(&self.inner),
            generation,
        });

        self.inner.set_status(SyncStatus::Connecting);
        let subscription = self.inner.registry.subscribe(key, listener);
        let engine = Arc::downgrade(&self.inner);
        SyncHandle {
            subscription: Some(subscription),
            on_stop: Some(Box::new(move || {
                if let Some(inner) = engine.upgrade() {
                    inner.deactivate();
                }
            })),
        }
    }
}

impl<M: EntityMapper> EngineInner<M> {
    fn map_rows(&self, user: &UserId, rows: &[Row]) -> Vec<M::Entity> {
        rows.iter()
            .filter_map(|row| {
                match row.owner() {
                    Ok(Some(owner)) if owner != *user => {
                        warn!(
                            "Skipping {} row owned by {} in load for {}",
                            self.mapper.collection(),
                            owner,
                            user
                        );
                        return None;
                    }
                    Err(e) => {
                        warn!("Skipping {} row: {}", self.mapper.collection(), e);
                        return None;
                    }
                    _ => {}
                }
                match self.mapper.to_entity(row) {
                    Ok(entity) => Some(entity),
                    Err(e) => {
                        warn!("Skipping {} row: {}", self.mapper.collection(), e);
                        None
                    }
                }
            })
            .collect()
    }

    fn apply_optimistic(
        &self,
        optimistic: Option<Optimistic<M::Entity>>,
    ) -> (u64, Option<Undo<M::Entity>>) {
        let mut state = lock(&self.state);
        let generation = state.generation;
        let undo = match optimistic {
            None => None,
            Some(Optimistic::Insert(entity)) => {
                let provisional = entity.id().clone();
                state
                    .apply(ViewOp::Insert(entity))
                    .then_some(Undo::Inserted { provisional })
            }
            Some(Optimistic::Update(entity)) => {
                let previous = state.view.get(entity.id()).cloned();
                state.apply(ViewOp::Replace(entity));
                previous.map(|previous| Undo::Updated { previous })
            }
        };
        drop(state);
        if undo.is_some() {
            self.bump_revision();
        }
        (generation, undo)
    }

    fn confirm(&self, generation: u64, undo: Option<Undo<M::Entity>>, confirmed: M::Entity) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            debug!(
                "Discarding confirmation for {} in {}: sync stopped",
                confirmed.id(),
                self.mapper.collection()
            );
            return;
        }
        let op = match undo {
            Some(Undo::Inserted { provisional }) => ViewOp::Confirm {
                provisional,
                confirmed,
            },
            Some(Undo::Updated { .. }) => ViewOp::Replace(confirmed),
            Some(Undo::Deleted { .. }) | None => ViewOp::Upsert(confirmed),
        };
        let changed = state.apply(op);
        drop(state);
        if changed {
            self.bump_revision();
        }
    }

    fn rollback(&self, generation: u64, undo: Undo<M::Entity>) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            debug!(
                "Skipping rollback in {}: sync stopped",
                self.mapper.collection()
            );
            return;
        }
        let op = match undo {
            Undo::Inserted { provisional } => ViewOp::Discard(provisional),
            Undo::Updated { previous } => ViewOp::Replace(previous),
            Undo::Deleted {
                previous: Some((position, entity)),
                ..
            } => ViewOp::Restore { position, entity },
            Undo::Deleted { id, previous: None } => ViewOp::Untombstone(id),
        };
        let changed = state.apply(op);
        drop(state);
        if changed {
            self.bump_revision();
        }
        debug!("Rolled back optimistic change in {}", self.mapper.collection());
    }

    fn apply_remote(&self, generation: u64, event: ChangeEvent<M::Entity>) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return;
        }
        let kind = event.kind();
        let changed = state.apply(event.into());
        drop(state);
        if changed {
            self.bump_revision();
        } else {
            debug!("{:?} event for {} left the view unchanged", kind, self.mapper.collection());
        }
    }

    fn on_channel_status(&self, generation: u64, status: &ChannelStatus) {
        if lock(&self.state).generation != generation {
            return;
        }
        let next = match status {
            ChannelStatus::Connecting => SyncStatus::Connecting,
            ChannelStatus::Connected => SyncStatus::Live,
            ChannelStatus::Reconnecting => SyncStatus::Reconnecting,
            ChannelStatus::Reconnected => SyncStatus::ReloadRequired,
            ChannelStatus::Degraded(e) => SyncStatus::Degraded(e.to_string()),
        };
        self.set_status(next);
    }

    fn deactivate(&self) {
        {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.load_ticket += 1;
            state.journal = None;
        }
        self.set_status(SyncStatus::Idle);
        debug!("Stopped sync for {}", self.mapper.collection());
    }

    fn set_status(&self, next: SyncStatus) {
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Bridges registry callbacks into an engine.
struct EngineListener<M: EntityMapper> {
    engine: Weak<EngineInner<M>>,
    generation: u64,
}

impl<M: EntityMapper> EngineListener<M> {
    fn handle(&self, event: impl FnOnce(&M) -> Result<ChangeEvent<M::Entity>, lifesync_model::MappingError>) {
        let Some(inner) = self.engine.upgrade() else {
            return;
        };
        match event(&inner.mapper) {
            Ok(event) => inner.apply_remote(self.generation, event),
            Err(e) => warn!(
                "Dropping change event for {}: {}",
                inner.mapper.collection(),
                e
            ),
        }
    }
}

impl<M: EntityMapper> ChangeListener for EngineListener<M> {
    fn on_insert(&self, row: &Row) {
        self.handle(|mapper| mapper.to_entity(row).map(ChangeEvent::Inserted));
    }

    fn on_update(&self, row: &Row) {
        self.handle(|mapper| mapper.to_entity(row).map(ChangeEvent::Updated));
    }

    fn on_delete(&self, id: &EntityId) {
        self.handle(|_| Ok(ChangeEvent::Deleted(id.clone())));
    }

    fn on_status(&self, status: &ChannelStatus) {
        if let Some(inner) = self.engine.upgrade() {
            inner.on_channel_status(self.generation, status);
        }
    }
}

/// Keeps an engine subscribed to its change feed.
///
/// [`SyncHandle::stop`] (or dropping the handle) unsubscribes and discards
/// every load or write result that resolves afterwards.
#[must_use = "dropping a SyncHandle stops sync immediately"]
pub struct SyncHandle {
    subscription: Option<Subscription>,
    on_stop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SyncHandle {
    /// The channel this handle listens to.
    pub fn key(&self) -> Option<&ChannelKey> {
        self.subscription.as_ref().map(Subscription::key)
    }

    /// Stops sync.
    pub fn stop(self) {}
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandle")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
