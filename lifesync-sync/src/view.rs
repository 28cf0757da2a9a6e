//! Local view: the reconciled, ordered entity list of one feature module.
//!
//! A `LocalView` enforces the id-uniqueness invariant and the tombstone rule
//! (an id removed by a delete is not brought back by a late insert or write
//! confirmation until the next full load). It performs no I/O; the
//! reconciliation engine is its only writer.
//!
//! Tombstones are kept until the next [`LocalView::replace_all`]. A local
//! removal only tombstones ids that were in the view; a remote delete
//! tombstones its id unconditionally, since the matching insert may still be
//! in flight. A session that never reloads therefore grows the set by one
//! entry per remotely deleted id.

use lifesync_model::Entity;
use lifesync_types::{ChangeEvent, EntityId};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

type Comparator<E> = Arc<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

/// How a view orders its entities.
pub enum ViewOrder<E> {
    /// Loaded order, new entities appended.
    Arrival,
    /// Loaded order, new entities prepended.
    NewestFirst,
    /// Always sorted by the comparator (stable). Re-sorted after every change.
    Sorted(Comparator<E>),
}

impl<E> ViewOrder<E> {
    /// Sort with a comparator.
    pub fn by(cmp: impl Fn(&E, &E) -> Ordering + Send + Sync + 'static) -> Self {
        Self::Sorted(Arc::new(cmp))
    }

    /// Sort ascending by a key.
    pub fn by_key<K: Ord>(key: impl Fn(&E) -> K + Send + Sync + 'static) -> Self {
        Self::by(move |a, b| key(a).cmp(&key(b)))
    }

    /// Sort descending by a key (e.g. newest timestamp first).
    pub fn by_key_desc<K: Ord>(key: impl Fn(&E) -> K + Send + Sync + 'static) -> Self {
        Self::by(move |a, b| key(b).cmp(&key(a)))
    }
}

impl<E> Clone for ViewOrder<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Arrival => Self::Arrival,
            Self::NewestFirst => Self::NewestFirst,
            Self::Sorted(cmp) => Self::Sorted(cmp.clone()),
        }
    }
}

impl<E> Default for ViewOrder<E> {
    fn default() -> Self {
        Self::Arrival
    }
}

impl<E> fmt::Debug for ViewOrder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arrival => f.write_str("Arrival"),
            Self::NewestFirst => f.write_str("NewestFirst"),
            Self::Sorted(_) => f.write_str("Sorted(..)"),
        }
    }
}

/// Why an id is tombstoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    /// Removed locally; the remote delete may still fail.
    Pending,
    /// The remote service reported the delete.
    Confirmed,
}

/// Ordered set of entities keyed by id.
pub struct LocalView<E> {
    items: Vec<E>,
    order: ViewOrder<E>,
    tombstones: HashMap<EntityId, Tombstone>,
}

impl<E: Entity> Default for LocalView<E> {
    fn default() -> Self {
        Self::new(ViewOrder::Arrival)
    }
}

impl<E: Entity + fmt::Debug> fmt::Debug for LocalView<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalView")
            .field("items", &self.items)
            .field("order", &self.order)
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

impl<E: Entity> LocalView<E> {
    /// Creates an empty view.
    pub fn new(order: ViewOrder<E>) -> Self {
        Self {
            items: Vec::new(),
            order,
            tombstones: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[E] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<E> {
        self.items.clone()
    }

    /// Ids in view order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.items.iter().map(|e| e.id().clone()).collect()
    }

    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|e| e.id() == id)
    }

    pub fn get(&self, id: &EntityId) -> Option<&E> {
        self.items.iter().find(|e| e.id() == id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.position(id).is_some()
    }

    /// Whether `id` was deleted since the last full load.
    pub fn is_tombstoned(&self, id: &EntityId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Whether a remote delete was seen for `id` since the last full load.
    pub fn is_deleted_remotely(&self, id: &EntityId) -> bool {
        self.tombstones.get(id) == Some(&Tombstone::Confirmed)
    }

    /// Number of tombstoned ids.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Replaces everything with a freshly loaded baseline and forgets
    /// tombstones. Duplicate ids keep their first occurrence; returns how
    /// many duplicates were dropped.
    pub fn replace_all(&mut self, entities: impl IntoIterator<Item = E>) -> usize {
        let mut seen = HashSet::new();
        let mut dropped = 0;
        self.items.clear();
        self.tombstones.clear();
        for entity in entities {
            if seen.insert(entity.id().clone()) {
                self.items.push(entity);
            } else {
                dropped += 1;
            }
        }
        self.reorder();
        dropped
    }

    /// Adds an entity unless its id is already present or tombstoned.
    pub fn insert(&mut self, entity: E) -> bool {
        if self.contains(entity.id()) || self.is_tombstoned(entity.id()) {
            return false;
        }
        self.place(entity);
        true
    }

    /// Replaces the entity with the same id, or adds it if absent.
    /// Tombstoned ids are left alone.
    pub fn upsert(&mut self, entity: E) -> bool {
        if self.is_tombstoned(entity.id()) {
            return false;
        }
        if self.replace(entity.clone()).is_none() {
            self.place(entity);
        }
        true
    }

    /// Replaces the entity with the same id. Absent ids are ignored.
    /// Returns the previous value.
    pub fn replace(&mut self, entity: E) -> Option<E> {
        let pos = self.position(entity.id())?;
        let previous = std::mem::replace(&mut self.items[pos], entity);
        self.reorder();
        Some(previous)
    }

    /// Removes an entity ahead of a remote delete and tombstones its id.
    /// Absent ids are left alone. Returns the removed entity with its former
    /// position.
    pub fn remove(&mut self, id: &EntityId) -> Option<(usize, E)> {
        let pos = self.position(id)?;
        self.tombstones.entry(id.clone()).or_insert(Tombstone::Pending);
        Some((pos, self.items.remove(pos)))
    }

    /// Applies a delete reported by the remote service. Idempotent; the id
    /// stays tombstoned even if it is not (yet) in the view, and no rollback
    /// can lift it.
    pub fn remove_confirmed(&mut self, id: &EntityId) -> Option<(usize, E)> {
        self.tombstones.insert(id.clone(), Tombstone::Confirmed);
        let pos = self.position(id)?;
        Some((pos, self.items.remove(pos)))
    }

    /// Removes an entity without tombstoning it (used to drop placeholders).
    pub fn discard(&mut self, id: &EntityId) -> Option<E> {
        let pos = self.position(id)?;
        Some(self.items.remove(pos))
    }

    /// Lifts a pending tombstone on `id`. Remote deletes are kept.
    pub fn untombstone(&mut self, id: &EntityId) -> bool {
        if self.is_deleted_remotely(id) {
            return false;
        }
        self.tombstones.remove(id).is_some()
    }

    /// Puts a locally removed entity back at its former position and lifts
    /// its tombstone. No-op if the id is present again or was deleted
    /// remotely in the meantime.
    pub fn restore(&mut self, position: usize, entity: E) -> bool {
        if self.is_deleted_remotely(entity.id()) {
            return false;
        }
        self.tombstones.remove(entity.id());
        if self.contains(entity.id()) {
            return false;
        }
        let pos = position.min(self.items.len());
        self.items.insert(pos, entity);
        self.reorder();
        true
    }

    /// Swaps a provisional entity for its server-confirmed version.
    ///
    /// If the confirmed id is already present (its insert event won the
    /// race), the provisional entry is dropped and the existing one
    /// replaced, so the view never holds both. A tombstoned confirmed id only
    /// drops the provisional entry.
    pub fn confirm(&mut self, provisional: &EntityId, confirmed: E) -> bool {
        if self.is_tombstoned(confirmed.id()) {
            return self.discard(provisional).is_some();
        }
        if provisional == confirmed.id() {
            return self.upsert(confirmed);
        }
        if self.contains(confirmed.id()) {
            self.discard(provisional);
            self.replace(confirmed);
            return true;
        }
        match self.position(provisional) {
            Some(pos) => {
                self.items[pos] = confirmed;
                self.reorder();
                true
            }
            None => self.insert(confirmed),
        }
    }

    /// Applies an inbound change event.
    ///
    /// Inserts are idempotent, updates only touch present ids (last writer
    /// wins), deletes are idempotent and tombstone the id for good.
    pub fn apply(&mut self, event: ChangeEvent<E>) -> bool {
        match event {
            ChangeEvent::Inserted(entity) => self.insert(entity),
            ChangeEvent::Updated(entity) => self.replace(entity).is_some(),
            ChangeEvent::Deleted(id) => self.remove_confirmed(&id).is_some(),
        }
    }

    fn place(&mut self, entity: E) {
        match &self.order {
            ViewOrder::NewestFirst => self.items.insert(0, entity),
            ViewOrder::Arrival | ViewOrder::Sorted(_) => self.items.push(entity),
        }
        self.reorder();
    }

    fn reorder(&mut self) {
        if let ViewOrder::Sorted(cmp) = &self.order {
            let cmp = cmp.clone();
            self.items.sort_by(|a, b| cmp(a, b));
        }
    }
}

/// A single view mutation. The engine funnels every change through these so
/// they can be journaled while a load is in flight and replayed on top of
/// the loaded baseline.
#[derive(Clone)]
pub(crate) enum ViewOp<E> {
    Insert(E),
    Upsert(E),
    Replace(E),
    Remove(EntityId),
    RemoteRemove(EntityId),
    Discard(EntityId),
    Untombstone(EntityId),
    Restore { position: usize, entity: E },
    Confirm { provisional: EntityId, confirmed: E },
}

impl<E: Entity> ViewOp<E> {
    pub(crate) fn apply_to(self, view: &mut LocalView<E>) -> bool {
        match self {
            Self::Insert(entity) => view.insert(entity),
            Self::Upsert(entity) => view.upsert(entity),
            Self::Replace(entity) => view.replace(entity).is_some(),
            Self::Remove(id) => view.remove(&id).is_some(),
            Self::RemoteRemove(id) => view.remove_confirmed(&id).is_some(),
            Self::Discard(id) => view.discard(&id).is_some(),
            Self::Untombstone(id) => view.untombstone(&id),
            Self::Restore { position, entity } => view.restore(position, entity),
            Self::Confirm {
                provisional,
                confirmed,
            } => view.confirm(&provisional, confirmed),
        }
    }
}

impl<E> From<ChangeEvent<E>> for ViewOp<E> {
    fn from(event: ChangeEvent<E>) -> Self {
        match event {
            ChangeEvent::Inserted(entity) => Self::Insert(entity),
            ChangeEvent::Updated(entity) => Self::Replace(entity),
            ChangeEvent::Deleted(id) => Self::RemoteRemove(id),
        }
    }
}
