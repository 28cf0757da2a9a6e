//! Channel registry: one transport subscription per (collection, user).
//!
//! Feature modules subscribe to a [`ChannelKey`] and receive every change
//! row for it. The first subscriber opens the transport channel; later ones
//! share it. When the last subscriber leaves, the channel is closed after a
//! short grace period so an unmount/remount in quick succession reuses the
//! open channel instead of flapping it.
//!
//! Each open channel is driven by a pump task that owns the transport feed:
//! it forwards rows to listeners in transport order, reconnects with
//! exponential backoff when the feed drops, and pairs every successful
//! `open` with exactly one `close`. A channel reopened for a key whose
//! previous pump is still shutting down waits for that pump, so the
//! transport always sees the old `close` before the new `open`.
//!
//! Events lost while a feed is down are not recovered here. Listeners learn
//! about the gap through [`ChannelStatus::Reconnected`] and must reload.

use crate::config::SyncConfig;
use crate::error::SubscriptionError;
use crate::listener::{ChangeHandlers, ChangeListener, ChannelStatus};
use crate::transport::{ChangeFeed, RealtimeTransport};
use crate::{lock, read, write};
use lifesync_types::{ChangeKind, ChannelKey, RowChange};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Arc<RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>>;

/// Registry state for one open channel.
struct ChannelSlot {
    listeners: ListenerList,
    status: Arc<Mutex<ChannelStatus>>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
    /// Bumped whenever the slot gains or loses its last listener; a pending
    /// close only runs if the ticket it captured is still current.
    close_ticket: u64,
}

impl ChannelSlot {
    /// Signals the pump to stop and hands back its task.
    fn shut_down(mut self) -> Option<JoinHandle<()>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.pump.take()
    }

    fn listener_count(&self) -> usize {
        read(&self.listeners).len()
    }
}

struct RegistryInner {
    transport: Arc<dyn RealtimeTransport>,
    config: SyncConfig,
    channels: Mutex<HashMap<ChannelKey, ChannelSlot>>,
    /// Pumps told to stop whose transport channel may still be closing.
    /// Locked after `channels` when both are held.
    draining: Mutex<HashMap<ChannelKey, JoinHandle<()>>>,
    next_listener: AtomicU64,
}

/// Shares transport channels between all feature modules of a session.
///
/// Cheap to clone; clones share the same channels. Must be used from within
/// a Tokio runtime (opening a channel spawns its pump task).
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channel_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ChannelRegistry {
    /// Creates a registry over the given transport.
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                draining: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Registers `listener` for the change feed of `key`.
    ///
    /// Opens the transport channel if this is the first listener for `key`
    /// (or cancels a pending close if the channel is in its grace period).
    /// A listener joining a channel that is already past `Connecting` is
    /// told its current status immediately.
    pub fn subscribe(&self, key: ChannelKey, listener: Arc<dyn ChangeListener>) -> Subscription {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));

        let current = {
            let mut channels = lock(&self.inner.channels);
            let slot = match channels.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    let slot = entry.into_mut();
                    slot.close_ticket += 1;
                    debug!("Reusing channel {} ({} listeners)", key, slot.listener_count());
                    slot
                }
                Entry::Vacant(entry) => entry.insert(self.inner.open_slot(&key)),
            };
            write(&slot.listeners).push((id, listener.clone()));
            match lock(&slot.status).clone() {
                ChannelStatus::Connecting => None,
                // The gap predates this listener.
                ChannelStatus::Reconnected => Some(ChannelStatus::Connected),
                status => Some(status),
            }
        };

        if let Some(status) = current {
            guarded(&key, || listener.on_status(&status));
        }

        Subscription {
            registry: Arc::downgrade(&self.inner),
            key,
            id,
            released: false,
        }
    }

    /// Registers three closures (and optionally a status callback).
    pub fn subscribe_with(&self, key: ChannelKey, handlers: ChangeHandlers) -> Subscription {
        self.subscribe(key, Arc::new(handlers))
    }

    /// Number of open channels (including ones in their grace period).
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Number of listeners registered for `key`.
    pub fn listener_count(&self, key: &ChannelKey) -> usize {
        lock(&self.inner.channels)
            .get(key)
            .map_or(0, ChannelSlot::listener_count)
    }

    /// Whether a channel exists for `key`.
    pub fn is_open(&self, key: &ChannelKey) -> bool {
        lock(&self.inner.channels).contains_key(key)
    }

    /// Current status of the channel for `key`, if it exists.
    pub fn channel_status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        lock(&self.inner.channels)
            .get(key)
            .map(|slot| lock(&slot.status).clone())
    }
}

impl RegistryInner {
    fn open_slot(&self, key: &ChannelKey) -> ChannelSlot {
        info!("Opening channel {}", key);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));
        let status = Arc::new(Mutex::new(ChannelStatus::Connecting));

        let previous = lock(&self.draining)
            .remove(key)
            .filter(|handle| !handle.is_finished());
        if previous.is_some() {
            debug!("Channel {} waits for its previous pump to close", key);
        }
        let pump = Pump {
            key: key.clone(),
            transport: self.transport.clone(),
            listeners: listeners.clone(),
            status: status.clone(),
            config: self.config.clone(),
            previous,
        };
        let handle = tokio::spawn(pump.run(shutdown_rx));

        ChannelSlot {
            listeners,
            status,
            shutdown: Some(shutdown_tx),
            pump: Some(handle),
            close_ticket: 0,
        }
    }

    fn retire(&self, key: &ChannelKey, slot: ChannelSlot) {
        let Some(handle) = slot.shut_down() else {
            return;
        };
        let mut draining = lock(&self.draining);
        draining.retain(|_, h| !h.is_finished());
        if !handle.is_finished() {
            draining.insert(key.clone(), handle);
        }
    }

    fn unsubscribe(self: &Arc<Self>, key: &ChannelKey, id: ListenerId) {
        let mut channels = lock(&self.channels);
        let Some(slot) = channels.get_mut(key) else {
            return;
        };

        let remaining = {
            let mut listeners = write(&slot.listeners);
            listeners.retain(|(lid, _)| *lid != id);
            listeners.len()
        };
        debug!("Listener {:?} left channel {} ({} remaining)", id, key, remaining);
        if remaining > 0 {
            return;
        }

        slot.close_ticket += 1;
        let ticket = slot.close_ticket;
        let grace = self.config.teardown_grace();

        if !grace.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let registry = Arc::downgrade(self);
                let key = key.clone();
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.close_if_idle(&key, ticket);
                    }
                });
                return;
            }
        }

        if let Some(slot) = channels.remove(key) {
            info!("Closing channel {}", key);
            self.retire(key, slot);
        }
    }

    fn close_if_idle(&self, key: &ChannelKey, ticket: u64) {
        let mut channels = lock(&self.channels);
        let idle = channels
            .get(key)
            .is_some_and(|slot| slot.close_ticket == ticket && slot.listener_count() == 0);
        if !idle {
            return;
        }
        if let Some(slot) = channels.remove(key) {
            info!("Closing idle channel {}", key);
            self.retire(key, slot);
        }
    }
}

/// One listener's registration. Unsubscribes on [`Subscription::unsubscribe`]
/// or when dropped, whichever comes first.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    key: ChannelKey,
    id: ListenerId,
    released: bool,
}

impl Subscription {
    /// The channel this subscription listens to.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// This listener's id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes exactly this listener. Closes the channel (after the grace
    /// period) if it was the last one.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

enum FeedEnd {
    Shutdown,
    Dropped,
}

/// Background task owning one transport channel.
struct Pump {
    key: ChannelKey,
    transport: Arc<dyn RealtimeTransport>,
    listeners: ListenerList,
    status: Arc<Mutex<ChannelStatus>>,
    config: SyncConfig,
    /// Pump of the channel this one replaces, still closing its feed.
    previous: Option<JoinHandle<()>>,
}

impl Pump {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = previous.await {
                warn!("Previous pump for {} ended abnormally: {}", self.key, e);
            }
            if shutdown_requested(&mut shutdown) {
                return;
            }
        }

        let mut attempt: u32 = 0;
        let mut connected_once = false;

        loop {
            match self.transport.open(&self.key).await {
                Ok(feed) => {
                    if shutdown_requested(&mut shutdown) {
                        drop(feed);
                        self.transport.close(&self.key).await;
                        return;
                    }
                    attempt = 0;
                    if connected_once {
                        warn!(
                            "Channel {} re-established; changes made while it was down were not delivered",
                            self.key
                        );
                        self.set_status(ChannelStatus::Reconnected);
                    } else {
                        debug!("Channel {} connected", self.key);
                        self.set_status(ChannelStatus::Connected);
                    }
                    connected_once = true;

                    let end = self.forward(feed, &mut shutdown).await;
                    self.transport.close(&self.key).await;
                    match end {
                        FeedEnd::Shutdown => {
                            debug!("Channel {} closed", self.key);
                            return;
                        }
                        FeedEnd::Dropped => {
                            warn!("Channel {} dropped by transport", self.key);
                            self.set_status(ChannelStatus::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to open channel {}: {}", self.key, e);
                    if shutdown_requested(&mut shutdown) {
                        return;
                    }
                }
            }

            attempt += 1;
            if attempt > self.config.reconnect_attempts {
                let err = SubscriptionError::RetriesExhausted {
                    key: self.key.clone(),
                    attempts: self.config.reconnect_attempts,
                };
                error!("{}", err);
                self.set_status(ChannelStatus::Degraded(err));
                let _ = (&mut shutdown).await;
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            debug!(
                "Reconnecting channel {} in {:?} (attempt {}/{})",
                self.key, delay, attempt, self.config.reconnect_attempts
            );
            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn forward(&self, mut feed: ChangeFeed, shutdown: &mut oneshot::Receiver<()>) -> FeedEnd {
        loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown => return FeedEnd::Shutdown,
                change = feed.recv() => match change {
                    Some(change) => self.dispatch(change),
                    None => return FeedEnd::Dropped,
                },
            }
        }
    }

    fn dispatch(&self, change: RowChange) {
        match change.row.owner() {
            Ok(Some(owner)) if owner != self.key.user => {
                warn!(
                    "Dropping {:?} on channel {}: row belongs to user {}",
                    change.kind, self.key, owner
                );
                return;
            }
            Err(e) => {
                warn!("Dropping {:?} on channel {}: {}", change.kind, self.key, e);
                return;
            }
            _ => {}
        }

        let listeners = self.snapshot();
        match change.kind {
            ChangeKind::Insert => {
                for listener in &listeners {
                    guarded(&self.key, || listener.on_insert(&change.row));
                }
            }
            ChangeKind::Update => {
                for listener in &listeners {
                    guarded(&self.key, || listener.on_update(&change.row));
                }
            }
            ChangeKind::Delete => match change.row.entity_id() {
                Ok(id) => {
                    for listener in &listeners {
                        guarded(&self.key, || listener.on_delete(&id));
                    }
                }
                Err(e) => warn!("Dropping delete on channel {}: {}", self.key, e),
            },
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        *lock(&self.status) = status.clone();
        for listener in self.snapshot() {
            guarded(&self.key, || listener.on_status(&status));
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        read(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

fn shutdown_requested(shutdown: &mut oneshot::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

/// Runs a listener callback, containing panics.
fn guarded(key: &ChannelKey, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Listener on channel {} panicked; event skipped for it", key);
    }
}
