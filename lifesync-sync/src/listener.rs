//! Listener side of the channel registry.

use crate::error::SubscriptionError;
use lifesync_types::{EntityId, Row};
use std::fmt;

/// Lifecycle of a channel as seen by its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Waiting for the transport to open the feed.
    Connecting,
    /// The feed is open.
    Connected,
    /// The feed dropped; a reconnect is pending.
    Reconnecting,
    /// The feed was re-established after a drop. Events from the gap are
    /// lost; listeners must reload to catch up.
    Reconnected,
    /// Reconnection gave up. Sent once per listener.
    Degraded(SubscriptionError),
}

/// Receives the change notifications of one channel.
///
/// Callbacks run on the channel's pump task and must not block. A panic in
/// one listener is contained and does not affect the others.
pub trait ChangeListener: Send + Sync + 'static {
    fn on_insert(&self, row: &Row);

    fn on_update(&self, row: &Row);

    fn on_delete(&self, id: &EntityId);

    fn on_status(&self, status: &ChannelStatus) {
        let _ = status;
    }
}

type RowHandler = Box<dyn Fn(&Row) + Send + Sync>;
type DeleteHandler = Box<dyn Fn(&EntityId) + Send + Sync>;
type StatusHandler = Box<dyn Fn(&ChannelStatus) + Send + Sync>;

/// Closure-based listener.
///
/// ```
/// use lifesync_sync::ChangeHandlers;
///
/// let handlers = ChangeHandlers::new(
///     |row| println!("insert {row:?}"),
///     |row| println!("update {row:?}"),
///     |id| println!("delete {id}"),
/// )
/// .on_status(|status| println!("status {status:?}"));
/// # drop(handlers);
/// ```
pub struct ChangeHandlers {
    on_insert: RowHandler,
    on_update: RowHandler,
    on_delete: DeleteHandler,
    on_status: Option<StatusHandler>,
}

impl ChangeHandlers {
    pub fn new(
        on_insert: impl Fn(&Row) + Send + Sync + 'static,
        on_update: impl Fn(&Row) + Send + Sync + 'static,
        on_delete: impl Fn(&EntityId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_insert: Box::new(on_insert),
            on_update: Box::new(on_update),
            on_delete: Box::new(on_delete),
            on_status: None,
        }
    }

    /// Adds a status callback.
    pub fn on_status(mut self, f: impl Fn(&ChannelStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ChangeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHandlers")
            .field("on_status", &self.on_status.is_some())
            .finish_non_exhaustive()
    }
}

impl ChangeListener for ChangeHandlers {
    fn on_insert(&self, row: &Row) {
        (self.on_insert)(row);
    }

    fn on_update(&self, row: &Row) {
        (self.on_update)(row);
    }

    fn on_delete(&self, id: &EntityId) {
        (self.on_delete)(id);
    }

    fn on_status(&self, status: &ChannelStatus) {
        if let Some(f) = &self.on_status {
            f(status);
        }
    }
}
