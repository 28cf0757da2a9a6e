//! Realtime transport abstraction.
//!
//! The registry only needs two things from the remote service's realtime
//! layer: open a per-user change feed for a collection, and close it again.
//! Everything else (websocket framing, auth tokens, heartbeats) lives behind
//! this trait.

use crate::error::SyncResult;
use async_trait::async_trait;
use lifesync_types::{ChannelKey, RowChange};
use tokio::sync::mpsc;

/// Stream of change rows for one channel. The sender side being dropped
/// means the transport lost the channel.
pub type ChangeFeed = mpsc::Receiver<RowChange>;

/// A realtime transport that can open per-user change feeds.
#[async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Opens the change feed for `key`.
    ///
    /// The feed must only carry rows owned by `key.user`.
    async fn open(&self, key: &ChannelKey) -> SyncResult<ChangeFeed>;

    /// Releases the transport-side channel for `key`.
    async fn close(&self, key: &ChannelKey);
}
