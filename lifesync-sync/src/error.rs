//! Error types for the sync layer.

use lifesync_model::MappingError;
use lifesync_types::{ChannelKey, EntityId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A row could not be mapped to an entity.
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// The remote service rejected a write.
    #[error("write failed: {0}")]
    Write(#[from] WriteError),

    /// The change feed could not be established.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// The remote service failed a read.
    #[error("data service error: {0}")]
    Service(String),

    /// Invalid identifier or row shape.
    #[error("invalid data: {0}")]
    Types(#[from] lifesync_types::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A remote write was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The service refused the write (constraint, permission, validation).
    #[error("rejected: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },

    /// The row to update or delete does not exist.
    #[error("row {0} not found")]
    NotFound(EntityId),

    /// The request never reached the service.
    #[error("network error: {0}")]
    Network(String),

    /// The service did not answer in time.
    #[error("write timed out")]
    Timeout,
}

impl WriteError {
    /// Shorthand for a rejection without a service error code.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            code: None,
            message: message.into(),
        }
    }
}

/// The realtime change feed for a channel is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The transport refused to open the channel.
    #[error("failed to open channel {key}: {reason}")]
    OpenFailed { key: ChannelKey, reason: String },

    /// The transport dropped an open channel.
    #[error("channel {key} dropped")]
    Dropped { key: ChannelKey },

    /// Reconnection gave up; the feed is stale until the next full reload.
    #[error("channel {key} unavailable after {attempts} reconnect attempts")]
    RetriesExhausted { key: ChannelKey, attempts: u32 },
}
