//! Realtime sync and optimistic reconciliation for lifesync feature modules.
//!
//! Every feature module (meals, workouts, journal entries, ...) keeps a local,
//! ordered view of the user's rows in one remote collection. This crate keeps
//! that view consistent with the remote service.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Registry**: Shares one realtime channel per (collection, user) between
//!   all listeners, reconnects dropped feeds and closes idle channels
//! - **Engine**: The single writer of a feature's local view. Merges full
//!   loads, optimistic writes (with rollback) and inbound change events
//! - **View**: Ordered, id-unique entity list with delete tombstones
//! - **Transport / Service**: Traits over the remote realtime feed and the
//!   remote row store
//! - **Memory**: In-process backend implementing both traits
//!
//! ## Write Process
//!
//! 1. **Optimistic**: The provisional change is applied to the view
//! 2. **Write**: The remote service stores the row
//! 3. **Confirm**: The stored row replaces the provisional entity, or the
//!    view is restored to its prior state if the write failed
//! 4. **Echo**: The change event for the write arrives and is deduplicated
//!    by id
//!
//! # Example
//!
//! ```
//! use lifesync_model::RecordMapper;
//! use lifesync_sync::memory::MemoryBackend;
//! use lifesync_sync::{ChannelRegistry, ReconciliationEngine, SyncConfig};
//! use lifesync_types::{CollectionName, Row, UserId};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lifesync_sync::SyncResult<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let registry = ChannelRegistry::new(backend.clone(), SyncConfig::default());
//! let mapper = RecordMapper::new(CollectionName::new("meals")?);
//! let engine = ReconciliationEngine::new(mapper, backend.clone(), registry);
//!
//! let user = UserId::new();
//! engine.load(&user).await?;
//! let sync = engine.start_sync(user);
//!
//! let mut draft = Row::new();
//! draft.insert("name", "Oatmeal".into());
//! let meal = engine.insert(&user, &draft, None).await?;
//! assert!(engine.contains(&meal.id));
//!
//! sync.stop();
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
mod listener;
pub mod memory;
mod registry;
mod service;
mod transport;
mod view;

pub use config::SyncConfig;
pub use engine::{LoadOutcome, Optimistic, ReconciliationEngine, SyncHandle, SyncStatus};
pub use error::{SubscriptionError, SyncError, SyncResult, WriteError};
pub use listener::{ChangeHandlers, ChangeListener, ChannelStatus};
pub use registry::{ChannelRegistry, ListenerId, Subscription};
pub use service::DataService;
pub use transport::{ChangeFeed, RealtimeTransport};
pub use view::{LocalView, ViewOrder};

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking listener is contained by the registry, so a poisoned lock only
// means a callback died mid-way; the guarded data is still consistent.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
