//! SafeSpace Sync - Session and Data Synchronization
//!
//! Client-side services behind the moderation dashboard:
//!
//! - [`SessionStore`]: credential and identity, resolved at start-up
//! - [`TenantRegistry`]: servers the identity manages and the active one
//! - [`AggregateCache`]: per-tenant datasets with stale-while-revalidate reads
//! - [`FeedbackCoordinator`]: write-through feedback with targeted invalidation
//! - [`NotificationBus`]: short-lived, user-facing outcome messages
//!
//! Services are explicitly constructed and cheap to clone. [`Dashboard`]
//! wires them together in dependency order.

pub mod api_client;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod feedback;
pub mod notifications;
pub mod persistence;
pub mod remote;
pub mod session;
pub mod telemetry;
pub mod tenants;

pub use api_client::{ApiClientError, HttpRemote};
pub use cache::{
    AggregateCache, CacheConfig, CacheKey, DatasetPolicy, DatasetSelector, DatasetView,
    ReadStatus, Subscription,
};
pub use config::{ConfigError, LogConfig, SyncConfig};
pub use dashboard::Dashboard;
pub use error::SyncClientError;
pub use feedback::FeedbackCoordinator;
pub use notifications::{Notification, NotificationAction, NotificationBus, NotificationId, Severity};
pub use persistence::{ClientStore, FileStore, MemoryStore, PersistenceError};
pub use remote::{RemoteSource, SharedRemote};
pub use session::{SessionState, SessionStore};
pub use telemetry::{init_tracing, TelemetryError};
pub use tenants::TenantRegistry;

pub use safespace_core::{SyncError, SyncResult};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a service's state, recovering from poisoning.
///
/// State is only mutated in short critical sections that leave it valid, so
/// a panic elsewhere never makes the data unusable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
