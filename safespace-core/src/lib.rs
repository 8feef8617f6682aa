//! SafeSpace Core - Shared Types
//!
//! Pure data structures for the dashboard session and data-synchronization
//! layer, plus the [`RemoteSource`] contract the layer is written against.
//! Every other crate depends on this one; nothing in here performs I/O.

pub mod dataset;
pub mod error;
pub mod feedback;
pub mod identity;
pub mod remote;
pub mod tenant;

pub use dataset::{
    AnalyticsPoint, AnalyticsSeries, DashboardData, DatasetKind, DatasetPayload, HealthReport,
    LearningInsights, QueryParams, ServerStats, Violation, ViolationPage,
    DEFAULT_ANALYTICS_DAYS, DEFAULT_VIOLATION_LIMIT,
};
pub use error::{LoginError, RemoteError, SyncError, SyncResult};
pub use feedback::{FeedbackLabel, FeedbackOutcome, FeedbackRecord, ViolationId};
pub use identity::{AuthGrant, AuthProof, Credential, Identity, UserId};
pub use remote::RemoteSource;
pub use tenant::{PermissionTier, Tenant, TenantId};

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;
