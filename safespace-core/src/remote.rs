//! The backend contract consumed by the sync layer.
//!
//! The wire format is owned by the backend. Implementations translate
//! transport failures into [`RemoteError`]; callers never see raw HTTP.

use crate::dataset::{DatasetKind, DatasetPayload, QueryParams};
use crate::error::RemoteError;
use crate::feedback::{FeedbackOutcome, FeedbackRecord};
use crate::identity::{AuthGrant, AuthProof, Credential, Identity};
use crate::tenant::{Tenant, TenantId};
use async_trait::async_trait;

/// Abstract remote data source (the dashboard backend).
///
/// Implementations must be thread-safe (Send + Sync) because fetches run
/// on spawned tasks.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Exchange an OAuth proof for a credential and identity.
    async fn exchange(&self, proof: &AuthProof) -> Result<AuthGrant, RemoteError>;

    /// Resolve the identity behind a credential.
    ///
    /// Returns [`RemoteError::Unauthorized`] when the credential is expired or invalid.
    async fn verify(&self, credential: &Credential) -> Result<Identity, RemoteError>;

    /// Tell the backend the credential is no longer in use.
    async fn logout(&self, credential: &Credential) -> Result<(), RemoteError>;

    /// Servers the identity can manage, in display order.
    async fn list_tenants(&self, credential: &Credential) -> Result<Vec<Tenant>, RemoteError>;

    /// Fetch one dataset for one tenant.
    async fn fetch_dataset(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        kind: DatasetKind,
        params: QueryParams,
    ) -> Result<DatasetPayload, RemoteError>;

    /// Record operator feedback on a violation.
    ///
    /// Submitting the same `(violation, label)` twice must not double-count
    /// in any server-side aggregate.
    async fn submit_feedback(
        &self,
        credential: &Credential,
        record: &FeedbackRecord,
    ) -> Result<FeedbackOutcome, RemoteError>;
}
