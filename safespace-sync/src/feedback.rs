//! Feedback Coordinator
//!
//! Forwards an operator's verdict on a flagged violation to the backend and,
//! once the backend has accepted it, invalidates and refetches the datasets
//! whose aggregates depend on feedback history. Nothing in the cache changes
//! before acceptance is observed.

use crate::cache::AggregateCache;
use crate::notifications::{Notification, NotificationAction, NotificationBus};
use crate::remote::{with_timeout, SharedRemote};
use crate::tenants::TenantRegistry;
use safespace_core::{
    DatasetKind, FeedbackLabel, FeedbackOutcome, FeedbackRecord, RemoteError, SyncError,
    SyncResult, TenantId, ViolationId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const GENERIC_REJECTION: &str = "Feedback was not accepted";

struct CoordinatorInner {
    remote: SharedRemote,
    tenants: TenantRegistry,
    cache: AggregateCache,
    bus: NotificationBus,
    timeout: Duration,
}

#[derive(Clone)]
pub struct FeedbackCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FeedbackCoordinator {
    pub fn new(
        remote: SharedRemote,
        tenants: TenantRegistry,
        cache: AggregateCache,
        bus: NotificationBus,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                remote,
                tenants,
                cache,
                bus,
                timeout,
            }),
        }
    }

    /// Submit `label` for `violation_id` under `tenant_id`.
    ///
    /// `tenant_id` must be the active tenant when the call starts, otherwise
    /// the submission is refused with [`SyncError::StaleContext`]. Every
    /// failure is returned to the caller and also published as a
    /// notification.
    pub async fn submit_feedback(
        &self,
        tenant_id: &TenantId,
        violation_id: ViolationId,
        label: FeedbackLabel,
    ) -> SyncResult<FeedbackOutcome> {
        let active = self.inner.tenants.active_id();
        if active.as_ref() != Some(tenant_id) {
            warn!(
                tenant_id = %tenant_id,
                violation_id = %violation_id,
                active = ?active,
                "Refusing feedback for inactive tenant"
            );
            self.inner.bus.publish(Notification::warning(
                "The server changed before your feedback was sent. Please try again.",
            ));
            return Err(SyncError::StaleContext {
                submitted: tenant_id.clone(),
                active,
            });
        }

        let Some(credential) = self.inner.tenants.session().credential() else {
            self.inner.bus.publish(
                Notification::warning("Sign in to submit feedback")
                    .with_action(NotificationAction::SignIn),
            );
            return Err(SyncError::AuthInvalid);
        };

        let record = FeedbackRecord {
            tenant_id: tenant_id.clone(),
            violation_id,
            label,
        };
        info!(
            tenant_id = %tenant_id,
            violation_id = %violation_id,
            label = %label,
            "Submitting feedback"
        );

        let result = with_timeout(
            self.inner.timeout,
            self.inner.remote.submit_feedback(&credential, &record),
        )
        .await;

        match result {
            Ok(outcome) if outcome.accepted => {
                let refetched = self.apply_accepted(&record);
                info!(
                    tenant_id = %tenant_id,
                    violation_id = %violation_id,
                    refetched,
                    "Feedback accepted"
                );
                self.inner.bus.publish(Notification::success(match label {
                    FeedbackLabel::FalsePositive => "Marked as false positive",
                    FeedbackLabel::Confirmed => "Violation confirmed",
                }));
                Ok(outcome)
            }
            Ok(outcome) => Err(self.rejected(&record, outcome.reason)),
            Err(RemoteError::Rejected { reason }) => Err(self.rejected(&record, Some(reason))),
            Err(RemoteError::Unauthorized) => {
                warn!(tenant_id = %tenant_id, "Feedback rejected: credential no longer valid");
                self.inner.cache.expire_session(&credential);
                Err(SyncError::AuthInvalid)
            }
            Err(err) => {
                warn!(
                    tenant_id = %tenant_id,
                    violation_id = %violation_id,
                    error = %err,
                    "Feedback submission failed"
                );
                self.inner.bus.publish(
                    Notification::error(format!("Could not submit feedback: {}", err))
                        .with_action(NotificationAction::Retry),
                );
                Err(SyncError::SubmitFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Mark the feedback-dependent datasets, and the summaries embedding
    /// them, stale and refetch them.
    fn apply_accepted(&self, record: &FeedbackRecord) -> usize {
        DatasetKind::FEEDBACK_DEPENDENT
            .iter()
            .chain(DatasetKind::FEEDBACK_SUMMARIES.iter())
            .map(|&kind| {
                self.inner.cache.invalidate(kind, &record.tenant_id);
                self.inner.cache.refetch(kind, &record.tenant_id)
            })
            .sum()
    }

    fn rejected(&self, record: &FeedbackRecord, reason: Option<String>) -> SyncError {
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| GENERIC_REJECTION.to_string());
        warn!(
            tenant_id = %record.tenant_id,
            violation_id = %record.violation_id,
            reason = %reason,
            "Feedback rejected"
        );
        self.inner
            .bus
            .publish(Notification::error(format!("Feedback not saved: {}", reason)));
        SyncError::RemoteRejected { reason }
    }
}
