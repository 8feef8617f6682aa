//! What a reader sees when it asks the cache for a dataset.
//!
//! A view always carries enough to tell "loading, nothing yet" apart from
//! "stale but present" and "errored, last-good value shown".

use super::key::CacheKey;
use safespace_core::{
    AnalyticsSeries, DashboardData, DatasetPayload, HealthReport, LearningInsights, ServerStats,
    SyncError, Timestamp, ViolationPage,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadStatus {
    /// No active tenant, so there is nothing to read.
    Idle,
    /// No value yet; a fetch is pending or about to start.
    Loading,
    Fresh,
    /// Older than its horizon or invalidated; a refresh is due or underway.
    Stale,
    /// The last fetch failed. Any previous value is still served.
    Errored,
}

#[derive(Debug, Clone)]
pub struct DatasetView {
    pub(super) key: Option<CacheKey>,
    pub(super) status: ReadStatus,
    pub(super) value: Option<Arc<DatasetPayload>>,
    pub(super) fetched_at: Option<Timestamp>,
    pub(super) age: Option<Duration>,
    pub(super) refreshing: bool,
    pub(super) last_error: Option<SyncError>,
}

impl DatasetView {
    pub(super) fn idle() -> Self {
        Self {
            key: None,
            status: ReadStatus::Idle,
            value: None,
            fetched_at: None,
            age: None,
            refreshing: false,
            last_error: None,
        }
    }

    /// No entry yet for `key`.
    pub(super) fn pending(key: CacheKey) -> Self {
        Self {
            key: Some(key),
            status: ReadStatus::Loading,
            ..Self::idle()
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    pub fn status(&self) -> ReadStatus {
        self.status
    }

    pub fn value(&self) -> Option<&DatasetPayload> {
        self.value.as_deref()
    }

    pub fn shared_value(&self) -> Option<Arc<DatasetPayload>> {
        self.value.clone()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Wall-clock time of the fetch that produced the value.
    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    pub fn age(&self) -> Option<Duration> {
        self.age
    }

    /// A fetch for this key is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    pub fn is_loading(&self) -> bool {
        self.status == ReadStatus::Loading
    }

    pub fn is_stale(&self) -> bool {
        self.status == ReadStatus::Stale
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn dashboard(&self) -> Option<&DashboardData> {
        match self.value()? {
            DatasetPayload::Dashboard(data) => Some(data),
            _ => None,
        }
    }

    pub fn stats(&self) -> Option<&ServerStats> {
        match self.value()? {
            DatasetPayload::Stats(stats) => Some(stats),
            _ => None,
        }
    }

    pub fn analytics(&self) -> Option<&AnalyticsSeries> {
        match self.value()? {
            DatasetPayload::Analytics(series) => Some(series),
            _ => None,
        }
    }

    pub fn violations(&self) -> Option<&ViolationPage> {
        match self.value()? {
            DatasetPayload::Violations(page) => Some(page),
            _ => None,
        }
    }

    pub fn insights(&self) -> Option<&LearningInsights> {
        match self.value()? {
            DatasetPayload::LearningInsights(insights) => Some(insights),
            _ => None,
        }
    }

    pub fn health(&self) -> Option<&HealthReport> {
        match self.value()? {
            DatasetPayload::HealthScore(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safespace_core::{DatasetKind, QueryParams, TenantId};

    #[test]
    fn test_idle_view_is_empty() {
        let view = DatasetView::idle();
        assert_eq!(view.status(), ReadStatus::Idle);
        assert!(view.value().is_none());
        assert!(view.key().is_none());
        assert!(!view.is_refreshing());
    }

    #[test]
    fn test_typed_accessors_match_payload() {
        let view = DatasetView {
            key: Some(CacheKey::new(
                TenantId::from("A"),
                DatasetKind::HealthScore,
                QueryParams::none(),
            )),
            status: ReadStatus::Fresh,
            value: Some(Arc::new(DatasetPayload::HealthScore(HealthReport {
                health_score: 0.9,
                ..Default::default()
            }))),
            fetched_at: None,
            age: Some(Duration::ZERO),
            refreshing: false,
            last_error: None,
        };
        assert_eq!(view.health().map(|h| h.health_score), Some(0.9));
        assert!(view.stats().is_none());
        assert!(view.violations().is_none());
    }
}
