//! Staleness, refresh and retry policy for cached datasets.

use crate::config::SyncConfig;
use safespace_core::DatasetKind;
use std::collections::BTreeMap;
use std::time::Duration;

/// How long a dataset stays fresh and how often subscribers poll it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetPolicy {
    /// Age after which a read serves the value as stale and refetches.
    pub stale_after: Duration,
    /// Background refresh cadence while subscribed. `None` disables polling.
    pub refresh_interval: Option<Duration>,
}

impl DatasetPolicy {
    pub fn new(stale_after: Duration, refresh_interval: Option<Duration>) -> Self {
        Self {
            stale_after,
            refresh_interval,
        }
    }

    /// Built-in horizons, matching how quickly each aggregate moves.
    pub fn default_for(kind: DatasetKind) -> Self {
        let secs = Duration::from_secs;
        match kind {
            DatasetKind::Dashboard => Self::new(secs(15), Some(secs(30))),
            DatasetKind::Stats => Self::new(secs(300), Some(secs(30))),
            DatasetKind::Analytics => Self::new(secs(120), None),
            DatasetKind::Violations => Self::new(secs(30), Some(secs(30))),
            DatasetKind::LearningInsights => Self::new(secs(120), None),
            DatasetKind::HealthScore => Self::new(secs(60), Some(secs(60))),
        }
    }
}

/// Exponential backoff for failed fetches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Consecutive failures after which retries drop to the slow cadence
    /// of [`BackoffPolicy::retry_delay`].
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Wait before the next attempt after `failures` consecutive failures:
    /// `min(initial * multiplier^(failures - 1), max)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }

    /// Wait before retrying an entry that has failed `failures` times in a
    /// row. Once retries are exhausted the entry is still retried, but no
    /// faster than `max` or the dataset's refresh interval, whichever is
    /// longer.
    pub fn retry_delay(&self, failures: u32, refresh_interval: Option<Duration>) -> Duration {
        if self.exhausted(failures) {
            refresh_interval.map_or(self.max, |interval| interval.max(self.max))
        } else {
            self.delay_for(failures)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Per-kind overrides of [`DatasetPolicy::default_for`].
    pub policies: BTreeMap<DatasetKind, DatasetPolicy>,
    pub backoff: BackoffPolicy,
    /// Idle time after which entries of inactive tenants may be evicted.
    pub evict_after: Duration,
    /// Bound on every remote fetch.
    pub request_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policies: BTreeMap::new(),
            backoff: BackoffPolicy::default(),
            evict_after: Duration::from_secs(600),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sync_config(config: &SyncConfig) -> Self {
        let backoff = &config.cache.backoff;
        let policies = config
            .dataset_overrides()
            .map(|(kind, settings)| {
                (
                    kind,
                    DatasetPolicy::new(
                        Duration::from_millis(settings.stale_after_ms),
                        settings.refresh_interval_ms.map(Duration::from_millis),
                    ),
                )
            })
            .collect();
        Self {
            policies,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(backoff.initial_ms),
                max: Duration::from_millis(backoff.max_ms),
                multiplier: backoff.multiplier,
                max_retries: backoff.max_retries,
            },
            evict_after: Duration::from_millis(config.cache.evict_after_ms),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_policy(mut self, kind: DatasetKind, policy: DatasetPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_evict_after(mut self, duration: Duration) -> Self {
        self.evict_after = duration;
        self
    }

    pub fn with_request_timeout(mut self, duration: Duration) -> Self {
        self.request_timeout = duration;
        self
    }

    pub fn policy(&self, kind: DatasetKind) -> DatasetPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| DatasetPolicy::default_for(kind))
    }
}
