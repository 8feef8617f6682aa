//! Aggregate cache: per-tenant datasets with stale-while-revalidate reads.
//!
//! - [`CacheKey`]: `(tenant, dataset, params)`; constructing one requires a tenant
//! - [`DatasetView`] / [`ReadStatus`]: what a reader sees, including staleness
//! - [`CacheConfig`]: staleness horizons, refresh intervals and retry backoff
//! - [`AggregateCache`]: deduplicated fetches, invalidation, subscriptions

mod freshness;
mod key;
mod policy;
mod store;

pub use freshness::{DatasetView, ReadStatus};
pub use key::CacheKey;
pub use policy::{BackoffPolicy, CacheConfig, DatasetPolicy};
pub use store::{AggregateCache, DatasetSelector, Subscription};
