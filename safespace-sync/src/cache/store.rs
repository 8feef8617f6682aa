//! The aggregate cache itself.
//!
//! All mutation goes through this type. Each key has at most one fetch in
//! flight; later readers attach to it through a shared future. A result is
//! only stored if its fetch is still the current one for the key and the
//! key's tenant is still active.
//!
//! Invalidation bumps an entry's epoch. A fetch that started before the
//! bump may still store its value, but the entry stays stale until a fetch
//! started after the bump completes.

use super::freshness::{DatasetView, ReadStatus};
use super::key::CacheKey;
use super::policy::{CacheConfig, DatasetPolicy};
use crate::lock;
use crate::notifications::{Notification, NotificationAction, NotificationBus};
use crate::remote::{with_timeout, SharedRemote};
use crate::session::SessionStore;
use crate::tenants::TenantRegistry;
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use safespace_core::{
    Credential, DatasetKind, DatasetPayload, QueryParams, RemoteError, SyncError, TenantId,
    Timestamp,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type FetchDone = Shared<BoxFuture<'static, ()>>;

/// Which datasets of a tenant an invalidation or refetch applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetSelector {
    All,
    Kind(DatasetKind),
}

impl DatasetSelector {
    fn matches(&self, kind: DatasetKind) -> bool {
        match self {
            Self::All => true,
            Self::Kind(k) => *k == kind,
        }
    }
}

impl From<DatasetKind> for DatasetSelector {
    fn from(kind: DatasetKind) -> Self {
        Self::Kind(kind)
    }
}

struct InFlight {
    id: u64,
    epoch: u64,
    done: FetchDone,
}

struct CacheEntry {
    value: Option<Arc<DatasetPayload>>,
    fetched_at: Option<Instant>,
    fetched_wall: Option<Timestamp>,
    invalidated: bool,
    epoch: u64,
    in_flight: Option<InFlight>,
    /// Run another fetch when the current (pre-invalidation) one completes.
    refetch_queued: bool,
    last_error: Option<SyncError>,
    failures: u32,
    retry_after: Option<Instant>,
    subscribers: usize,
    poller: Option<JoinHandle<()>>,
    last_read: Instant,
}

impl CacheEntry {
    fn new(now: Instant) -> Self {
        Self {
            value: None,
            fetched_at: None,
            fetched_wall: None,
            invalidated: false,
            epoch: 0,
            in_flight: None,
            refetch_queued: false,
            last_error: None,
            failures: 0,
            retry_after: None,
            subscribers: 0,
            poller: None,
            last_read: now,
        }
    }

    fn is_stale(&self, policy: &DatasetPolicy, now: Instant) -> bool {
        self.invalidated
            || self
                .fetched_at
                .map_or(true, |at| now.saturating_duration_since(at) >= policy.stale_after)
    }

    fn backing_off(&self, now: Instant) -> bool {
        self.retry_after.is_some_and(|at| now < at)
    }

    fn needs_fetch(&self, policy: &DatasetPolicy, now: Instant) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        if self.value.is_none() && self.last_error.is_none() {
            return true;
        }
        if self.backing_off(now) {
            return false;
        }
        self.last_error.is_some() || self.is_stale(policy, now)
    }

    fn invalidate(&mut self) {
        self.invalidated = true;
        self.epoch += 1;
        self.failures = 0;
        self.retry_after = None;
    }

    /// Drop everything fetched; keep subscribers and their poller.
    fn reset(&mut self) {
        self.value = None;
        self.fetched_at = None;
        self.fetched_wall = None;
        self.invalidated = false;
        self.epoch += 1;
        self.in_flight = None;
        self.refetch_queued = false;
        self.last_error = None;
        self.failures = 0;
        self.retry_after = None;
    }

    fn view(&self, key: &CacheKey, policy: &DatasetPolicy, now: Instant) -> DatasetView {
        let status = if self.last_error.is_some() {
            ReadStatus::Errored
        } else if self.value.is_none() {
            ReadStatus::Loading
        } else if self.is_stale(policy, now) {
            ReadStatus::Stale
        } else {
            ReadStatus::Fresh
        };
        DatasetView {
            key: Some(key.clone()),
            status,
            value: self.value.clone(),
            fetched_at: self.fetched_wall,
            age: self.fetched_at.map(|at| now.saturating_duration_since(at)),
            refreshing: self.in_flight.is_some(),
            last_error: self.last_error.clone(),
        }
    }
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    active_rx: watch::Receiver<Option<TenantId>>,
    next_fetch_id: u64,
    disposed: bool,
}

struct CacheInner {
    remote: SharedRemote,
    session: SessionStore,
    tenants: TenantRegistry,
    bus: NotificationBus,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

#[derive(Clone)]
pub struct AggregateCache {
    inner: Arc<CacheInner>,
}

impl AggregateCache {
    pub fn new(
        remote: SharedRemote,
        tenants: TenantRegistry,
        bus: NotificationBus,
        config: CacheConfig,
    ) -> Self {
        let active_rx = tenants.watch_active();
        Self {
            inner: Arc::new(CacheInner {
                remote,
                session: tenants.session().clone(),
                tenants,
                bus,
                config,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    active_rx,
                    next_fetch_id: 0,
                    disposed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current view of `kind` for the active tenant.
    ///
    /// Never waits: a missing, stale or invalidated entry starts a
    /// deduplicated background fetch and the view reports it. Must be called
    /// from within a Tokio runtime for fetches to start.
    pub fn read(&self, kind: DatasetKind, params: QueryParams) -> DatasetView {
        let mut state = lock(&self.inner.state);
        let Some(tenant_id) = self.sync_active(&mut state) else {
            return DatasetView::idle();
        };
        let key = CacheKey::new(tenant_id, kind, params);
        self.read_locked(&mut state, &key, true)
    }

    /// Like [`AggregateCache::read`], but waits for the key's in-flight fetch
    /// (starting one if the entry needs it) and returns the settled view.
    pub async fn fetch(&self, kind: DatasetKind, params: QueryParams) -> DatasetView {
        let mut started_for: Option<CacheKey> = None;
        loop {
            let pending = {
                let mut state = lock(&self.inner.state);
                let Some(tenant_id) = self.sync_active(&mut state) else {
                    return DatasetView::idle();
                };
                let key = CacheKey::new(tenant_id, kind, params);
                let now = Instant::now();
                let policy = self.inner.config.policy(kind);
                let entry = state
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| CacheEntry::new(now));
                entry.last_read = now;

                let in_flight = entry.in_flight.as_ref().map(|f| f.done.clone());
                let wants_fetch = started_for.as_ref() != Some(&key)
                    && entry.needs_fetch(&policy, now);

                let done = match in_flight {
                    Some(done) => Some(done),
                    None if wants_fetch => {
                        started_for = Some(key.clone());
                        self.start_fetch_locked(&mut state, &key)
                    }
                    None => None,
                };
                match done {
                    Some(done) => Ok(done),
                    None => Err(state
                        .entries
                        .get(&key)
                        .map(|entry| entry.view(&key, &policy, now))
                        .unwrap_or_else(|| DatasetView::pending(key.clone()))),
                }
            };

            match pending {
                Ok(done) => done.await,
                Err(view) => return view,
            }
        }
    }

    /// View of any tenant's entry without creating it or starting a fetch.
    pub fn peek(&self, tenant_id: &TenantId, kind: DatasetKind, params: QueryParams) -> DatasetView {
        let state = lock(&self.inner.state);
        let key = CacheKey::new(tenant_id.clone(), kind, params);
        let policy = self.inner.config.policy(kind);
        match state.entries.get(&key) {
            Some(entry) => entry.view(&key, &policy, Instant::now()),
            None => DatasetView::pending(key),
        }
    }

    /// Mark matching entries of `tenant_id` stale. Values stay servable.
    pub fn invalidate(&self, selector: impl Into<DatasetSelector>, tenant_id: &TenantId) -> usize {
        let selector = selector.into();
        let mut state = lock(&self.inner.state);
        let count = invalidate_locked(&mut state, selector, tenant_id);
        info!(tenant_id = %tenant_id, selector = ?selector, count, "Invalidated cache entries");
        count
    }

    /// Refetch matching entries of `tenant_id` if it is the active tenant.
    ///
    /// An entry whose in-flight fetch predates its last invalidation gets a
    /// follow-up fetch queued instead of a duplicate request.
    pub fn refetch(&self, selector: impl Into<DatasetSelector>, tenant_id: &TenantId) -> usize {
        let selector = selector.into();
        let mut state = lock(&self.inner.state);
        if self.sync_active(&mut state).as_ref() != Some(tenant_id) {
            debug!(tenant_id = %tenant_id, "Skipping refetch for inactive tenant");
            return 0;
        }
        self.refetch_locked(&mut state, selector, tenant_id)
    }

    /// Explicit user refresh: invalidate and refetch everything of the active tenant.
    pub fn refresh_active(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let Some(tenant_id) = self.sync_active(&mut state) else {
            return 0;
        };
        invalidate_locked(&mut state, DatasetSelector::All, &tenant_id);
        let count = self.refetch_locked(&mut state, DatasetSelector::All, &tenant_id);
        info!(tenant_id = %tenant_id, count, "Refreshing active tenant");
        count
    }

    /// Keep `kind` polled on its refresh interval until the guard is dropped.
    ///
    /// Returns `None` when no tenant is active.
    pub fn subscribe(&self, kind: DatasetKind, params: QueryParams) -> Option<Subscription> {
        let mut state = lock(&self.inner.state);
        let tenant_id = self.sync_active(&mut state)?;
        let key = CacheKey::new(tenant_id, kind, params);
        let now = Instant::now();
        let policy = self.inner.config.policy(kind);
        let disposed = state.disposed;

        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(now));
        entry.subscribers += 1;
        entry.last_read = now;
        if entry.poller.is_none() && !disposed {
            if let Some(interval) = policy.refresh_interval {
                entry.poller = self.spawn_poller(key.clone(), interval);
            }
        }
        debug!(key = %key, subscribers = entry.subscribers, "Subscribed");

        if entry.needs_fetch(&policy, now) {
            self.start_fetch_locked(&mut state, &key);
        }
        Some(Subscription {
            cache: Arc::downgrade(&self.inner),
            key,
        })
    }

    pub fn subscriber_count(&self, tenant_id: &TenantId, kind: DatasetKind, params: QueryParams) -> usize {
        let key = CacheKey::new(tenant_id.clone(), kind, params);
        let state = lock(&self.inner.state);
        state.entries.get(&key).map_or(0, |entry| entry.subscribers)
    }

    /// Wait until no fetch is in flight.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<FetchDone> = {
                let state = lock(&self.inner.state);
                state
                    .entries
                    .values()
                    .filter_map(|entry| entry.in_flight.as_ref().map(|f| f.done.clone()))
                    .collect()
            };
            if pending.is_empty() {
                return;
            }
            join_all(pending).await;
        }
    }

    /// Remove idle entries of inactive tenants. Entries with subscribers stay.
    pub fn evict_idle(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let active = state.active_rx.borrow().clone();
        self.evict_idle_locked(&mut state, active.as_ref(), Instant::now())
    }

    /// Forget all fetched data (logout). Subscribed entries are emptied, not removed.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        state.entries.retain(|_, entry| entry.subscribers > 0);
        for entry in state.entries.values_mut() {
            entry.reset();
        }
        info!(retained = state.entries.len(), "Cache cleared");
    }

    /// Stop every background loop and refuse new fetches.
    pub fn dispose(&self) {
        let mut state = lock(&self.inner.state);
        state.disposed = true;
        for entry in state.entries.values_mut() {
            if let Some(poller) = entry.poller.take() {
                poller.abort();
            }
            entry.in_flight = None;
            entry.refetch_queued = false;
        }
        info!("Cache disposed");
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the session after a fetch was rejected with `credential`, then
    /// drop cached data. Ignored if a newer session is in place.
    pub fn expire_session(&self, credential: &Credential) {
        if self.inner.tenants.sign_out_unauthorized(credential) {
            self.clear();
        }
    }

    // --- internals ---------------------------------------------------------

    /// Pick up tenant switches. The newly active tenant's entries are
    /// invalidated so the switch always shows fresh data.
    fn sync_active(&self, state: &mut CacheState) -> Option<TenantId> {
        let changed = state.active_rx.has_changed().unwrap_or(false);
        let active = state.active_rx.borrow_and_update().clone();
        if changed {
            if let Some(tenant_id) = &active {
                let count = invalidate_locked(state, DatasetSelector::All, tenant_id);
                debug!(tenant_id = %tenant_id, count, "Active tenant changed");
            }
            let evicted = self.evict_idle_locked(state, active.as_ref(), Instant::now());
            if evicted > 0 {
                debug!(evicted, "Evicted idle entries");
            }
        }
        active
    }

    fn read_locked(&self, state: &mut CacheState, key: &CacheKey, start: bool) -> DatasetView {
        let now = Instant::now();
        let policy = self.inner.config.policy(key.kind());
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(now));
        entry.last_read = now;
        if start && entry.needs_fetch(&policy, now) {
            self.start_fetch_locked(state, key);
        }
        state
            .entries
            .get(key)
            .map(|entry| entry.view(key, &policy, now))
            .unwrap_or_else(|| DatasetView::pending(key.clone()))
    }

    fn refetch_locked(&self, state: &mut CacheState, selector: DatasetSelector, tenant_id: &TenantId) -> usize {
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|key| key.belongs_to(tenant_id) && selector.matches(key.kind()))
            .cloned()
            .collect();

        let mut count = 0;
        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            let in_flight_epoch = entry.in_flight.as_ref().map(|f| f.epoch);
            match in_flight_epoch {
                Some(epoch) if epoch == entry.epoch => {}
                Some(_) => {
                    entry.refetch_queued = true;
                    count += 1;
                }
                None => {
                    if self.start_fetch_locked(state, &key).is_some() {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    fn start_fetch_locked(&self, state: &mut CacheState, key: &CacheKey) -> Option<FetchDone> {
        if state.disposed {
            return None;
        }
        let Some(credential) = self.inner.session.credential() else {
            debug!(key = %key, "No credential; fetch not started");
            return None;
        };
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(key = %key, "No async runtime; fetch not started");
                return None;
            }
        };

        state.next_fetch_id += 1;
        let fetch_id = state.next_fetch_id;
        let entry = state.entries.get_mut(key)?;
        let epoch = entry.epoch;

        let cache = self.clone();
        let task_key = key.clone();
        let handle = runtime.spawn(async move {
            let result = cache.run_fetch(&task_key, &credential).await;
            cache.complete_fetch(&task_key, fetch_id, epoch, &credential, result);
        });
        let done: FetchDone = async move {
            let _ = handle.await;
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            id: fetch_id,
            epoch,
            done: done.clone(),
        });
        debug!(
            tenant_id = %key.tenant_id(),
            dataset = %key.kind(),
            fetch_id,
            epoch,
            "Fetch started"
        );
        Some(done)
    }

    async fn run_fetch(
        &self,
        key: &CacheKey,
        credential: &Credential,
    ) -> Result<DatasetPayload, RemoteError> {
        let payload = with_timeout(
            self.inner.config.request_timeout,
            self.inner
                .remote
                .fetch_dataset(credential, key.tenant_id(), key.kind(), key.params()),
        )
        .await?;
        if payload.kind() != key.kind() {
            return Err(RemoteError::Decode {
                reason: format!("expected {} payload, got {}", key.kind(), payload.kind()),
            });
        }
        Ok(payload)
    }

    fn complete_fetch(
        &self,
        key: &CacheKey,
        fetch_id: u64,
        epoch: u64,
        credential: &Credential,
        result: Result<DatasetPayload, RemoteError>,
    ) {
        let now = Instant::now();
        let mut unauthorized = false;
        let mut failure_notice = None;
        {
            let mut state = lock(&self.inner.state);
            let active = state.active_rx.borrow().clone();
            let backoff = self.inner.config.backoff;
            let refresh_interval = self.inner.config.policy(key.kind()).refresh_interval;
            let Some(entry) = state.entries.get_mut(key) else {
                debug!(key = %key, "Entry gone before fetch completed");
                return;
            };
            if entry.in_flight.as_ref().map(|f| f.id) != Some(fetch_id) {
                debug!(key = %key, fetch_id, "Discarding superseded fetch");
                return;
            }
            entry.in_flight = None;

            if active.as_ref() != Some(key.tenant_id()) {
                debug!(key = %key, "Discarding result for inactive tenant");
                entry.refetch_queued = false;
                return;
            }

            match result {
                Ok(payload) => {
                    entry.value = Some(Arc::new(payload));
                    entry.fetched_at = Some(now);
                    entry.fetched_wall = Some(Utc::now());
                    if entry.epoch == epoch {
                        entry.invalidated = false;
                    }
                    entry.last_error = None;
                    entry.failures = 0;
                    entry.retry_after = None;
                    debug!(key = %key, fetch_id, "Fetch completed");
                }
                Err(RemoteError::Unauthorized) => {
                    entry.last_error = Some(SyncError::AuthInvalid);
                    entry.refetch_queued = false;
                    unauthorized = true;
                }
                Err(err) => {
                    entry.failures += 1;
                    let delay = backoff.retry_delay(entry.failures, refresh_interval);
                    entry.retry_after = Some(now + delay);
                    entry.last_error = Some(SyncError::fetch_failed(key.kind(), &err));
                    warn!(
                        tenant_id = %key.tenant_id(),
                        dataset = %key.kind(),
                        attempt = entry.failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Fetch failed; keeping last value"
                    );
                    if entry.failures == 1 {
                        failure_notice = Some(format!("Could not load {}: {}", key.kind(), err));
                    }
                }
            }

            if std::mem::take(&mut entry.refetch_queued) {
                self.start_fetch_locked(&mut state, key);
            }
        }

        if unauthorized {
            self.expire_session(credential);
        }
        if let Some(message) = failure_notice {
            self.inner
                .bus
                .publish(Notification::warning(message).with_action(NotificationAction::Retry));
        }
    }

    fn spawn_poller(&self, key: CacheKey, interval: Duration) -> Option<JoinHandle<()>> {
        let runtime = Handle::try_current().ok()?;
        let weak = Arc::downgrade(&self.inner);
        debug!(key = %key, interval_ms = interval.as_millis() as u64, "Background refresh started");
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = AggregateCache { inner };
                if !cache.poll_tick(&key) {
                    break;
                }
            }
        }))
    }

    /// One background refresh tick. Returns false when the loop should end.
    fn poll_tick(&self, key: &CacheKey) -> bool {
        let mut state = lock(&self.inner.state);
        if state.disposed {
            return false;
        }
        let active = self.sync_active(&mut state);
        let now = Instant::now();
        let Some(entry) = state.entries.get(key) else {
            return false;
        };
        if entry.subscribers == 0 {
            return false;
        }
        if active.as_ref() != Some(key.tenant_id())
            || entry.in_flight.is_some()
            || entry.backing_off(now)
        {
            return true;
        }
        self.start_fetch_locked(&mut state, key);
        true
    }

    fn unsubscribe(&self, key: &CacheKey) {
        let mut state = lock(&self.inner.state);
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        entry.last_read = Instant::now();
        if entry.subscribers == 0 {
            if let Some(poller) = entry.poller.take() {
                poller.abort();
                debug!(key = %key, "Background refresh stopped");
            }
        }
    }

    fn evict_idle_locked(
        &self,
        state: &mut CacheState,
        active: Option<&TenantId>,
        now: Instant,
    ) -> usize {
        let evict_after = self.inner.config.evict_after;
        let before = state.entries.len();
        state.entries.retain(|key, entry| {
            active == Some(key.tenant_id())
                || entry.subscribers > 0
                || entry.in_flight.is_some()
                || now.saturating_duration_since(entry.last_read) < evict_after
        });
        before - state.entries.len()
    }
}

fn invalidate_locked(state: &mut CacheState, selector: DatasetSelector, tenant_id: &TenantId) -> usize {
    let mut count = 0;
    for (key, entry) in state.entries.iter_mut() {
        if key.belongs_to(tenant_id) && selector.matches(key.kind()) {
            entry.invalidate();
            count += 1;
        }
    }
    count
}

/// Keeps one key's background refresh alive. Dropping it unsubscribes.
pub struct Subscription {
    cache: Weak<CacheInner>,
    key: CacheKey,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current view of the subscribed key. Starts a fetch only while the
    /// key's tenant is active.
    pub fn view(&self) -> DatasetView {
        let Some(inner) = self.cache.upgrade() else {
            return DatasetView::idle();
        };
        let cache = AggregateCache { inner };
        let mut state = lock(&cache.inner.state);
        let active = cache.sync_active(&mut state);
        let start = active.as_ref() == Some(self.key.tenant_id());
        cache.read_locked(&mut state, &self.key, start)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            AggregateCache { inner }.unsubscribe(&self.key);
        }
    }
}
