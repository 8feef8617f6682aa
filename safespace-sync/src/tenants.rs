//! Tenant registry: the servers the identity manages and which one is active.

use crate::lock;
use crate::notifications::{Notification, NotificationAction, NotificationBus};
use crate::persistence::ClientStore;
use crate::remote::{with_timeout, SharedRemote};
use crate::session::SessionStore;
use safespace_core::{Credential, Identity, RemoteError, SyncError, SyncResult, Tenant, TenantId, UserId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    /// Display order as returned by the backend, ids unique.
    tenants: Vec<Tenant>,
    active: Option<TenantId>,
    /// An explicit pick wins over auto-selection until `reset`.
    explicit: bool,
    /// The persisted hint only seeds the first load of a session.
    hint_consumed: bool,
    loaded_for: Option<UserId>,
    load_seq: u64,
}

impl RegistryState {
    fn contains(&self, tenant_id: &TenantId) -> bool {
        self.tenants.iter().any(|t| &t.id == tenant_id)
    }
}

struct RegistryInner {
    session: SessionStore,
    remote: SharedRemote,
    store: Arc<dyn ClientStore>,
    bus: NotificationBus,
    timeout: Duration,
    state: Mutex<RegistryState>,
    active_tx: watch::Sender<Option<TenantId>>,
}

#[derive(Clone)]
pub struct TenantRegistry {
    inner: Arc<RegistryInner>,
}

impl TenantRegistry {
    pub fn new(
        session: SessionStore,
        remote: SharedRemote,
        store: Arc<dyn ClientStore>,
        bus: NotificationBus,
        timeout: Duration,
    ) -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(RegistryInner {
                session,
                remote,
                store,
                bus,
                timeout,
                state: Mutex::new(RegistryState::default()),
                active_tx,
            }),
        }
    }

    /// Replace the mapping with the identity's current tenant list.
    ///
    /// Fails soft: on a remote error the previous mapping stays and a warning
    /// is published. Returns the number of tenants now known.
    pub async fn load_tenants(&self, identity: &Identity) -> SyncResult<usize> {
        let credential = self.inner.session.credential().ok_or(SyncError::AuthInvalid)?;

        let seq = {
            let mut state = lock(&self.inner.state);
            if state.loaded_for.as_ref() != Some(&identity.id) {
                debug!(user_id = %identity.id, "Tenant mapping belongs to another identity; starting over");
                let had_active = state.active.is_some();
                let load_seq = state.load_seq;
                *state = RegistryState {
                    loaded_for: Some(identity.id.clone()),
                    load_seq,
                    ..RegistryState::default()
                };
                if had_active {
                    self.inner.active_tx.send_replace(None);
                }
            }
            state.load_seq += 1;
            state.load_seq
        };

        let result =
            with_timeout(self.inner.timeout, self.inner.remote.list_tenants(&credential)).await;

        let tenants = match result {
            Ok(tenants) => tenants,
            Err(RemoteError::Unauthorized) => {
                self.sign_out_unauthorized(&credential);
                return Err(SyncError::AuthInvalid);
            }
            Err(err) => {
                warn!(error = %err, "Failed to load tenants; keeping previous list");
                self.inner.bus.publish(
                    Notification::warning(format!("Could not refresh your servers: {}", err))
                        .with_action(NotificationAction::Retry),
                );
                return Err(SyncError::TenantsUnavailable {
                    reason: err.to_string(),
                });
            }
        };

        let hint = match self.inner.store.load_tenant_hint() {
            Ok(hint) => hint,
            Err(err) => {
                warn!(error = %err, "Failed to read tenant hint");
                None
            }
        };

        let (count, selected) = {
            let mut state = lock(&self.inner.state);
            if state.load_seq != seq || state.loaded_for.as_ref() != Some(&identity.id) {
                debug!(seq, "Discarding superseded tenant list");
                return Ok(state.tenants.len());
            }

            let mut seen = HashSet::new();
            state.tenants = tenants
                .into_iter()
                .filter(|t| seen.insert(t.id.clone()))
                .collect();

            if let Some(active) = state.active.clone() {
                if !state.contains(&active) {
                    info!(tenant_id = %active, "Active tenant no longer available");
                    state.active = None;
                    state.explicit = false;
                    self.inner.active_tx.send_replace(None);
                }
            }

            let mut selected = None;
            if state.active.is_none() && !state.tenants.is_empty() {
                let hinted = hint
                    .filter(|_| !state.hint_consumed)
                    .filter(|id| state.contains(id));
                let pick = hinted.unwrap_or_else(|| state.tenants[0].id.clone());
                info!(tenant_id = %pick, "Auto-selected tenant");
                state.active = Some(pick.clone());
                self.inner.active_tx.send_replace(Some(pick.clone()));
                selected = Some(pick);
            }
            state.hint_consumed = true;
            (state.tenants.len(), selected)
        };

        if let Some(tenant_id) = selected {
            self.save_hint(&tenant_id);
        }
        debug!(count, "Tenant list loaded");
        Ok(count)
    }

    /// Reload the mapping for the current identity.
    pub async fn refresh(&self) -> SyncResult<usize> {
        let identity = self.inner.session.identity().ok_or(SyncError::AuthInvalid)?;
        self.load_tenants(&identity).await
    }

    /// Make `tenant_id` active. Unknown ids leave the selection unchanged.
    pub fn select_tenant(&self, tenant_id: &TenantId) -> SyncResult<()> {
        {
            let mut state = lock(&self.inner.state);
            if !state.contains(tenant_id) {
                debug!(tenant_id = %tenant_id, "Ignoring selection of unknown tenant");
                return Err(SyncError::TenantNotFound {
                    tenant_id: tenant_id.clone(),
                });
            }
            state.active = Some(tenant_id.clone());
            state.explicit = true;
            self.inner.active_tx.send_replace(Some(tenant_id.clone()));
        }
        info!(tenant_id = %tenant_id, "Tenant selected");
        self.save_hint(tenant_id);
        Ok(())
    }

    /// Forget the mapping and selection (logout).
    pub fn reset(&self) {
        let mut state = lock(&self.inner.state);
        let load_seq = state.load_seq + 1;
        *state = RegistryState {
            load_seq,
            ..RegistryState::default()
        };
        self.inner.active_tx.send_replace(None);
        debug!("Tenant registry reset");
    }

    /// End the session after the backend rejected `credential`, then reset.
    pub fn sign_out_unauthorized(&self, credential: &Credential) -> bool {
        let ended = self.inner.session.handle_unauthorized(credential);
        if ended {
            self.reset();
        }
        ended
    }

    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    pub fn active_tenant(&self) -> Option<Tenant> {
        let state = lock(&self.inner.state);
        let active = state.active.as_ref()?;
        state.tenants.iter().find(|t| &t.id == active).cloned()
    }

    pub fn active_id(&self) -> Option<TenantId> {
        lock(&self.inner.state).active.clone()
    }

    pub fn is_active(&self, tenant_id: &TenantId) -> bool {
        lock(&self.inner.state).active.as_ref() == Some(tenant_id)
    }

    pub fn has_explicit_selection(&self) -> bool {
        lock(&self.inner.state).explicit
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        lock(&self.inner.state).tenants.clone()
    }

    pub fn get(&self, tenant_id: &TenantId) -> Option<Tenant> {
        lock(&self.inner.state)
            .tenants
            .iter()
            .find(|t| &t.id == tenant_id)
            .cloned()
    }

    /// Changes to the active tenant. Every selection is sent, including
    /// re-selecting the current one.
    pub fn watch_active(&self) -> watch::Receiver<Option<TenantId>> {
        self.inner.active_tx.subscribe()
    }

    fn save_hint(&self, tenant_id: &TenantId) {
        if let Err(err) = self.inner.store.save_tenant_hint(tenant_id) {
            warn!(tenant_id = %tenant_id, error = %err, "Failed to persist tenant hint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::notifications::Severity;
    use crate::persistence::MemoryStore;
    use safespace_core::AuthProof;
    use safespace_test_utils::{grant, tenants, Endpoint, MockRemote};

    struct Fixture {
        remote: Arc<MockRemote>,
        store: Arc<MemoryStore>,
        bus: NotificationBus,
        session: SessionStore,
        registry: TenantRegistry,
    }

    async fn fixture(store: MemoryStore) -> Fixture {
        let remote = MockRemote::shared();
        remote.set_grant(grant("tok", "Alice"));
        let store = Arc::new(store);
        let bus = NotificationBus::new(&NotificationConfig {
            info_ttl_ms: 5_000,
            error_ttl_ms: 8_000,
        });
        let timeout = Duration::from_secs(10);
        let session = SessionStore::new(remote.clone(), store.clone(), bus.clone(), timeout);
        session.login(AuthProof::new("code")).await.unwrap();
        bus.clear();
        let registry = TenantRegistry::new(
            session.clone(),
            remote.clone(),
            store.clone(),
            bus.clone(),
            timeout,
        );
        Fixture {
            remote,
            store,
            bus,
            session,
            registry,
        }
    }

    fn active(f: &Fixture) -> Option<String> {
        f.registry.active_id().map(|id| id.to_string())
    }

    #[tokio::test]
    async fn test_auto_select_then_explicit_selection_survives_reload() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();

        f.remote.set_tenants(tenants(&["A", "B"]));
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(active(&f).as_deref(), Some("A"));

        f.registry.select_tenant(&TenantId::from("B")).unwrap();
        assert_eq!(active(&f).as_deref(), Some("B"));

        f.remote.set_tenants(tenants(&["A", "B", "C"]));
        assert_eq!(f.registry.load_tenants(&identity).await.unwrap(), 3);
        assert_eq!(active(&f).as_deref(), Some("B"));
        assert!(f.registry.has_explicit_selection());
    }

    #[tokio::test]
    async fn test_empty_then_populated_auto_selects_once() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();

        f.remote.set_tenants(Vec::new());
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(active(&f), None);

        f.remote.set_tenants(tenants(&["X", "Y"]));
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(active(&f).as_deref(), Some("X"));

        // Reordered list keeps the existing auto-selection.
        f.remote.set_tenants(tenants(&["Y", "X"]));
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(active(&f).as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn test_hint_preferred_on_first_load_only() {
        let f = fixture(MemoryStore::new().with_tenant_hint(TenantId::from("B"))).await;
        let identity = f.session.identity().unwrap();

        f.remote.set_tenants(tenants(&["A", "B"]));
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(active(&f).as_deref(), Some("B"));

        // B disappears: next pick is the first tenant, not a re-read hint.
        f.remote.set_tenants(tenants(&["A", "C"]));
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(active(&f).as_deref(), Some("A"));
        assert_eq!(f.store.load_tenant_hint().unwrap(), Some(TenantId::from("A")));
    }

    #[tokio::test]
    async fn test_replace_not_merge_and_dedup() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();

        f.remote.set_tenants(tenants(&["A", "B", "A"]));
        assert_eq!(f.registry.load_tenants(&identity).await.unwrap(), 2);

        f.remote.set_tenants(tenants(&["C"]));
        f.registry.load_tenants(&identity).await.unwrap();
        let ids: Vec<String> = f.registry.tenants().iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, vec!["C"]);
        assert!(f.registry.get(&TenantId::from("A")).is_none());
        assert_eq!(active(&f).as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_load_failure_keeps_previous_mapping() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();
        f.remote.set_tenants(tenants(&["A"]));
        f.registry.load_tenants(&identity).await.unwrap();

        f.remote
            .fail_next(Endpoint::ListTenants, RemoteError::unavailable("502"));
        let err = f.registry.load_tenants(&identity).await.unwrap_err();
        assert!(matches!(err, SyncError::TenantsUnavailable { .. }));
        assert_eq!(f.registry.tenants().len(), 1);
        assert_eq!(active(&f).as_deref(), Some("A"));

        let notes = f.bus.active();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_select_unknown_is_noop() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();
        f.remote.set_tenants(tenants(&["A"]));
        f.registry.load_tenants(&identity).await.unwrap();

        let err = f.registry.select_tenant(&TenantId::from("Z")).unwrap_err();
        assert_eq!(
            err,
            SyncError::TenantNotFound {
                tenant_id: TenantId::from("Z")
            }
        );
        assert_eq!(active(&f).as_deref(), Some("A"));
        assert!(!f.registry.has_explicit_selection());
    }

    #[tokio::test]
    async fn test_unauthorized_load_ends_session_and_resets() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();
        f.remote.set_tenants(tenants(&["A"]));
        f.registry.load_tenants(&identity).await.unwrap();

        f.remote
            .fail_next(Endpoint::ListTenants, RemoteError::Unauthorized);
        let err = f.registry.load_tenants(&identity).await.unwrap_err();
        assert_eq!(err, SyncError::AuthInvalid);
        assert!(!f.session.is_authenticated());
        assert!(f.registry.tenants().is_empty());
        assert_eq!(active(&f), None);
    }

    #[tokio::test]
    async fn test_superseded_load_is_discarded() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();
        f.remote.set_tenants(tenants(&["A", "B"]));
        f.remote.hold(Endpoint::ListTenants);

        let slow = {
            let registry = f.registry.clone();
            let identity = identity.clone();
            tokio::spawn(async move { registry.load_tenants(&identity).await })
        };
        while f.remote.count(Endpoint::ListTenants) == 0 {
            tokio::task::yield_now().await;
        }
        f.registry.reset();
        f.remote.release(Endpoint::ListTenants);

        slow.await.unwrap().unwrap();
        assert!(f.registry.tenants().is_empty());
        assert_eq!(active(&f), None);
    }

    #[tokio::test]
    async fn test_watch_active_reports_selection() {
        let f = fixture(MemoryStore::new()).await;
        let identity = f.session.identity().unwrap();
        let mut rx = f.registry.watch_active();
        f.remote.set_tenants(tenants(&["A", "B"]));
        f.registry.load_tenants(&identity).await.unwrap();
        assert_eq!(rx.borrow_and_update().clone(), Some(TenantId::from("A")));

        f.registry.select_tenant(&TenantId::from("B")).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().clone(), Some(TenantId::from("B")));
    }
}
