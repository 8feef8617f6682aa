//! Dashboard context
//!
//! Owns one instance of every service and wires them together in dependency
//! order: bus, session, registry, cache, coordinator. There is no global
//! state; a UI shell holds a `Dashboard` (or clones of individual services)
//! and passes it where needed.

use crate::api_client::HttpRemote;
use crate::cache::{AggregateCache, CacheConfig};
use crate::config::{ConfigError, SyncConfig};
use crate::error::SyncClientError;
use crate::feedback::FeedbackCoordinator;
use crate::notifications::NotificationBus;
use crate::persistence::{ClientStore, FileStore};
use crate::remote::SharedRemote;
use crate::session::{SessionState, SessionStore};
use crate::tenants::TenantRegistry;
use safespace_core::{
    AuthProof, FeedbackLabel, FeedbackOutcome, Identity, LoginError, SyncResult, TenantId,
    ViolationId,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Dashboard {
    config: Arc<SyncConfig>,
    bus: NotificationBus,
    session: SessionStore,
    tenants: TenantRegistry,
    cache: AggregateCache,
    feedback: FeedbackCoordinator,
}

impl Dashboard {
    /// Validate `config` and construct every service. Performs no I/O.
    pub fn new(
        config: SyncConfig,
        remote: SharedRemote,
        store: Arc<dyn ClientStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = config.request_timeout();

        let bus = NotificationBus::new(&config.notifications);
        let session = SessionStore::new(remote.clone(), store.clone(), bus.clone(), timeout);
        let tenants = TenantRegistry::new(
            session.clone(),
            remote.clone(),
            store,
            bus.clone(),
            timeout,
        );
        let cache = AggregateCache::new(
            remote.clone(),
            tenants.clone(),
            bus.clone(),
            CacheConfig::from_sync_config(&config),
        );
        let feedback =
            FeedbackCoordinator::new(remote, tenants.clone(), cache.clone(), bus.clone(), timeout);

        Ok(Self {
            config: Arc::new(config),
            bus,
            session,
            tenants,
            cache,
            feedback,
        })
    }

    /// Construct the services, restore the persisted session and, if it is
    /// still valid, load the identity's tenants.
    pub async fn init(
        config: SyncConfig,
        remote: SharedRemote,
        store: Arc<dyn ClientStore>,
    ) -> Result<Self, SyncClientError> {
        let dashboard = Self::new(config, remote, store)?;
        dashboard.start().await;
        Ok(dashboard)
    }

    /// [`Dashboard::init`] against the HTTP backend with file persistence.
    pub async fn connect(config: SyncConfig) -> Result<Self, SyncClientError> {
        let remote: SharedRemote = Arc::new(HttpRemote::new(&config)?);
        let store: Arc<dyn ClientStore> = Arc::new(FileStore::from_config(&config));
        Self::init(config, remote, store).await
    }

    /// Resolve the persisted session and load tenants when authenticated.
    pub async fn start(&self) -> SessionState {
        let state = self.session.resolve_session().await;
        if let SessionState::Authenticated(identity) = &state {
            self.load_tenants(identity).await;
        }
        info!(authenticated = state.is_authenticated(), "Dashboard started");
        state
    }

    pub async fn login(&self, proof: AuthProof) -> Result<Identity, LoginError> {
        let identity = self.session.login(proof).await?;
        self.load_tenants(&identity).await;
        Ok(identity)
    }

    /// End the session. Local state is cleared even if the remote call fails.
    pub async fn logout(&self) {
        self.session.logout().await;
        self.tenants.reset();
        self.cache.clear();
    }

    pub fn select_tenant(&self, tenant_id: &TenantId) -> SyncResult<()> {
        self.tenants.select_tenant(tenant_id)
    }

    /// Explicit user refresh: reload the tenant list, then refetch every
    /// dataset of the active tenant.
    pub async fn refresh(&self) -> SyncResult<usize> {
        self.tenants.refresh().await?;
        Ok(self.cache.refresh_active())
    }

    pub async fn submit_feedback(
        &self,
        tenant_id: &TenantId,
        violation_id: ViolationId,
        label: FeedbackLabel,
    ) -> SyncResult<FeedbackOutcome> {
        self.feedback
            .submit_feedback(tenant_id, violation_id, label)
            .await
    }

    /// Stop every background refresh loop. Outstanding subscriptions stay
    /// valid but no longer poll.
    pub fn dispose(&self) {
        self.cache.dispose();
        info!("Dashboard disposed");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn notifications(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub fn cache(&self) -> &AggregateCache {
        &self.cache
    }

    pub fn feedback(&self) -> &FeedbackCoordinator {
        &self.feedback
    }

    async fn load_tenants(&self, identity: &Identity) {
        match self.tenants.load_tenants(identity).await {
            Ok(count) => info!(user_id = %identity.id, count, "Tenants loaded"),
            Err(err) => warn!(user_id = %identity.id, error = %err, "Tenant load failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReadStatus;
    use crate::notifications::Severity;
    use crate::persistence::MemoryStore;
    use safespace_core::{Credential, DatasetKind, QueryParams, RemoteError, SyncError};
    use safespace_test_utils::{grant, identity, tenants, Endpoint, MockRemote};

    fn build(remote: &Arc<MockRemote>, store: MemoryStore) -> (Dashboard, Arc<MemoryStore>) {
        let store = Arc::new(store);
        let dashboard = Dashboard::new(SyncConfig::default(), remote.clone(), store.clone()).unwrap();
        (dashboard, store)
    }

    #[tokio::test]
    async fn test_start_restores_session_and_hinted_tenant() {
        let remote = MockRemote::shared();
        remote.add_session(Credential::new("tok"), identity("Alice"));
        remote.set_tenants(tenants(&["A", "B", "C"]));
        let (dashboard, _) = build(
            &remote,
            MemoryStore::with_credential(Credential::new("tok")).with_tenant_hint(TenantId::from("C")),
        );

        let state = dashboard.start().await;
        assert!(state.is_authenticated());
        assert_eq!(dashboard.tenants().active_id(), Some(TenantId::from("C")));
        assert!(!dashboard.tenants().has_explicit_selection());
    }

    #[tokio::test]
    async fn test_start_without_credential_loads_nothing() {
        let remote = MockRemote::shared();
        let (dashboard, _) = build(&remote, MemoryStore::new());

        assert_eq!(dashboard.start().await, SessionState::Unauthenticated);
        assert!(dashboard.tenants().tenants().is_empty());
        assert_eq!(remote.count(Endpoint::ListTenants), 0);
        assert!(dashboard.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let remote = MockRemote::shared();
        remote.set_grant(grant("tok", "Alice"));
        remote.set_tenants(tenants(&["A", "B"]));
        let (dashboard, store) = build(&remote, MemoryStore::new());
        dashboard.start().await;

        dashboard.login(AuthProof::new("code")).await.unwrap();
        assert_eq!(dashboard.tenants().active_id(), Some(TenantId::from("A")));

        let view = dashboard
            .cache()
            .fetch(DatasetKind::Violations, QueryParams::none())
            .await;
        assert_eq!(view.status(), ReadStatus::Fresh);

        dashboard
            .submit_feedback(
                &TenantId::from("A"),
                ViolationId::new(1),
                FeedbackLabel::FalsePositive,
            )
            .await
            .unwrap();
        dashboard.cache().settle().await;
        assert_eq!(
            remote.fetch_count(&TenantId::from("A"), DatasetKind::Violations),
            2
        );

        remote.fail_always(Endpoint::Logout, RemoteError::unavailable("offline"));
        dashboard.logout().await;
        assert!(!dashboard.session().is_authenticated());
        assert!(store.load_credential().unwrap().is_none());
        assert!(dashboard.tenants().active_id().is_none());
        assert!(dashboard.cache().is_empty());
        assert_eq!(
            dashboard
                .cache()
                .read(DatasetKind::Violations, QueryParams::none())
                .status(),
            ReadStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_login_with_failing_tenant_list_still_signs_in() {
        let remote = MockRemote::shared();
        remote.set_grant(grant("tok", "Alice"));
        remote.fail_next(Endpoint::ListTenants, RemoteError::unavailable("502"));
        let (dashboard, _) = build(&remote, MemoryStore::new());

        let identity = dashboard.login(AuthProof::new("code")).await.unwrap();
        assert_eq!(identity.display_name, "Alice");
        assert!(dashboard.tenants().active_id().is_none());
        let warnings = dashboard
            .notifications()
            .active()
            .into_iter()
            .filter(|n| n.severity == Severity::Warning)
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_select_unknown_tenant_reports_not_found() {
        let remote = MockRemote::shared();
        remote.set_grant(grant("tok", "Alice"));
        remote.set_tenants(tenants(&["A"]));
        let (dashboard, _) = build(&remote, MemoryStore::new());
        dashboard.login(AuthProof::new("code")).await.unwrap();

        assert_eq!(
            dashboard.select_tenant(&TenantId::from("Z")),
            Err(SyncError::TenantNotFound {
                tenant_id: TenantId::from("Z")
            })
        );
        assert_eq!(dashboard.tenants().active_id(), Some(TenantId::from("A")));
    }

    #[tokio::test]
    async fn test_refresh_reloads_tenants_and_datasets() {
        let remote = MockRemote::shared();
        remote.set_grant(grant("tok", "Alice"));
        remote.set_tenants(tenants(&["A"]));
        let (dashboard, _) = build(&remote, MemoryStore::new());
        dashboard.login(AuthProof::new("code")).await.unwrap();
        dashboard
            .cache()
            .fetch(DatasetKind::Stats, QueryParams::none())
            .await;

        remote.set_tenants(tenants(&["A", "B"]));
        assert_eq!(dashboard.refresh().await.unwrap(), 1);
        dashboard.cache().settle().await;
        assert_eq!(dashboard.tenants().tenants().len(), 2);
        assert_eq!(remote.count(Endpoint::ListTenants), 2);
        assert_eq!(remote.total_fetches(), 2);
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let mut config = SyncConfig::default();
        config.request_timeout_ms = 0;
        let result = Dashboard::new(
            config,
            MockRemote::shared(),
            Arc::new(MemoryStore::new()),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                ..
            })
        ));
    }
}
