//! SafeSpace Test Utilities
//!
//! Shared test infrastructure for the SafeSpace workspace:
//! - [`MockRemote`], a scriptable in-memory [`RemoteSource`]
//! - Fixtures for identities, tenants and dataset payloads
//! - Proptest generators for tenant lists and violation pages

pub use safespace_core::{
    AnalyticsPoint, AnalyticsSeries, AuthGrant, AuthProof, Credential, DashboardData,
    DatasetKind, DatasetPayload, FeedbackLabel, FeedbackOutcome, FeedbackRecord, HealthReport,
    Identity, LearningInsights, PermissionTier, QueryParams, RemoteError, RemoteSource,
    ServerStats, Tenant, TenantId, UserId, Violation, ViolationId, ViolationPage,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// MOCK REMOTE
// ============================================================================

/// Remote endpoints, for scripting and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Exchange,
    Verify,
    Logout,
    ListTenants,
    FetchDataset,
    SubmitFeedback,
}

/// One recorded call, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Exchange,
    Verify(Credential),
    Logout(Credential),
    ListTenants(Credential),
    FetchDataset {
        tenant_id: TenantId,
        kind: DatasetKind,
        params: QueryParams,
    },
    SubmitFeedback(FeedbackRecord),
}

impl RemoteCall {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Exchange => Endpoint::Exchange,
            Self::Verify(_) => Endpoint::Verify,
            Self::Logout(_) => Endpoint::Logout,
            Self::ListTenants(_) => Endpoint::ListTenants,
            Self::FetchDataset { .. } => Endpoint::FetchDataset,
            Self::SubmitFeedback(_) => Endpoint::SubmitFeedback,
        }
    }
}

#[derive(Default)]
struct MockState {
    grant: Option<AuthGrant>,
    sessions: HashMap<Credential, Identity>,
    tenants: Vec<Tenant>,
    datasets: HashMap<(TenantId, DatasetKind), DatasetPayload>,
    feedback: Option<FeedbackOutcome>,
    next_failures: HashMap<Endpoint, VecDeque<RemoteError>>,
    persistent_failures: HashMap<Endpoint, RemoteError>,
    delays: HashMap<Endpoint, Duration>,
    calls: Vec<RemoteCall>,
}

/// In-memory backend with per-endpoint scripting.
///
/// Every call is recorded before it can be delayed, held or failed, so a
/// test can observe that a request was issued while it is still pending.
pub struct MockRemote {
    state: Mutex<MockState>,
    gates: Mutex<HashMap<Endpoint, watch::Sender<bool>>>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- scripting ---------------------------------------------------------

    /// What `exchange` returns. The credential also becomes valid for `verify`.
    pub fn set_grant(&self, grant: AuthGrant) {
        let mut state = self.state();
        state
            .sessions
            .insert(grant.credential.clone(), grant.identity.clone());
        state.grant = Some(grant);
    }

    /// Make `credential` resolve to `identity` on `verify`.
    pub fn add_session(&self, credential: Credential, identity: Identity) {
        self.state().sessions.insert(credential, identity);
    }

    /// Make `credential` answer `Unauthorized` from now on.
    pub fn revoke(&self, credential: &Credential) {
        self.state().sessions.remove(credential);
    }

    pub fn set_tenants(&self, tenants: Vec<Tenant>) {
        self.state().tenants = tenants;
    }

    pub fn set_dataset(&self, tenant_id: impl Into<TenantId>, payload: DatasetPayload) {
        let kind = payload.kind();
        self.state().datasets.insert((tenant_id.into(), kind), payload);
    }

    pub fn set_feedback(&self, outcome: FeedbackOutcome) {
        self.state().feedback = Some(outcome);
    }

    /// Fail only the next call to `endpoint`.
    pub fn fail_next(&self, endpoint: Endpoint, error: RemoteError) {
        self.state()
            .next_failures
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// Fail every call to `endpoint` until [`MockRemote::recover`].
    pub fn fail_always(&self, endpoint: Endpoint, error: RemoteError) {
        self.state().persistent_failures.insert(endpoint, error);
    }

    pub fn recover(&self, endpoint: Endpoint) {
        let mut state = self.state();
        state.persistent_failures.remove(&endpoint);
        state.next_failures.remove(&endpoint);
    }

    pub fn set_delay(&self, endpoint: Endpoint, delay: Duration) {
        self.state().delays.insert(endpoint, delay);
    }

    /// Block calls to `endpoint` until [`MockRemote::release`].
    pub fn hold(&self, endpoint: Endpoint) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(endpoint)
            .or_insert_with(|| watch::channel(true).0)
            .send_replace(false);
    }

    pub fn release(&self, endpoint: Endpoint) {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gate) = gates.get(&endpoint) {
            gate.send_replace(true);
        }
    }

    // --- inspection --------------------------------------------------------

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, endpoint: Endpoint) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.endpoint() == endpoint)
            .count()
    }

    pub fn fetch_count(&self, tenant_id: &TenantId, kind: DatasetKind) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| {
                matches!(call, RemoteCall::FetchDataset { tenant_id: t, kind: k, .. } if t == tenant_id && *k == kind)
            })
            .count()
    }

    pub fn total_fetches(&self) -> usize {
        self.count(Endpoint::FetchDataset)
    }

    // --- plumbing ----------------------------------------------------------

    /// Record the call, then apply delay, gate and scripted failure.
    async fn enter(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let endpoint = call.endpoint();
        let delay = {
            let mut state = self.state();
            state.calls.push(call);
            state.delays.get(&endpoint).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let gate = {
            let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            gates.get(&endpoint).map(|gate| gate.subscribe())
        };
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        let mut state = self.state();
        if let Some(error) = state
            .next_failures
            .get_mut(&endpoint)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        if let Some(error) = state.persistent_failures.get(&endpoint) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn exchange(&self, _proof: &AuthProof) -> Result<AuthGrant, RemoteError> {
        self.enter(RemoteCall::Exchange).await?;
        self.state().grant.clone().ok_or(RemoteError::Unauthorized)
    }

    async fn verify(&self, credential: &Credential) -> Result<Identity, RemoteError> {
        self.enter(RemoteCall::Verify(credential.clone())).await?;
        self.state()
            .sessions
            .get(credential)
            .cloned()
            .ok_or(RemoteError::Unauthorized)
    }

    async fn logout(&self, credential: &Credential) -> Result<(), RemoteError> {
        self.enter(RemoteCall::Logout(credential.clone())).await
    }

    async fn list_tenants(&self, credential: &Credential) -> Result<Vec<Tenant>, RemoteError> {
        self.enter(RemoteCall::ListTenants(credential.clone())).await?;
        let state = self.state();
        if !state.sessions.contains_key(credential) {
            return Err(RemoteError::Unauthorized);
        }
        Ok(state.tenants.clone())
    }

    async fn fetch_dataset(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        kind: DatasetKind,
        params: QueryParams,
    ) -> Result<DatasetPayload, RemoteError> {
        self.enter(RemoteCall::FetchDataset {
            tenant_id: tenant_id.clone(),
            kind,
            params,
        })
        .await?;
        let state = self.state();
        if !state.sessions.contains_key(credential) {
            return Err(RemoteError::Unauthorized);
        }
        Ok(state
            .datasets
            .get(&(tenant_id.clone(), kind))
            .cloned()
            .unwrap_or_else(|| default_payload(kind)))
    }

    async fn submit_feedback(
        &self,
        credential: &Credential,
        record: &FeedbackRecord,
    ) -> Result<FeedbackOutcome, RemoteError> {
        self.enter(RemoteCall::SubmitFeedback(record.clone())).await?;
        let state = self.state();
        if !state.sessions.contains_key(credential) {
            return Err(RemoteError::Unauthorized);
        }
        Ok(state
            .feedback
            .clone()
            .unwrap_or_else(FeedbackOutcome::accepted))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub fn identity(name: &str) -> Identity {
    Identity {
        id: UserId::new(format!("user-{}", name.to_lowercase())),
        display_name: name.to_string(),
        avatar: None,
        verified: true,
    }
}

pub fn grant(token: &str, name: &str) -> AuthGrant {
    AuthGrant {
        credential: Credential::new(token),
        identity: identity(name),
    }
}

pub fn tenant(id: &str) -> Tenant {
    Tenant::new(id, format!("Server {}", id))
}

pub fn tenants(ids: &[&str]) -> Vec<Tenant> {
    ids.iter().map(|id| tenant(id)).collect()
}

pub fn violation(id: i64, violation_type: &str) -> Violation {
    Violation {
        id: ViolationId::new(id),
        violation_type: violation_type.to_string(),
        confidence_score: 0.9,
        action_taken: "flagged".to_string(),
        false_positive: None,
        created_at: None,
        message_content: None,
        username: None,
        channel_name: None,
        user_id: Some(format!("member-{}", id)),
    }
}

pub fn violations_payload(ids: &[i64]) -> DatasetPayload {
    DatasetPayload::Violations(ViolationPage {
        violations: ids.iter().map(|id| violation(*id, "toxicity")).collect(),
        total_count: Some(ids.len() as u64),
    })
}

pub fn health_payload(score: f64) -> DatasetPayload {
    DatasetPayload::HealthScore(HealthReport {
        health_score: score,
        trend: 0.0,
        status: "ok".to_string(),
        recommendations: Vec::new(),
    })
}

pub fn stats_payload(total_messages: u64, total_violations: u64) -> DatasetPayload {
    DatasetPayload::Stats(ServerStats {
        total_messages,
        total_violations,
        health_score: 0.8,
        ..Default::default()
    })
}

/// Empty payload of the right shape.
pub fn default_payload(kind: DatasetKind) -> DatasetPayload {
    match kind {
        DatasetKind::Dashboard => DatasetPayload::Dashboard(DashboardData::default()),
        DatasetKind::Stats => DatasetPayload::Stats(ServerStats::default()),
        DatasetKind::Analytics => DatasetPayload::Analytics(AnalyticsSeries::default()),
        DatasetKind::Violations => DatasetPayload::Violations(ViolationPage::default()),
        DatasetKind::LearningInsights => {
            DatasetPayload::LearningInsights(LearningInsights::default())
        }
        DatasetKind::HealthScore => DatasetPayload::HealthScore(HealthReport::default()),
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Short ids from a small alphabet so lists overlap between draws.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        "[A-F]".prop_map(TenantId::new)
    }

    pub fn arb_permission() -> impl Strategy<Value = PermissionTier> {
        prop_oneof![
            Just(PermissionTier::Owner),
            Just(PermissionTier::Admin),
            Just(PermissionTier::Member),
        ]
    }

    pub fn arb_tenant() -> impl Strategy<Value = Tenant> {
        (arb_tenant_id(), arb_permission(), proptest::option::of(0.0f64..=1.0)).prop_map(
            |(id, permission, health)| {
                let tenant = Tenant::new(id.as_str(), format!("Server {}", id))
                    .with_permission(permission);
                match health {
                    Some(h) => tenant.with_health(h),
                    None => tenant,
                }
            },
        )
    }

    /// Tenant lists; may contain repeated ids.
    pub fn arb_tenant_list(max_len: usize) -> impl Strategy<Value = Vec<Tenant>> {
        proptest::collection::vec(arb_tenant(), 0..=max_len)
    }

    pub fn arb_violation() -> impl Strategy<Value = Violation> {
        (
            1i64..20,
            prop_oneof![Just("toxicity"), Just("spam"), Just("nsfw")],
            0u32..60,
        )
            .prop_map(|(id, violation_type, minute)| {
                let mut v = violation(id, violation_type);
                v.created_at = chrono::DateTime::from_timestamp(1_750_000_000 + i64::from(minute) * 60, 0);
                v
            })
    }

    pub fn arb_violation_page() -> impl Strategy<Value = ViolationPage> {
        proptest::collection::vec(arb_violation(), 0..30).prop_map(|violations| ViolationPage {
            violations,
            total_count: None,
        })
    }
}
