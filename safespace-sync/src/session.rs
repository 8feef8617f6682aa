//! Session store: the credential, the identity, and the transitions between them.
//!
//! Credential and identity live in one `Option` so they are set and cleared
//! together. A generation counter lets a slow `resolve_session` notice that a
//! login or logout happened while it was waiting on the remote.

use crate::lock;
use crate::notifications::{Notification, NotificationAction, NotificationBus};
use crate::persistence::ClientStore;
use crate::remote::{with_timeout, SharedRemote};
use safespace_core::{AuthProof, Credential, Identity, LoginError, RemoteError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// `resolve_session` has not finished yet.
    Unknown,
    Authenticated(Identity),
    Unauthenticated,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            Self::Unknown | Self::Unauthenticated => None,
        }
    }
}

struct Authenticated {
    credential: Credential,
    identity: Identity,
}

struct SessionData {
    auth: Option<Authenticated>,
    resolved: bool,
    generation: u64,
}

impl SessionData {
    fn state(&self) -> SessionState {
        match (&self.auth, self.resolved) {
            (Some(auth), _) => SessionState::Authenticated(auth.identity.clone()),
            (None, false) => SessionState::Unknown,
            (None, true) => SessionState::Unauthenticated,
        }
    }
}

struct SessionInner {
    remote: SharedRemote,
    store: Arc<dyn ClientStore>,
    bus: NotificationBus,
    timeout: Duration,
    data: Mutex<SessionData>,
    state_tx: watch::Sender<SessionState>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    pub fn new(
        remote: SharedRemote,
        store: Arc<dyn ClientStore>,
        bus: NotificationBus,
        timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Unknown);
        Self {
            inner: Arc::new(SessionInner {
                remote,
                store,
                bus,
                timeout,
                data: Mutex::new(SessionData {
                    auth: None,
                    resolved: false,
                    generation: 0,
                }),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.data).state()
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.inner.data)
            .auth
            .as_ref()
            .map(|auth| auth.identity.clone())
    }

    pub fn credential(&self) -> Option<Credential> {
        lock(&self.inner.data)
            .auth
            .as_ref()
            .map(|auth| auth.credential.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.inner.data).auth.is_some()
    }

    /// Observe state transitions.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    fn publish_state(&self, data: &SessionData) {
        self.inner.state_tx.send_replace(data.state());
    }

    /// Try to restore the persisted session.
    ///
    /// Any verification failure clears the persisted credential: the user
    /// signs in again instead of the layer retrying forever.
    pub async fn resolve_session(&self) -> SessionState {
        let generation = lock(&self.inner.data).generation;

        let credential = match self.inner.store.load_credential() {
            Ok(Some(credential)) if !credential.is_blank() => credential,
            Ok(_) => {
                debug!("No persisted credential");
                return self.finish_unresolved(generation);
            }
            Err(err) => {
                warn!(error = %err, "Failed to read persisted credential");
                return self.finish_unresolved(generation);
            }
        };

        let result = with_timeout(self.inner.timeout, self.inner.remote.verify(&credential)).await;

        let mut data = lock(&self.inner.data);
        if data.generation != generation {
            debug!("Session changed while resolving; keeping newer state");
            return data.state();
        }

        match result {
            Ok(identity) => {
                info!(user_id = %identity.id, "Session restored");
                let message = format!("Welcome back, {}", identity.display_name);
                data.auth = Some(Authenticated {
                    credential,
                    identity: identity.clone(),
                });
                data.resolved = true;
                data.generation += 1;
                self.publish_state(&data);
                drop(data);
                self.inner.bus.info(message);
                SessionState::Authenticated(identity)
            }
            Err(err) => {
                warn!(error = %err, "Persisted credential could not be verified");
                if let Err(err) = self.inner.store.clear_credential() {
                    warn!(error = %err, "Failed to clear persisted credential");
                }
                data.auth = None;
                data.resolved = true;
                data.generation += 1;
                self.publish_state(&data);
                drop(data);
                let message = match err {
                    RemoteError::Unauthorized => {
                        "Your session has expired. Please sign in again.".to_string()
                    }
                    other => format!("Could not verify your session ({}). Please sign in again.", other),
                };
                self.inner
                    .bus
                    .publish(Notification::warning(message).with_action(NotificationAction::SignIn));
                SessionState::Unauthenticated
            }
        }
    }

    fn finish_unresolved(&self, generation: u64) -> SessionState {
        let mut data = lock(&self.inner.data);
        if data.generation == generation && !data.resolved {
            data.resolved = true;
            self.publish_state(&data);
        }
        data.state()
    }

    /// Exchange an external proof for a session.
    ///
    /// Stored state is only touched on success.
    pub async fn login(&self, proof: AuthProof) -> Result<Identity, LoginError> {
        let result = with_timeout(self.inner.timeout, self.inner.remote.exchange(&proof))
            .await
            .map_err(LoginError::from)
            .and_then(|grant| {
                if grant.credential.is_blank() {
                    Err(LoginError::Unknown("backend issued an empty credential".to_string()))
                } else {
                    Ok(grant)
                }
            });

        let grant = match result {
            Ok(grant) => grant,
            Err(err) => {
                warn!(error = %err, "Login failed");
                let notification = Notification::error(format!("Sign-in failed: {}", err));
                let notification = match &err {
                    LoginError::RemoteUnavailable(_) => {
                        notification.with_action(NotificationAction::Retry)
                    }
                    LoginError::InvalidProof | LoginError::Unknown(_) => notification,
                };
                self.inner.bus.publish(notification);
                return Err(err);
            }
        };

        let identity = grant.identity.clone();
        {
            let mut data = lock(&self.inner.data);
            if let Err(err) = self.inner.store.save_credential(&grant.credential) {
                warn!(error = %err, "Failed to persist credential; session will not survive a restart");
            }
            data.auth = Some(Authenticated {
                credential: grant.credential,
                identity: grant.identity,
            });
            data.resolved = true;
            data.generation += 1;
            self.publish_state(&data);
        }

        info!(user_id = %identity.id, "Logged in");
        self.inner
            .bus
            .success(format!("Signed in as {}", identity.display_name));
        Ok(identity)
    }

    /// Best-effort remote logout followed by an unconditional local clear.
    pub async fn logout(&self) {
        let credential = self.credential();

        if let Some(credential) = &credential {
            if let Err(err) =
                with_timeout(self.inner.timeout, self.inner.remote.logout(credential)).await
            {
                warn!(error = %err, "Remote logout failed; clearing local session anyway");
            }
        }

        let had_session = self.clear_local();
        info!(had_session, "Logged out");
        if had_session {
            self.inner.bus.info("Signed out");
        }
    }

    /// Force logout after the backend rejected `credential`.
    ///
    /// Only acts if `credential` is still the current one, so a stale 401
    /// never ends a newer session. Returns whether the session was ended.
    pub fn handle_unauthorized(&self, credential: &Credential) -> bool {
        {
            let data = lock(&self.inner.data);
            match &data.auth {
                Some(auth) if &auth.credential == credential => {}
                _ => return false,
            }
        }

        if !self.clear_local() {
            return false;
        }
        warn!("Credential rejected by backend; session ended");
        self.inner.bus.publish(
            Notification::warning("Your session has expired. Please sign in again.")
                .with_action(NotificationAction::SignIn),
        );
        true
    }

    fn clear_local(&self) -> bool {
        let mut data = lock(&self.inner.data);
        if let Err(err) = self.inner.store.clear_credential() {
            warn!(error = %err, "Failed to clear persisted credential");
        }
        let had_session = data.auth.take().is_some();
        data.resolved = true;
        data.generation += 1;
        self.publish_state(&data);
        had_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::notifications::Severity;
    use crate::persistence::MemoryStore;
    use safespace_test_utils::{grant, identity, Endpoint, MockRemote};

    struct Fixture {
        remote: Arc<MockRemote>,
        store: Arc<MemoryStore>,
        bus: NotificationBus,
        session: SessionStore,
    }

    fn fixture(store: MemoryStore) -> Fixture {
        let remote = MockRemote::shared();
        let store = Arc::new(store);
        let bus = NotificationBus::new(&NotificationConfig {
            info_ttl_ms: 5_000,
            error_ttl_ms: 8_000,
        });
        let session = SessionStore::new(
            remote.clone(),
            store.clone(),
            bus.clone(),
            Duration::from_secs(10),
        );
        Fixture {
            remote,
            store,
            bus,
            session,
        }
    }

    #[tokio::test]
    async fn test_resolve_without_credential_is_silent() {
        let f = fixture(MemoryStore::new());
        assert_eq!(f.session.state(), SessionState::Unknown);
        assert_eq!(f.session.resolve_session().await, SessionState::Unauthenticated);
        assert!(f.bus.is_empty());
        assert_eq!(f.remote.count(Endpoint::Verify), 0);
    }

    #[tokio::test]
    async fn test_resolve_restores_valid_credential() {
        let f = fixture(MemoryStore::with_credential(Credential::new("tok")));
        f.remote.add_session(Credential::new("tok"), identity("Alice"));

        let state = f.session.resolve_session().await;
        assert_eq!(state, SessionState::Authenticated(identity("Alice")));
        assert_eq!(f.session.credential(), Some(Credential::new("tok")));
        assert_eq!(f.bus.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_clears_rejected_credential() {
        let f = fixture(MemoryStore::with_credential(Credential::new("expired")));

        assert_eq!(f.session.resolve_session().await, SessionState::Unauthenticated);
        assert!(f.store.load_credential().unwrap().is_none());
        assert!(f.session.credential().is_none());
        let active = f.bus.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].action, Some(NotificationAction::SignIn));
    }

    #[tokio::test]
    async fn test_resolve_clears_credential_when_remote_unreachable() {
        let f = fixture(MemoryStore::with_credential(Credential::new("tok")));
        f.remote.add_session(Credential::new("tok"), identity("Alice"));
        f.remote
            .fail_next(Endpoint::Verify, RemoteError::unavailable("connection refused"));

        assert_eq!(f.session.resolve_session().await, SessionState::Unauthenticated);
        assert!(f.store.load_credential().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_times_out_instead_of_hanging() {
        let f = fixture(MemoryStore::with_credential(Credential::new("tok")));
        f.remote.add_session(Credential::new("tok"), identity("Alice"));
        f.remote.set_delay(Endpoint::Verify, Duration::from_secs(60));

        assert_eq!(f.session.resolve_session().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_login_success_persists_and_notifies_once() {
        let f = fixture(MemoryStore::new());
        f.remote.set_grant(grant("fresh", "Bob"));

        let identity = f.session.login(AuthProof::new("oauth-code")).await.unwrap();
        assert_eq!(identity.display_name, "Bob");
        assert_eq!(f.store.load_credential().unwrap(), Some(Credential::new("fresh")));
        assert!(f.session.is_authenticated());

        let active = f.bus.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Success);
    }

    #[tokio::test]
    async fn test_login_failure_leaves_state_untouched() {
        let f = fixture(MemoryStore::with_credential(Credential::new("old")));
        f.remote.add_session(Credential::new("old"), identity("Alice"));
        f.session.resolve_session().await;
        f.bus.clear();

        f.remote.fail_next(Endpoint::Exchange, RemoteError::Unauthorized);
        let err = f.session.login(AuthProof::new("bad")).await.unwrap_err();
        assert_eq!(err, LoginError::InvalidProof);
        assert_eq!(f.session.identity(), Some(identity("Alice")));
        assert_eq!(f.store.load_credential().unwrap(), Some(Credential::new("old")));

        let active = f.bus.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_login_unavailable_is_typed() {
        let f = fixture(MemoryStore::new());
        f.remote
            .fail_next(Endpoint::Exchange, RemoteError::unavailable("dns"));
        let err = f.session.login(AuthProof::new("code")).await.unwrap_err();
        assert!(matches!(err, LoginError::RemoteUnavailable(_)));
        assert_eq!(f.session.state(), SessionState::Unknown);
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_remote_fails() {
        let f = fixture(MemoryStore::new());
        f.remote.set_grant(grant("tok", "Alice"));
        f.session.login(AuthProof::new("code")).await.unwrap();
        f.remote
            .fail_always(Endpoint::Logout, RemoteError::unavailable("offline"));

        f.session.logout().await;
        assert_eq!(f.session.state(), SessionState::Unauthenticated);
        assert!(f.session.credential().is_none());
        assert!(f.store.load_credential().unwrap().is_none());
        assert_eq!(f.remote.count(Endpoint::Logout), 1);
    }

    #[tokio::test]
    async fn test_handle_unauthorized_ignores_stale_credential() {
        let f = fixture(MemoryStore::new());
        f.remote.set_grant(grant("current", "Alice"));
        f.session.login(AuthProof::new("code")).await.unwrap();
        f.bus.clear();

        assert!(!f.session.handle_unauthorized(&Credential::new("previous")));
        assert!(f.session.is_authenticated());
        assert!(f.bus.is_empty());

        assert!(f.session.handle_unauthorized(&Credential::new("current")));
        assert!(!f.session.is_authenticated());
        assert_eq!(f.bus.len(), 1);
        assert!(!f.session.handle_unauthorized(&Credential::new("current")));
    }

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let f = fixture(MemoryStore::new());
        let mut rx = f.session.watch();
        f.remote.set_grant(grant("tok", "Alice"));
        f.session.login(AuthProof::new("code")).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_authenticated());
    }
}
