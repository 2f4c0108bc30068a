//! Session reconciliation: hydrate the signed-in user from the remote
//! session service and the local fallback store.
//!
//! ARCHITECTURE
//! ============
//! `SessionStore` is the single writer of `AuthState`. A hydration pass:
//! 1. fetches the remote session inside a short time-box, falling back to a
//!    cached direct session and retrying once when the service is
//!    unreachable;
//! 2. with a principal, runs the profile fetch / ensure-row unit inside a
//!    longer time-box, committing a metadata-only fallback user if the box
//!    elapses first.
//!
//! The profile unit runs as its own task, so losing the time-box race
//! abandons the wait but not the work; a late profile still replaces the
//! fallback user.
//!
//! TRADE-OFFS
//! ==========
//! Every pass captures the generation at start and commits only if it is
//! still current. Sign-out bumps the generation, so a slow pass can no
//! longer resurrect a signed-out user. Token refreshes share the counter and
//! remain last-write-wins against hydration passes of the same generation.
//!
//! ERROR HANDLING
//! ==============
//! Nothing here returns an error. Backend failures degrade to the fallback
//! user or to "signed out" and are logged at `debug`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::backend::{AuthChange, AuthEvent, BackendError, EnsureUserRow, RemoteSession, SessionBackend};
use crate::clock::Clock;
use crate::config::ReconcileTimeouts;
use crate::state::{AuthState, ReconciliationState};
use crate::store::{CachedSession, FallbackStore, KeyValueStore};
use crate::user::AuthenticatedUser;

/// Outcome of one hydration attempt.
enum Attempt {
    Settled,
    /// Remote session service unreachable and no usable cached session.
    Unreachable,
}

struct Inner {
    backend: Arc<dyn SessionBackend>,
    fallback: FallbackStore,
    clock: Arc<dyn Clock>,
    timeouts: ReconcileTimeouts,
    reconcile: Mutex<ReconciliationState>,
    auth: watch::Sender<AuthState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Owned handle to the auth state. Clones share the same state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    #[must_use]
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        timeouts: ReconcileTimeouts,
    ) -> Self {
        let (auth, _) = watch::channel(AuthState::default());
        Self {
            inner: Arc::new(Inner {
                backend,
                fallback: FallbackStore::new(store),
                clock,
                timeouts,
                reconcile: Mutex::new(ReconciliationState::default()),
                auth,
                listener: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // READERS
    // =========================================================================

    #[must_use]
    pub fn snapshot(&self) -> AuthState {
        self.inner.auth.borrow().clone()
    }

    #[must_use]
    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.inner.auth.borrow().user.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.auth.borrow().loading
    }

    /// Subscribe to `AuthState` changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.inner.auth.subscribe()
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.reconcile().is_processing()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.reconcile().initialized
    }

    pub(crate) fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.inner.backend
    }

    pub(crate) fn fallback(&self) -> &FallbackStore {
        &self.inner.fallback
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.inner.clock.now()
    }

    fn reconcile(&self) -> MutexGuard<'_, ReconciliationState> {
        self.inner
            .reconcile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Subscribe to remote auth events and run the boot hydration. Calling
    /// it again before [`dispose`](Self::dispose) does nothing.
    pub async fn init(&self) {
        {
            let mut reconcile = self.reconcile();
            if reconcile.initialized {
                return;
            }
            reconcile.initialized = true;
        }
        let events = self.inner.backend.subscribe();
        let handle = tokio::spawn(listen(Arc::downgrade(&self.inner), events));
        if let Some(previous) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
        info!("session store initialized");
        self.hydrate().await;
    }

    /// Stop listening for remote auth events.
    pub fn dispose(&self) {
        if let Some(handle) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.reconcile().initialized = false;
    }

    // =========================================================================
    // COMMITS
    // =========================================================================

    /// Mark a pass as loading and return the generation it belongs to.
    fn begin_loading(&self) -> u64 {
        let reconcile = self.reconcile();
        self.inner.auth.send_modify(|state| state.loading = true);
        reconcile.generation
    }

    fn generation(&self) -> u64 {
        self.reconcile().generation
    }

    /// Replace the whole state if `generation` is still current.
    fn commit(&self, generation: u64, user: Option<AuthenticatedUser>) -> bool {
        let reconcile = self.reconcile();
        if reconcile.generation != generation {
            debug!(generation, current = reconcile.generation, "discarding stale hydration result");
            return false;
        }
        self.inner.auth.send_replace(AuthState { user, loading: false });
        true
    }

    /// Swap the user without touching `loading`, if `generation` is current.
    fn replace_user(&self, generation: u64, user: AuthenticatedUser) -> bool {
        let reconcile = self.reconcile();
        if reconcile.generation != generation {
            debug!(generation, current = reconcile.generation, "discarding stale profile");
            return false;
        }
        self.inner.auth.send_modify(|state| state.user = Some(user));
        true
    }

    fn settle_loading(&self, generation: u64) {
        let reconcile = self.reconcile();
        if reconcile.generation == generation {
            self.inner.auth.send_modify(|state| state.loading = false);
        }
    }

    fn apply_signed_out(&self) {
        {
            let mut reconcile = self.reconcile();
            reconcile.bump_generation();
            self.inner.auth.send_replace(AuthState::default());
        }
        self.inner.fallback.clear_cached_session();
    }

    // =========================================================================
    // HYDRATION
    // =========================================================================

    /// Derive the current user from the remote session, or from the cached
    /// direct session when the remote service cannot say.
    pub async fn hydrate(&self) {
        self.hydrate_with_retries(0).await;
    }

    /// [`hydrate`](Self::hydrate) starting from an explicit retry count.
    pub async fn hydrate_with_retries(&self, retry_count: u32) {
        let mut retry_count = retry_count;
        loop {
            if let Some(holder) = self.reconcile().processing_user() {
                debug!(holder, "hydration already in flight");
                return;
            }
            let generation = self.begin_loading();
            match self.hydrate_attempt(generation).await {
                Attempt::Settled => return,
                Attempt::Unreachable if retry_count < self.inner.timeouts.max_retries => {
                    retry_count += 1;
                    debug!(retry_count, "remote session unavailable; retrying");
                    sleep(self.inner.timeouts.retry_delay).await;
                    if self.generation() != generation {
                        debug!("auth state changed during retry delay");
                        return;
                    }
                }
                Attempt::Unreachable => {
                    // A network blip must not evict an authenticated user.
                    debug!(retry_count, "remote session unavailable; keeping current user");
                    self.settle_loading(generation);
                    return;
                }
            }
        }
    }

    async fn hydrate_attempt(&self, generation: u64) -> Attempt {
        let timeouts = self.inner.timeouts;
        let fetched = timeout(timeouts.session_fetch, self.inner.backend.get_session())
            .await
            .unwrap_or(Err(BackendError::Timeout));

        let session = match fetched {
            Ok(session) => session,
            Err(e) => {
                debug!(error = %e, "remote session fetch failed");
                let cached = self
                    .inner
                    .fallback
                    .read_cached_session(self.now(), Some(timeouts.cached_session_max_age));
                return match cached {
                    Some(cached) => {
                        debug!(user_id = %cached.user.id, "using cached direct session");
                        self.commit(generation, Some(self.user_from_cached(&cached)));
                        Attempt::Settled
                    }
                    None => Attempt::Unreachable,
                };
            }
        };

        match session.and_then(|s| s.user) {
            Some(principal) => {
                self.inner.fallback.clear_cached_session();
                let fallback_user = AuthenticatedUser::fallback_from_principal(&principal, self.now());
                self.hydrate_principal(generation, fallback_user).await;
            }
            None => {
                let user = self
                    .inner
                    .fallback
                    .read_cached_session(self.now(), None)
                    .map(|cached| self.user_from_cached(&cached));
                match &user {
                    Some(user) => debug!(user_id = %user.id, "no remote principal; using cached direct session"),
                    None if self.inner.fallback.is_session_active() => {
                        debug!("no session to resume; clearing session-active flag");
                        self.inner.fallback.mark_session_active(false);
                    }
                    None => {}
                }
                self.commit(generation, user);
            }
        }
        Attempt::Settled
    }

    fn user_from_cached(&self, cached: &CachedSession) -> AuthenticatedUser {
        AuthenticatedUser::fallback_from_cached(
            &cached.user.id,
            &cached.user.email,
            &cached.user.metadata,
            self.inner.fallback.signup_hints().role,
            self.now(),
        )
    }

    /// Time-boxed profile hydration for a known principal.
    async fn hydrate_principal(&self, generation: u64, fallback_user: AuthenticatedUser) {
        let pass = {
            let mut reconcile = self.reconcile();
            match reconcile.try_begin(&fallback_user.id) {
                Some(pass) => pass,
                None => {
                    debug!(
                        user_id = %fallback_user.id,
                        holder = ?reconcile.processing_user(),
                        "profile hydration already in flight"
                    );
                    return;
                }
            }
        };

        let worker = self.clone();
        let seed = fallback_user.clone();
        let mut work = tokio::spawn(async move { worker.load_or_ensure_profile(&seed).await });

        let user = match timeout(self.inner.timeouts.hydrate, &mut work).await {
            Ok(Ok(profile)) => profile.unwrap_or(fallback_user),
            Ok(Err(e)) => {
                warn!(error = %e, "profile hydration task failed");
                fallback_user
            }
            Err(_) => {
                debug!(user_id = %fallback_user.id, "profile hydration time-box elapsed; using fallback user");
                let late = self.clone();
                tokio::spawn(async move {
                    if let Ok(Some(user)) = work.await {
                        if late.replace_user(generation, user) {
                            debug!("late profile replaced fallback user");
                        }
                    }
                });
                fallback_user
            }
        };

        self.reconcile().end(pass);
        self.commit(generation, Some(user));
    }

    async fn load_or_ensure_profile(&self, fallback_user: &AuthenticatedUser) -> Option<AuthenticatedUser> {
        let user_id = fallback_user.id.as_str();
        if let Some(user) = self.fetch_user_profile(user_id, &fallback_user.email).await {
            return Some(user);
        }

        let hints = self.inner.fallback.signup_hints();
        let row = EnsureUserRow {
            role: hints
                .role
                .or(fallback_user.role)
                .map(|role| role.as_str().to_owned()),
            first_name: hints
                .first_name
                .or_else(|| fallback_user.given_name().map(str::to_owned)),
            last_name: hints
                .last_name
                .or_else(|| fallback_user.family_name().map(str::to_owned)),
        };
        match self.inner.backend.ensure_user_row(&row).await {
            Ok(()) => {
                debug!(user_id, "backing row ensured");
                self.inner.fallback.clear_signup_hints();
            }
            // Duplicate-key and null-constraint races land here; the re-read
            // below decides.
            Err(e) => debug!(user_id, error = %e, "ensure_user_row failed"),
        }
        self.fetch_user_profile(user_id, &fallback_user.email).await
    }

    /// Base profile, then permissions and extended fields concurrently.
    pub(crate) async fn fetch_user_profile(&self, user_id: &str, email: &str) -> Option<AuthenticatedUser> {
        let backend = &self.inner.backend;
        let profile = match backend.fetch_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!(user_id, "no stored profile");
                return None;
            }
            Err(e) => {
                debug!(user_id, error = %e, "profile fetch failed");
                return None;
            }
        };

        let (permissions, extended) =
            tokio::join!(backend.fetch_permissions(user_id), backend.fetch_extended_profile(user_id));
        let permissions = permissions.unwrap_or_else(|e| {
            debug!(user_id, error = %e, "permission fetch failed; continuing without permissions");
            Vec::new()
        });
        let extended = extended.unwrap_or_else(|e| {
            debug!(user_id, error = %e, "extended profile fetch failed");
            None
        });
        Some(AuthenticatedUser::from_profile(profile, permissions, extended, email, self.now()))
    }

    // =========================================================================
    // AUTH EVENTS
    // =========================================================================

    /// React to one remote auth state change.
    pub async fn on_remote_auth_event(&self, event: AuthEvent, session: Option<RemoteSession>) {
        debug!(?event, "remote auth event");
        match event {
            AuthEvent::SignedIn => {
                if let Some(user_id) = session.and_then(|s| s.user).map(|p| p.id) {
                    let backend = self.inner.backend.clone();
                    tokio::spawn(async move {
                        if let Err(e) = backend.record_login_activity(&user_id).await {
                            debug!(user_id = %user_id, error = %e, "login activity not recorded");
                        }
                    });
                }
                self.hydrate().await;
            }
            AuthEvent::InitialSession => self.hydrate().await,
            AuthEvent::TokenRefreshed | AuthEvent::UserUpdated => self.refresh_profile(session).await,
            AuthEvent::SignedOut => self.apply_signed_out(),
        }
    }

    async fn refresh_profile(&self, session: Option<RemoteSession>) {
        let Some(principal) = session.and_then(|s| s.user) else {
            debug!("token refresh without principal; keeping current user");
            return;
        };
        let generation = self.generation();
        let email = principal.email.unwrap_or_default();
        match self.fetch_user_profile(&principal.id, &email).await {
            Some(user) => {
                self.replace_user(generation, user);
            }
            None => debug!(user_id = %principal.id, "profile re-fetch failed; keeping current user"),
        }
    }

    /// Clear every local auth artifact, then tell the remote service. Local
    /// state is cleared even if the remote call fails or stalls.
    pub async fn sign_out(&self) {
        self.inner.fallback.clear_auth_artifacts();
        self.apply_signed_out();
        match timeout(self.inner.timeouts.sign_out, self.inner.backend.sign_out()).await {
            Ok(Ok(())) => info!("signed out"),
            Ok(Err(e)) => debug!(error = %e, "remote sign-out failed; local state already cleared"),
            Err(_) => debug!("remote sign-out timed out; local state already cleared"),
        }
    }
}

/// Forward remote auth events to the store until it is dropped or disposed.
async fn listen(inner: Weak<Inner>, mut events: broadcast::Receiver<AuthChange>) {
    loop {
        let change = match events.recv().await {
            Ok(change) => Some(change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "auth events lagged; rehydrating");
                None
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let store = SessionStore { inner };
        // Each event runs on its own task so a slow hydration never delays a
        // later sign-out.
        tokio::spawn(async move {
            match change {
                Some(change) => store.on_remote_auth_event(change.event, change.session).await,
                None => store.hydrate().await,
            }
        });
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
