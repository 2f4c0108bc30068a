//! Scripted `SessionBackend` for unit tests.
//!
//! Each operation pops the next queued [`Step`] or repeats its default one.
//! Steps may resolve immediately, after a delay on tokio's clock (use paused
//! time), or never.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use time::macros::datetime;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::*;

#[derive(Debug, Clone)]
pub enum Step<T> {
    Ready(Result<T, BackendError>),
    After(Duration, Result<T, BackendError>),
    Hang,
}

impl<T> Step<T> {
    pub fn ok(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn err(error: BackendError) -> Self {
        Self::Ready(Err(error))
    }

    pub fn ok_after(delay: Duration, value: T) -> Self {
        Self::After(delay, Ok(value))
    }

    async fn run(self) -> Result<T, BackendError> {
        match self {
            Self::Ready(result) => result,
            Self::After(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
            Self::Hang => std::future::pending().await,
        }
    }
}

struct Script<T> {
    queue: VecDeque<Step<T>>,
    default: Step<T>,
}

impl<T: Clone> Script<T> {
    fn new(default: Step<T>) -> Mutex<Self> {
        Mutex::new(Self { queue: VecDeque::new(), default })
    }
}

fn next<T: Clone>(script: &Mutex<Script<T>>) -> Step<T> {
    let mut script = script.lock().unwrap();
    script
        .queue
        .pop_front()
        .unwrap_or_else(|| script.default.clone())
}

fn set<T>(script: &Mutex<Script<T>>, step: Step<T>) {
    script.lock().unwrap().default = step;
}

fn queue<T>(script: &Mutex<Script<T>>, step: Step<T>) {
    script.lock().unwrap().queue.push_back(step);
}

pub struct MockBackend {
    session: Mutex<Script<Option<RemoteSession>>>,
    sign_in: Mutex<Script<RemoteSession>>,
    sign_up: Mutex<Script<Option<RemoteSession>>>,
    otp: Mutex<Script<()>>,
    verify: Mutex<Script<RemoteSession>>,
    exchange: Mutex<Script<RemoteSession>>,
    sign_out: Mutex<Script<()>>,
    profile: Mutex<Script<Option<ProfileRow>>>,
    permissions: Mutex<Script<Vec<String>>>,
    extended: Mutex<Script<Option<ExtendedProfile>>>,
    ensure: Mutex<Script<()>>,
    login_activity: Mutex<Script<()>>,
    events: broadcast::Sender<AuthChange>,

    pub session_calls: Mutex<Vec<Instant>>,
    pub sign_in_calls: AtomicUsize,
    pub otp_requests: Mutex<Vec<String>>,
    pub verified_tokens: Mutex<Vec<String>>,
    pub sign_up_requests: Mutex<Vec<SignUpRequest>>,
    pub sign_out_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    pub ensure_rows: Mutex<Vec<EnsureUserRow>>,
    pub login_activity_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session: Script::new(Step::ok(None)),
            sign_in: Script::new(Step::err(BackendError::InvalidCredentials)),
            sign_up: Script::new(Step::ok(None)),
            otp: Script::new(Step::ok(())),
            verify: Script::new(Step::err(BackendError::OtpExpired)),
            exchange: Script::new(Step::err(BackendError::NotConfigured("no flow".into()))),
            sign_out: Script::new(Step::ok(())),
            profile: Script::new(Step::ok(None)),
            permissions: Script::new(Step::ok(Vec::new())),
            extended: Script::new(Step::ok(None)),
            ensure: Script::new(Step::ok(())),
            login_activity: Script::new(Step::ok(())),
            events,
            session_calls: Mutex::new(Vec::new()),
            sign_in_calls: AtomicUsize::new(0),
            otp_requests: Mutex::new(Vec::new()),
            verified_tokens: Mutex::new(Vec::new()),
            sign_up_requests: Mutex::new(Vec::new()),
            sign_out_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            ensure_rows: Mutex::new(Vec::new()),
            login_activity_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_session(&self, step: Step<Option<RemoteSession>>) {
        set(&self.session, step);
    }

    pub fn queue_session(&self, step: Step<Option<RemoteSession>>) {
        queue(&self.session, step);
    }

    pub fn set_sign_in(&self, step: Step<RemoteSession>) {
        set(&self.sign_in, step);
    }

    pub fn set_sign_up(&self, step: Step<Option<RemoteSession>>) {
        set(&self.sign_up, step);
    }

    pub fn set_otp(&self, step: Step<()>) {
        set(&self.otp, step);
    }

    pub fn set_verify(&self, step: Step<RemoteSession>) {
        set(&self.verify, step);
    }

    pub fn set_exchange(&self, step: Step<RemoteSession>) {
        set(&self.exchange, step);
    }

    pub fn set_sign_out(&self, step: Step<()>) {
        set(&self.sign_out, step);
    }

    pub fn set_profile(&self, step: Step<Option<ProfileRow>>) {
        set(&self.profile, step);
    }

    pub fn queue_profile(&self, step: Step<Option<ProfileRow>>) {
        queue(&self.profile, step);
    }

    pub fn set_permissions(&self, step: Step<Vec<String>>) {
        set(&self.permissions, step);
    }

    pub fn set_extended(&self, step: Step<Option<ExtendedProfile>>) {
        set(&self.extended, step);
    }

    pub fn set_ensure(&self, step: Step<()>) {
        set(&self.ensure, step);
    }

    pub fn set_login_activity(&self, step: Step<()>) {
        set(&self.login_activity, step);
    }

    /// Broadcast an auth change to subscribers.
    pub fn emit(&self, event: AuthEvent, session: Option<RemoteSession>) {
        let _ = self.events.send(AuthChange { event, session });
    }

    pub fn session_call_count(&self) -> usize {
        self.session_calls.lock().unwrap().len()
    }

    pub fn ensure_call_count(&self) -> usize {
        self.ensure_rows.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SessionBackend for MockBackend {
    async fn get_session(&self) -> Result<Option<RemoteSession>, BackendError> {
        self.session_calls.lock().unwrap().push(Instant::now());
        next(&self.session).run().await
    }

    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<RemoteSession, BackendError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.sign_in).run().await
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<Option<RemoteSession>, BackendError> {
        self.sign_up_requests.lock().unwrap().push(request.clone());
        next(&self.sign_up).run().await
    }

    async fn sign_in_with_otp(&self, email: &str, _redirect_to: Option<&str>) -> Result<(), BackendError> {
        self.otp_requests.lock().unwrap().push(email.to_owned());
        next(&self.otp).run().await
    }

    async fn verify_otp(&self, _email: &str, token: &str) -> Result<RemoteSession, BackendError> {
        self.verified_tokens.lock().unwrap().push(token.to_owned());
        next(&self.verify).run().await
    }

    fn oauth_authorize_url(&self, provider: OAuthProvider, redirect_to: &str) -> Result<String, BackendError> {
        Ok(format!(
            "https://auth.example.test/authorize?provider={}&redirect_to={redirect_to}",
            provider.as_str()
        ))
    }

    async fn exchange_code_for_session(&self, _auth_code: &str) -> Result<RemoteSession, BackendError> {
        next(&self.exchange).run().await
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.sign_out).run().await
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn fetch_profile(&self, _user_id: &str) -> Result<Option<ProfileRow>, BackendError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.profile).run().await
    }

    async fn fetch_permissions(&self, _user_id: &str) -> Result<Vec<String>, BackendError> {
        next(&self.permissions).run().await
    }

    async fn fetch_extended_profile(&self, _user_id: &str) -> Result<Option<ExtendedProfile>, BackendError> {
        next(&self.extended).run().await
    }

    async fn ensure_user_row(&self, row: &EnsureUserRow) -> Result<(), BackendError> {
        self.ensure_rows.lock().unwrap().push(row.clone());
        next(&self.ensure).run().await
    }

    async fn record_login_activity(&self, _user_id: &str) -> Result<(), BackendError> {
        self.login_activity_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.login_activity).run().await
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

pub fn principal(id: &str, role: Option<&str>) -> Principal {
    Principal {
        id: id.to_owned(),
        email: Some(format!("{id}@example.com")),
        user_metadata: UserMetadata {
            role: role.map(str::to_owned),
            full_name: Some("Ada Lovelace".to_owned()),
            ..UserMetadata::default()
        },
        created_at: Some(datetime!(2024-06-01 9:00 UTC)),
        updated_at: None,
    }
}

pub fn session_for(principal: Principal) -> RemoteSession {
    RemoteSession {
        access_token: format!("token-{}", principal.id),
        refresh_token: Some("refresh".to_owned()),
        expires_at: None,
        user: Some(principal),
    }
}

pub fn profile_row(id: &str, role: Option<&str>) -> ProfileRow {
    ProfileRow {
        id: id.to_owned(),
        email: Some(format!("{id}@example.com")),
        first_name: Some("Grace".to_owned()),
        last_name: Some("Hopper".to_owned()),
        role: role.map(str::to_owned),
        is_active: Some(true),
        created_at: Some(datetime!(2024-01-01 0:00 UTC)),
        updated_at: Some(datetime!(2024-02-01 0:00 UTC)),
    }
}
