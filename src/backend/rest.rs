//! REST adapter for the hosted auth/table backend.
//!
//! Thin HTTP wrapper over `/auth/v1/*` and `/rest/v1/*`. Response parsing
//! and error classification are pure functions so they can be tested
//! without a server. The current session is mirrored into the injected
//! key/value store under [`BACKEND_SESSION_KEY`], so a restarted process
//! resumes it (and refreshes it) instead of starting signed out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{
    AuthChange, AuthEvent, BackendError, EnsureUserRow, ExtendedProfile, OAuthProvider, Principal, ProfileRow,
    RemoteSession, SessionBackend, SignUpRequest,
};
use crate::store::KeyValueStore;

/// Store key of the persisted remote session. Owned by the adapter; the
/// reconciliation core never reads it.
pub const BACKEND_SESSION_KEY: &str = "backend-auth-session";

/// Refresh the access token when it expires within this many seconds.
const REFRESH_MARGIN_SECS: i64 = 60;
const EVENT_CHANNEL_CAPACITY: usize = 32;
const PROFILE_COLUMNS: &str = "id,email,first_name,last_name,role,is_active,created_at,updated_at";
const EXTENDED_PROFILE_COLUMNS: &str = "avatar_url,phone,username";

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestBackendConfig {
    /// Project base URL without trailing slash.
    pub base_url: String,
    pub anon_key: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: Mutex<Option<RemoteSession>>,
    store: Arc<dyn KeyValueStore>,
    pkce_verifier: Mutex<Option<String>>,
    events: broadcast::Sender<AuthChange>,
}

impl RestBackend {
    /// Build the HTTP client and resume any session persisted in `store`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotConfigured`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: RestBackendConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BackendError::NotConfigured(format!("http client: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            anon_key: config.anon_key,
            session: Mutex::new(load_session(store.as_ref())),
            store,
            pkce_verifier: Mutex::new(None),
            events,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn current_session(&self) -> Option<RemoteSession> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn bearer(&self) -> String {
        let token = self
            .current_session()
            .map_or_else(|| self.anon_key.clone(), |s| s.access_token);
        format!("Bearer {token}")
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .header("Authorization", self.bearer())
            .header("Accept", "application/json")
    }

    /// Send a request and return the body of a success response.
    async fn send(&self, builder: RequestBuilder) -> Result<String, BackendError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_transport_error)?;
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(classify_auth_error(status, &body))
        }
    }

    fn publish(&self, event: AuthEvent, session: Option<RemoteSession>) {
        // No subscribers is fine.
        let _ = self.events.send(AuthChange { event, session });
    }

    fn store_session(&self, session: RemoteSession, event: AuthEvent) {
        *self
            .session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session.clone());
        match serde_json::to_string(&session) {
            Ok(raw) => {
                if let Err(e) = self.store.set(BACKEND_SESSION_KEY, &raw) {
                    warn!(error = %e, "session not persisted");
                }
            }
            Err(e) => warn!(error = %e, "session encode failed"),
        }
        self.publish(event, Some(session));
    }

    fn clear_session(&self) -> bool {
        if let Err(e) = self.store.remove(BACKEND_SESSION_KEY) {
            warn!(error = %e, "persisted session not removed");
        }
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .is_some()
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<RemoteSession, BackendError> {
        let url = format!("{}?grant_type={grant_type}", self.auth_url("token"));
        let builder = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .header("Accept", "application/json")
            .json(&body);
        let text = self.send(builder).await?;
        parse_session(&text, OffsetDateTime::now_utc().unix_timestamp())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Option<RemoteSession>, BackendError> {
        match self
            .token_grant("refresh_token", serde_json::json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(session) => {
                debug!("access token refreshed");
                self.store_session(session.clone(), AuthEvent::TokenRefreshed);
                Ok(Some(session))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                warn!(error = %e, "refresh token rejected; dropping session");
                if self.clear_session() {
                    self.publish(AuthEvent::SignedOut, None);
                }
                Ok(None)
            }
        }
    }

    async fn select_rows<T: serde::de::DeserializeOwned>(&self, table: &str, query: &str) -> Result<Vec<T>, BackendError> {
        let url = format!("{}?{query}", self.rest_url(table));
        let text = self.send(self.authorized(self.http.get(url))).await?;
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SessionBackend for RestBackend {
    async fn get_session(&self) -> Result<Option<RemoteSession>, BackendError> {
        let Some(session) = self.current_session() else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();
        match (needs_refresh(&session, now), session.refresh_token.as_deref()) {
            (true, Some(refresh_token)) => self.refresh(refresh_token).await,
            _ => Ok(Some(session)),
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<RemoteSession, BackendError> {
        let session = self
            .token_grant("password", serde_json::json!({ "email": email, "password": password }))
            .await?;
        self.store_session(session.clone(), AuthEvent::SignedIn);
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<Option<RemoteSession>, BackendError> {
        let mut url = self.auth_url("signup");
        if let Some(redirect_to) = &request.redirect_to {
            url = with_query(&url, &[("redirect_to", redirect_to)])?;
        }
        let builder = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": request.email,
                "password": request.password,
                "data": request.metadata,
            }));
        let text = self.send(builder).await?;
        let session = parse_sign_up(&text, OffsetDateTime::now_utc().unix_timestamp())?;
        if let Some(session) = &session {
            self.store_session(session.clone(), AuthEvent::SignedIn);
        }
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str, redirect_to: Option<&str>) -> Result<(), BackendError> {
        let mut url = self.auth_url("otp");
        if let Some(redirect_to) = redirect_to {
            url = with_query(&url, &[("redirect_to", redirect_to)])?;
        }
        let builder = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "create_user": true }));
        self.send(builder).await.map(|_| ())
    }

    async fn verify_otp(&self, email: &str, token: &str) -> Result<RemoteSession, BackendError> {
        let builder = self
            .http
            .post(self.auth_url("verify"))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "type": "email", "email": email, "token": token }));
        let text = self.send(builder).await?;
        let session = parse_session(&text, OffsetDateTime::now_utc().unix_timestamp())?;
        self.store_session(session.clone(), AuthEvent::SignedIn);
        Ok(session)
    }

    fn oauth_authorize_url(&self, provider: OAuthProvider, redirect_to: &str) -> Result<String, BackendError> {
        let verifier = generate_code_verifier();
        let challenge = code_challenge(&verifier);
        *self
            .pkce_verifier
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(verifier);
        with_query(
            &self.auth_url("authorize"),
            &[
                ("provider", provider.as_str()),
                ("redirect_to", redirect_to),
                ("code_challenge", &challenge),
                ("code_challenge_method", "s256"),
            ],
        )
    }

    async fn exchange_code_for_session(&self, auth_code: &str) -> Result<RemoteSession, BackendError> {
        let verifier = self
            .pkce_verifier
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| BackendError::NotConfigured("no pending oauth flow".into()))?;
        let session = self
            .token_grant("pkce", serde_json::json!({ "auth_code": auth_code, "code_verifier": verifier }))
            .await?;
        self.store_session(session.clone(), AuthEvent::SignedIn);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let result = if self.current_session().is_some() {
            self.send(self.authorized(self.http.post(self.auth_url("logout"))))
                .await
                .map(|_| ())
        } else {
            Ok(())
        };
        self.clear_session();
        self.publish(AuthEvent::SignedOut, None);
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, BackendError> {
        let rows: Vec<ProfileRow> = self
            .select_rows("profiles", &format!("id=eq.{user_id}&select={PROFILE_COLUMNS}&limit=1"))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_permissions(&self, user_id: &str) -> Result<Vec<String>, BackendError> {
        #[derive(Deserialize)]
        struct PermissionRow {
            permission: String,
        }

        let rows: Vec<PermissionRow> = self
            .select_rows("user_permissions", &format!("user_id=eq.{user_id}&select=permission"))
            .await?;
        Ok(rows.into_iter().map(|r| r.permission).collect())
    }

    async fn fetch_extended_profile(&self, user_id: &str) -> Result<Option<ExtendedProfile>, BackendError> {
        let rows: Vec<ExtendedProfile> = self
            .select_rows(
                "user_profiles",
                &format!("user_id=eq.{user_id}&select={EXTENDED_PROFILE_COLUMNS}&limit=1"),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn ensure_user_row(&self, row: &EnsureUserRow) -> Result<(), BackendError> {
        let builder = self
            .authorized(self.http.post(self.rest_url("rpc/ensure_user_row")))
            .json(row);
        self.send(builder).await.map(|_| ())
    }

    async fn record_login_activity(&self, user_id: &str) -> Result<(), BackendError> {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        let url = format!("{}?id=eq.{user_id}", self.rest_url("profiles"));
        let builder = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "last_login_at": now }));
        self.send(builder).await.map(|_| ())
    }
}

// =============================================================================
// PURE HELPERS
// =============================================================================

/// Persisted session, if any. Undecodable entries are removed.
fn load_session(store: &dyn KeyValueStore) -> Option<RemoteSession> {
    let raw = match store.get(BACKEND_SESSION_KEY) {
        Ok(raw) => raw?,
        Err(e) => {
            debug!(error = %e, "persisted session unreadable");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(session) => {
            debug!("resumed persisted session");
            Some(session)
        }
        Err(e) => {
            debug!(error = %e, "purging malformed persisted session");
            if let Err(e) = store.remove(BACKEND_SESSION_KEY) {
                debug!(error = %e, "malformed persisted session not removed");
            }
            None
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e.to_string())
    }
}

fn with_query(base: &str, params: &[(&str, &str)]) -> Result<String, BackendError> {
    Url::parse_with_params(base, params)
        .map(String::from)
        .map_err(|e| BackendError::NotConfigured(format!("invalid url {base}: {e}")))
}

pub(crate) fn needs_refresh(session: &RemoteSession, now_unix: i64) -> bool {
    session
        .expires_at
        .is_some_and(|expires_at| expires_at - now_unix <= REFRESH_MARGIN_SECS)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<Principal>,
}

/// Parse a token-endpoint response into a session, deriving `expires_at`
/// from `expires_in` when the server omits it.
pub(crate) fn parse_session(body: &str, now_unix: i64) -> Result<RemoteSession, BackendError> {
    let token: TokenResponse = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok(RemoteSession {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: token
            .expires_at
            .or_else(|| token.expires_in.map(|secs| now_unix + secs)),
        user: token.user,
    })
}

/// Sign-up answers with a full session when confirmation is disabled and
/// with the bare user otherwise.
pub(crate) fn parse_sign_up(body: &str, now_unix: i64) -> Result<Option<RemoteSession>, BackendError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    if value.get("access_token").is_some() {
        parse_session(body, now_unix).map(Some)
    } else {
        Ok(None)
    }
}

fn json_str<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(serde_json::Value::as_str)
}

/// Map an error response from either the auth or the table API.
#[must_use]
pub fn classify_auth_error(status: u16, body: &str) -> BackendError {
    let value: serde_json::Value = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    let error_code = json_str(&value, "error_code").unwrap_or_default();
    let message = json_str(&value, "msg")
        .or_else(|| json_str(&value, "error_description"))
        .or_else(|| json_str(&value, "message"))
        .unwrap_or_default();
    let lowered = message.to_ascii_lowercase();

    match error_code {
        "invalid_credentials" => return BackendError::InvalidCredentials,
        "email_not_confirmed" => return BackendError::EmailNotConfirmed,
        "otp_expired" => return BackendError::OtpExpired,
        "over_request_rate_limit" | "over_email_send_rate_limit" => return BackendError::RateLimited,
        _ => {}
    }
    if status == 429 {
        return BackendError::RateLimited;
    }
    if lowered.contains("invalid login credentials") {
        return BackendError::InvalidCredentials;
    }
    if lowered.contains("email not confirmed") {
        return BackendError::EmailNotConfirmed;
    }
    if lowered.contains("token has expired") || lowered.contains("otp has expired") {
        return BackendError::OtpExpired;
    }
    // Table API errors carry the SQLSTATE in `code`.
    if let Some(code) = json_str(&value, "code") {
        return BackendError::Rejected { code: code.to_owned(), message: message.to_owned() };
    }
    BackendError::Status { status, body: body.to_owned() }
}

#[must_use]
pub(crate) fn generate_code_verifier() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[must_use]
pub(crate) fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
