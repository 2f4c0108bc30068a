//! Remote session service: the hosted auth/table/RPC backend.
//!
//! ARCHITECTURE
//! ============
//! `SessionBackend` is the seam between the reconciliation core and the
//! hosted service. `RestBackend` speaks its REST contract; tests swap in
//! scripted mocks. Auth state changes are delivered on a broadcast channel;
//! dropping the receiver is the unsubscribe.

pub mod rest;
#[cfg(test)]
pub mod test_helpers;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

pub use rest::{BACKEND_SESSION_KEY, RestBackend, RestBackendConfig};

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response (DNS, connect, reset).
    #[error("transport failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// Non-success status without a recognized auth error code.
    #[error("backend responded {status}")]
    Status { status: u16, body: String },

    #[error("response decode failed: {0}")]
    Decode(String),

    #[error("invalid login credentials")]
    InvalidCredentials,

    #[error("email not confirmed")]
    EmailNotConfirmed,

    #[error("otp expired or invalid")]
    OtpExpired,

    #[error("rate limited")]
    RateLimited,

    /// The database refused a write (duplicate key, null constraint, RLS).
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    /// Failures worth another attempt after a pause.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::Status { status: 500..=599, .. })
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Provider-supplied user metadata. Loosely shaped: every field is optional
/// and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// The authenticated principal inside a remote session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry as unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub user: Option<Principal>,
}

impl RemoteSession {
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.user.as_ref()
    }
}

/// Row of the `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Row of the `user_profiles` table (fields beyond the base profile).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedProfile {
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub username: Option<String>,
}

/// Arguments of the `ensure_user_row` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureUserRow {
    pub role: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub metadata: UserMetadata,
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
        }
    }
}

// =============================================================================
// AUTH EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    TokenRefreshed,
    UserUpdated,
    SignedOut,
}

/// One auth state change as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<RemoteSession>,
}

// =============================================================================
// TRAIT
// =============================================================================

/// Async interface to the hosted backend.
///
/// Implementations must be `Send + Sync` so the reconciliation core can
/// share one instance across spawned tasks.
#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync {
    /// Current session, refreshed first if the access token is about to
    /// expire. `Ok(None)` means nobody is signed in.
    async fn get_session(&self) -> Result<Option<RemoteSession>, BackendError>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<RemoteSession, BackendError>;

    /// Returns `None` when the account still has to confirm its e-mail.
    async fn sign_up(&self, request: &SignUpRequest) -> Result<Option<RemoteSession>, BackendError>;

    /// Send a magic link / one-time code to `email`.
    async fn sign_in_with_otp(&self, email: &str, redirect_to: Option<&str>) -> Result<(), BackendError>;

    async fn verify_otp(&self, email: &str, token: &str) -> Result<RemoteSession, BackendError>;

    /// Provider authorization URL for the redirect-based OAuth flow.
    fn oauth_authorize_url(&self, provider: OAuthProvider, redirect_to: &str) -> Result<String, BackendError>;

    async fn exchange_code_for_session(&self, auth_code: &str) -> Result<RemoteSession, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, BackendError>;

    async fn fetch_permissions(&self, user_id: &str) -> Result<Vec<String>, BackendError>;

    async fn fetch_extended_profile(&self, user_id: &str) -> Result<Option<ExtendedProfile>, BackendError>;

    /// Idempotently create the backing row for the signed-in user.
    async fn ensure_user_row(&self, row: &EnsureUserRow) -> Result<(), BackendError>;

    async fn record_login_activity(&self, user_id: &str) -> Result<(), BackendError>;
}
