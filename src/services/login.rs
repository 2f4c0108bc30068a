//! User-initiated sign-in flows.
//!
//! DESIGN
//! ======
//! Each flow validates its input locally, calls the backend once, and on a
//! new session hands over to [`SessionStore::hydrate`]. Password and OTP
//! sign-ins also seed the cached direct session so a slow session fetch on
//! the next boot still finds the user.
//!
//! ERROR HANDLING
//! ==============
//! `LoginError` is the only error type surfaced to the UI. Its `Display` is
//! the message shown to the user; backend detail is logged at `debug`.

use tracing::{debug, info};

use super::session::SessionStore;
use crate::backend::{BackendError, OAuthProvider, RemoteSession, SignUpRequest, UserMetadata};
use crate::store::{CachedSession, CachedUser, SignupHints};
use crate::user::Role;

pub const OTP_LEN: usize = 6;
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("Please enter a valid email address.")]
    InvalidEmail,
    #[error("Please enter your password.")]
    MissingPassword,
    #[error("Password must be at least 6 characters.")]
    WeakPassword,
    #[error("Enter the 6-digit code from your email.")]
    InvalidCode,
    #[error("Invalid email or password.")]
    InvalidCredentials,
    #[error("Please confirm your email address before signing in.")]
    EmailNotConfirmed,
    #[error("That code is invalid or has expired.")]
    CodeExpired,
    #[error("Too many attempts. Please wait a moment and try again.")]
    RateLimited,
    #[error("Unable to reach the server. Check your connection and try again.")]
    Unreachable,
    #[error("Something went wrong. Please try again.")]
    Unexpected,
}

impl From<BackendError> for LoginError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::InvalidCredentials => Self::InvalidCredentials,
            BackendError::EmailNotConfirmed => Self::EmailNotConfirmed,
            BackendError::OtpExpired => Self::CodeExpired,
            BackendError::RateLimited => Self::RateLimited,
            BackendError::Transport(_) | BackendError::Timeout => Self::Unreachable,
            BackendError::Status { .. }
            | BackendError::Decode(_)
            | BackendError::Rejected { .. }
            | BackendError::NotConfigured(_) => Self::Unexpected,
        }
    }
}

fn login_failed(flow: &'static str) -> impl FnOnce(BackendError) -> LoginError {
    move |e| {
        debug!(flow, error = %e, "login flow failed");
        LoginError::from(e)
    }
}

#[must_use]
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim().to_ascii_lowercase();
    let (local, domain) = normalized.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(normalized)
}

/// Six ASCII digits; spaces typed between groups are dropped.
#[must_use]
pub fn normalize_otp(code: &str) -> Option<String> {
    let normalized: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    if normalized.len() != OTP_LEN || !normalized.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(normalized)
}

/// Fields of the signup form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpForm {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    /// Where the confirmation e-mail should land.
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn,
    /// The account exists but has to confirm its e-mail first.
    ConfirmationPending,
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

impl SessionStore {
    /// Cache the direct session and flag it active before hydrating.
    fn remember_session(&self, session: &RemoteSession) {
        if let Some(principal) = session.principal() {
            let user = CachedUser {
                id: principal.id.clone(),
                email: principal.email.clone().unwrap_or_default(),
                metadata: principal.user_metadata.clone(),
            };
            self.fallback()
                .write_cached_session(&CachedSession::new(session.access_token.clone(), user, self.now()));
        }
        self.fallback().mark_session_active(true);
    }

    /// # Errors
    ///
    /// Returns a [`LoginError`] for malformed input or a refused sign-in.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<(), LoginError> {
        let email = normalize_email(email).ok_or(LoginError::InvalidEmail)?;
        if password.is_empty() {
            return Err(LoginError::MissingPassword);
        }
        let session = self
            .backend()
            .sign_in_with_password(&email, password)
            .await
            .map_err(login_failed("password"))?;
        info!("signed in with password");
        self.remember_session(&session);
        self.hydrate().await;
        Ok(())
    }

    /// Register a new account. The chosen role and names are kept as signup
    /// hints until the backing row exists.
    ///
    /// # Errors
    ///
    /// Returns a [`LoginError`] for malformed input or a refused signup.
    pub async fn sign_up(&self, form: &SignUpForm) -> Result<SignUpOutcome, LoginError> {
        let email = normalize_email(&form.email).ok_or(LoginError::InvalidEmail)?;
        if form.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(LoginError::WeakPassword);
        }
        let first_name = non_blank(&form.first_name);
        let last_name = non_blank(&form.last_name);
        self.fallback().write_signup_hints(&SignupHints {
            role: Some(form.role),
            first_name: first_name.clone(),
            last_name: last_name.clone(),
        });

        let full_name = match (&first_name, &last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        };
        let request = SignUpRequest {
            email,
            password: form.password.clone(),
            metadata: UserMetadata {
                role: Some(form.role.as_str().to_owned()),
                first_name,
                last_name,
                full_name,
                ..UserMetadata::default()
            },
            redirect_to: form.redirect_to.clone(),
        };
        let session = self
            .backend()
            .sign_up(&request)
            .await
            .map_err(login_failed("sign_up"))?;

        match session {
            Some(session) => {
                info!(role = %form.role, "signed up");
                self.remember_session(&session);
                self.hydrate().await;
                Ok(SignUpOutcome::SignedIn)
            }
            None => {
                info!(role = %form.role, "signed up; confirmation pending");
                Ok(SignUpOutcome::ConfirmationPending)
            }
        }
    }

    /// # Errors
    ///
    /// Returns a [`LoginError`] for a malformed address or a refused send.
    pub async fn send_magic_link(&self, email: &str, redirect_to: Option<&str>) -> Result<(), LoginError> {
        let email = normalize_email(email).ok_or(LoginError::InvalidEmail)?;
        self.backend()
            .sign_in_with_otp(&email, redirect_to)
            .await
            .map_err(login_failed("magic_link"))?;
        debug!("magic link sent");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a [`LoginError`] for malformed input or a rejected code.
    pub async fn verify_otp(&self, email: &str, code: &str) -> Result<(), LoginError> {
        let email = normalize_email(email).ok_or(LoginError::InvalidEmail)?;
        let code = normalize_otp(code).ok_or(LoginError::InvalidCode)?;
        let session = self
            .backend()
            .verify_otp(&email, &code)
            .await
            .map_err(login_failed("otp"))?;
        info!("signed in with one-time code");
        self.remember_session(&session);
        self.hydrate().await;
        Ok(())
    }

    /// Start the Google redirect flow and return the provider URL. With
    /// `link_existing` the callback treats the result as a linked identity.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::Unexpected`] if no URL can be built.
    pub fn sign_in_with_google(&self, redirect_to: &str, link_existing: bool) -> Result<String, LoginError> {
        let url = self
            .backend()
            .oauth_authorize_url(OAuthProvider::Google, redirect_to)
            .map_err(login_failed("google"))?;
        self.fallback().set_linking_google(link_existing);
        Ok(url)
    }

    /// Finish the redirect flow with the code from the callback URL.
    ///
    /// # Errors
    ///
    /// Returns a [`LoginError`] if the code is missing or the exchange fails.
    pub async fn complete_oauth(&self, auth_code: &str) -> Result<(), LoginError> {
        let auth_code = auth_code.trim();
        if auth_code.is_empty() {
            return Err(LoginError::Unexpected);
        }
        let linking = self.fallback().is_linking_google();
        let result = self
            .backend()
            .exchange_code_for_session(auth_code)
            .await
            .map_err(login_failed("oauth"));
        self.fallback().set_linking_google(false);
        result?;
        info!(linking, "signed in with Google");
        self.fallback().mark_session_active(true);
        self.hydrate().await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "login_test.rs"]
mod tests;
