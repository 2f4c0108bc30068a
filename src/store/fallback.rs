//! Fallback session cache and signup hints on top of a [`KeyValueStore`].
//!
//! A cached "direct session" lets the app keep a user signed in while the
//! remote service is slow. Entries are trusted only when they carry both a
//! token and a user and, where an age bound applies, are younger than it.
//! Anything else is deleted on read.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use super::KeyValueStore;
use crate::backend::UserMetadata;
use crate::clock::epoch_millis;
use crate::user::Role;

pub const DIRECT_SESSION_KEY: &str = "direct-auth-session";
pub const SIGNUP_ROLE_KEY: &str = "signup.role";
pub const SIGNUP_FIRST_NAME_KEY: &str = "signup.first_name";
pub const SIGNUP_LAST_NAME_KEY: &str = "signup.last_name";
pub const LINKING_GOOGLE_KEY: &str = "linkingGoogle";
pub const SESSION_ACTIVE_KEY: &str = "auth-session-active";

const AUTH_ARTIFACT_KEYS: [&str; 6] = [
    DIRECT_SESSION_KEY,
    SIGNUP_ROLE_KEY,
    SIGNUP_FIRST_NAME_KEY,
    SIGNUP_LAST_NAME_KEY,
    LINKING_GOOGLE_KEY,
    SESSION_ACTIVE_KEY,
];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub metadata: UserMetadata,
}

/// A validated cache entry. Serialized as
/// `{ accessToken, user: { id, email, metadata }, timestamp }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSession {
    pub access_token: String,
    pub user: CachedUser,
    /// Epoch milliseconds at write time.
    pub timestamp: i64,
}

impl CachedSession {
    #[must_use]
    pub fn new(access_token: impl Into<String>, user: CachedUser, at: OffsetDateTime) -> Self {
        Self { access_token: access_token.into(), user, timestamp: epoch_millis(at) }
    }

    #[must_use]
    pub fn age_millis(&self, now: OffsetDateTime) -> i64 {
        epoch_millis(now).saturating_sub(self.timestamp)
    }
}

/// On-disk shape, before validation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCachedSession {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<CachedUser>,
    #[serde(default)]
    timestamp: Option<i64>,
}

impl RawCachedSession {
    fn validate(self) -> Option<CachedSession> {
        let access_token = self.access_token.filter(|t| !t.trim().is_empty())?;
        let user = self.user.filter(|u| !u.id.trim().is_empty())?;
        Some(CachedSession { access_token, user, timestamp: self.timestamp.unwrap_or(0) })
    }
}

/// Role and name chosen on the signup form, kept until the backing row
/// exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignupHints {
    pub role: Option<Role>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

// =============================================================================
// ADAPTER
// =============================================================================

#[derive(Clone)]
pub struct FallbackStore {
    store: Arc<dyn KeyValueStore>,
}

impl FallbackStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "local store read failed");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            debug!(key, error = %e, "local store write failed");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            debug!(key, error = %e, "local store remove failed");
        }
    }

    /// Read the cached direct session.
    ///
    /// Malformed entries are always purged. With `max_age`, entries at or
    /// beyond that age are purged too.
    #[must_use]
    pub fn read_cached_session(&self, now: OffsetDateTime, max_age: Option<Duration>) -> Option<CachedSession> {
        let raw = self.get(DIRECT_SESSION_KEY)?;
        let parsed = serde_json::from_str::<RawCachedSession>(&raw)
            .ok()
            .and_then(RawCachedSession::validate);
        let Some(session) = parsed else {
            debug!("purging malformed cached session");
            self.clear_cached_session();
            return None;
        };
        if let Some(max_age) = max_age {
            let limit = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
            if session.age_millis(now) >= limit {
                debug!(age_ms = session.age_millis(now), "purging stale cached session");
                self.clear_cached_session();
                return None;
            }
        }
        Some(session)
    }

    pub fn write_cached_session(&self, session: &CachedSession) {
        match serde_json::to_string(session) {
            Ok(raw) => self.set(DIRECT_SESSION_KEY, &raw),
            Err(e) => debug!(error = %e, "cached session encode failed"),
        }
    }

    pub fn clear_cached_session(&self) {
        self.remove(DIRECT_SESSION_KEY);
    }

    #[must_use]
    pub fn signup_hints(&self) -> SignupHints {
        let non_blank = |key: &str| self.get(key).filter(|v| !v.trim().is_empty());
        SignupHints {
            role: non_blank(SIGNUP_ROLE_KEY).and_then(|r| Role::parse(&r)),
            first_name: non_blank(SIGNUP_FIRST_NAME_KEY),
            last_name: non_blank(SIGNUP_LAST_NAME_KEY),
        }
    }

    pub fn write_signup_hints(&self, hints: &SignupHints) {
        let entries = [
            (SIGNUP_ROLE_KEY, hints.role.map(|r| r.as_str().to_owned())),
            (SIGNUP_FIRST_NAME_KEY, hints.first_name.clone()),
            (SIGNUP_LAST_NAME_KEY, hints.last_name.clone()),
        ];
        for (key, value) in entries {
            match value {
                Some(value) => self.set(key, &value),
                None => self.remove(key),
            }
        }
    }

    pub fn clear_signup_hints(&self) {
        for key in [SIGNUP_ROLE_KEY, SIGNUP_FIRST_NAME_KEY, SIGNUP_LAST_NAME_KEY] {
            self.remove(key);
        }
    }

    pub fn set_linking_google(&self, linking: bool) {
        if linking {
            self.set(LINKING_GOOGLE_KEY, "true");
        } else {
            self.remove(LINKING_GOOGLE_KEY);
        }
    }

    #[must_use]
    pub fn is_linking_google(&self) -> bool {
        self.get(LINKING_GOOGLE_KEY).as_deref() == Some("true")
    }

    pub fn mark_session_active(&self, active: bool) {
        if active {
            self.set(SESSION_ACTIVE_KEY, "true");
        } else {
            self.remove(SESSION_ACTIVE_KEY);
        }
    }

    #[must_use]
    pub fn is_session_active(&self) -> bool {
        self.get(SESSION_ACTIVE_KEY).as_deref() == Some("true")
    }

    /// Remove every auth-related key.
    pub fn clear_auth_artifacts(&self) {
        for key in AUTH_ARTIFACT_KEYS {
            self.remove(key);
        }
    }
}

#[cfg(test)]
#[path = "fallback_test.rs"]
mod tests;
