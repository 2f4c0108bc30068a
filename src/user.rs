//! The application's view of the signed-in principal.
//!
//! DESIGN
//! ======
//! `AuthenticatedUser` is always built whole, from one of three sources: the
//! stored profile (authoritative), the principal's provider metadata (the
//! fallback user), or a cached direct session. Name fields keep the
//! placeholder convention (`"User"` / `"Name"` mean unset) so rows written by
//! older clients round-trip, and every display derivation reads them through
//! [`strip_placeholder`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::backend::{ExtendedProfile, Principal, ProfileRow, UserMetadata};

pub const FIRST_NAME_PLACEHOLDER: &str = "User";
pub const LAST_NAME_PLACEHOLDER: &str = "Name";

/// Role assumed for a cached direct session that carries no role at all.
pub const DEFAULT_FALLBACK_ROLE: Role = Role::Landlord;

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Landlord,
    Tenant,
    Admin,
}

impl Role {
    /// Normalize a raw role string. Anything outside the known set is
    /// "unset", not an error.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "landlord" => Some(Self::Landlord),
            "tenant" => Some(Self::Tenant),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn parse_opt(raw: Option<&str>) -> Option<Self> {
        raw.and_then(Self::parse)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Landlord => "landlord",
            Self::Tenant => "tenant",
            Self::Admin => "admin",
        }
    }

    /// Default route group for the role.
    #[must_use]
    pub fn home_route(self) -> &'static str {
        match self {
            Self::Tenant => "/tenant",
            Self::Landlord | Self::Admin => "/dashboard",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// NAME HELPERS
// =============================================================================

/// Return `None` for blank values and the name placeholders.
#[must_use]
pub fn strip_placeholder(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == FIRST_NAME_PLACEHOLDER || trimmed == LAST_NAME_PLACEHOLDER {
        None
    } else {
        Some(trimmed)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// First/last name from provider metadata, trying explicit fields first and
/// then splitting a full name on the first whitespace.
fn names_from_metadata(metadata: &UserMetadata) -> (Option<String>, Option<String>) {
    let full = non_blank(metadata.full_name.as_deref()).or_else(|| non_blank(metadata.name.as_deref()));
    let (full_first, full_last) = match full {
        Some(full) => match full.split_once(char::is_whitespace) {
            Some((first, rest)) => (Some(first), non_blank(Some(rest))),
            None => (Some(full), None),
        },
        None => (None, None),
    };

    let first = non_blank(metadata.first_name.as_deref())
        .or_else(|| non_blank(metadata.given_name.as_deref()))
        .or(full_first)
        .map(str::to_owned);
    let last = non_blank(metadata.last_name.as_deref())
        .or_else(|| non_blank(metadata.family_name.as_deref()))
        .or(full_last)
        .map(str::to_owned);
    (first, last)
}

// =============================================================================
// AUTHENTICATED USER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Option<Role>,
    pub is_active: bool,
    pub permissions: BTreeSet<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub username: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AuthenticatedUser {
    /// Fallback user synthesized purely from the principal's metadata.
    #[must_use]
    pub fn fallback_from_principal(principal: &Principal, now: OffsetDateTime) -> Self {
        let role = Role::parse_opt(principal.user_metadata.role.as_deref());
        let mut user = Self::from_metadata(
            &principal.id,
            principal.email.as_deref().unwrap_or_default(),
            &principal.user_metadata,
            role,
            now,
        );
        user.created_at = principal.created_at.unwrap_or(now);
        user.updated_at = principal.updated_at.unwrap_or(now);
        user
    }

    /// Fallback user for a cached direct session. The role falls back to the
    /// signup hint and then to [`DEFAULT_FALLBACK_ROLE`].
    #[must_use]
    pub fn fallback_from_cached(
        id: &str,
        email: &str,
        metadata: &UserMetadata,
        hinted_role: Option<Role>,
        now: OffsetDateTime,
    ) -> Self {
        let role = Role::parse_opt(metadata.role.as_deref())
            .or(hinted_role)
            .unwrap_or(DEFAULT_FALLBACK_ROLE);
        Self::from_metadata(id, email, metadata, Some(role), now)
    }

    fn from_metadata(id: &str, email: &str, metadata: &UserMetadata, role: Option<Role>, now: OffsetDateTime) -> Self {
        let (first, last) = names_from_metadata(metadata);
        Self {
            id: id.to_owned(),
            email: email.to_owned(),
            first_name: first.unwrap_or_else(|| FIRST_NAME_PLACEHOLDER.to_owned()),
            last_name: last.unwrap_or_else(|| LAST_NAME_PLACEHOLDER.to_owned()),
            role,
            is_active: true,
            permissions: BTreeSet::new(),
            avatar_url: non_blank(metadata.avatar_url.as_deref())
                .or_else(|| non_blank(metadata.picture.as_deref()))
                .map(str::to_owned),
            phone: None,
            username: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge the stored profile with its permission and extended lookups.
    /// The stored role wins over anything the auth provider reported.
    #[must_use]
    pub fn from_profile(
        profile: ProfileRow,
        permissions: Vec<String>,
        extended: Option<ExtendedProfile>,
        email_fallback: &str,
        now: OffsetDateTime,
    ) -> Self {
        let extended = extended.unwrap_or_default();
        Self {
            email: profile
                .email
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| email_fallback.to_owned()),
            first_name: profile
                .first_name
                .unwrap_or_else(|| FIRST_NAME_PLACEHOLDER.to_owned()),
            last_name: profile
                .last_name
                .unwrap_or_else(|| LAST_NAME_PLACEHOLDER.to_owned()),
            role: Role::parse_opt(profile.role.as_deref()),
            is_active: profile.is_active.unwrap_or(true),
            permissions: permissions.into_iter().collect(),
            avatar_url: extended.avatar_url,
            phone: extended.phone,
            username: extended.username,
            created_at: profile.created_at.unwrap_or(now),
            updated_at: profile.updated_at.unwrap_or(now),
            id: profile.id,
        }
    }

    #[must_use]
    pub fn given_name(&self) -> Option<&str> {
        strip_placeholder(&self.first_name)
    }

    #[must_use]
    pub fn family_name(&self) -> Option<&str> {
        strip_placeholder(&self.last_name)
    }

    /// True when the user still has to pick a role.
    #[must_use]
    pub fn needs_onboarding(&self) -> bool {
        self.role.is_none()
    }

    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    fn email_local_part(&self) -> Option<&str> {
        self.email.split('@').next().and_then(|local| non_blank(Some(local)))
    }

    /// Full name for headers and menus: real names, then username, then
    /// e-mail.
    #[must_use]
    pub fn display_name(&self) -> String {
        match (self.given_name(), self.family_name()) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(only), None) | (None, Some(only)) => only.to_owned(),
            (None, None) => non_blank(self.username.as_deref())
                .or_else(|| non_blank(Some(&self.email)))
                .unwrap_or("Unnamed user")
                .to_owned(),
        }
    }

    /// Short form for greetings ("Welcome back, Ada").
    #[must_use]
    pub fn greeting_name(&self) -> String {
        self.given_name()
            .or_else(|| non_blank(self.username.as_deref()))
            .or_else(|| self.email_local_part())
            .unwrap_or("there")
            .to_owned()
    }

    /// Avatar initials, at most two characters.
    #[must_use]
    pub fn initials(&self) -> String {
        let letters: String = [self.given_name(), self.family_name()]
            .into_iter()
            .flatten()
            .filter_map(|part| part.chars().next())
            .filter_map(first_upper)
            .collect();
        if !letters.is_empty() {
            return letters;
        }
        self.email
            .trim()
            .chars()
            .next()
            .and_then(first_upper)
            .map_or_else(|| "?".to_owned(), String::from)
    }
}

/// Leading char of the uppercase form; `ß` yields `S`, not `SS`.
fn first_upper(c: char) -> Option<char> {
    c.to_uppercase().next()
}

#[cfg(test)]
#[path = "user_test.rs"]
mod tests;
