//! Route guard decision for one navigation.
//!
//! SYSTEM CONTEXT
//! ==============
//! Every protected page applies the same decision, so the redirect rules
//! live here as a pure function over the reconciled `AuthState`.

use serde::Serialize;

use crate::state::AuthState;
use crate::user::Role;

pub const LOGIN_ROUTE: &str = "/login";
pub const ONBOARDING_ROUTE: &str = "/onboarding";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Auth is still settling; show a neutral placeholder.
    Loading,
    Render,
    Redirect {
        to: String,
        /// Where to send the user after signing in.
        #[serde(skip_serializing_if = "Option::is_none")]
        return_to: Option<String>,
    },
}

impl Decision {
    fn redirect(to: &str) -> Self {
        Self::Redirect { to: to.to_owned(), return_to: None }
    }
}

/// Path without query string, fragment or trailing slash. The root stays
/// `/`.
#[must_use]
pub fn normalize_path(location: &str) -> &str {
    let end = location.find(['?', '#']).unwrap_or(location.len());
    let path = location[..end].trim_end_matches('/');
    if path.is_empty() { "/" } else { path }
}

/// Decide what to do with a navigation to `location`. An empty
/// `allowed_roles` admits any role.
#[must_use]
pub fn decide(auth: &AuthState, location: &str, allowed_roles: &[Role]) -> Decision {
    if auth.loading {
        return Decision::Loading;
    }
    let Some(user) = &auth.user else {
        return Decision::Redirect { to: LOGIN_ROUTE.to_owned(), return_to: Some(location.to_owned()) };
    };
    let path = normalize_path(location);

    let Some(role) = user.role else {
        return if path == ONBOARDING_ROUTE { Decision::Render } else { Decision::redirect(ONBOARDING_ROUTE) };
    };
    if allowed_roles.is_empty() || allowed_roles.contains(&role) {
        return Decision::Render;
    }

    let home = role.home_route();
    if path == home { Decision::Render } else { Decision::redirect(home) }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
