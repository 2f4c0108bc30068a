//! Role-gated navigation.
//!
//! ARCHITECTURE
//! ============
//! `guard::decide` is the per-route decision. `RouteTable` maps paths to
//! their access rule so callers can guard any location without repeating
//! the allow-lists.

pub mod guard;

pub use guard::{Decision, decide, normalize_path};

use crate::state::AuthState;
use crate::user::Role;

/// Who may open a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// No sign-in required.
    Public,
    /// Signed in; an empty list admits any role.
    Roles(Vec<Role>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub access: Access,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

const MANAGEMENT: [Role; 2] = [Role::Landlord, Role::Admin];

impl Default for RouteTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for prefix in ["/", "/login", "/signup", "/auth/callback", "/reset-password"] {
            table.insert(prefix, Access::Public);
        }
        for prefix in ["/onboarding", "/notifications", "/profile", "/settings"] {
            table.insert(prefix, Access::Roles(Vec::new()));
        }
        table.insert("/tenant", Access::Roles(vec![Role::Tenant]));
        for prefix in ["/dashboard", "/properties", "/apartments", "/tenants", "/invoices", "/reports"] {
            table.insert(prefix, Access::Roles(MANAGEMENT.to_vec()));
        }
        table.insert("/admin", Access::Roles(vec![Role::Admin]));
        table
    }
}

impl RouteTable {
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add or replace the rule for `prefix`.
    pub fn insert(&mut self, prefix: &str, access: Access) {
        let prefix = normalize_path(prefix).to_owned();
        match self.rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.access = access,
            None => self.rules.push(RouteRule { prefix, access }),
        }
    }

    /// Longest rule whose prefix matches whole path segments of `location`.
    #[must_use]
    pub fn rule_for(&self, location: &str) -> Option<&RouteRule> {
        let path = normalize_path(location);
        self.rules
            .iter()
            .filter(|rule| segment_prefix(path, &rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
    }

    /// Guard `location`. Paths without a rule require sign-in with any role.
    #[must_use]
    pub fn guard(&self, auth: &AuthState, location: &str) -> Decision {
        match self.rule_for(location).map(|rule| &rule.access) {
            Some(Access::Public) => Decision::Render,
            Some(Access::Roles(roles)) => decide(auth, location, roles),
            None => decide(auth, location, &[]),
        }
    }
}

/// `/tenants` does not match `/tenant`; `/` only matches itself.
fn segment_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path == "/";
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
