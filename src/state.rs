//! Published auth snapshot and the reconciliation bookkeeping behind it.
//!
//! DESIGN
//! ======
//! `AuthState` is what the rest of the application reads (through a
//! `watch` channel). `ReconciliationState` is private to the session store:
//! the single-flight guard, the subscription flag and the generation counter
//! used to discard results that were overtaken by a sign-out.

use serde::Serialize;

use crate::user::AuthenticatedUser;

// =============================================================================
// AUTH STATE
// =============================================================================

/// Current user and whether a hydration is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub user: Option<AuthenticatedUser>,
    pub loading: bool,
}

impl AuthState {
    #[must_use]
    pub fn signed_in(user: AuthenticatedUser) -> Self {
        Self { user: Some(user), loading: false }
    }
}

// =============================================================================
// RECONCILIATION STATE
// =============================================================================

/// Holder of the single-flight guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingGuard {
    pub user_id: String,
    pub pass: u64,
}

#[derive(Debug, Default)]
pub struct ReconciliationState {
    pub processing: Option<ProcessingGuard>,
    pub initialized: bool,
    pub generation: u64,
    next_pass: u64,
}

impl ReconciliationState {
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.is_some()
    }

    /// User whose pass currently holds the guard.
    #[must_use]
    pub fn processing_user(&self) -> Option<&str> {
        self.processing.as_ref().map(|g| g.user_id.as_str())
    }

    /// Take the guard for `user_id`. Returns the pass token, or `None` when
    /// another pass already holds it.
    pub fn try_begin(&mut self, user_id: &str) -> Option<u64> {
        if self.processing.is_some() {
            return None;
        }
        self.next_pass += 1;
        let pass = self.next_pass;
        self.processing = Some(ProcessingGuard { user_id: user_id.to_owned(), pass });
        Some(pass)
    }

    /// Release the guard if `pass` still owns it.
    pub fn end(&mut self, pass: u64) {
        if self.processing.as_ref().is_some_and(|g| g.pass == pass) {
            self.processing = None;
        }
    }

    /// Invalidate every in-flight pass.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.processing = None;
        self.generation
    }
}


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
