//! Auth services built on the session store.
//!
//! ARCHITECTURE
//! ============
//! `session` owns the reconciliation state machine and is the only writer of
//! `AuthState`. `login` adds the user-initiated flows (password, magic link,
//! OTP, OAuth) on top of it and maps backend failures to messages the UI can
//! show as-is.

pub mod login;
pub mod session;

pub use login::{LoginError, SignUpForm, SignUpOutcome};
pub use session::SessionStore;
