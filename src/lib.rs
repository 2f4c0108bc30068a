//! Client-side auth session core for the rentdesk property management app.
//!
//! ARCHITECTURE
//! ============
//! - `backend`: the hosted session service seam and its REST client.
//! - `store`: local key-value persistence and the fallback session cache.
//! - `services`: session reconciliation and the login flows on top of it.
//! - `routes`: role-gated navigation over the reconciled `AuthState`.

pub mod backend;
pub mod clock;
pub mod config;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod user;

pub use services::{LoginError, SessionStore};
pub use state::AuthState;
pub use user::{AuthenticatedUser, Role};
