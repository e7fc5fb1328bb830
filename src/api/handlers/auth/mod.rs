//! Auth handlers and supporting modules.
//!
//! This module coordinates password and OAuth sign-in, session management,
//! email verification, the two-factor challenge, and password reset.
//!
//! ## Flow gating
//!
//! Every route derives the caller's flow state from the session record and
//! redirects to the first unmet precondition, in order: unauthenticated,
//! email unverified, two-factor pending, fully authenticated. Account
//! mutations require the final state.
//!
//! ## Rate limiting
//!
//! Sensitive actions are bounded per client IP or per user id. Handlers probe
//! with `check` before doing expensive work and charge with `consume` right
//! before the effectful step, so a request that fails validation is never
//! billed against the caller.

pub(crate) mod account;
pub(crate) mod oauth;
pub(crate) mod password;
pub(crate) mod principal;
mod rate_limit;
pub(crate) mod reset;
pub(crate) mod session;
mod state;
mod storage;
pub(crate) mod twofactor;
pub(crate) mod types;
mod utils;
pub(crate) mod verification;

pub use rate_limit::{ExpiringBucket, RateLimits, RefillBucket};
pub use state::{AuthConfig, AuthState, OAuthProvider, TwoFactorConfig};
