//! API handlers and shared utilities.
//!
//! Routes are grouped by concern: `auth` carries the session and verification
//! flows, `health` the liveness probe, and `root` the undocumented banner.

pub mod auth;
pub mod health;
pub mod root;
