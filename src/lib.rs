//! # Ingresso (Account Session & Verification Service)
//!
//! `ingresso` is the authentication backend for a content-hub web front end.
//! It owns sessions, email verification, TOTP two-factor with a single
//! rotating recovery code, password reset, OAuth sign-in/signup, and the
//! rate limiting around all of them.
//!
//! ## Sessions
//!
//! Sessions are opaque random tokens delivered in an `HttpOnly` cookie (or a
//! bearer header); the database stores only a SHA-256 hash. Each session
//! carries a `two_factor_verified` flag that can only become true for users
//! with a registered TOTP credential.
//!
//! ## Flow gating
//!
//! Routes walk the caller through a fixed order of preconditions: session,
//! verified email, two-factor challenge. Account-mutating routes require the
//! whole chain; failures are reported uniformly as `Forbidden` without
//! naming the gate that rejected the call.
//!
//! ## Rate limiting
//!
//! Sensitive actions are bounded in-process per client IP or per user id,
//! with the check-then-consume pair executed under one lock so concurrent
//! requests cannot slip between the probe and the charge.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
