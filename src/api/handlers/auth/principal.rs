//! Authenticated principal extraction and the authentication flow gate.
//!
//! Flow Overview: every route derives the caller's flow state from the
//! session row and checks it against the first unmet precondition, in order:
//! unauthenticated, email unverified, two-factor pending, fully
//! authenticated. Only fully-authenticated callers may mutate the account.
//! Authorization failures are reported uniformly as `Forbidden` so callers
//! cannot probe which gate rejected them.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use uuid::Uuid;

use super::session::authenticate_session;
use super::storage::SessionRecord;
use super::types::MessageResponse;

/// Authenticated user context derived from the session cookie.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub email_verified: bool,
    pub registered_two_factor: bool,
    pub two_factor_verified: bool,
    pub(super) token_hash: Vec<u8>,
}

/// The login progression, ordered by the first unmet precondition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowState {
    Unauthenticated,
    EmailUnverified,
    TwoFactorPending,
    FullyAuthenticated,
}

/// Classify a session record into the flow state the caller currently holds.
pub(crate) fn flow_state(record: Option<&SessionRecord>) -> FlowState {
    let Some(record) = record else {
        return FlowState::Unauthenticated;
    };
    if !record.email_verified {
        return FlowState::EmailUnverified;
    }
    if record.registered_two_factor && !record.two_factor_verified {
        return FlowState::TwoFactorPending;
    }
    FlowState::FullyAuthenticated
}

/// Uniform authorization failure body.
pub(super) fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(MessageResponse::new("Forbidden")),
    )
        .into_response()
}

fn principal_from(token_hash: Vec<u8>, record: SessionRecord) -> Principal {
    Principal {
        user_id: record.user_id,
        email: record.email,
        email_verified: record.email_verified,
        registered_two_factor: record.registered_two_factor,
        two_factor_verified: record.two_factor_verified,
        token_hash,
    }
}

/// Resolve the session into a principal, or 401 when there is none.
pub(super) async fn require_auth(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Principal, StatusCode> {
    match authenticate_session(headers, pool).await {
        Ok(Some((token_hash, record))) => Ok(principal_from(token_hash, record)),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(status) => Err(status),
    }
}

/// Resolve the session and require the full flow to be complete.
///
/// When two-factor is registered for the user, the session must also carry
/// `two_factor_verified`; otherwise a valid verified-email session suffices.
pub(super) async fn require_fully_authenticated(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Principal, Response> {
    let principal = match authenticate_session(headers, pool).await {
        Ok(Some((token_hash, record))) => {
            let state = flow_state(Some(&record));
            if state != FlowState::FullyAuthenticated {
                return Err(forbidden());
            }
            principal_from(token_hash, record)
        }
        Ok(None) => return Err(StatusCode::UNAUTHORIZED.into_response()),
        Err(status) => return Err(status.into_response()),
    };
    Ok(principal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        email_verified: bool,
        registered_two_factor: bool,
        two_factor_verified: bool,
    ) -> SessionRecord {
        SessionRecord {
            user_id: Uuid::nil(),
            email: "alice@example.com".to_string(),
            email_verified,
            two_factor_verified,
            registered_two_factor,
        }
    }

    #[test]
    fn missing_session_is_unauthenticated() {
        assert_eq!(flow_state(None), FlowState::Unauthenticated);
    }

    #[test]
    fn unverified_email_blocks_first() {
        // Even with a 2FA credential, email verification comes first.
        let rec = record(false, true, false);
        assert_eq!(flow_state(Some(&rec)), FlowState::EmailUnverified);
    }

    #[test]
    fn registered_two_factor_requires_verified_flag() {
        let rec = record(true, true, false);
        assert_eq!(flow_state(Some(&rec)), FlowState::TwoFactorPending);

        let rec = record(true, true, true);
        assert_eq!(flow_state(Some(&rec)), FlowState::FullyAuthenticated);
    }

    #[test]
    fn no_two_factor_skips_challenge() {
        let rec = record(true, false, false);
        assert_eq!(flow_state(Some(&rec)), FlowState::FullyAuthenticated);
    }

    #[tokio::test]
    async fn forbidden_body_is_uniform() {
        let response = forbidden();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap_or_default();
        assert_eq!(&bytes[..], br#"{"message":"Forbidden"}"#);
    }
}
