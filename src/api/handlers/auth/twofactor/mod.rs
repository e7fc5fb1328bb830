//! Two-factor authentication (TOTP) and recovery handling.
//!
//! Flow Overview:
//! 1) After login, a user with a registered TOTP credential holds a session
//!    with `two_factor_verified = false` and must pass the challenge.
//! 2) Setup generates a secret; activation confirms the first code, seals the
//!    secret at rest, and emits the single recovery code.
//! 3) Consuming the recovery code tears down the credential and every
//!    session, rotates the code, and leaves the user to re-enroll.
//!
//! Security boundaries:
//! - The recovery code is the only self-service recovery mechanism.
//! - Recovery codes are Argon2id-hashed with a server-side pepper.
//! - TOTP secrets are stored encrypted and AAD-bound to the user id.

pub(crate) mod recovery;
pub(crate) mod storage;
mod totp;

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::principal::{forbidden, require_auth, Principal};
use super::session::session_cookie;
use super::state::AuthState;
use super::storage::{delete_sessions_for_user, insert_session, mark_session_two_factor_verified};
use super::types::{
    RecoveryRequest, RecoveryResponse, TotpActivateRequest, TotpActivateResponse,
    TotpSetupResponse, TotpVerifyRequest,
};

/// Gate shared by setup/activate: a session with a verified email.
fn require_verified_email(principal: &Principal) -> Result<(), axum::response::Response> {
    if principal.email_verified {
        Ok(())
    } else {
        Err(forbidden())
    }
}

/// Outcome of checking a submitted TOTP code for a user.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum TotpCheck {
    Accepted,
    Rejected,
    NotEnrolled,
}

/// Load, unseal, and check the user's TOTP credential against a code.
pub(crate) async fn check_totp_code(
    pool: &PgPool,
    auth_state: &AuthState,
    user_id: uuid::Uuid,
    code: &str,
) -> anyhow::Result<TotpCheck> {
    let Some(totp_key) = auth_state.two_factor().totp_key() else {
        return Err(anyhow::anyhow!("TOTP key is not configured"));
    };
    let Some(sealed) = storage::load_totp_secret(pool, user_id).await? else {
        return Ok(TotpCheck::NotEnrolled);
    };
    let secret = totp::decrypt_secret(totp_key, &sealed, user_id)?;
    if totp::verify_code(&secret, code)? {
        Ok(TotpCheck::Accepted)
    } else {
        Ok(TotpCheck::Rejected)
    }
}

/// Begin TOTP enrollment: hand out a fresh secret and its otpauth URL.
#[utoipa::path(
    post,
    path = "/v1/auth/totp/setup",
    responses(
        (status = 200, description = "Enrollment started", body = TotpSetupResponse),
        (status = 400, description = "Already enrolled", body = String),
        (status = 401, description = "Unauthenticated"),
        (status = 403, description = "Email not verified")
    ),
    tag = "two-factor"
)]
pub async fn totp_setup(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> axum::response::Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    if let Err(response) = require_verified_email(&principal) {
        return response;
    }
    if principal.registered_two_factor {
        return (
            StatusCode::BAD_REQUEST,
            "Two-factor is already set up".to_string(),
        )
            .into_response();
    }

    let (secret_bytes, secret_base32) = match totp::generate_secret() {
        Ok(pair) => pair,
        Err(err) => {
            error!("Failed to generate TOTP secret: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let otpauth_url = match totp::otpauth_url(
        &secret_bytes,
        auth_state.two_factor().issuer(),
        &principal.email,
    ) {
        Ok(url) => url,
        Err(err) => {
            error!("Failed to build otpauth URL: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        StatusCode::OK,
        Json(TotpSetupResponse {
            secret: secret_base32,
            otpauth_url,
        }),
    )
        .into_response()
}

/// Confirm enrollment with the first code; persists the sealed credential and
/// emits the single recovery code.
#[utoipa::path(
    post,
    path = "/v1/auth/totp/activate",
    request_body = TotpActivateRequest,
    responses(
        (status = 200, description = "Enrollment finished", body = TotpActivateResponse),
        (status = 400, description = "Invalid secret or code", body = String),
        (status = 401, description = "Unauthenticated"),
        (status = 403, description = "Email not verified")
    ),
    tag = "two-factor"
)]
pub async fn totp_activate(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<TotpActivateRequest>>,
) -> axum::response::Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    if let Err(response) = require_verified_email(&principal) {
        return response;
    }
    if principal.registered_two_factor {
        return (
            StatusCode::BAD_REQUEST,
            "Two-factor is already set up".to_string(),
        )
            .into_response();
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let secret = match totp::decode_secret(&request.secret) {
        Ok(secret) => secret,
        Err(message) => return (StatusCode::BAD_REQUEST, message.to_string()).into_response(),
    };

    match totp::verify_code(&secret, &request.code) {
        Ok(true) => {}
        Ok(false) => {
            return (StatusCode::BAD_REQUEST, "Invalid code".to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to check TOTP code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let Some(totp_key) = auth_state.two_factor().totp_key() else {
        error!("TOTP activation attempted without a TOTP key configured");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let Some(pepper) = auth_state.two_factor().recovery_pepper() else {
        error!("TOTP activation attempted without a recovery pepper configured");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let sealed = match totp::encrypt_secret(totp_key, &secret, principal.user_id) {
        Ok(sealed) => sealed,
        Err(err) => {
            error!("Failed to seal TOTP secret: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Err(err) = storage::upsert_totp_credential(&pool, principal.user_id, &sealed).await {
        error!("Failed to save TOTP credential: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let code = match recovery::RecoveryCode::generate(pepper) {
        Ok(code) => code,
        Err(err) => {
            error!("Failed to generate recovery code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Err(err) =
        storage::upsert_recovery_code(&pool, principal.user_id, &code.code_hash).await
    {
        error!("Failed to save recovery code: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // The enrolling session has just proven the factor.
    if let Err(err) = mark_session_two_factor_verified(&pool, &principal.token_hash).await {
        error!("Failed to mark session two-factor verified: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!(user_id = %principal.user_id, "TOTP enrollment completed");
    (
        StatusCode::OK,
        Json(TotpActivateResponse {
            recovery_code: code.code,
        }),
    )
        .into_response()
}

/// Pass the two-factor challenge on the current session.
#[utoipa::path(
    post,
    path = "/v1/auth/totp/verify",
    request_body = TotpVerifyRequest,
    responses(
        (status = 204, description = "Challenge passed"),
        (status = 400, description = "Invalid code", body = String),
        (status = 401, description = "Unauthenticated"),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "two-factor"
)]
pub async fn totp_verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<TotpVerifyRequest>>,
) -> axum::response::Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    if !principal.registered_two_factor {
        return forbidden();
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let limits = auth_state.limits();
    if !limits.totp_user.check(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.totp_user.consume(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    match check_totp_code(&pool, &auth_state, principal.user_id, &request.code).await {
        Ok(TotpCheck::Accepted) => {}
        Ok(TotpCheck::Rejected) => {
            warn!(user_id = %principal.user_id, "TOTP challenge failed");
            return (StatusCode::BAD_REQUEST, "Invalid code".to_string()).into_response();
        }
        Ok(TotpCheck::NotEnrolled) => return forbidden(),
        Err(err) => {
            error!("Failed to check TOTP code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    limits.totp_user.reset(&principal.user_id);

    if let Err(err) = mark_session_two_factor_verified(&pool, &principal.token_hash).await {
        error!("Failed to mark session two-factor verified: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    StatusCode::NO_CONTENT.into_response()
}

/// Consume the recovery code: tear down 2FA, revoke every session, rotate the
/// code, and issue a fresh unverified session for re-enrollment.
#[utoipa::path(
    post,
    path = "/v1/auth/recovery",
    request_body = RecoveryRequest,
    responses(
        (status = 200, description = "Recovery accepted, new code issued", body = RecoveryResponse),
        (status = 401, description = "Unauthorized", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "two-factor"
)]
pub async fn recovery(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RecoveryRequest>>,
) -> axum::response::Response {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    if !principal.registered_two_factor {
        return forbidden();
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let limits = auth_state.limits();
    if !limits.recovery_user.check(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.recovery_user.consume(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    let Some(pepper) = auth_state.two_factor().recovery_pepper() else {
        error!("Recovery attempted without a recovery pepper configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Recovery unavailable".to_string(),
        )
            .into_response();
    };

    let stored_hash = match storage::load_recovery_code_hash(&pool, principal.user_id).await {
        Ok(Some(hash)) => hash,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()).into_response(),
        Err(err) => {
            error!("Failed to load recovery code: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recovery failed".to_string(),
            )
                .into_response();
        }
    };

    match recovery::verify_recovery_code(&request.code, &stored_hash, pepper) {
        Ok(true) => {}
        Ok(false) => {
            warn!(user_id = %principal.user_id, "Recovery code invalid");
            return (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()).into_response();
        }
        Err(err) => {
            warn!(user_id = %principal.user_id, "Recovery attempt rejected: {err}");
            return (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()).into_response();
        }
    }

    // Single use: rotate before anything is torn down so a replayed code is
    // already dead even if a later step fails.
    let replacement = match recovery::RecoveryCode::generate(pepper) {
        Ok(code) => code,
        Err(err) => {
            error!("Failed to rotate recovery code: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recovery failed".to_string(),
            )
                .into_response();
        }
    };
    if let Err(err) =
        storage::upsert_recovery_code(&pool, principal.user_id, &replacement.code_hash).await
    {
        error!("Failed to save rotated recovery code: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Recovery failed".to_string(),
        )
            .into_response();
    }

    if let Err(err) = storage::delete_totp_credential(&pool, principal.user_id).await {
        error!("Failed to delete TOTP credential: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Recovery failed".to_string(),
        )
            .into_response();
    }
    if let Err(err) = delete_sessions_for_user(&pool, principal.user_id).await {
        error!("Failed to revoke sessions after recovery: {err}");
    }

    let token = match insert_session(
        &pool,
        principal.user_id,
        false,
        auth_state.config().session_ttl_seconds(),
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session after recovery: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recovery failed".to_string(),
            )
                .into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    match session_cookie(auth_state.config(), &token) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
            info!(user_id = %principal.user_id, "Two-factor reset via recovery code");
            (
                StatusCode::OK,
                response_headers,
                Json(RecoveryResponse {
                    recovery_code: replacement.code,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!("Failed to set session cookie: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Recovery failed".to_string(),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::recovery::{verify_recovery_code, RecoveryCode};
    use super::*;
    use crate::api::handlers::auth::rate_limit::RateLimits;
    use crate::api::handlers::auth::state::{AuthConfig, TwoFactorConfig};
    use anyhow::Result;
    use sqlx::postgres::PgPoolOptions;

    fn auth_state() -> Arc<AuthState> {
        Arc::new(AuthState::new(
            AuthConfig::new("https://hub.example".to_string()),
            TwoFactorConfig::new(),
            None,
            RateLimits::unlimited(),
        ))
    }

    #[tokio::test]
    async fn totp_setup_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = totp_setup(HeaderMap::new(), Extension(pool), Extension(auth_state())).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn recovery_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = recovery(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(RecoveryRequest {
                code: "ABCD-EFGH-JKLM".to_string(),
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[test]
    fn consumed_code_never_verifies_after_rotation() {
        // Rotation replaces the stored hash, so the consumed code is dead
        // even though it was valid moments ago.
        let pepper = b"pepper";
        let Ok(original) = RecoveryCode::generate(pepper) else {
            panic!("generate failed");
        };
        let Ok(replacement) = RecoveryCode::generate(pepper) else {
            panic!("generate failed");
        };
        let stored = replacement.code_hash;
        assert_eq!(
            verify_recovery_code(&original.code, &stored, pepper).ok(),
            Some(false)
        );
    }
}
