//! Password reset flow.
//!
//! Flow Overview: `forgot-password` opens a short-lived reset session carried
//! in its own cookie and emails a code. The reset session then walks the same
//! gating order as login — email verification first, then the two-factor
//! challenge when one is registered — before the password may be replaced.
//! Completion revokes every session and every reset session for the user, so
//! running it twice fails the second time as not authenticated.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};

use super::password::{hash_password, validate_password_strength};
use super::principal::forbidden;
use super::session::{clear_cookie, cookie_value, session_cookie, token_cookie, RESET_COOKIE_NAME};
use super::state::AuthState;
use super::storage::{
    delete_reset_sessions_for_user, delete_sessions_for_user, insert_reset_session,
    insert_session, lookup_reset_session, lookup_user_by_email, mark_reset_email_verified,
    mark_reset_two_factor_verified, update_password_hash, ResetSessionRecord,
};
use super::twofactor::{check_totp_code, TotpCheck};
use super::types::{
    ForgotPasswordRequest, ResetPasswordRequest, ResetTotpRequest, ResetVerifyEmailRequest,
    SessionResponse,
};
use super::utils::{extract_client_ip, hash_token, normalize_email, valid_email};

/// Resolve the reset cookie into a reset session record.
async fn reset_session_from_headers(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Option<(Vec<u8>, ResetSessionRecord)>, StatusCode> {
    let Some(token) = cookie_value(headers, RESET_COOKIE_NAME) else {
        return Ok(None);
    };
    let token_hash = hash_token(&token);
    match lookup_reset_session(pool, &token_hash).await {
        Ok(Some(record)) => Ok(Some((token_hash, record))),
        Ok(None) => Ok(None),
        Err(err) => {
            error!("Failed to lookup reset session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Open a password-reset session and email the code.
///
/// The body is opaque: unknown addresses and per-email limits return the
/// same 204 as success so the endpoint cannot confirm account existence.
#[utoipa::path(
    post,
    path = "/v1/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 204, description = "Accepted"),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "password-reset"
)]
pub async fn forgot_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    let limits = auth_state.limits();
    if !limits.forgot_ip.check(&client_ip, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.forgot_email.check(&email, 1) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let user = match lookup_user_by_email(&pool, &email).await {
        Ok(Some(user)) => user,
        Ok(None) => return StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Failed to lookup user for reset: {err}");
            return StatusCode::NO_CONTENT.into_response();
        }
    };

    if !limits.forgot_ip.consume(&client_ip, 1) || !limits.forgot_email.consume(&email, 1) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let token = match open_reset_session(&pool, user.user_id, &user.email, &auth_state).await {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to open reset session: {err}");
            return StatusCode::NO_CONTENT.into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = token_cookie(
        auth_state.config(),
        RESET_COOKIE_NAME,
        &token,
        auth_state.config().reset_session_ttl_seconds(),
    ) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

async fn open_reset_session(
    pool: &PgPool,
    user_id: uuid::Uuid,
    email: &str,
    auth_state: &AuthState,
) -> anyhow::Result<String> {
    let mut tx = pool.begin().await?;
    let token = insert_reset_session(&mut tx, user_id, email, auth_state.config()).await?;
    tx.commit().await?;
    Ok(token)
}

/// Consume the emailed code on the reset session.
#[utoipa::path(
    post,
    path = "/v1/auth/reset-password/verify-email",
    request_body = ResetVerifyEmailRequest,
    responses(
        (status = 204, description = "Email verified for this reset"),
        (status = 400, description = "Incorrect code", body = String),
        (status = 401, description = "No reset session", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "password-reset"
)]
pub async fn reset_verify_email(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResetVerifyEmailRequest>>,
) -> impl IntoResponse {
    let (token_hash, record) = match reset_session_from_headers(&headers, &pool).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Not authenticated".to_string()).into_response();
        }
        Err(status) => return status.into_response(),
    };

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let code = request.code.trim();
    if code.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing code".to_string()).into_response();
    }

    let limits = auth_state.limits();
    if !limits.verify_email_user.check(&record.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.verify_email_user.consume(&record.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    match mark_reset_email_verified(&pool, &token_hash, code).await {
        Ok(true) => {
            limits.verify_email_user.reset(&record.user_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => (StatusCode::BAD_REQUEST, "Incorrect code".to_string()).into_response(),
        Err(err) => {
            error!("Failed to verify reset code: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Verification failed".to_string(),
            )
                .into_response()
        }
    }
}

/// Pass the two-factor challenge on the reset session.
#[utoipa::path(
    post,
    path = "/v1/auth/reset-password/totp",
    request_body = ResetTotpRequest,
    responses(
        (status = 204, description = "Challenge passed"),
        (status = 400, description = "Invalid code", body = String),
        (status = 401, description = "No reset session", body = String),
        (status = 403, description = "Flow precondition unmet"),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "password-reset"
)]
pub async fn reset_totp(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResetTotpRequest>>,
) -> impl IntoResponse {
    let (token_hash, record) = match reset_session_from_headers(&headers, &pool).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Not authenticated".to_string()).into_response();
        }
        Err(status) => return status.into_response(),
    };

    // Email first, then the second factor, mirroring the login order.
    if !record.email_verified || !record.registered_two_factor {
        return forbidden();
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let limits = auth_state.limits();
    if !limits.totp_user.check(&record.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.totp_user.consume(&record.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    match check_totp_code(&pool, &auth_state, record.user_id, &request.code).await {
        Ok(TotpCheck::Accepted) => {}
        Ok(TotpCheck::Rejected) => {
            return (StatusCode::BAD_REQUEST, "Invalid code".to_string()).into_response();
        }
        Ok(TotpCheck::NotEnrolled) => return forbidden(),
        Err(err) => {
            error!("Failed to check TOTP code for reset: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    limits.totp_user.reset(&record.user_id);

    if let Err(err) = mark_reset_two_factor_verified(&pool, &token_hash).await {
        error!("Failed to mark reset session verified: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    StatusCode::NO_CONTENT.into_response()
}

/// Complete the reset: replace the password, revoke everything, sign in.
#[utoipa::path(
    post,
    path = "/v1/auth/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password replaced, session issued", body = SessionResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "No reset session", body = String),
        (status = 403, description = "Flow precondition unmet")
    ),
    tag = "password-reset"
)]
pub async fn reset_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> impl IntoResponse {
    let (_token_hash, record) = match reset_session_from_headers(&headers, &pool).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Not authenticated".to_string()).into_response();
        }
        Err(status) => return status.into_response(),
    };

    if !record.email_verified {
        return forbidden();
    }
    if record.registered_two_factor && !record.two_factor_verified {
        return forbidden();
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    if let Err(message) = validate_password_strength(&request.password) {
        return (StatusCode::BAD_REQUEST, message.to_string()).into_response();
    }

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Reset failed".to_string())
                .into_response();
        }
    };

    // Password swap and reset-session teardown commit together; every other
    // session is revoked right after. A replayed completion finds no reset
    // session and stops at the 401 above.
    if let Err(err) = apply_reset(&pool, record.user_id, &password_hash).await {
        error!("Failed to apply password reset: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Reset failed".to_string()).into_response();
    }
    if let Err(err) = delete_sessions_for_user(&pool, record.user_id).await {
        error!("Failed to revoke sessions after reset: {err}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Reset failed".to_string()).into_response();
    }

    let token = match insert_session(
        &pool,
        record.user_id,
        record.two_factor_verified,
        auth_state.config().session_ttl_seconds(),
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session after reset: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Reset failed".to_string())
                .into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    match session_cookie(auth_state.config(), &token) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Reset failed".to_string())
                .into_response();
        }
    }
    if let Ok(cleared) = clear_cookie(auth_state.config(), RESET_COOKIE_NAME) {
        response_headers.append(SET_COOKIE, cleared);
    }

    info!(user_id = %record.user_id, "Password reset completed");
    let response = SessionResponse {
        user_id: record.user_id.to_string(),
        email: record.email,
        email_verified: true,
        registered_two_factor: record.registered_two_factor,
        two_factor_verified: record.two_factor_verified,
    };
    (StatusCode::OK, response_headers, Json(response)).into_response()
}

async fn apply_reset(
    pool: &PgPool,
    user_id: uuid::Uuid,
    password_hash: &str,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    update_password_hash(&mut tx, user_id, password_hash).await?;
    delete_reset_sessions_for_user(&mut tx, user_id).await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
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
    async fn forgot_password_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = forgot_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn forgot_password_invalid_email_is_opaque() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = forgot_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(ForgotPasswordRequest {
                email: "not-an-email".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        Ok(())
    }

    #[tokio::test]
    async fn reset_completion_without_session_is_unauthenticated() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = reset_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(ResetPasswordRequest {
                password: "Password1!".to_string(),
            })),
        )
        .await
        .into_response();
        // The same status a second, replayed completion receives once the
        // reset session has been consumed.
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
