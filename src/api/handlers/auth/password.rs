//! Password signup/login and the credential verifier.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use rand::rngs::OsRng;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::session::session_cookie;
use super::state::AuthState;
use super::storage::{
    insert_session, insert_user, lookup_user_by_email, replace_verification_request,
};
use super::types::{LoginRequest, SessionResponse, SignupRequest};
use super::utils::{extract_client_ip, normalize_email, valid_email};

const PASSWORD_MIN_LEN: usize = 8;
const PASSWORD_MAX_LEN: usize = 255;

// Most-seen entries from public breach corpora; a full k-anonymity check
// belongs in the frontend, this is the server-side floor.
const WEAK_PASSWORDS: &[&str] = &[
    "password", "password1", "12345678", "123456789", "qwertyuiop", "iloveyou", "sunshine",
    "princess", "football", "11111111",
];

/// Validate password strength; returns a user-facing message on failure.
pub(super) fn validate_password_strength(password: &str) -> Result<(), &'static str> {
    if password.len() < PASSWORD_MIN_LEN {
        return Err("Password must be at least 8 characters");
    }
    if password.len() > PASSWORD_MAX_LEN {
        return Err("Password is too long");
    }
    if WEAK_PASSWORDS.contains(&password.to_lowercase().as_str()) {
        return Err("Password is too common");
    }
    Ok(())
}

/// Hash a password with Argon2id and default parameters.
pub(super) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash password"))?
        .to_string();
    Ok(hash)
}

/// Verify a password against a stored Argon2id hash.
pub(super) fn verify_password(stored_hash: &str, password: &str) -> Result<bool> {
    let parsed = PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid password hash"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[utoipa::path(
    post,
    path = "/v1/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 200, description = "Account created, session issued", body = SessionResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn signup(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<SignupRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }
    if let Err(message) = validate_password_strength(&request.password) {
        return (StatusCode::BAD_REQUEST, message.to_string()).into_response();
    }

    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    if !auth_state.limits().signup_ip.check(&client_ip, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    };

    // Charge the bucket only now that the request is known to be well formed.
    if !auth_state.limits().signup_ip.consume(&client_ip, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    let user_id = match create_account(&pool, &email, &password_hash, &auth_state).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            return (StatusCode::BAD_REQUEST, "Email is already used".to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to create account: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Signup failed".to_string())
                .into_response();
        }
    };

    issue_session(&pool, &auth_state, user_id, &email, false, false).await
}

async fn create_account(
    pool: &PgPool,
    email: &str,
    password_hash: &str,
    auth_state: &AuthState,
) -> Result<Option<uuid::Uuid>> {
    // User row and the first verification email commit together.
    let mut tx = pool.begin().await.context("begin signup transaction")?;
    let Some(user_id) = insert_user(&mut tx, email, Some(password_hash), false).await? else {
        let _ = tx.rollback().await;
        return Ok(None);
    };
    let _ = replace_verification_request(&mut tx, user_id, email, auth_state.config()).await?;
    tx.commit().await.context("commit signup transaction")?;
    Ok(Some(user_id))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Credentials accepted, session issued", body = SessionResponse),
        (status = 400, description = "Invalid credentials", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) || request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Invalid email or password".to_string()).into_response();
    }

    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    let limits = auth_state.limits();
    if !limits.login_ip.check(&client_ip, 1) || !limits.login_email.check(&email, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    let user = match lookup_user_by_email(&pool, &email).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to lookup user: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    };

    // Charge before the expensive verification so guesses are metered even
    // when they fail.
    if !limits.login_ip.consume(&client_ip, 1) || !limits.login_email.consume(&email, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    let Some(user) = user else {
        // Same message as a bad password to avoid account probing.
        return (StatusCode::BAD_REQUEST, "Invalid email or password".to_string()).into_response();
    };

    let Some(stored_hash) = user.password_hash.as_deref() else {
        return (
            StatusCode::BAD_REQUEST,
            "Account uses provider sign-in".to_string(),
        )
            .into_response();
    };

    match verify_password(stored_hash, &request.password) {
        Ok(true) => {}
        Ok(false) => {
            return (StatusCode::BAD_REQUEST, "Invalid email or password".to_string())
                .into_response();
        }
        Err(err) => {
            error!("Failed to verify password: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    }

    // A successful login clears the per-account failure counter.
    limits.login_email.reset(&email);

    let registered_two_factor =
        match super::twofactor::storage::registered_two_factor(&pool, user.user_id).await {
            Ok(registered) => registered,
            Err(err) => {
                error!("Failed to check two-factor registration: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                    .into_response();
            }
        };

    issue_session(
        &pool,
        &auth_state,
        user.user_id,
        &user.email,
        user.email_verified,
        registered_two_factor,
    )
    .await
}

/// Create a session (never two-factor verified at issue time) and set the
/// cookie alongside the flow facts the client needs for its next step.
async fn issue_session(
    pool: &PgPool,
    auth_state: &AuthState,
    user_id: uuid::Uuid,
    email: &str,
    email_verified: bool,
    registered_two_factor: bool,
) -> axum::response::Response {
    let token = match insert_session(
        pool,
        user_id,
        false,
        auth_state.config().session_ttl_seconds(),
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
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
            return (StatusCode::INTERNAL_SERVER_ERROR, "Login failed".to_string())
                .into_response();
        }
    }

    let response = SessionResponse {
        user_id: user_id.to_string(),
        email: email.to_string(),
        email_verified,
        registered_two_factor,
        two_factor_verified: false,
    };
    (StatusCode::OK, response_headers, Json(response)).into_response()
}
