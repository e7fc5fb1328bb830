//! Account mutation endpoints: change email, change password.
//!
//! Both are gated on the fully-authenticated flow state; a session that has
//! not passed a registered two-factor challenge gets the uniform Forbidden.

use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};

use super::password::{hash_password, validate_password_strength, verify_password};
use super::principal::require_fully_authenticated;
use super::state::AuthState;
use super::storage::{
    delete_other_sessions_for_user, lookup_password_hash, lookup_user_by_email,
    replace_verification_request, update_password_hash,
};
use super::types::{ChangeEmailRequest, ChangePasswordRequest};
use super::utils::{normalize_email, valid_email};

/// Start an email change: a verification request is issued for the new
/// address; the account switches over when its code is consumed.
#[utoipa::path(
    post,
    path = "/v1/account/email",
    request_body = ChangeEmailRequest,
    responses(
        (status = 204, description = "Verification code sent to the new address"),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Unauthenticated"),
        (status = 403, description = "Flow precondition unmet"),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "account"
)]
pub async fn change_email(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ChangeEmailRequest>>,
) -> impl IntoResponse {
    let principal = match require_fully_authenticated(&headers, &pool).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }
    if email == principal.email {
        return (StatusCode::BAD_REQUEST, "This is already your email".to_string())
            .into_response();
    }

    match lookup_user_by_email(&pool, &email).await {
        Ok(Some(_)) => {
            return (StatusCode::BAD_REQUEST, "Email is already used".to_string()).into_response();
        }
        Ok(None) => {}
        Err(err) => {
            error!("Failed to check email availability: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Email change failed".to_string(),
            )
                .into_response();
        }
    }

    let limits = auth_state.limits();
    if !limits.send_verification_user.check(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.send_verification_user.consume(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    if let Err(err) = issue_change_request(&pool, principal.user_id, &email, &auth_state).await {
        error!("Failed to issue email change request: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Email change failed".to_string(),
        )
            .into_response();
    }

    info!(user_id = %principal.user_id, "Email change requested");
    StatusCode::NO_CONTENT.into_response()
}

async fn issue_change_request(
    pool: &PgPool,
    user_id: uuid::Uuid,
    email: &str,
    auth_state: &AuthState,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin email change")?;
    let _ = replace_verification_request(&mut tx, user_id, email, auth_state.config()).await?;
    tx.commit().await.context("commit email change")?;
    Ok(())
}

/// Change the password; every other session is revoked.
#[utoipa::path(
    post,
    path = "/v1/account/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 204, description = "Password changed, other sessions revoked"),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Unauthenticated"),
        (status = 403, description = "Flow precondition unmet")
    ),
    tag = "account"
)]
pub async fn change_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    payload: Option<Json<ChangePasswordRequest>>,
) -> impl IntoResponse {
    let principal = match require_fully_authenticated(&headers, &pool).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    if let Err(message) = validate_password_strength(&request.new_password) {
        return (StatusCode::BAD_REQUEST, message.to_string()).into_response();
    }

    let stored_hash = match lookup_password_hash(&pool, principal.user_id).await {
        Ok(Some(hash)) => hash,
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                "Account uses provider sign-in".to_string(),
            )
                .into_response();
        }
        Err(err) => {
            error!("Failed to load password hash: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password change failed".to_string(),
            )
                .into_response();
        }
    };

    match verify_password(&stored_hash, &request.current_password) {
        Ok(true) => {}
        Ok(false) => {
            return (StatusCode::BAD_REQUEST, "Incorrect password".to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to verify password: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password change failed".to_string(),
            )
                .into_response();
        }
    }

    let new_hash = match hash_password(&request.new_password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Password change failed".to_string(),
            )
                .into_response();
        }
    };

    if let Err(err) = apply_password_change(&pool, principal.user_id, &new_hash).await {
        error!("Failed to apply password change: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Password change failed".to_string(),
        )
            .into_response();
    }

    // The presented session survives; everything else is revoked.
    if let Err(err) =
        delete_other_sessions_for_user(&pool, principal.user_id, &principal.token_hash).await
    {
        error!("Failed to revoke other sessions: {err}");
    }

    info!(user_id = %principal.user_id, "Password changed");
    StatusCode::NO_CONTENT.into_response()
}

async fn apply_password_change(
    pool: &PgPool,
    user_id: uuid::Uuid,
    password_hash: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin password change")?;
    update_password_hash(&mut tx, user_id, password_hash).await?;
    tx.commit().await.context("commit password change")?;
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
    async fn change_email_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = change_email(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(ChangeEmailRequest {
                email: "new@example.com".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn change_password_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = change_password(
            HeaderMap::new(),
            Extension(pool),
            Some(Json(ChangePasswordRequest {
                current_password: "old password".to_string(),
                new_password: "new password 123".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
