//! Email verification endpoints.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::principal::require_auth;
use super::state::AuthState;
use super::storage::{
    replace_verification_request, resend_verification_request, take_verification_request,
    ResendOutcome, VerificationTake,
};
use super::types::{MessageResponse, VerifyEmailRequest};

/// Consume the emailed code and mark the address verified.
///
/// An expired code is a distinguished outcome: a fresh code is issued and
/// sent in the same transaction, and the response says so instead of failing
/// flat.
#[utoipa::path(
    post,
    path = "/v1/auth/verify-email",
    request_body = VerifyEmailRequest,
    responses(
        (status = 204, description = "Email verified"),
        (status = 400, description = "Invalid or expired code", body = MessageResponse),
        (status = 401, description = "Unauthenticated"),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn verify_email(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<VerifyEmailRequest>>,
) -> impl IntoResponse {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
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
    if !limits.verify_email_user.check(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    // Each attempt is charged, matched or not.
    if !limits.verify_email_user.consume(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Failed to start verify-email transaction: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Verification failed".to_string(),
            )
                .into_response();
        }
    };

    let outcome = match take_verification_request(&mut tx, principal.user_id, code).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Failed to consume verification code: {err}");
            let _ = tx.rollback().await;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Verification failed".to_string(),
            )
                .into_response();
        }
    };

    match outcome {
        VerificationTake::Consumed { .. } => {
            if let Err(err) = tx.commit().await {
                error!("Failed to commit verify-email transaction: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Verification failed".to_string(),
                )
                    .into_response();
            }
            auth_state.limits().verify_email_user.reset(&principal.user_id);
            StatusCode::NO_CONTENT.into_response()
        }
        VerificationTake::Expired { email } => {
            // Reissue in the same transaction so the stale row never outlives
            // the fresh code.
            if let Err(err) =
                replace_verification_request(&mut tx, principal.user_id, &email, auth_state.config())
                    .await
            {
                error!("Failed to reissue verification code: {err}");
                let _ = tx.rollback().await;
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Verification failed".to_string(),
                )
                    .into_response();
            }
            if let Err(err) = tx.commit().await {
                error!("Failed to commit verification reissue: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Verification failed".to_string(),
                )
                    .into_response();
            }
            (
                StatusCode::BAD_REQUEST,
                Json(MessageResponse::new(
                    "The verification code expired. We sent a new one to your inbox.",
                )),
            )
                .into_response()
        }
        VerificationTake::WrongCode => {
            let _ = tx.rollback().await;
            (StatusCode::BAD_REQUEST, Json(MessageResponse::new("Incorrect code")))
                .into_response()
        }
        VerificationTake::Missing => {
            let _ = tx.rollback().await;
            (
                StatusCode::BAD_REQUEST,
                Json(MessageResponse::new("No verification is pending")),
            )
                .into_response()
        }
    }
}

/// Resend the current verification code (opaque 204 on cooldown).
#[utoipa::path(
    post,
    path = "/v1/auth/resend-verification",
    responses(
        (status = 204, description = "Resend accepted"),
        (status = 401, description = "Unauthenticated"),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn resend_verification(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let limits = auth_state.limits();
    if !limits.send_verification_user.check(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }
    if !limits.send_verification_user.consume(&principal.user_id, 1) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()).into_response();
    }

    match resend_verification_request(&pool, principal.user_id, &principal.email, auth_state.config())
        .await
    {
        // Cooldown stays opaque so the endpoint can't be used as a timer oracle.
        Ok(ResendOutcome::Queued | ResendOutcome::Cooldown) => {
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("Failed to resend verification: {err}");
            StatusCode::NO_CONTENT.into_response()
        }
    }
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
    async fn verify_email_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = verify_email(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(VerifyEmailRequest {
                code: "12345678".to_string(),
            })),
        )
        .await
        .into_response();
        // No cookie at all resolves to 401 before any database work.
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn resend_requires_session() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response =
            resend_verification(HeaderMap::new(), Extension(pool), Extension(auth_state()))
                .await
                .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
