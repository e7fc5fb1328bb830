//! Session endpoints and the session cookie.

use axum::{
    extract::Extension,
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::{
    state::{AuthConfig, AuthState},
    storage::{delete_session, lookup_session, SessionRecord},
    types::SessionResponse,
    utils::hash_token,
};

const SESSION_COOKIE_NAME: &str = "ingresso_session";
pub(super) const RESET_COOKIE_NAME: &str = "ingresso_reset";

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 204, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn session(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    // Missing cookies are treated as "no session" to avoid leaking auth state.
    let Some(token) = extract_session_token(&headers) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let token_hash = hash_token(&token);
    match lookup_session(&pool, &token_hash).await {
        Ok(Some(record)) => {
            let response = SessionResponse {
                user_id: record.user_id.to_string(),
                email: record.email,
                email_verified: record.email_verified,
                registered_two_factor: record.registered_two_factor,
                two_factor_verified: record.two_factor_verified,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Resolve the session cookie (or bearer token) into a session record.
///
/// Returns `Ok(None)` when the token is missing, unknown, or expired; callers
/// must treat that as logged-out rather than an error.
pub(crate) async fn authenticate_session(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Option<(Vec<u8>, SessionRecord)>, StatusCode> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(None);
    };
    let token_hash = hash_token(&token);
    match lookup_session(pool, &token_hash).await {
        Ok(Some(record)) => Ok(Some((token_hash, record))),
        Ok(None) => Ok(None),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers) {
        let token_hash = hash_token(&token);
        if let Err(err) = delete_session(&pool, &token_hash).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_cookie(auth_state.config(), SESSION_COOKIE_NAME) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// Build a secure `HttpOnly` cookie carrying an opaque token.
pub(super) fn token_cookie(
    config: &AuthConfig,
    name: &str,
    token: &str,
    ttl_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    // Only mark cookies secure when the frontend is served over HTTPS.
    let secure = config.session_cookie_secure();
    let mut cookie = format!("{name}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn session_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    token_cookie(
        config,
        SESSION_COOKIE_NAME,
        token,
        config.session_ttl_seconds(),
    )
}

pub(super) fn clear_cookie(
    config: &AuthConfig,
    name: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    token_cookie(config, name, "", 0)
}

pub(super) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    cookie_value(headers, SESSION_COOKIE_NAME)
}

pub(super) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn config(frontend: &str) -> AuthConfig {
        AuthConfig::new(frontend.to_string())
    }

    #[test]
    fn session_cookie_secure_only_on_https() {
        let secure = session_cookie(&config("https://hub.example"), "tok")
            .ok()
            .and_then(|v| v.to_str().map(str::to_string).ok())
            .unwrap_or_default();
        assert!(secure.contains("; Secure"));
        assert!(secure.contains("HttpOnly"));
        assert!(secure.contains("SameSite=Lax"));

        let plain = session_cookie(&config("http://localhost:3000"), "tok")
            .ok()
            .and_then(|v| v.to_str().map(str::to_string).ok())
            .unwrap_or_default();
        assert!(!plain.contains("; Secure"));
    }

    #[test]
    fn clear_cookie_zeroes_max_age() {
        let cleared = clear_cookie(&config("https://hub.example"), SESSION_COOKIE_NAME)
            .ok()
            .and_then(|v| v.to_str().map(str::to_string).ok())
            .unwrap_or_default();
        assert!(cleared.contains("Max-Age=0"));
        assert!(cleared.starts_with("ingresso_session=;"));
    }

    #[test]
    fn extract_session_token_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(
            COOKIE,
            HeaderValue::from_static("ingresso_session=from-cookie"),
        );
        assert_eq!(extract_session_token(&headers), Some("abc".to_string()));
    }

    #[test]
    fn cookie_value_parses_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; ingresso_session=tok; other=1"),
        );
        assert_eq!(
            cookie_value(&headers, "ingresso_session"),
            Some("tok".to_string())
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn empty_cookie_value_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("ingresso_session="));
        assert_eq!(cookie_value(&headers, "ingresso_session"), None);
    }
}
