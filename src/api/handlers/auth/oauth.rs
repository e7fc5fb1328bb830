//! OAuth sign-in/signup over authorization-code + PKCE.
//!
//! Flow Overview: `start` records a pending-auth row keyed by the hash of a
//! state nonce (server-side state, no cookie-carried control flow) and hands
//! the client the provider authorize URL. `callback` consumes the pending row
//! exactly once, exchanges the code, and decodes the identity claims with a
//! typed parser that fails closed on missing fields. Any failure along the
//! way degrades to "restart the process" with no user or session row written;
//! the session is only created after the identity is fully resolved.

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Extension, Query},
    http::{
        header::{LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    Json,
};
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

use secrecy::ExposeSecret;

use super::session::session_cookie;
use super::state::{AuthState, OAuthProvider};
use super::storage::{insert_session, insert_user, lookup_user_by_email};
use super::types::{OAuthStartRequest, OAuthStartResponse};
use super::utils::{generate_token, hash_token, is_unique_violation, normalize_email, valid_email};

const RESTART_MESSAGE: &str = "Could not complete sign-in. Please restart the process.";

/// What the flow should do when no linked account exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Intent {
    SignIn,
    SignUp,
}

impl Intent {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "signin" => Some(Self::SignIn),
            "signup" => Some(Self::SignUp),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::SignIn => "signin",
            Self::SignUp => "signup",
        }
    }
}

/// Identity claims required from the provider's ID token.
///
/// Decoding is strict: a token without `sub` or `email` is rejected before
/// any account work happens.
#[derive(Debug, Deserialize)]
pub(super) struct IdentityClaims {
    pub(super) sub: String,
    pub(super) email: String,
    #[serde(default)]
    pub(super) email_verified: bool,
}

/// Decode the claims segment of an ID token.
///
/// The token arrives over the provider's TLS token endpoint in direct
/// response to our code exchange, so the payload is decoded without local
/// signature verification.
pub(super) fn decode_identity_claims(id_token: &str) -> Result<IdentityClaims> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow!("ID token is not a JWT"))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .context("ID token payload is not base64url")?;
    let claims: IdentityClaims =
        serde_json::from_slice(&bytes).context("ID token claims are missing required fields")?;
    if claims.sub.trim().is_empty() || claims.email.trim().is_empty() {
        return Err(anyhow!("ID token claims are empty"));
    }
    Ok(claims)
}

/// Build the S256 PKCE challenge for a verifier.
pub(super) fn pkce_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Keep redirect targets inside the frontend: a single leading slash.
pub(super) fn sanitize_callback_url(callback_url: Option<&str>) -> String {
    match callback_url {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path.to_string(),
        _ => "/".to_string(),
    }
}

struct PendingAuth {
    code_verifier: String,
    intent: Intent,
    callback_url: String,
}

async fn insert_pending(
    pool: &PgPool,
    state_hash: &[u8],
    code_verifier: &str,
    intent: Intent,
    callback_url: &str,
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        INSERT INTO oauth_pending
            (state_hash, code_verifier, intent, callback_url, expires_at)
        VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(state_hash)
        .bind(code_verifier)
        .bind(intent.as_str())
        .bind(callback_url)
        .bind(ttl_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert pending auth")?;
    Ok(())
}

/// Consume the pending-auth row for a state nonce.
///
/// The row is deleted on first use regardless of outcome; an expired or
/// unknown state yields `None`.
async fn take_pending(pool: &PgPool, state_hash: &[u8]) -> Result<Option<PendingAuth>> {
    let query = r"
        DELETE FROM oauth_pending
        WHERE state_hash = $1
        RETURNING code_verifier, intent, callback_url, (expires_at > NOW()) AS live
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(state_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to take pending auth")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let live: bool = row.get("live");
    if !live {
        return Ok(None);
    }
    let intent: String = row.get("intent");
    let Some(intent) = Intent::parse(&intent) else {
        return Ok(None);
    };
    Ok(Some(PendingAuth {
        code_verifier: row.get("code_verifier"),
        intent,
        callback_url: row.get("callback_url"),
    }))
}

async fn lookup_linked_user(
    pool: &PgPool,
    provider: &str,
    provider_user_id: &str,
) -> Result<Option<Uuid>> {
    let query = r"
        SELECT user_id
        FROM oauth_accounts
        WHERE provider = $1 AND provider_user_id = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup linked account")?;
    Ok(row.map(|row| row.get("user_id")))
}

async fn insert_oauth_account(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    provider: &str,
    provider_user_id: &str,
    user_id: Uuid,
) -> Result<bool> {
    let query = r"
        INSERT INTO oauth_accounts (provider, provider_user_id, user_id)
        VALUES ($1, $2, $3)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(provider)
        .bind(provider_user_id)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await;
    match result {
        Ok(_) => Ok(true),
        Err(err) if is_unique_violation(&err) => Ok(false),
        Err(err) => Err(err).context("failed to insert linked account"),
    }
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    id_token: String,
}

/// Exchange the authorization code + verifier for tokens at the provider.
async fn exchange_code(
    provider: &OAuthProvider,
    code: &str,
    code_verifier: &str,
) -> Result<TokenExchangeResponse> {
    let client = reqwest::Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .build()
        .context("failed to build HTTP client")?;

    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", provider.redirect_url()),
        ("client_id", provider.client_id()),
        ("client_secret", provider.client_secret().expose_secret()),
        ("code_verifier", code_verifier),
    ];
    let response = client
        .post(provider.token_endpoint())
        .form(&params)
        .send()
        .await
        .context("token exchange request failed")?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "token exchange returned status {}",
            response.status()
        ));
    }
    response
        .json::<TokenExchangeResponse>()
        .await
        .context("token exchange response was not understood")
}

/// Begin the provider flow: record pending auth, return the authorize URL.
#[utoipa::path(
    post,
    path = "/v1/oauth/start",
    request_body = OAuthStartRequest,
    responses(
        (status = 200, description = "Flow started", body = OAuthStartResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 503, description = "No provider configured", body = String)
    ),
    tag = "oauth"
)]
pub async fn oauth_start(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<OAuthStartRequest>>,
) -> impl IntoResponse {
    let Some(provider) = auth_state.oauth() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Provider sign-in is not available".to_string(),
        )
            .into_response();
    };

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let Some(intent) = Intent::parse(&request.intent) else {
        return (StatusCode::BAD_REQUEST, "Invalid intent".to_string()).into_response();
    };
    let callback_url = sanitize_callback_url(request.callback_url.as_deref());

    let (state, code_verifier) = match (generate_token(), generate_token()) {
        (Ok(state), Ok(verifier)) => (state, verifier),
        _ => {
            error!("Failed to generate OAuth state/verifier");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Err(err) = insert_pending(
        &pool,
        &hash_token(&state),
        &code_verifier,
        intent,
        &callback_url,
        auth_state.config().oauth_pending_ttl_seconds(),
    )
    .await
    {
        error!("Failed to record pending auth: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let authorize_url = match build_authorize_url(provider, &state, &code_verifier) {
        Ok(url) => url,
        Err(err) => {
            error!("Failed to build authorize URL: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        StatusCode::OK,
        Json(OAuthStartResponse {
            authorize_url,
            state,
        }),
    )
        .into_response()
}

fn build_authorize_url(provider: &OAuthProvider, state: &str, code_verifier: &str) -> Result<String> {
    let mut url = Url::parse(provider.authorize_endpoint())
        .with_context(|| format!("invalid authorize endpoint: {}", provider.authorize_endpoint()))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", provider.client_id())
        .append_pair("redirect_uri", provider.redirect_url())
        .append_pair("scope", "openid email")
        .append_pair("state", state)
        .append_pair("code_challenge", &pkce_challenge(code_verifier))
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Provider redirect target: consume pending auth, exchange, sign in or up.
#[utoipa::path(
    get,
    path = "/v1/oauth/callback",
    responses(
        (status = 303, description = "Signed in; redirecting to the frontend"),
        (status = 400, description = "Flow must be restarted", body = String)
    ),
    tag = "oauth"
)]
pub async fn oauth_callback(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Query(query): Query<CallbackQuery>,
) -> impl IntoResponse {
    let Some(provider) = auth_state.oauth() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Provider sign-in is not available".to_string(),
        )
            .into_response();
    };

    let (Some(code), Some(state)) = (query.code.as_deref(), query.state.as_deref()) else {
        return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
    };

    let pending = match take_pending(&pool, &hash_token(state)).await {
        Ok(Some(pending)) => pending,
        Ok(None) => {
            // Unknown or expired state: nothing was consumed on the provider
            // side that we can honor.
            warn!("OAuth callback with unknown or expired state");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to consume pending auth: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    };

    if let Some(provider_error) = query.error.as_deref() {
        // Raw provider error text is logged, never surfaced.
        warn!("OAuth provider returned an error: {provider_error}");
        return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
    }

    let exchange = match exchange_code(provider, code, &pending.code_verifier).await {
        Ok(exchange) => exchange,
        Err(err) => {
            warn!("OAuth token exchange failed: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    };

    let claims = match decode_identity_claims(&exchange.id_token) {
        Ok(claims) => claims,
        Err(err) => {
            warn!("OAuth identity claims rejected: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    };

    let linked = match lookup_linked_user(&pool, provider.name(), &claims.sub).await {
        Ok(linked) => linked,
        Err(err) => {
            error!("Failed to lookup linked account: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    };

    let user_id = match (linked, pending.intent) {
        (Some(user_id), _) => user_id,
        (None, Intent::SignIn) => {
            return (
                StatusCode::BAD_REQUEST,
                "No account is linked to this sign-in. Please sign up first.".to_string(),
            )
                .into_response();
        }
        (None, Intent::SignUp) => {
            match create_linked_account(&pool, provider.name(), &claims).await {
                Ok(Some(user_id)) => user_id,
                Ok(None) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        "An account already exists for this identity.".to_string(),
                    )
                        .into_response();
                }
                Err(err) => {
                    error!("Failed to create linked account: {err}");
                    return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
                }
            }
        }
    };

    // Identity fully resolved; only now is a session minted.
    let token = match insert_session(
        &pool,
        user_id,
        false,
        auth_state.config().session_ttl_seconds(),
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session after OAuth: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    };

    let destination = format!(
        "{}{}",
        auth_state.config().frontend_base_url().trim_end_matches('/'),
        pending.callback_url
    );
    let mut response_headers = HeaderMap::new();
    match session_cookie(auth_state.config(), &token) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    }
    match HeaderValue::from_str(&destination) {
        Ok(location) => {
            response_headers.insert(LOCATION, location);
        }
        Err(err) => {
            error!("Failed to build redirect location: {err}");
            return (StatusCode::BAD_REQUEST, RESTART_MESSAGE.to_string()).into_response();
        }
    }

    info!(user_id = %user_id, "OAuth sign-in completed");
    (StatusCode::SEE_OTHER, response_headers).into_response()
}

/// Create the user and its provider link atomically.
///
/// Returns `None` when either the email or the provider identity collides
/// with an existing account; no partial rows survive.
async fn create_linked_account(
    pool: &PgPool,
    provider_name: &str,
    claims: &IdentityClaims,
) -> Result<Option<Uuid>> {
    let email = normalize_email(&claims.email);
    if !valid_email(&email) {
        return Err(anyhow!("provider returned an invalid email"));
    }

    let mut tx = pool.begin().await.context("begin oauth signup")?;

    if lookup_user_by_email(pool, &email).await?.is_some() {
        let _ = tx.rollback().await;
        return Ok(None);
    }

    let Some(user_id) = insert_user(&mut tx, &email, None, claims.email_verified).await? else {
        let _ = tx.rollback().await;
        return Ok(None);
    };
    if !insert_oauth_account(&mut tx, provider_name, &claims.sub, user_id).await? {
        let _ = tx.rollback().await;
        return Ok(None);
    }

    tx.commit().await.context("commit oauth signup")?;
    Ok(Some(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn token_with_claims(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn pkce_challenge_matches_rfc_vector() {
        // RFC 7636 appendix B.
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn decode_identity_claims_accepts_complete_token() {
        let token = token_with_claims(&serde_json::json!({
            "sub": "prov-123",
            "email": "alice@example.com",
            "email_verified": true,
        }));
        let Ok(claims) = decode_identity_claims(&token) else {
            panic!("claims should decode");
        };
        assert_eq!(claims.sub, "prov-123");
        assert_eq!(claims.email, "alice@example.com");
        assert!(claims.email_verified);
    }

    #[test]
    fn decode_identity_claims_fails_closed_on_missing_fields() {
        let missing_sub = token_with_claims(&serde_json::json!({
            "email": "alice@example.com",
        }));
        assert!(decode_identity_claims(&missing_sub).is_err());

        let missing_email = token_with_claims(&serde_json::json!({
            "sub": "prov-123",
        }));
        assert!(decode_identity_claims(&missing_email).is_err());

        let empty_sub = token_with_claims(&serde_json::json!({
            "sub": "  ",
            "email": "alice@example.com",
        }));
        assert!(decode_identity_claims(&empty_sub).is_err());
    }

    #[test]
    fn decode_identity_claims_rejects_non_jwt() {
        assert!(decode_identity_claims("not-a-jwt").is_err());
        assert!(decode_identity_claims("a.!!!.c").is_err());
    }

    #[test]
    fn unverified_email_defaults_to_false() {
        let token = token_with_claims(&serde_json::json!({
            "sub": "prov-123",
            "email": "alice@example.com",
        }));
        let Ok(claims) = decode_identity_claims(&token) else {
            panic!("claims should decode");
        };
        assert!(!claims.email_verified);
    }

    #[test]
    fn sanitize_callback_url_defaults_to_root() {
        assert_eq!(sanitize_callback_url(None), "/");
        assert_eq!(sanitize_callback_url(Some("https://evil.example")), "/");
        assert_eq!(sanitize_callback_url(Some("//evil.example")), "/");
        assert_eq!(sanitize_callback_url(Some("/articles/42")), "/articles/42");
    }

    #[test]
    fn intent_parses_known_values() {
        assert_eq!(Intent::parse("signin"), Some(Intent::SignIn));
        assert_eq!(Intent::parse("signup"), Some(Intent::SignUp));
        assert_eq!(Intent::parse("other"), None);
    }
}
