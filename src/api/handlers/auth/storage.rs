//! Database helpers for users, sessions, verification requests, and
//! password-reset sessions.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::state::AuthConfig;
use super::utils::{
    generate_token, generate_verification_code, hash_token, hash_verification_code,
    is_unique_violation,
};

/// Minimal data returned for a valid session token.
pub(crate) struct SessionRecord {
    pub(crate) user_id: Uuid,
    pub(crate) email: String,
    pub(crate) email_verified: bool,
    pub(crate) two_factor_verified: bool,
    pub(crate) registered_two_factor: bool,
}

pub(super) struct UserRecord {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) password_hash: Option<String>,
    pub(super) email_verified: bool,
}

/// Outcome of consuming a verification code.
#[derive(Debug)]
pub(super) enum VerificationTake {
    /// Code matched; the user's email was updated and marked verified.
    Consumed { email: String },
    /// The request had lapsed; the row is gone and a fresh code should be issued.
    Expired { email: String },
    WrongCode,
    Missing,
}

/// Outcome for a resend request.
#[derive(Debug)]
pub(super) enum ResendOutcome {
    Queued,
    Cooldown,
}

pub(super) async fn lookup_user_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRecord>> {
    let query = "SELECT id, email, password_hash, email_verified FROM users WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by email")?;

    Ok(row.map(|row| UserRecord {
        user_id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        email_verified: row.get("email_verified"),
    }))
}

/// Insert a new user; returns `None` when the email is already taken.
pub(super) async fn insert_user(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    email: &str,
    password_hash: Option<&str>,
    email_verified: bool,
) -> Result<Option<Uuid>> {
    let query = r"
        INSERT INTO users (email, password_hash, email_verified)
        VALUES ($1, $2, $3)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .bind(password_hash)
        .bind(email_verified)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await;

    match row {
        Ok(row) => Ok(Some(row.get("id"))),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err).context("failed to insert user"),
    }
}

pub(super) async fn lookup_password_hash(pool: &PgPool, user_id: Uuid) -> Result<Option<String>> {
    let query = "SELECT password_hash FROM users WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup password hash")?;
    Ok(row.and_then(|row| row.get("password_hash")))
}

pub(super) async fn update_password_hash(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    password_hash: &str,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET password_hash = $2, updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(password_hash)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to update password hash")?;
    Ok(())
}

/// Create a session row and return the raw token for the cookie.
///
/// The generated token is retried on the (unlikely) hash collision, the same
/// way unique violations are handled on insert elsewhere.
pub(crate) async fn insert_session(
    pool: &PgPool,
    user_id: Uuid,
    two_factor_verified: bool,
    ttl_seconds: i64,
) -> Result<String> {
    let query = r"
        INSERT INTO sessions (token_hash, user_id, two_factor_verified, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );

    for _ in 0..3 {
        let token = generate_token()?;
        let token_hash = hash_token(&token);
        let result = sqlx::query(query)
            .bind(token_hash)
            .bind(user_id)
            .bind(two_factor_verified)
            .bind(ttl_seconds)
            .execute(pool)
            .instrument(span.clone())
            .await;

        match result {
            Ok(_) => return Ok(token),
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("failed to generate unique session token"))
}

/// Resolve a session token hash.
///
/// Expired rows for the presented token are deleted before the lookup, so an
/// expired session both validates to `None` and leaves no row behind.
pub(crate) async fn lookup_session(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<SessionRecord>> {
    let query = "DELETE FROM sessions WHERE token_hash = $1 AND expires_at <= NOW()";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to prune expired session")?;

    let query = r"
        SELECT users.id, users.email, users.email_verified,
               sessions.two_factor_verified,
               EXISTS (
                   SELECT 1 FROM totp_credentials
                   WHERE totp_credentials.user_id = users.id
               ) AS registered_two_factor
        FROM sessions
        JOIN users ON users.id = sessions.user_id
        WHERE sessions.token_hash = $1
          AND sessions.expires_at > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup session")?;

    if row.is_none() {
        return Ok(None);
    }

    // Record activity for audit/visibility without extending the session TTL.
    let query = "UPDATE sessions SET last_seen_at = NOW() WHERE token_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update session last_seen_at")?;

    Ok(row.map(|row| SessionRecord {
        user_id: row.get("id"),
        email: row.get("email"),
        email_verified: row.get("email_verified"),
        two_factor_verified: row.get("two_factor_verified"),
        registered_two_factor: row.get("registered_two_factor"),
    }))
}

pub(crate) async fn delete_session(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    // Logout is idempotent; it's fine if no rows are deleted.
    let query = "DELETE FROM sessions WHERE token_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;
    Ok(())
}

pub(crate) async fn delete_sessions_for_user(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = "DELETE FROM sessions WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete sessions for user")?;
    Ok(())
}

/// Delete every session for the user except the presented one.
pub(super) async fn delete_other_sessions_for_user(
    pool: &PgPool,
    user_id: Uuid,
    keep_token_hash: &[u8],
) -> Result<()> {
    let query = "DELETE FROM sessions WHERE user_id = $1 AND token_hash <> $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(keep_token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete other sessions for user")?;
    Ok(())
}

pub(crate) async fn mark_session_two_factor_verified(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<()> {
    let query = r"
        UPDATE sessions
        SET two_factor_verified = true
        WHERE token_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark session two-factor verified")?;
    Ok(())
}

/// Queue an email in the transactional outbox.
pub(crate) async fn enqueue_email(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    to_email: &str,
    template: &str,
    payload_json: &serde_json::Value,
) -> Result<()> {
    let payload_text =
        serde_json::to_string(payload_json).context("failed to serialize email payload")?;
    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}

/// Replace the user's verification request with a fresh code and queue the
/// email, all in the caller's transaction. At most one request per user.
pub(super) async fn replace_verification_request(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    email: &str,
    config: &AuthConfig,
) -> Result<String> {
    let code = generate_verification_code()?;
    let code_hash = hash_verification_code(&code);

    let query = r"
        INSERT INTO verification_requests (user_id, email, code_hash, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
        ON CONFLICT (user_id) DO UPDATE
        SET email = EXCLUDED.email,
            code_hash = EXCLUDED.code_hash,
            created_at = NOW(),
            expires_at = EXCLUDED.expires_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(email)
        .bind(code_hash)
        .bind(config.verification_code_ttl_seconds())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to upsert verification request")?;

    enqueue_email(tx, email, "verify_email", &json!({ "code": code })).await?;

    Ok(code)
}

/// Attempt to consume the user's verification code.
///
/// The row is locked for the duration of the transaction so two concurrent
/// submissions cannot both consume it.
pub(super) async fn take_verification_request(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    code: &str,
) -> Result<VerificationTake> {
    let query = r"
        SELECT email, code_hash, (expires_at > NOW()) AS live
        FROM verification_requests
        WHERE user_id = $1
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to lock verification request")?;

    let Some(row) = row else {
        return Ok(VerificationTake::Missing);
    };

    let email: String = row.get("email");
    let live: bool = row.get("live");

    if !live {
        delete_verification_request(tx, user_id).await?;
        return Ok(VerificationTake::Expired { email });
    }

    let stored_hash: Vec<u8> = row.get("code_hash");
    if stored_hash != hash_verification_code(code) {
        return Ok(VerificationTake::WrongCode);
    }

    delete_verification_request(tx, user_id).await?;

    // The request may carry a new address (email change); adopt it on success.
    let query = r"
        UPDATE users
        SET email = $2, email_verified = true, updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(&email)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to mark email verified")?;

    Ok(VerificationTake::Consumed { email })
}

pub(super) async fn delete_verification_request(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
) -> Result<()> {
    let query = "DELETE FROM verification_requests WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete verification request")?;
    Ok(())
}

/// Reissue the current verification request unless one was created within the
/// cooldown window. A pending request keeps its target address (it may carry
/// an email change); otherwise the fallback address is used.
pub(super) async fn resend_verification_request(
    pool: &PgPool,
    user_id: Uuid,
    fallback_email: &str,
    config: &AuthConfig,
) -> Result<ResendOutcome> {
    let mut tx = pool.begin().await.context("begin resend transaction")?;

    let query = r"
        SELECT email,
               (created_at > NOW() - ($2 * INTERVAL '1 second')) AS recent
        FROM verification_requests
        WHERE user_id = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(config.resend_cooldown_seconds())
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to check resend cooldown")?;

    let email = match row {
        Some(row) => {
            let recent: bool = row.get("recent");
            if recent {
                tx.commit().await.context("commit resend cooldown")?;
                return Ok(ResendOutcome::Cooldown);
            }
            row.get::<String, _>("email")
        }
        None => fallback_email.to_string(),
    };

    let _ = replace_verification_request(&mut tx, user_id, &email, config).await?;
    tx.commit().await.context("commit resend enqueue")?;
    Ok(ResendOutcome::Queued)
}

/// Reset-session data joined with the gating facts the handlers need.
pub(super) struct ResetSessionRecord {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) email_verified: bool,
    pub(super) two_factor_verified: bool,
    pub(super) registered_two_factor: bool,
}

/// Create a password-reset session, replacing any prior ones for the user,
/// and queue the code email. Returns the raw reset token.
pub(super) async fn insert_reset_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    email: &str,
    config: &AuthConfig,
) -> Result<String> {
    delete_reset_sessions_for_user(tx, user_id).await?;

    let token = generate_token()?;
    let token_hash = hash_token(&token);
    let code = generate_verification_code()?;
    let code_hash = hash_verification_code(&code);

    let query = r"
        INSERT INTO password_reset_sessions
            (token_hash, user_id, email, code_hash, expires_at)
        VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .bind(user_id)
        .bind(email)
        .bind(code_hash)
        .bind(config.reset_session_ttl_seconds())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert password reset session")?;

    enqueue_email(tx, email, "password_reset", &json!({ "code": code })).await?;

    Ok(token)
}

/// Resolve a reset token hash; expired rows are pruned like sessions.
pub(super) async fn lookup_reset_session(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<ResetSessionRecord>> {
    let query = "DELETE FROM password_reset_sessions WHERE token_hash = $1 AND expires_at <= NOW()";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to prune expired reset session")?;

    let query = r"
        SELECT prs.user_id, prs.email, prs.email_verified, prs.two_factor_verified,
               EXISTS (
                   SELECT 1 FROM totp_credentials
                   WHERE totp_credentials.user_id = prs.user_id
               ) AS registered_two_factor
        FROM password_reset_sessions AS prs
        WHERE prs.token_hash = $1
          AND prs.expires_at > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup reset session")?;

    Ok(row.map(|row| ResetSessionRecord {
        user_id: row.get("user_id"),
        email: row.get("email"),
        email_verified: row.get("email_verified"),
        two_factor_verified: row.get("two_factor_verified"),
        registered_two_factor: row.get("registered_two_factor"),
    }))
}

/// Consume the emailed code on a reset session. Returns false when the code
/// does not match the stored hash.
pub(super) async fn mark_reset_email_verified(
    pool: &PgPool,
    token_hash: &[u8],
    code: &str,
) -> Result<bool> {
    let code_hash = hash_verification_code(code);
    let query = r"
        UPDATE password_reset_sessions
        SET email_verified = true
        WHERE token_hash = $1
          AND code_hash = $2
          AND expires_at > NOW()
        RETURNING user_id, email
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(&code_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to verify reset session email")?;

    let Some(row) = row else {
        return Ok(false);
    };

    // Proving control of the address also verifies the account email when it
    // still matches.
    let user_id: Uuid = row.get("user_id");
    let email: String = row.get("email");
    let query = r"
        UPDATE users
        SET email_verified = true, updated_at = NOW()
        WHERE id = $1 AND email = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(&email)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mirror email verification")?;

    Ok(true)
}

pub(super) async fn mark_reset_two_factor_verified(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<()> {
    let query = r"
        UPDATE password_reset_sessions
        SET two_factor_verified = true
        WHERE token_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark reset session two-factor verified")?;
    Ok(())
}

pub(super) async fn delete_reset_sessions_for_user(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
) -> Result<()> {
    let query = "DELETE FROM password_reset_sessions WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete reset sessions for user")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ResendOutcome, SessionRecord, VerificationTake};
    use uuid::Uuid;

    #[test]
    fn verification_take_debug_names() {
        assert!(format!(
            "{:?}",
            VerificationTake::Consumed {
                email: "a@b.co".to_string()
            }
        )
        .starts_with("Consumed"));
        assert!(format!(
            "{:?}",
            VerificationTake::Expired {
                email: "a@b.co".to_string()
            }
        )
        .starts_with("Expired"));
        assert_eq!(format!("{:?}", VerificationTake::WrongCode), "WrongCode");
        assert_eq!(format!("{:?}", VerificationTake::Missing), "Missing");
    }

    #[test]
    fn resend_outcome_debug_names() {
        assert_eq!(format!("{:?}", ResendOutcome::Queued), "Queued");
        assert_eq!(format!("{:?}", ResendOutcome::Cooldown), "Cooldown");
    }

    #[test]
    fn session_record_holds_values() {
        let record = SessionRecord {
            user_id: Uuid::nil(),
            email: "alice@example.com".to_string(),
            email_verified: true,
            two_factor_verified: false,
            registered_two_factor: true,
        };
        assert_eq!(record.user_id, Uuid::nil());
        assert!(record.email_verified);
        assert!(!record.two_factor_verified);
        assert!(record.registered_two_factor);
    }
}
