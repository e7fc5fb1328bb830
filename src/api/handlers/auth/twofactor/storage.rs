//! Database helpers for TOTP credentials and recovery codes.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

pub(crate) async fn registered_two_factor(pool: &PgPool, user_id: Uuid) -> Result<bool> {
    let query = "SELECT 1 FROM totp_credentials WHERE user_id = $1 LIMIT 1";
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
        .context("failed to check totp registration")?;
    Ok(row.is_some())
}

pub(super) async fn upsert_totp_credential(
    pool: &PgPool,
    user_id: Uuid,
    secret_enc: &[u8],
) -> Result<()> {
    let query = r"
        INSERT INTO totp_credentials (user_id, secret_enc)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE
        SET secret_enc = EXCLUDED.secret_enc, created_at = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(secret_enc)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to upsert totp credential")?;
    Ok(())
}

pub(super) async fn load_totp_secret(pool: &PgPool, user_id: Uuid) -> Result<Option<Vec<u8>>> {
    let query = "SELECT secret_enc FROM totp_credentials WHERE user_id = $1";
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
        .context("failed to load totp credential")?;
    Ok(row.map(|row| row.get("secret_enc")))
}

pub(super) async fn delete_totp_credential(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = "DELETE FROM totp_credentials WHERE user_id = $1";
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
        .context("failed to delete totp credential")?;
    Ok(())
}

/// Store the user's single recovery-code hash, replacing any prior one.
pub(super) async fn upsert_recovery_code(
    pool: &PgPool,
    user_id: Uuid,
    code_hash: &str,
) -> Result<()> {
    let query = r"
        INSERT INTO recovery_codes (user_id, code_hash)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE
        SET code_hash = EXCLUDED.code_hash, created_at = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(code_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to upsert recovery code")?;
    Ok(())
}

pub(super) async fn load_recovery_code_hash(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<String>> {
    let query = "SELECT code_hash FROM recovery_codes WHERE user_id = $1";
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
        .context("failed to load recovery code")?;
    Ok(row.map(|row| row.get("code_hash")))
}
