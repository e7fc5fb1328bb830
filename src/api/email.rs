//! Email outbox worker and delivery abstractions.
//!
//! Signup, verification, email-change, and password-reset flows enqueue rows
//! in `email_outbox` inside the same transaction as the state they announce.
//! A background task polls that table, locks a batch with
//! `FOR UPDATE SKIP LOCKED`, and hands each row to an `EmailSender`. Failed
//! rows are retried with exponential backoff and jitter until a max attempt
//! threshold, then marked `failed`.
//!
//! The default sender for local dev is `LogEmailSender`, which logs the
//! payload and returns `Ok(())`.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Email delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and processes the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = process_outbox_batch(&pool, sender.as_ref(), &config).await {
                error!("email outbox batch failed: {err}");
            }
            sleep(config.poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Locked batch so multiple workers can run without double-sending.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(1))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let message = EmailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        let send_result = sender.send(&message);
        settle_outbox_row(&mut tx, id, attempts, send_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

async fn settle_outbox_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    send_result: Result<()>,
    config: &EmailWorkerConfig,
) -> Result<()> {
    let next_attempt = attempts.saturating_add(1);
    let attempts_column = i32::try_from(next_attempt).unwrap_or(i32::MAX);

    // One statement per outcome: sent, exhausted, or rescheduled.
    let (status, last_error, delay_ms) = match &send_result {
        Ok(()) => ("sent", None, 0i64),
        Err(err) if next_attempt >= config.max_attempts() => ("failed", Some(err.to_string()), 0),
        Err(err) => {
            let delay = backoff_delay(next_attempt, config.backoff_base, config.backoff_max);
            (
                "pending",
                Some(err.to_string()),
                i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
            )
        }
    };

    let query = r"
        UPDATE email_outbox
        SET status = $2,
            attempts = $3,
            last_error = $4,
            sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END,
            next_attempt_at = NOW() + ($5 * INTERVAL '1 millisecond')
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(status)
        .bind(attempts_column)
        .bind(last_error)
        .bind(delay_ms)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to settle email outbox row")?;

    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    jitter_delay(delay.min(max))
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    // Uniform in [delay/2, delay] so retries from one burst spread out.
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_sender_accepts_message() {
        let message = EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: "verify_email".to_string(),
            payload_json: r#"{"code":"12345678"}"#.to_string(),
        };
        assert!(LogEmailSender.send(&message).is_ok());
    }

    #[test]
    fn config_builders_clamp_to_sane_floors() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        // Jitter keeps each delay within [half, full] of the capped value.
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt, base, max);
            assert!(delay <= max);
            assert!(delay >= Duration::from_millis(2));
        }
        let late = backoff_delay(32, base, max);
        assert!(late >= max / 2 && late <= max);
    }

    #[test]
    fn jitter_keeps_tiny_delays_intact() {
        assert_eq!(jitter_delay(Duration::from_millis(1)), Duration::from_millis(1));
    }
}
