//! Integration tests for the ingresso service.
//!
//! These tests need a reachable Postgres superuser DSN in
//! `INGRESSO_TEST_DSN`; without it they skip. Each run provisions a throwaway
//! database, applies the migrations, mounts the real router, and drives it
//! over HTTP.

use anyhow::{Context, Result};
use axum::Extension;
use ingresso::api;
use ingresso::api::handlers::auth::{AuthConfig, AuthState, RateLimits, TwoFactorConfig};
use reqwest::StatusCode;
use sqlx::{postgres::PgPoolOptions, Connection, PgConnection, PgPool};
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use uuid::Uuid;

const MIGRATIONS: &[&str] = &[
    include_str!("../migrations/0001_users.sql"),
    include_str!("../migrations/0002_two_factor.sql"),
    include_str!("../migrations/0003_password_reset.sql"),
    include_str!("../migrations/0004_oauth.sql"),
    include_str!("../migrations/0005_email_outbox.sql"),
];

struct TestServer {
    base_url: String,
    pool: PgPool,
}

async fn provision_database(admin_dsn: &str) -> Result<String> {
    let db_name = format!("ingresso_it_{}", Uuid::new_v4().simple());
    let mut admin = PgConnection::connect(admin_dsn)
        .await
        .context("failed to connect to admin DSN")?;
    sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
        .execute(&mut admin)
        .await
        .context("failed to create test database")?;

    let base = admin_dsn.rsplit_once('/').map_or(admin_dsn, |(base, _)| base);
    Ok(format!("{base}/{db_name}"))
}

async fn start_server(dsn: &str, session_ttl_seconds: i64) -> Result<TestServer> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(dsn)
        .await
        .context("failed to connect to test database")?;

    for migration in MIGRATIONS {
        sqlx::raw_sql(migration)
            .execute(&pool)
            .await
            .context("failed to apply migration")?;
    }

    let auth_state = Arc::new(AuthState::new(
        AuthConfig::new("http://localhost:3000".to_string())
            .with_session_ttl_seconds(session_ttl_seconds),
        TwoFactorConfig::new(),
        None,
        RateLimits::unlimited(),
    ));

    let (router, _openapi) = api::router().split_for_parts();
    let app = router
        .layer(Extension(auth_state))
        .layer(Extension(pool.clone()));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind test listener")?;
    let addr = listener.local_addr().context("missing local addr")?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });

    Ok(TestServer {
        base_url: format!("http://{addr}"),
        pool,
    })
}

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .context("failed to build HTTP client")
}

#[tokio::test]
async fn signup_session_logout_round_trip() -> Result<()> {
    let Ok(admin_dsn) = env::var("INGRESSO_TEST_DSN") else {
        eprintln!("skipping: INGRESSO_TEST_DSN not set");
        return Ok(());
    };
    let dsn = provision_database(&admin_dsn).await?;
    let server = start_server(&dsn, 3600).await?;
    let client = client()?;

    // Health is up before any account exists.
    let health = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await?;
    assert_eq!(health.status(), StatusCode::OK);

    // No cookie yet: no session.
    let none = client
        .get(format!("{}/v1/auth/session", server.base_url))
        .send()
        .await?;
    assert_eq!(none.status(), StatusCode::NO_CONTENT);

    // Signup issues a session cookie.
    let signup = client
        .post(format!("{}/v1/auth/signup", server.base_url))
        .json(&serde_json::json!({
            "email": "alice@example.com",
            "password": "correct horse battery",
        }))
        .send()
        .await?;
    assert_eq!(signup.status(), StatusCode::OK);

    let session = client
        .get(format!("{}/v1/auth/session", server.base_url))
        .send()
        .await?;
    assert_eq!(session.status(), StatusCode::OK);
    let body: serde_json::Value = session.json().await?;
    assert_eq!(body["email"], "alice@example.com");
    assert_eq!(body["email_verified"], false);
    assert_eq!(body["two_factor_verified"], false);

    // Account mutations are forbidden before the email is verified.
    let change = client
        .post(format!("{}/v1/account/email", server.base_url))
        .json(&serde_json::json!({"email": "new@example.com"}))
        .send()
        .await?;
    assert_eq!(change.status(), StatusCode::FORBIDDEN);
    let body: serde_json::Value = change.json().await?;
    assert_eq!(body["message"], "Forbidden");

    // Logout clears the session.
    let logout = client
        .post(format!("{}/v1/auth/logout", server.base_url))
        .send()
        .await?;
    assert_eq!(logout.status(), StatusCode::NO_CONTENT);

    let after = client
        .get(format!("{}/v1/auth/session", server.base_url))
        .send()
        .await?;
    assert_eq!(after.status(), StatusCode::NO_CONTENT);

    Ok(())
}

#[tokio::test]
async fn login_rejects_wrong_password_and_unknown_account_alike() -> Result<()> {
    let Ok(admin_dsn) = env::var("INGRESSO_TEST_DSN") else {
        eprintln!("skipping: INGRESSO_TEST_DSN not set");
        return Ok(());
    };
    let dsn = provision_database(&admin_dsn).await?;
    let server = start_server(&dsn, 3600).await?;
    let client = client()?;

    let signup = client
        .post(format!("{}/v1/auth/signup", server.base_url))
        .json(&serde_json::json!({
            "email": "bob@example.com",
            "password": "correct horse battery",
        }))
        .send()
        .await?;
    assert_eq!(signup.status(), StatusCode::OK);

    let wrong_password = client
        .post(format!("{}/v1/auth/login", server.base_url))
        .json(&serde_json::json!({
            "email": "bob@example.com",
            "password": "wrong horse battery",
        }))
        .send()
        .await?;
    let unknown_account = client
        .post(format!("{}/v1/auth/login", server.base_url))
        .json(&serde_json::json!({
            "email": "nobody@example.com",
            "password": "correct horse battery",
        }))
        .send()
        .await?;

    assert_eq!(wrong_password.status(), StatusCode::BAD_REQUEST);
    assert_eq!(unknown_account.status(), StatusCode::BAD_REQUEST);
    // Same message either way, so the endpoint cannot confirm accounts.
    assert_eq!(wrong_password.text().await?, unknown_account.text().await?);

    Ok(())
}

#[tokio::test]
async fn expired_session_validates_to_nothing_and_row_is_removed() -> Result<()> {
    let Ok(admin_dsn) = env::var("INGRESSO_TEST_DSN") else {
        eprintln!("skipping: INGRESSO_TEST_DSN not set");
        return Ok(());
    };
    let dsn = provision_database(&admin_dsn).await?;
    // Zero TTL: sessions are born expired.
    let server = start_server(&dsn, 0).await?;
    let client = client()?;

    let signup = client
        .post(format!("{}/v1/auth/signup", server.base_url))
        .json(&serde_json::json!({
            "email": "dave@example.com",
            "password": "correct horse battery",
        }))
        .send()
        .await?;
    assert_eq!(signup.status(), StatusCode::OK);

    // The cookie is presented but the session has already lapsed.
    let session = client
        .get(format!("{}/v1/auth/session", server.base_url))
        .send()
        .await?;
    assert_eq!(session.status(), StatusCode::NO_CONTENT);

    // Validation also pruned the expired row.
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
        .fetch_one(&server.pool)
        .await?;
    assert_eq!(remaining, 0);

    Ok(())
}

#[tokio::test]
async fn duplicate_signup_is_rejected() -> Result<()> {
    let Ok(admin_dsn) = env::var("INGRESSO_TEST_DSN") else {
        eprintln!("skipping: INGRESSO_TEST_DSN not set");
        return Ok(());
    };
    let dsn = provision_database(&admin_dsn).await?;
    let server = start_server(&dsn, 3600).await?;

    for expected in [StatusCode::OK, StatusCode::BAD_REQUEST] {
        let client = client()?;
        let signup = client
            .post(format!("{}/v1/auth/signup", server.base_url))
            .json(&serde_json::json!({
                "email": "carol@example.com",
                "password": "correct horse battery",
            }))
            .send()
            .await?;
        assert_eq!(signup.status(), expected);
    }

    Ok(())
}
