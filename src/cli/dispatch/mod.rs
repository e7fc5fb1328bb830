//! Command-line argument dispatch and server initialization.
//!
//! This module parses validated CLI arguments and maps them to the
//! appropriate action, such as starting the API server with its full
//! configuration state.

use crate::cli::actions::{server::Args, Action};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let frontend_base_url = matches
        .get_one::<String>("frontend-base-url")
        .cloned()
        .context("missing required argument: --frontend-base-url")?;

    let secret = |name: &str| {
        matches
            .get_one::<String>(name)
            .map(|value| SecretString::from(value.clone()))
    };

    Ok(Action::Server(Args {
        port,
        dsn,
        frontend_base_url,
        session_ttl_seconds: matches
            .get_one::<i64>("session-ttl-seconds")
            .copied()
            .unwrap_or(43200),
        verification_code_ttl_seconds: matches
            .get_one::<i64>("verification-code-ttl-seconds")
            .copied()
            .unwrap_or(600),
        resend_cooldown_seconds: matches
            .get_one::<i64>("resend-cooldown-seconds")
            .copied()
            .unwrap_or(60),
        reset_session_ttl_seconds: matches
            .get_one::<i64>("reset-session-ttl-seconds")
            .copied()
            .unwrap_or(600),
        totp_issuer: matches
            .get_one::<String>("totp-issuer")
            .cloned()
            .unwrap_or_else(|| "Ingresso".to_string()),
        totp_key: secret("totp-key"),
        recovery_pepper: secret("recovery-pepper"),
        oauth_provider: matches.get_one::<String>("oauth-provider").cloned(),
        oauth_client_id: matches.get_one::<String>("oauth-client-id").cloned(),
        oauth_client_secret: secret("oauth-client-secret"),
        oauth_authorize_url: matches.get_one::<String>("oauth-authorize-url").cloned(),
        oauth_token_url: matches.get_one::<String>("oauth-token-url").cloned(),
        oauth_redirect_url: matches.get_one::<String>("oauth-redirect-url").cloned(),
        email_outbox_poll_seconds: matches
            .get_one::<u64>("email-outbox-poll-seconds")
            .copied()
            .unwrap_or(5),
        email_outbox_batch_size: matches
            .get_one::<usize>("email-outbox-batch-size")
            .copied()
            .unwrap_or(10),
        email_outbox_max_attempts: matches
            .get_one::<u32>("email-outbox-max-attempts")
            .copied()
            .unwrap_or(5),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::actions::Action;

    #[test]
    fn handler_builds_server_action_from_args() {
        temp_env::with_vars(
            [
                ("INGRESSO_DSN", None::<&str>),
                ("INGRESSO_PORT", None),
                ("INGRESSO_SESSION_TTL_SECONDS", None),
            ],
            || {
                let command = crate::cli::commands::new();
                let matches = command.get_matches_from(vec![
                    "ingresso",
                    "--dsn",
                    "postgres://user@localhost:5432/ingresso",
                    "--port",
                    "9090",
                    "--session-ttl-seconds",
                    "120",
                ]);
                let Ok(Action::Server(args)) = handler(&matches) else {
                    panic!("expected a server action");
                };
                assert_eq!(args.port, 9090);
                assert_eq!(args.dsn, "postgres://user@localhost:5432/ingresso");
                assert_eq!(args.session_ttl_seconds, 120);
                assert!(args.oauth_provider.is_none());
                assert!(args.totp_key.is_none());
            },
        );
    }

    #[test]
    fn handler_collects_oauth_fields() {
        temp_env::with_vars([("INGRESSO_DSN", None::<&str>)], || {
            let command = crate::cli::commands::new();
            let matches = command.get_matches_from(vec![
                "ingresso",
                "--dsn",
                "postgres://user@localhost:5432/ingresso",
                "--oauth-provider",
                "google",
                "--oauth-client-id",
                "client",
                "--oauth-client-secret",
                "secret",
                "--oauth-authorize-url",
                "https://accounts.example/authorize",
                "--oauth-token-url",
                "https://accounts.example/token",
                "--oauth-redirect-url",
                "https://api.hub.example/v1/oauth/callback",
            ]);
            let Ok(Action::Server(args)) = handler(&matches) else {
                panic!("expected a server action");
            };
            assert_eq!(args.oauth_provider.as_deref(), Some("google"));
            assert!(args.oauth_client_secret.is_some());
        });
    }
}
