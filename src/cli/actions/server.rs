use crate::api::{
    self,
    handlers::auth::{AuthConfig, AuthState, OAuthProvider, RateLimits, TwoFactorConfig},
    EmailWorkerConfig,
};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub frontend_base_url: String,
    pub session_ttl_seconds: i64,
    pub verification_code_ttl_seconds: i64,
    pub resend_cooldown_seconds: i64,
    pub reset_session_ttl_seconds: i64,
    pub totp_issuer: String,
    pub totp_key: Option<SecretString>,
    pub recovery_pepper: Option<SecretString>,
    pub oauth_provider: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<SecretString>,
    pub oauth_authorize_url: Option<String>,
    pub oauth_token_url: Option<String>,
    pub oauth_redirect_url: Option<String>,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is inconsistent or the server fails
/// to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth_config = AuthConfig::new(args.frontend_base_url)
        .with_session_ttl_seconds(args.session_ttl_seconds)
        .with_verification_code_ttl_seconds(args.verification_code_ttl_seconds)
        .with_resend_cooldown_seconds(args.resend_cooldown_seconds)
        .with_reset_session_ttl_seconds(args.reset_session_ttl_seconds);

    let mut two_factor = TwoFactorConfig::new().with_issuer(args.totp_issuer);
    match args.totp_key.as_ref().map(decode_totp_key).transpose()? {
        Some(key) => {
            two_factor = two_factor.with_totp_key(Arc::new(key));
        }
        None => warn!("No TOTP key configured; two-factor enrollment is disabled"),
    }
    match args.recovery_pepper {
        Some(pepper) => {
            two_factor = two_factor
                .with_recovery_pepper(Arc::from(pepper.expose_secret().as_bytes().to_vec()));
        }
        None => warn!("No recovery pepper configured; recovery codes are disabled"),
    }

    let oauth = build_oauth_provider(
        args.oauth_provider,
        args.oauth_client_id,
        args.oauth_client_secret,
        args.oauth_authorize_url,
        args.oauth_token_url,
        args.oauth_redirect_url,
    )?;

    let auth_state = Arc::new(AuthState::new(
        auth_config,
        two_factor,
        oauth,
        RateLimits::new(),
    ));

    let email_config = EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.email_outbox_poll_seconds)
        .with_batch_size(args.email_outbox_batch_size)
        .with_max_attempts(args.email_outbox_max_attempts);

    api::new(args.port, args.dsn, auth_state, email_config).await
}

fn decode_totp_key(encoded: &SecretString) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.expose_secret().trim())
        .context("INGRESSO_TOTP_KEY is not valid base64")?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("INGRESSO_TOTP_KEY must decode to exactly 32 bytes"))
}

/// All-or-nothing: a partial OAuth configuration is a startup error rather
/// than a provider that fails at callback time.
fn build_oauth_provider(
    provider: Option<String>,
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    authorize_url: Option<String>,
    token_url: Option<String>,
    redirect_url: Option<String>,
) -> Result<Option<OAuthProvider>> {
    let fields = [
        provider.is_some(),
        client_id.is_some(),
        client_secret.is_some(),
        authorize_url.is_some(),
        token_url.is_some(),
        redirect_url.is_some(),
    ];
    if fields.iter().all(|present| !present) {
        return Ok(None);
    }
    if !fields.iter().all(|present| *present) {
        return Err(anyhow!(
            "Incomplete OAuth configuration: provider, client id/secret, authorize/token/redirect URLs must all be set"
        ));
    }

    // The checks above guarantee every field is present.
    match (
        provider,
        client_id,
        client_secret,
        authorize_url,
        token_url,
        redirect_url,
    ) {
        (Some(name), Some(id), Some(secret), Some(authorize), Some(token), Some(redirect)) => {
            Ok(Some(OAuthProvider::new(
                name, id, secret, authorize, token, redirect,
            )))
        }
        _ => Err(anyhow!("Incomplete OAuth configuration")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_totp_key_enforces_length() {
        let key = SecretString::from(base64::engine::general_purpose::STANDARD.encode([7u8; 32]));
        assert!(decode_totp_key(&key).is_ok());

        let short = SecretString::from(base64::engine::general_purpose::STANDARD.encode([7u8; 16]));
        assert!(decode_totp_key(&short).is_err());

        let garbage = SecretString::from("!!!".to_string());
        assert!(decode_totp_key(&garbage).is_err());
    }

    #[test]
    fn oauth_provider_is_all_or_nothing() {
        assert!(build_oauth_provider(None, None, None, None, None, None)
            .is_ok_and(|provider| provider.is_none()));

        let partial = build_oauth_provider(
            Some("google".to_string()),
            Some("client".to_string()),
            None,
            None,
            None,
            None,
        );
        assert!(partial.is_err());

        let complete = build_oauth_provider(
            Some("google".to_string()),
            Some("client".to_string()),
            Some(SecretString::from("secret".to_string())),
            Some("https://accounts.example/authorize".to_string()),
            Some("https://accounts.example/token".to_string()),
            Some("https://api.hub.example/v1/oauth/callback".to_string()),
        );
        assert!(complete.is_ok_and(|provider| provider.is_some()));
    }
}
