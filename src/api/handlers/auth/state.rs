//! Auth state and configuration shared across handlers.

use std::sync::Arc;

use secrecy::SecretString;

use super::rate_limit::RateLimits;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_VERIFICATION_CODE_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;
const DEFAULT_RESET_SESSION_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_OAUTH_PENDING_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_TOTP_ISSUER: &str = "Ingresso";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    session_ttl_seconds: i64,
    verification_code_ttl_seconds: i64,
    resend_cooldown_seconds: i64,
    reset_session_ttl_seconds: i64,
    oauth_pending_ttl_seconds: i64,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            verification_code_ttl_seconds: DEFAULT_VERIFICATION_CODE_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            reset_session_ttl_seconds: DEFAULT_RESET_SESSION_TTL_SECONDS,
            oauth_pending_ttl_seconds: DEFAULT_OAUTH_PENDING_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_verification_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verification_code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.resend_cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_oauth_pending_ttl_seconds(mut self, seconds: i64) -> Self {
        self.oauth_pending_ttl_seconds = seconds;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(crate) fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    pub(super) fn verification_code_ttl_seconds(&self) -> i64 {
        self.verification_code_ttl_seconds
    }

    pub(super) fn resend_cooldown_seconds(&self) -> i64 {
        self.resend_cooldown_seconds
    }

    pub(super) fn reset_session_ttl_seconds(&self) -> i64 {
        self.reset_session_ttl_seconds
    }

    pub(super) fn oauth_pending_ttl_seconds(&self) -> i64 {
        self.oauth_pending_ttl_seconds
    }

    pub(super) fn session_cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

/// Two-factor configuration loaded at startup.
///
/// The recovery pepper feeds Argon2id hashing of recovery codes; the TOTP key
/// encrypts stored TOTP secrets. Both are required before two-factor routes
/// will do anything useful.
#[derive(Clone)]
pub struct TwoFactorConfig {
    issuer: String,
    recovery_pepper: Option<Arc<[u8]>>,
    totp_key: Option<Arc<[u8; 32]>>,
}

impl TwoFactorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer: DEFAULT_TOTP_ISSUER.to_string(),
            recovery_pepper: None,
            totp_key: None,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_recovery_pepper(mut self, pepper: Arc<[u8]>) -> Self {
        self.recovery_pepper = Some(pepper);
        self
    }

    #[must_use]
    pub fn with_totp_key(mut self, key: Arc<[u8; 32]>) -> Self {
        self.totp_key = Some(key);
        self
    }

    pub(super) fn issuer(&self) -> &str {
        &self.issuer
    }

    pub(crate) fn recovery_pepper(&self) -> Option<&[u8]> {
        self.recovery_pepper.as_deref()
    }

    pub(super) fn totp_key(&self) -> Option<&[u8; 32]> {
        self.totp_key.as_deref()
    }
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A single configured OAuth provider (authorization-code + PKCE).
#[derive(Clone)]
pub struct OAuthProvider {
    name: String,
    client_id: String,
    client_secret: SecretString,
    authorize_endpoint: String,
    token_endpoint: String,
    redirect_url: String,
}

impl OAuthProvider {
    #[must_use]
    pub fn new(
        name: String,
        client_id: String,
        client_secret: SecretString,
        authorize_endpoint: String,
        token_endpoint: String,
        redirect_url: String,
    ) -> Self {
        Self {
            name,
            client_id,
            client_secret,
            authorize_endpoint,
            token_endpoint,
            redirect_url,
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(super) fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }

    pub(super) fn authorize_endpoint(&self) -> &str {
        &self.authorize_endpoint
    }

    pub(super) fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    pub(super) fn redirect_url(&self) -> &str {
        &self.redirect_url
    }
}

pub struct AuthState {
    config: AuthConfig,
    two_factor: TwoFactorConfig,
    oauth: Option<OAuthProvider>,
    limits: RateLimits,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        two_factor: TwoFactorConfig,
        oauth: Option<OAuthProvider>,
        limits: RateLimits,
    ) -> Self {
        Self {
            config,
            two_factor,
            oauth,
            limits,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn two_factor(&self) -> &TwoFactorConfig {
        &self.two_factor
    }

    pub(super) fn oauth(&self) -> Option<&OAuthProvider> {
        self.oauth.as_ref()
    }

    pub(crate) fn limits(&self) -> &RateLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_config_defaults_and_overrides() {
        let config = AuthConfig::new("https://hub.example".to_string());

        assert_eq!(config.frontend_base_url(), "https://hub.example");
        assert_eq!(config.session_ttl_seconds(), DEFAULT_SESSION_TTL_SECONDS);
        assert_eq!(
            config.verification_code_ttl_seconds(),
            DEFAULT_VERIFICATION_CODE_TTL_SECONDS
        );
        assert_eq!(
            config.resend_cooldown_seconds(),
            DEFAULT_RESEND_COOLDOWN_SECONDS
        );
        assert!(config.session_cookie_secure());

        let config = config
            .with_session_ttl_seconds(60)
            .with_verification_code_ttl_seconds(120)
            .with_resend_cooldown_seconds(30)
            .with_reset_session_ttl_seconds(90)
            .with_oauth_pending_ttl_seconds(45);

        assert_eq!(config.session_ttl_seconds(), 60);
        assert_eq!(config.verification_code_ttl_seconds(), 120);
        assert_eq!(config.resend_cooldown_seconds(), 30);
        assert_eq!(config.reset_session_ttl_seconds(), 90);
        assert_eq!(config.oauth_pending_ttl_seconds(), 45);
    }

    #[test]
    fn plain_http_frontend_disables_secure_cookies() {
        let config = AuthConfig::new("http://localhost:3000".to_string());
        assert!(!config.session_cookie_secure());
    }

    #[test]
    fn two_factor_config_holds_secrets() {
        let pepper: Arc<[u8]> = Arc::from(b"pepper".as_slice());
        let key = Arc::new([7u8; 32]);
        let config = TwoFactorConfig::new()
            .with_issuer("Hub".to_string())
            .with_recovery_pepper(pepper)
            .with_totp_key(key);
        assert_eq!(config.issuer(), "Hub");
        assert_eq!(config.recovery_pepper(), Some(b"pepper".as_slice()));
        assert!(config.totp_key().is_some());
    }

    #[test]
    fn auth_state_constructs_without_oauth() {
        let state = AuthState::new(
            AuthConfig::new("https://hub.example".to_string()),
            TwoFactorConfig::new(),
            None,
            RateLimits::unlimited(),
        );
        assert!(state.oauth().is_none());
        assert!(state.limits().login_ip.check(&"1.2.3.4".to_string(), 1));
    }
}
