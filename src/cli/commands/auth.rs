use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    let command = with_two_factor_args(command);
    let command = with_outbox_args(command);
    with_oauth_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Frontend base URL used for cookies, CORS, and redirects")
                .env("INGRESSO_FRONTEND_BASE_URL")
                .default_value("https://hub.ingresso.app"),
        )
        .arg(
            Arg::new("session-ttl-seconds")
                .long("session-ttl-seconds")
                .help("Session cookie TTL in seconds")
                .env("INGRESSO_SESSION_TTL_SECONDS")
                .default_value("43200")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("verification-code-ttl-seconds")
                .long("verification-code-ttl-seconds")
                .help("Email verification code TTL in seconds")
                .env("INGRESSO_VERIFICATION_CODE_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("resend-cooldown-seconds")
                .long("resend-cooldown-seconds")
                .help("Cooldown before reissuing verification emails")
                .env("INGRESSO_RESEND_COOLDOWN_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("reset-session-ttl-seconds")
                .long("reset-session-ttl-seconds")
                .help("Password reset session TTL in seconds")
                .env("INGRESSO_RESET_SESSION_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_two_factor_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("totp-issuer")
                .long("totp-issuer")
                .help("Issuer label shown in authenticator apps")
                .env("INGRESSO_TOTP_ISSUER")
                .default_value("Ingresso"),
        )
        .arg(
            Arg::new("totp-key")
                .long("totp-key")
                .help("Base64 32-byte key sealing stored TOTP secrets")
                .env("INGRESSO_TOTP_KEY"),
        )
        .arg(
            Arg::new("recovery-pepper")
                .long("recovery-pepper")
                .help("Server-side pepper for recovery code hashing")
                .env("INGRESSO_RECOVERY_PEPPER"),
        )
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("email-outbox-poll-seconds")
                .long("email-outbox-poll-seconds")
                .help("Email outbox poll interval in seconds")
                .env("INGRESSO_EMAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-batch-size")
                .long("email-outbox-batch-size")
                .help("Email outbox batch size per poll")
                .env("INGRESSO_EMAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("email-outbox-max-attempts")
                .long("email-outbox-max-attempts")
                .help("Max attempts before marking an email as failed")
                .env("INGRESSO_EMAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
}

fn with_oauth_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("oauth-provider")
                .long("oauth-provider")
                .help("Name of the configured OAuth provider (e.g. google)")
                .env("INGRESSO_OAUTH_PROVIDER"),
        )
        .arg(
            Arg::new("oauth-client-id")
                .long("oauth-client-id")
                .help("OAuth client id")
                .env("INGRESSO_OAUTH_CLIENT_ID"),
        )
        .arg(
            Arg::new("oauth-client-secret")
                .long("oauth-client-secret")
                .help("OAuth client secret")
                .env("INGRESSO_OAUTH_CLIENT_SECRET"),
        )
        .arg(
            Arg::new("oauth-authorize-url")
                .long("oauth-authorize-url")
                .help("Provider authorization endpoint")
                .env("INGRESSO_OAUTH_AUTHORIZE_URL"),
        )
        .arg(
            Arg::new("oauth-token-url")
                .long("oauth-token-url")
                .help("Provider token endpoint")
                .env("INGRESSO_OAUTH_TOKEN_URL"),
        )
        .arg(
            Arg::new("oauth-redirect-url")
                .long("oauth-redirect-url")
                .help("Redirect URL registered with the provider")
                .env("INGRESSO_OAUTH_REDIRECT_URL"),
        )
}
