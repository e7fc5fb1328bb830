use super::handlers::{auth, health};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec. Routes added outside (like
/// `/`) are intentionally not documented.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path and add the
    // route to OpenAPI.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(auth::session::session))
        .routes(routes!(auth::session::logout))
        .routes(routes!(auth::password::signup))
        .routes(routes!(auth::password::login))
        .routes(routes!(auth::verification::verify_email))
        .routes(routes!(auth::verification::resend_verification))
        .routes(routes!(auth::twofactor::totp_setup))
        .routes(routes!(auth::twofactor::totp_activate))
        .routes(routes!(auth::twofactor::totp_verify))
        .routes(routes!(auth::twofactor::recovery))
        .routes(routes!(auth::reset::forgot_password))
        .routes(routes!(auth::reset::reset_verify_email))
        .routes(routes!(auth::reset::reset_totp))
        .routes(routes!(auth::reset::reset_password))
        .routes(routes!(auth::oauth::oauth_start))
        .routes(routes!(auth::oauth::oauth_callback))
        .routes(routes!(auth::account::change_email))
        .routes(routes!(auth::account::change_password));

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Signup, login, sessions, email verification".to_string());

    let mut two_factor_tag = Tag::new("two-factor");
    two_factor_tag.description = Some("TOTP enrollment, challenge, and recovery".to_string());

    let mut reset_tag = Tag::new("password-reset");
    reset_tag.description = Some("Staged password reset flow".to_string());

    let mut oauth_tag = Tag::new("oauth");
    oauth_tag.description = Some("Provider sign-in and signup".to_string());

    let mut account_tag = Tag::new("account");
    account_tag.description = Some("Authenticated account mutations".to_string());

    router.get_openapi_mut().tags = Some(vec![
        auth_tag,
        two_factor_tag,
        reset_tag,
        oauth_tag,
        account_tag,
    ]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    OpenApiBuilder::new().info(info).build()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn openapi_exposes_core_routes() {
        let spec = openapi();
        let paths = &spec.paths.paths;
        assert!(paths.contains_key("/health"));
        assert!(paths.contains_key("/v1/auth/session"));
        assert!(paths.contains_key("/v1/auth/login"));
        assert!(paths.contains_key("/v1/auth/verify-email"));
        assert!(paths.contains_key("/v1/auth/totp/verify"));
        assert!(paths.contains_key("/v1/auth/reset-password"));
        assert!(paths.contains_key("/v1/oauth/callback"));
        assert!(paths.contains_key("/v1/account/email"));
    }

    #[test]
    fn openapi_uses_cargo_metadata() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
    }
}
