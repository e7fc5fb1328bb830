//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub registered_two_factor: bool,
    pub two_factor_verified: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyEmailRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpActivateRequest {
    /// Base32-encoded secret returned by the setup step.
    pub secret: String,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpSetupResponse {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpActivateResponse {
    /// Shown exactly once; only a hash is kept server-side.
    pub recovery_code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpVerifyRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RecoveryRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RecoveryResponse {
    pub recovery_code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResetVerifyEmailRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResetTotpRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResetPasswordRequest {
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OAuthStartRequest {
    /// Whether the flow should create an account when none exists.
    pub intent: String,
    pub callback_url: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct OAuthStartResponse {
    pub authorize_url: String,
    pub state: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChangeEmailRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Single-field message body used by auth flows for user-facing outcomes.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
