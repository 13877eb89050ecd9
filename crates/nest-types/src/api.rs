use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Role;

// -- JWT Claims --

/// Access token claims. The role is informational only: authorization always
/// reloads the account, so a role change applies on the next request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
    pub exp: usize,
}

// -- Status --

/// Body of every status response, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    pub detail: String,
}

impl Detail {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    /// Free-form so an unknown value can be answered with a validation error.
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access: String,
}

// -- OTP --

// Fields are optional so absent values map to the endpoint's own 400 message.

#[derive(Debug, Default, Deserialize)]
pub struct SendOtpRequest {
    pub email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyOtpRequest {
    pub email: Option<String>,
    pub otp: Option<String>,
}

// -- Admin --

#[derive(Debug, Default, Deserialize)]
pub struct ChangeRoleRequest {
    pub role: Option<String>,
}
