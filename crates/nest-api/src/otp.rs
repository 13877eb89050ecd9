//! Email one-time passwords.
//!
//! Each account owns one device holding a random secret. Codes are TOTP
//! (HMAC-SHA1, 6 digits) over a configurable step, so nothing but the
//! device's bookkeeping is persisted between issuing and checking a code.

use axum::{Json, extract::State};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nest_db::models::{AccountRow, OtpCheck};
use nest_types::api::{Detail, SendOtpRequest, VerifyOtpRequest};

use crate::auth::{AppState, normalize_email};
use crate::error::ApiError;
use crate::mailer::OutgoingEmail;

/// Name of the single device every account gets.
pub const DEVICE_NAME: &str = "default";

const OTP_DIGITS: usize = 6;

const WAIT_MESSAGE: &str = "Please wait before requesting a new OTP";

/// Longest backoff exponent, keeps the delay arithmetic in range.
const MAX_THROTTLE_EXPONENT: u32 = 20;

#[derive(Debug, Clone)]
pub struct OtpSettings {
    /// Length of one TOTP window in seconds.
    pub step_secs: u64,
    /// How many windows before the current one still accept their code.
    pub skew_steps: u8,
    /// Minimum gap between two dispatched codes. 0 disables.
    pub cooldown_secs: u64,
    /// Base of the exponential lockout after failed checks. 0 disables.
    pub throttle_factor_secs: u64,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            step_secs: 300,
            skew_steps: 1,
            cooldown_secs: 60,
            throttle_factor_secs: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("Failed to generate secret: {0}")]
    SecretGeneration(String),
    #[error("Invalid device secret: {0}")]
    InvalidSecret(String),
    #[error("Failed to create TOTP: {0}")]
    TotpCreation(String),
}

impl From<OtpError> for ApiError {
    fn from(e: OtpError) -> Self {
        ApiError::Internal(format!("Internal error: {}", e))
    }
}

/// Fresh 160-bit secret, hex encoded for storage.
pub fn generate_secret() -> Result<String, OtpError> {
    let bytes = Secret::generate_secret()
        .to_bytes()
        .map_err(|e| OtpError::SecretGeneration(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// TOTP bound to one device secret.
pub struct EmailTotp {
    totp: TOTP,
    step_secs: u64,
    skew_steps: u8,
}

impl EmailTotp {
    pub fn new(secret_hex: &str, settings: &OtpSettings) -> Result<Self, OtpError> {
        if settings.step_secs == 0 {
            return Err(OtpError::TotpCreation("step must be at least one second".into()));
        }
        let secret = hex::decode(secret_hex).map_err(|e| OtpError::InvalidSecret(e.to_string()))?;

        // Skew is applied by `matching_step`, only towards the past.
        let totp = TOTP::new(Algorithm::SHA1, OTP_DIGITS, 0, settings.step_secs, secret)
            .map_err(|e| OtpError::TotpCreation(e.to_string()))?;

        Ok(Self {
            totp,
            step_secs: settings.step_secs,
            skew_steps: settings.skew_steps,
        })
    }

    pub fn step_at(&self, unix_secs: u64) -> u64 {
        unix_secs / self.step_secs
    }

    pub fn code_at(&self, unix_secs: u64) -> String {
        self.totp.generate(unix_secs)
    }

    /// The window whose code equals `code`, searching the current window and
    /// then up to `skew_steps` earlier ones.
    pub fn matching_step(&self, code: &str, unix_secs: u64) -> Option<u64> {
        let current = self.step_at(unix_secs);

        (0..=u64::from(self.skew_steps))
            .filter_map(|back| current.checked_sub(back))
            .find(|step| self.totp.check(code, step * self.step_secs))
    }
}

/// Whether the code of `current_step` was already used. Sending it again
/// would mail a code that can no longer be accepted.
pub fn step_consumed(last_verified_step: Option<i64>, current_step: u64) -> bool {
    last_verified_step.is_some_and(|last| i64::try_from(current_step).is_ok_and(|step| step <= last))
}

/// Seconds left before another code may be sent.
pub fn cooldown_remaining(last_challenge_at: Option<i64>, cooldown_secs: u64, now: i64) -> Option<i64> {
    let last = last_challenge_at?;
    let until = last.saturating_add(cooldown_secs as i64);
    (now < until).then(|| until - now)
}

/// Seconds left in the lockout following `failure_count` consecutive
/// failures. The delay doubles with every failure.
pub fn throttle_remaining(
    failure_count: u32,
    last_failure_at: Option<i64>,
    factor_secs: u64,
    now: i64,
) -> Option<i64> {
    if failure_count == 0 || factor_secs == 0 {
        return None;
    }
    let last = last_failure_at?;

    let exponent = (failure_count - 1).min(MAX_THROTTLE_EXPONENT);
    let delay = factor_secs.saturating_mul(1u64 << exponent);
    let until = last.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
    (now < until).then(|| until - now)
}

fn otp_email(platform_name: &str, account: &AccountRow, code: &str, settings: &OtpSettings) -> OutgoingEmail {
    let minutes = settings.step_secs.div_ceil(60).max(1);
    OutgoingEmail {
        to: account.email.clone(),
        subject: format!("Your {} verification code", platform_name),
        body: format!(
            "Hello {},\n\n\
             Your {} verification code is {}\n\
             It is valid for {} minutes.\n\n\
             If you did not request this code you can ignore this email.\n",
            account.first_name, platform_name, code, minutes
        ),
    }
}

pub async fn send_otp(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<SendOtpRequest>, ApiError>,
) -> Result<Json<Detail>, ApiError> {
    let email = req
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|email| !email.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Email is required".into()))?;

    let account = state
        .db
        .get_account_by_email(&email)?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    let device_id = Uuid::new_v4().to_string();
    let (mut device, created) = state
        .db
        .get_or_create_otp_device(&device_id, &account.id, DEVICE_NAME)?;
    if created {
        debug!(user_id = %account.id, device_id = %device.id, "OTP device created");
    }

    if !device.has_secret() {
        let secret = generate_secret()?;
        if state.db.set_otp_secret(&device.id, &secret)? {
            device.secret = secret;
        } else {
            // Another request stored one first; use theirs.
            device = state
                .db
                .get_or_create_otp_device(&device_id, &account.id, DEVICE_NAME)?
                .0;
        }
    }

    let now = Utc::now().timestamp();
    if let Some(wait) = cooldown_remaining(device.last_challenge_at, state.otp.cooldown_secs, now) {
        debug!(user_id = %account.id, wait, "OTP send refused during cooldown");
        return Err(ApiError::TooManyRequests(WAIT_MESSAGE.into()));
    }

    let totp = EmailTotp::new(&device.secret, &state.otp)?;
    if step_consumed(device.last_verified_step, totp.step_at(now as u64)) {
        debug!(user_id = %account.id, "OTP send refused until the next window");
        return Err(ApiError::TooManyRequests(WAIT_MESSAGE.into()));
    }
    let code = totp.code_at(now as u64);

    state
        .mailer
        .send(otp_email(&state.platform_name, &account, &code, &state.otp))
        .await?;
    state.db.record_otp_challenge(&device.id, now)?;

    info!(user_id = %account.id, "OTP dispatched");
    Ok(Json(Detail::new("OTP sent to your email")))
}

pub async fn verify_otp(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<VerifyOtpRequest>, ApiError>,
) -> Result<Json<Detail>, ApiError> {
    let email = req.email.as_deref().map(normalize_email).unwrap_or_default();
    let otp = req.otp.as_deref().map(str::trim).unwrap_or_default();
    if email.is_empty() || otp.is_empty() {
        return Err(ApiError::BadRequest("Email and OTP are required".into()));
    }

    let account = state
        .db
        .get_account_by_email(&email)?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;

    let device = state
        .db
        .get_confirmed_otp_device(&account.id, DEVICE_NAME)?
        .ok_or_else(|| ApiError::NotFound("OTP device not found".into()))?;

    let now = Utc::now().timestamp();
    let settings = &state.otp;

    let check = state.db.attempt_otp_verification(
        &device.id,
        now,
        |device| {
            throttle_remaining(
                device.failure_count,
                device.last_failure_at,
                settings.throttle_factor_secs,
                now,
            )
            .is_some()
        },
        |device| {
            if !device.has_secret() {
                return Ok(None);
            }
            let totp = EmailTotp::new(&device.secret, settings)?;
            Ok(totp.matching_step(otp, now as u64).map(|step| step as i64))
        },
    )?;

    match check {
        OtpCheck::Accepted => {
            info!(user_id = %account.id, "OTP verified");
            Ok(Json(Detail::new("OTP verified successfully")))
        }
        OtpCheck::Throttled => {
            warn!(user_id = %account.id, "OTP check refused while throttled");
            Err(ApiError::BadRequest("Invalid OTP".into()))
        }
        OtpCheck::Rejected { failures } => {
            warn!(user_id = %account.id, failures, "OTP verification failed");
            Err(ApiError::BadRequest("Invalid OTP".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OtpSettings {
        OtpSettings {
            step_secs: 300,
            skew_steps: 1,
            cooldown_secs: 60,
            throttle_factor_secs: 1,
        }
    }

    #[test]
    fn generated_secret_is_160_bits_hex() {
        let secret = generate_secret().unwrap();
        assert_eq!(secret.len(), 40);
        assert!(hex::decode(&secret).is_ok());
        assert_ne!(secret, generate_secret().unwrap());
    }

    #[test]
    fn code_is_six_digits_and_stable_within_a_window() {
        let totp = EmailTotp::new(&generate_secret().unwrap(), &settings()).unwrap();
        let start = 1_700_000_100;
        let code = totp.code_at(start);

        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(totp.step_at(start), totp.step_at(start + 99));
        assert_eq!(code, totp.code_at(start + 99));
    }

    #[test]
    fn accepts_current_and_previous_window_only() {
        let totp = EmailTotp::new(&generate_secret().unwrap(), &settings()).unwrap();
        let issued_at = 1_700_000_100;
        let code = totp.code_at(issued_at);
        let step = totp.step_at(issued_at);

        assert_eq!(totp.matching_step(&code, issued_at), Some(step));
        assert_eq!(totp.matching_step(&code, issued_at + 300), Some(step));
        assert_eq!(totp.matching_step(&code, issued_at + 600), None);
        // A code from the future is never accepted.
        assert_eq!(totp.matching_step(&code, issued_at - 300), None);
    }

    #[test]
    fn rejects_malformed_codes() {
        let totp = EmailTotp::new(&generate_secret().unwrap(), &settings()).unwrap();
        let now = 1_700_000_100;
        let code = totp.code_at(now);

        assert_eq!(totp.matching_step(&code[..5], now), None);
        assert_eq!(totp.matching_step(&format!("{}0", code), now), None);
        assert_eq!(totp.matching_step("abcdef", now), None);
    }

    #[test]
    fn rejects_bad_secrets() {
        assert!(matches!(
            EmailTotp::new("not hex", &settings()),
            Err(OtpError::InvalidSecret(_))
        ));
        // Too short for TOTP.
        assert!(matches!(
            EmailTotp::new("abcd", &settings()),
            Err(OtpError::TotpCreation(_))
        ));
    }

    #[test]
    fn resend_waits_for_a_fresh_window() {
        assert!(!step_consumed(None, 10));
        assert!(step_consumed(Some(10), 10));
        assert!(step_consumed(Some(10), 9));
        assert!(!step_consumed(Some(10), 11));
    }

    #[test]
    fn cooldown_counts_down_from_last_challenge() {
        assert_eq!(cooldown_remaining(None, 60, 1_000), None);
        assert_eq!(cooldown_remaining(Some(1_000), 60, 1_010), Some(50));
        assert_eq!(cooldown_remaining(Some(1_000), 60, 1_060), None);
        assert_eq!(cooldown_remaining(Some(1_000), 0, 1_000), None);
    }

    #[test]
    fn throttle_doubles_with_each_failure() {
        assert_eq!(throttle_remaining(0, Some(1_000), 1, 1_000), None);
        assert_eq!(throttle_remaining(1, Some(1_000), 1, 1_000), Some(1));
        assert_eq!(throttle_remaining(3, Some(1_000), 1, 1_000), Some(4));
        assert_eq!(throttle_remaining(3, Some(1_000), 1, 1_004), None);
        assert_eq!(throttle_remaining(3, Some(1_000), 0, 1_000), None);
        assert!(throttle_remaining(u32::MAX, Some(1_000), u64::MAX, 1_000).is_some());
    }
}
