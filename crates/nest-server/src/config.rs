use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use nest_api::mailer::SmtpSettings;
use nest_api::otp::OtpSettings;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub access_token_minutes: i64,
    pub platform_name: String,
    pub otp: OtpSettings,
    /// Without SMTP settings mail goes to the log.
    pub smtp: Option<SmtpSettings>,
    pub admin: Option<AdminBootstrap>,
}

#[derive(Debug, Clone)]
pub struct AdminBootstrap {
    pub email: String,
    pub password: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = get("NEST_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("NEST_JWT_SECRET is unset or still a placeholder");
        }

        let otp = OtpSettings {
            step_secs: parse_or(&get, "NEST_OTP_STEP_SECS", 300)?,
            skew_steps: parse_or(&get, "NEST_OTP_SKEW_STEPS", 1)?,
            cooldown_secs: parse_or(&get, "NEST_OTP_COOLDOWN_SECS", 60)?,
            throttle_factor_secs: parse_or(&get, "NEST_OTP_THROTTLE_FACTOR_SECS", 1)?,
        };
        if otp.step_secs == 0 {
            bail!("NEST_OTP_STEP_SECS must be positive");
        }

        let access_token_minutes: i64 = parse_or(&get, "NEST_ACCESS_TOKEN_MINUTES", 60)?;
        if access_token_minutes <= 0 {
            bail!("NEST_ACCESS_TOKEN_MINUTES must be positive");
        }

        let smtp = match get("NEST_SMTP_HOST") {
            Some(host) => {
                let username = get("NEST_SMTP_USERNAME");
                let from = get("NEST_EMAIL_FROM")
                    .or_else(|| username.clone())
                    .context("NEST_EMAIL_FROM is required when NEST_SMTP_HOST is set")?;
                Some(SmtpSettings {
                    host,
                    port: parse_or(&get, "NEST_SMTP_PORT", 587)?,
                    username,
                    password: get("NEST_SMTP_PASSWORD"),
                    from,
                })
            }
            None => None,
        };

        let admin = match (get("NEST_ADMIN_EMAIL"), get("NEST_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminBootstrap { email, password }),
            (None, None) => None,
            _ => bail!("NEST_ADMIN_EMAIL and NEST_ADMIN_PASSWORD must be set together"),
        };

        Ok(Self {
            host: get("NEST_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "NEST_PORT", 8000)?,
            db_path: get("NEST_DB_PATH").unwrap_or_else(|| "nest.db".into()).into(),
            jwt_secret,
            access_token_minutes,
            platform_name: get("NEST_PLATFORM_NAME").unwrap_or_else(|| "Nest".into()),
            otp,
            smtp,
            admin,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}
