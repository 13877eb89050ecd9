//! Database row types. These map directly to SQLite rows and stay
//! distinct from the nest-types API models to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub role: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_otp_verified: bool,
    pub date_joined: String,
}

/// Insert payload for `accounts`. `password` is the already hashed value.
#[derive(Debug)]
pub struct NewAccount<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub password: &'a str,
    pub role: &'a str,
    pub is_active: bool,
    pub is_staff: bool,
}

/// Timestamps are unix seconds.
#[derive(Debug, Clone)]
pub struct OtpDeviceRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub secret: String,
    pub confirmed: bool,
    pub last_challenge_at: Option<i64>,
    pub last_verified_step: Option<i64>,
    pub failure_count: u32,
    pub last_failure_at: Option<i64>,
}

impl OtpDeviceRow {
    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }
}

/// Outcome of one verification attempt against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheck {
    /// Refused without looking at the code.
    Throttled,
    /// The code's time step was consumed and the account activated.
    Accepted,
    /// Wrong, expired or already used code. Carries the failure count after
    /// recording this one.
    Rejected { failures: u32 },
}
