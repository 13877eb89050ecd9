use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::WithRejection;
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{info, warn};
use uuid::Uuid;

use nest_db::Database;
use nest_db::models::{AccountRow, NewAccount};
use nest_types::api::{Claims, RegisterRequest, TokenRequest, TokenResponse};
use nest_types::models::{Role, User};

use crate::error::ApiError;
use crate::mailer::Mailer;
use crate::middleware::CurrentUser;
use crate::otp::OtpSettings;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    pub access_token_ttl: chrono::Duration,
    pub otp: OtpSettings,
    pub mailer: Arc<dyn Mailer>,
    pub platform_name: String,
}

const NAME_MAX_LEN: usize = 100;
const PASSWORD_MIN_LEN: usize = 8;
const BAD_CREDENTIALS: &str = "No active account found with the given credentials";

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        return Err(ApiError::BadRequest("Enter a valid email address.".into()));
    }

    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();
    for (field, value) in [("first_name", first_name), ("last_name", last_name)] {
        if value.is_empty() || value.chars().count() > NAME_MAX_LEN {
            return Err(ApiError::BadRequest(format!(
                "{} must be between 1 and {} characters.",
                field, NAME_MAX_LEN
            )));
        }
    }

    if req.password.chars().count() < PASSWORD_MIN_LEN {
        return Err(ApiError::BadRequest(format!(
            "This password is too short. It must contain at least {} characters.",
            PASSWORD_MIN_LEN
        )));
    }

    let role = match req.role.as_deref() {
        None => Role::default(),
        Some(raw) => raw
            .parse::<Role>()
            .map_err(|_| ApiError::BadRequest(format!("\"{}\" is not a valid choice.", raw)))?,
    };

    let password_hash = hash_password(&req.password)?;
    let user_id = Uuid::new_v4();

    let created = state.db.create_account(&NewAccount {
        id: &user_id.to_string(),
        email: &email,
        first_name,
        last_name,
        password: &password_hash,
        role: role.as_str(),
        is_active: false,
        is_staff: false,
    })?;
    if !created {
        return Err(ApiError::BadRequest(
            "user with this email address already exists.".into(),
        ));
    }

    info!(%user_id, %role, "Account registered");

    Ok((
        StatusCode::CREATED,
        Json(User {
            id: user_id,
            email,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            role,
        }),
    ))
}

/// Issue an access token. Inactive accounts are refused like bad passwords.
pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<TokenRequest>, ApiError>,
) -> Result<Json<TokenResponse>, ApiError> {
    let email = normalize_email(&req.email);
    let account = state
        .db
        .get_account_by_email(&email)?
        .ok_or_else(|| ApiError::Unauthorized(BAD_CREDENTIALS.into()))?;

    if !verify_password(&req.password, &account.password)? || !account.is_active {
        warn!(user_id = %account.id, "Token request refused");
        return Err(ApiError::Unauthorized(BAD_CREDENTIALS.into()));
    }

    let user = user_from_row(&account)?;
    let access = create_token(&state.jwt_secret, state.access_token_ttl, &user)?;

    Ok(Json(TokenResponse { access }))
}

pub async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<User> {
    Json(user)
}

/// Make sure an active admin account exists for `email`, creating it with
/// `password` or promoting the existing account.
pub fn bootstrap_admin(db: &Database, email: &str, password: &str) -> anyhow::Result<()> {
    let email = normalize_email(email);

    if let Some(account) = db.get_account_by_email(&email)? {
        db.promote_to_admin(&account.id)?;
        info!(user_id = %account.id, "Existing account promoted to admin");
        return Ok(());
    }

    let user_id = Uuid::new_v4().to_string();
    let password_hash = hash_password(password)?;
    let created = db.create_account(&NewAccount {
        id: &user_id,
        email: &email,
        first_name: "Admin",
        last_name: "User",
        password: &password_hash,
        role: Role::Admin.as_str(),
        is_active: true,
        is_staff: true,
    })?;
    if !created {
        anyhow::bail!("Admin account {} was registered concurrently, restart to promote it", email);
    }

    info!(%user_id, "Admin account created");
    Ok(())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();
    Ok(hash)
}

fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Corrupt password hash: {}", e))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn create_token(secret: &str, ttl: chrono::Duration, user: &User) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user.id,
        email: user.email.clone(),
        role: user.role,
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub(crate) fn user_from_row(row: &AccountRow) -> anyhow::Result<User> {
    Ok(User {
        id: row
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("Corrupt account id '{}': {}", row.id, e))?,
        email: row.email.clone(),
        first_name: row.first_name.clone(),
        last_name: row.last_name.clone(),
        role: row.role.parse()?,
    })
}
