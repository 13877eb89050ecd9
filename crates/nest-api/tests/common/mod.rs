//! Shared harness for the HTTP tests: in-memory database, recording mailer
//! and helpers that walk accounts through registration and activation.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;
use uuid::Uuid;

use nest_api::auth::{AppState, AppStateInner, bootstrap_admin};
use nest_api::mailer::{Mailer, OutgoingEmail};
use nest_api::otp::OtpSettings;
use nest_api::router;
use nest_db::Database;
use nest_types::api::TokenResponse;
use nest_types::models::User;

pub const TEST_JWT_SECRET: &str = "test-jwt-secret-key-for-local-development";
pub const TEST_PASSWORD: &str = "s3cure-passw0rd";

/// Keeps every message instead of delivering it.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    /// The six digit code in the most recent message to `to`.
    pub fn last_code_for(&self, to: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|email| email.to == to)
            .and_then(|email| {
                email
                    .body
                    .split_whitespace()
                    .find(|word| word.len() == 6 && word.chars().all(|c| c.is_ascii_digit()))
                    .map(str::to_string)
            })
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

/// Simulates a relay that refuses every message.
pub struct FailingMailer;

#[async_trait]
impl Mailer for FailingMailer {
    async fn send(&self, _email: OutgoingEmail) -> Result<()> {
        Err(anyhow!("connection refused"))
    }
}

/// No cooldown and no throttling, so tests can send and verify freely.
pub fn relaxed_otp_settings() -> OtpSettings {
    OtpSettings {
        step_secs: 300,
        skew_steps: 1,
        cooldown_secs: 0,
        throttle_factor_secs: 0,
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub mailer: Arc<RecordingMailer>,
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(relaxed_otp_settings())
}

pub fn spawn_app_with(otp: OtpSettings) -> TestApp {
    let mailer = Arc::new(RecordingMailer::default());
    let state = build_state(otp, mailer.clone());
    let server = TestServer::new(router(state.clone())).unwrap();

    TestApp {
        server,
        state,
        mailer,
    }
}

pub fn build_state(otp: OtpSettings, mailer: Arc<dyn Mailer>) -> AppState {
    Arc::new(AppStateInner {
        db: Database::open_in_memory().unwrap(),
        jwt_secret: TEST_JWT_SECRET.to_string(),
        access_token_ttl: chrono::Duration::minutes(15),
        otp,
        mailer,
        platform_name: "Nest".to_string(),
    })
}

impl TestApp {
    /// Register an inactive account with the given role.
    pub async fn register(&self, email: &str, role: &str) -> User {
        let response = self
            .server
            .post("/api/v1/auth/users")
            .json(&json!({
                "email": email,
                "first_name": "Test",
                "last_name": "User",
                "password": TEST_PASSWORD,
                "role": role,
            }))
            .await;
        response.assert_status(StatusCode::CREATED);
        response.json::<User>()
    }

    pub async fn send_otp(&self, email: &str) -> StatusCode {
        self.server
            .post("/api/v1/otp/send")
            .json(&json!({ "email": email }))
            .await
            .status_code()
    }

    pub async fn verify_otp(&self, email: &str, otp: &str) -> StatusCode {
        self.server
            .post("/api/v1/otp/verify")
            .json(&json!({ "email": email, "otp": otp }))
            .await
            .status_code()
    }

    /// Register, then activate through the emailed code.
    pub async fn active_user(&self, email: &str, role: &str) -> User {
        let user = self.register(email, role).await;
        assert_eq!(self.send_otp(email).await, StatusCode::OK);
        let code = self.mailer.last_code_for(email).expect("OTP email sent");
        assert_eq!(self.verify_otp(email, &code).await, StatusCode::OK);
        user
    }

    pub async fn login(&self, email: &str, password: &str) -> String {
        let response = self
            .server
            .post("/api/v1/auth/jwt/create")
            .json(&json!({ "email": email, "password": password }))
            .await;
        response.assert_status_ok();
        response.json::<TokenResponse>().access
    }

    pub async fn admin_token(&self, email: &str) -> String {
        bootstrap_admin(&self.state.db, email, TEST_PASSWORD).unwrap();
        self.login(email, TEST_PASSWORD).await
    }

    pub fn account_active(&self, id: Uuid) -> bool {
        self.state
            .db
            .get_account_by_id(&id.to_string())
            .unwrap()
            .expect("account exists")
            .is_active
    }
}
