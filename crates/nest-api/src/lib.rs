pub mod admin;
pub mod auth;
pub mod error;
pub mod guard;
pub mod mailer;
pub mod middleware;
pub mod otp;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, patch, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// All API routes, without transport layers (CORS, tracing).
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/v1/auth/users", post(auth::register))
        .route("/api/v1/auth/jwt/create", post(auth::login))
        .route("/api/v1/otp/send", post(otp::send_otp))
        .route("/api/v1/otp/verify", post(otp::verify_otp));

    let protected_routes = Router::new()
        .route("/api/v1/auth/users/me", get(auth::me))
        .route("/api/v1/admin/users/{user_id}/role", patch(admin::change_user_role))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
