//! Role based access checks.
//!
//! [`RequireRole`] is an extractor: a handler taking `RequireRole<Admin>` only
//! runs for an authenticated admin. It must sit behind
//! [`require_auth`](crate::middleware::require_auth), which supplies the
//! authenticated account.

use std::marker::PhantomData;

use axum::{extract::FromRequestParts, http::request::Parts};

use nest_types::models::{Role, User};

use crate::error::ApiError;
use crate::middleware::CurrentUser;

/// Type-level role tag for [`RequireRole`].
pub trait RequiredRole: Send + Sync + 'static {
    const ROLE: Role;
}

pub struct Seeker;
pub struct Owner;
pub struct Manager;
pub struct Admin;

impl RequiredRole for Seeker {
    const ROLE: Role = Role::Seeker;
}

impl RequiredRole for Owner {
    const ROLE: Role = Role::Owner;
}

impl RequiredRole for Manager {
    const ROLE: Role = Role::Manager;
}

impl RequiredRole for Admin {
    const ROLE: Role = Role::Admin;
}

/// True when there is an authenticated user holding exactly `role`.
pub fn has_role(user: Option<&User>, role: Role) -> bool {
    user.is_some_and(|user| user.role == role)
}

pub struct RequireRole<R: RequiredRole>(pub User, PhantomData<R>);

impl<R: RequiredRole> RequireRole<R> {
    pub fn user(&self) -> &User {
        &self.0
    }
}

impl<S, R> FromRequestParts<S> for RequireRole<R>
where
    S: Send + Sync,
    R: RequiredRole,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(ApiError::unauthenticated)?;

        if !has_role(Some(&user), R::ROLE) {
            return Err(ApiError::permission_denied());
        }

        Ok(RequireRole(user, PhantomData))
    }
}

pub type AdminOnly = RequireRole<Admin>;
