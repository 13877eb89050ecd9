use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use jsonwebtoken::{DecodingKey, Validation, decode};

use nest_types::api::Claims;
use nest_types::models::User;

use crate::auth::{AppState, user_from_row};
use crate::error::ApiError;

/// The authenticated account, attached to the request by [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// Extract and validate the bearer JWT, then load the account it names.
///
/// The account is re-read on every request so role changes and deactivation
/// apply immediately rather than when the token expires.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or_else(ApiError::unauthenticated)?;

    let token_data = decode::<Claims>(
        bearer.token(),
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("Given token not valid for any token type".into()))?;

    let account = state
        .db
        .get_account_by_id(&token_data.claims.sub.to_string())?
        .ok_or_else(|| ApiError::Unauthorized("User not found".into()))?;

    if !account.is_active {
        return Err(ApiError::Unauthorized("User is inactive".into()));
    }

    let user = user_from_row(&account)?;
    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}
