use axum::{
    Json,
    extract::{Path, State},
};
use axum_extra::extract::WithRejection;
use tracing::info;
use uuid::Uuid;

use nest_types::api::{ChangeRoleRequest, Detail};
use nest_types::models::Role;

use crate::auth::{AppState, user_from_row};
use crate::error::ApiError;
use crate::guard::AdminOnly;

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("Internal server error: {}", e))
}

/// Change another account's role. Admins only.
pub async fn change_user_role(
    State(state): State<AppState>,
    admin: AdminOnly,
    WithRejection(Path(user_id), _): WithRejection<Path<Uuid>, ApiError>,
    WithRejection(Json(req), _): WithRejection<Json<ChangeRoleRequest>, ApiError>,
) -> Result<Json<Detail>, ApiError> {
    let target_id = user_id.to_string();

    let target = state
        .db
        .get_account_by_id(&target_id)
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    let target = user_from_row(&target).map_err(internal)?;

    let new_role = req
        .role
        .as_deref()
        .and_then(|raw| raw.parse::<Role>().ok())
        .ok_or_else(|| ApiError::BadRequest("Invalid role".into()))?;

    if !state
        .db
        .update_account_role(&target_id, new_role.as_str())
        .map_err(internal)?
    {
        return Err(ApiError::NotFound("User not found".into()));
    }

    info!(
        admin_id = %admin.user().id,
        %user_id,
        name = %target.full_name(),
        from = target.role.label(),
        to = new_role.label(),
        "Role changed"
    );

    Ok(Json(Detail::new(format!("Role successfully updated to {}", new_role))))
}
