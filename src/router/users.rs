//! Principal profile endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use crate::AppState;
use crate::ServerError;
use crate::error::Result;
use crate::guard;
use crate::user::{Summary, User};

/// Handler returning a profile. Owner or ADMIN only.
pub async fn get(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(user_id): Path<String>,
) -> Result<Json<Summary>> {
    guard::require_self(&user, &user_id)?;

    let target = state
        .stores
        .users
        .find_by_id(&user_id)
        .await?
        .ok_or(ServerError::NotFound)?;

    Ok(Json(target.summary()))
}

/// Handler deactivating a principal. Soft delete: the row stays, the
/// account stops authenticating.
pub async fn deactivate(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(user_id): Path<String>,
) -> Result<StatusCode> {
    guard::require_self(&user, &user_id)?;

    if !state.stores.users.set_active(&user_id, false).await? {
        return Err(ServerError::NotFound);
    }

    Ok(StatusCode::NO_CONTENT)
}
