//! Session listing and revocation for the authenticated principal.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::AppState;
use crate::ServerError;
use crate::error::Result;
use crate::middleware::AuthContext;
use crate::session::SessionRecord;
use crate::user::User;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    active: Option<bool>,
}

/// Handler listing the caller's own sessions, newest first.
pub async fn list(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionRecord>>> {
    let sessions = state
        .sessions
        .list(&context.user.id, query.active)
        .await?;

    Ok(Json(sessions))
}

/// Handler revoking one session. Sessions of other principals read as
/// missing so their existence is never leaked; ADMIN may revoke any.
pub async fn revoke(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    match state.sessions.get(&session_id).await? {
        Some(session)
            if session.owner_id == user.id || user.is_admin() =>
        {
            state.sessions.revoke(&session_id).await?;
            Ok(StatusCode::NO_CONTENT)
        },
        _ => Err(ServerError::NotFound),
    }
}
