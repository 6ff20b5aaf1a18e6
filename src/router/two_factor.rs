//! Two-factor lifecycle endpoints.

use axum::http::StatusCode;
use axum::{Extension, Json, extract::State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;
use crate::two_factor::{BACKUP_CODE_COUNT, Enrollment, Stats};
use crate::user::User;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CompleteBody {
    #[validate(length(min = 16, message = "Secret must be base32."))]
    secret: String,
    #[validate(length(equal = 6, message = "Code must have 6 digits."))]
    code: String,
    #[validate(length(equal = BACKUP_CODE_COUNT))]
    #[serde(rename = "backupCodes")]
    backup_codes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PasswordBody {
    #[validate(length(min = 1, message = "Password is required."))]
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCodes {
    backup_codes: Vec<String>,
}

/// Handler starting an enrollment; nothing persists until verified.
pub async fn begin(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Enrollment>> {
    Ok(Json(state.two_factor.begin_enrollment(&user.id).await?))
}

/// Handler committing an enrollment after the first code round-trips.
pub async fn complete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<CompleteBody>,
) -> Result<StatusCode> {
    state
        .two_factor
        .complete_enrollment(
            &user.id,
            &body.secret,
            &body.code,
            &body.backup_codes,
        )
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Handler disabling 2FA, gated on the account password.
pub async fn disable(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<PasswordBody>,
) -> Result<StatusCode> {
    state.two_factor.disable(&user.id, &body.password).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Handler replacing the backup-code set, gated on the account password.
pub async fn regenerate(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<PasswordBody>,
) -> Result<Json<BackupCodes>> {
    let backup_codes = state
        .two_factor
        .regenerate_backup_codes(&user.id, &body.password)
        .await?;

    Ok(Json(BackupCodes { backup_codes }))
}

/// Handler for enrollment totals. ADMIN only, enforced by the route layer.
pub async fn stats(State(state): State<AppState>) -> Result<Json<Stats>> {
    Ok(Json(state.two_factor.stats().await?))
}
