//! Registration of new principals.

use axum::{Json, extract::State, http::StatusCode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::AppState;
use crate::crypto;
use crate::error::Result;
use crate::router::Valid;
use crate::user::{Role, Summary, User};

fn validate_role(role: &Role) -> std::result::Result<(), ValidationError> {
    // Admin accounts are provisioned out of band, never self-registered.
    if *role == Role::Admin {
        return Err(ValidationError::new("invalid_role"));
    }

    Ok(())
}

fn email_in_use() -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    errors.add(
        "email",
        ValidationError::new("email_in_use")
            .with_message("Email is already in use.".into()),
    );
    errors
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(length(
        min = 1,
        max = 120,
        message = "Name must not be empty."
    ))]
    pub name: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(
        min = 8,
        max = 255,
        message = "Password must contain at least 8 characters."
    ))]
    pub password: String,
    #[validate(custom(
        function = "validate_role",
        message = "Role must be DESIGNER or CLIENT."
    ))]
    pub role: Option<Role>,
}

/// Handler to create a principal.
pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<Summary>)> {
    if state
        .stores
        .users
        .find_by_email(&body.email)
        .await?
        .is_some()
    {
        return Err(email_in_use().into());
    }

    let password_hash =
        crypto::hash_password(&state.crypto, body.password).await?;

    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        email: body.email,
        name: body.name,
        password_hash: Some(password_hash),
        role: body.role.unwrap_or_default(),
        active: true,
        two_factor_enabled: false,
        two_factor_secret: None,
        two_factor_backup_codes: Vec::new(),
        created_at: Utc::now(),
    };
    state.stores.users.insert(&user).await?;

    Ok((StatusCode::CREATED, Json(user.summary())))
}
