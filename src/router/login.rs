//! Login, second-factor completion and logout.

use axum::http::{HeaderMap, StatusCode};
use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Result;
use crate::middleware::AuthContext;
use crate::router::Valid;
use crate::two_factor::TwoFactorError;
use crate::user::{Summary, User};
use crate::{AppState, ServerError};

pub const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(email(message = "Email must be formatted."))]
    email: String,
    #[validate(length(
        min = 8,
        max = 255,
        message = "Password must contain at least 8 characters."
    ))]
    password: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct TwoFactorBody {
    #[validate(length(min = 1))]
    #[serde(rename = "principalId")]
    principal_id: String,
    #[validate(length(
        min = 6,
        max = 9,
        message = "Code must be a TOTP or backup code."
    ))]
    code: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    #[serde(rename_all = "camelCase")]
    Issued {
        token_type: String,
        token: String,
        expires_at: DateTime<Utc>,
        principal: Summary,
    },
    TwoFactorChallenge {
        #[serde(rename = "requires2fa")]
        requires_2fa: bool,
        #[serde(rename = "principalId")]
        principal_id: String,
    },
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_owned())
}

async fn issue_session(state: &AppState, user: &User) -> Result<Response> {
    let issued = state.sessions.issue(&user.id).await?;

    Ok(Response::Issued {
        token_type: TOKEN_TYPE.to_owned(),
        token: issued.composite,
        expires_at: issued.expires_at,
        principal: user.summary(),
    })
}

/// Handler for password login. Accounts with 2FA enabled get a challenge
/// instead of a session; [`verify_2fa`] completes the exchange.
pub async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Valid(body): Valid<Body>,
) -> Result<Json<Response>> {
    let ip = client_ip(&headers);

    // Unknown and deactivated accounts read exactly like a bad password.
    let user = state
        .stores
        .users
        .find_by_email(&body.email)
        .await?
        .filter(|user| user.active)
        .ok_or(ServerError::InvalidCredentials)?;

    if state.monitor.is_account_locked(&user.id).await {
        return Err(ServerError::AccountLocked);
    }

    let Some(password_hash) = user.password_hash.clone() else {
        return Err(ServerError::InvalidCredentials);
    };
    if !crate::crypto::verify_password(&state.crypto, body.password, password_hash)
        .await?
    {
        let tracking = state
            .monitor
            .track_failed_login(&user.id, ip.as_deref())
            .await;

        return Err(if tracking.locked {
            ServerError::AccountLocked
        } else {
            ServerError::InvalidCredentials
        });
    }

    if user.two_factor_enabled {
        return Ok(Json(Response::TwoFactorChallenge {
            requires_2fa: true,
            principal_id: user.id,
        }));
    }

    Ok(Json(issue_session(&state, &user).await?))
}

/// Handler completing a login for 2FA-enabled accounts.
pub async fn verify_2fa(
    State(state): State<AppState>,
    headers: HeaderMap,
    Valid(body): Valid<TwoFactorBody>,
) -> Result<Json<Response>> {
    let ip = client_ip(&headers);

    let user = state
        .stores
        .users
        .find_by_id(&body.principal_id)
        .await?
        .filter(|user| user.active)
        .ok_or(ServerError::InvalidCredentials)?;

    if state.monitor.is_account_locked(&user.id).await {
        return Err(ServerError::AccountLocked);
    }

    let verification =
        state.two_factor.verify_at_login(&user.id, &body.code).await?;
    if !verification.valid {
        state.monitor.track_failed_2fa(&user.id, ip.as_deref()).await;
        return Err(TwoFactorError::InvalidCode.into());
    }

    Ok(Json(issue_session(&state, &user).await?))
}

/// Handler revoking the session behind the current request.
pub async fn logout(
    State(state): State<AppState>,
    axum::Extension(context): axum::Extension<AuthContext>,
) -> Result<StatusCode> {
    state.sessions.revoke(&context.session_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
