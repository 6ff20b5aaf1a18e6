//! Authentication gate run before every protected route.

use axum::extract::State;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::ServerError;
use crate::error::Result;
use crate::session::ResolveError;
use crate::user::User;

const BEARER: &str = "Bearer ";

/// Principal and session behind the current request, attached to request
/// extensions by [`authenticate`].
#[derive(Clone)]
pub struct AuthContext {
    pub user: User,
    pub session_id: String,
}

/// Resolve the `Authorization` header to a principal.
///
/// Every resolution failure collapses into the same opaque 401; the actual
/// reason only reaches the server-side logs. Nothing else is touched, in
/// particular expiry never slides.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: axum::extract::Request,
    next: Next,
) -> Result<Response> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER))
        .ok_or(ServerError::Unauthorized)?;

    let (user, session) = match state.sessions.resolve(token).await {
        Ok(resolved) => resolved,
        Err(ResolveError::Server(err)) => return Err(err),
        Err(err) => {
            tracing::debug!(reason = %err, "bearer credential rejected");
            return Err(ServerError::Unauthorized);
        },
    };

    req.extensions_mut().insert(AuthContext {
        session_id: session.id,
        user: user.clone(),
    });
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}
