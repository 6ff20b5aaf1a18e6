//! Security event administration. Every route here sits behind the ADMIN
//! role layer.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::AppState;
use crate::error::Result;
use crate::security::{SecurityEvent, Severity};
use crate::user::User;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    severity: Option<Severity>,
}

/// Handler listing unresolved events, most severe first.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<SecurityEvent>>> {
    Ok(Json(state.monitor.unresolved_events(query.severity).await?))
}

/// Handler marking one event as handled; the only mutation events admit.
pub async fn resolve(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(event_id): Path<String>,
) -> Result<StatusCode> {
    state.monitor.resolve_event(&event_id, &user.id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use crate::user::Role;
    use crate::{app, make_request, router, test_util};

    #[tokio::test]
    async fn test_event_administration() {
        let state = router::state();
        let user = test_util::insert_user(&state.stores, "ana@atelier.test")
            .await;
        let admin = test_util::insert_role_user(
            &state.stores,
            "root@atelier.test",
            Role::Admin,
        )
        .await;

        // Five tracked failures leave FAILED_LOGIN plus one lockout event.
        for _ in 0..5 {
            state.monitor.track_failed_login(&user.id, None).await;
        }

        let user_token =
            state.sessions.issue(&user.id).await.unwrap().composite;
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/security/events",
            Some(&user_token),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin_token =
            state.sessions.issue(&admin.id).await.unwrap().composite;
        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/security/events?severity=HIGH",
            Some(&admin_token),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let events: Vec<serde_json::Value> =
            serde_json::from_slice(&bytes).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["eventType"], "ACCOUNT_LOCKOUT");
        let event_id = events[0]["id"].as_str().unwrap().to_owned();

        let path = format!("/security/events/{event_id}/resolve");
        let response = make_request(
            app(state.clone()),
            Method::POST,
            &path,
            Some(&admin_token),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = make_request(
            app(state.clone()),
            Method::GET,
            "/security/events?severity=HIGH",
            Some(&admin_token),
            String::default(),
        )
        .await;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let events: Vec<serde_json::Value> =
            serde_json::from_slice(&bytes).unwrap();
        assert!(events.is_empty());

        let response = make_request(
            app(state),
            Method::POST,
            "/security/events/missing/resolve",
            Some(&admin_token),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
