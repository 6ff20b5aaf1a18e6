//! Authorization gates.
//!
//! Composable pre-conditions evaluated between authentication and the
//! business handler: role membership, resource ownership, project access and
//! authorship. Each is a pure predicate over the authenticated principal
//! plus a store lookup; none of them mutates anything, and ADMIN bypasses
//! everything except the role gate itself.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::AppState;
use crate::ServerError;
use crate::error::Result;
use crate::store::ProjectStore;
use crate::user::{Role, User};

const BODY_LIMIT: usize = 30_000;

/// Principal's role must be one of `allowed`.
pub fn require_role(user: &User, allowed: &[Role]) -> Result<()> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}

/// Principal must be the subject of the targeted profile, unless ADMIN.
pub fn require_self(user: &User, target_id: &str) -> Result<()> {
    if user.is_admin() || user.id == target_id {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}

/// Principal must be the assigned designer or client of the project, unless
/// ADMIN. A missing project is a 404, a foreign one a 403.
pub async fn require_project_member(
    user: &User,
    project_id: &str,
    projects: &Arc<dyn ProjectStore>,
) -> Result<()> {
    if user.is_admin() {
        return Ok(());
    }

    let members = projects
        .project_members(project_id)
        .await?
        .ok_or(ServerError::NotFound)?;

    if members.includes(&user.id) {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}

/// Locate the project a request talks about: an explicit path parameter
/// wins, then a body field, then walking up from an art or task id.
pub async fn resolve_project_id(
    projects: &Arc<dyn ProjectStore>,
    path_project_id: Option<&str>,
    body_project_id: Option<&str>,
    resource_id: Option<&str>,
) -> Result<String> {
    if let Some(id) = path_project_id {
        return Ok(id.to_owned());
    }
    if let Some(id) = body_project_id {
        return Ok(id.to_owned());
    }

    if let Some(id) = resource_id {
        if let Some(project_id) = projects.project_of_art(id).await? {
            return Ok(project_id);
        }
        if let Some(project_id) = projects.project_of_task(id).await? {
            return Ok(project_id);
        }
    }

    Err(ServerError::BadRequest("project id not provided"))
}

/// Principal must have authored the feedback or approval, unless ADMIN.
pub async fn require_author(
    user: &User,
    resource_id: &str,
    projects: &Arc<dyn ProjectStore>,
) -> Result<()> {
    if user.is_admin() {
        return Ok(());
    }

    let author = match projects.feedback_author(resource_id).await? {
        Some(author) => author,
        None => projects
            .approval_author(resource_id)
            .await?
            .ok_or(ServerError::NotFound)?,
    };

    if author == user.id {
        Ok(())
    } else {
        Err(ServerError::Forbidden)
    }
}

fn authenticated_user(req: &Request) -> Result<User> {
    req.extensions()
        .get::<User>()
        .cloned()
        .ok_or(ServerError::Unauthorized)
}

/// Route layer allowing ADMIN only.
pub async fn admin_only(req: Request, next: Next) -> Result<Response> {
    let user = authenticated_user(&req)?;
    require_role(&user, &[Role::Admin])?;

    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    #[serde(rename = "projectId")]
    project_id: Option<String>,
}

/// Route layer enforcing project access on project-scoped resources.
///
/// The project reference may live in the path (`project_id`), in the JSON
/// body (`projectId`) or behind an art/task id (`id`); the body is buffered
/// and replayed so the handler still sees it.
pub async fn project_access(
    State(state): State<AppState>,
    params: Option<Path<HashMap<String, String>>>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let user = authenticated_user(&req)?;
    if user.is_admin() {
        return Ok(next.run(req).await);
    }

    let params = params.map(|Path(map)| map).unwrap_or_default();
    let path_project_id = params.get("project_id").cloned();
    let resource_id = params.get("id").cloned();

    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, BODY_LIMIT)
        .await
        .map_err(|_| ServerError::BadRequest("unreadable request body"))?;
    let body_project_id = serde_json::from_slice::<ProjectRef>(&body_bytes)
        .ok()
        .and_then(|reference| reference.project_id);
    let req =
        Request::from_parts(parts, axum::body::Body::from(body_bytes));

    let project_id = resolve_project_id(
        &state.stores.projects,
        path_project_id.as_deref(),
        body_project_id.as_deref(),
        resource_id.as_deref(),
    )
    .await?;
    require_project_member(&user, &project_id, &state.stores.projects).await?;

    Ok(next.run(req).await)
}

/// Route layer enforcing authorship on feedback and approval resources.
pub async fn author_access(
    State(state): State<AppState>,
    params: Option<Path<HashMap<String, String>>>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let user = authenticated_user(&req)?;

    let resource_id = params
        .as_ref()
        .and_then(|Path(map)| map.get("id"))
        .ok_or(ServerError::BadRequest("resource id not provided"))?;
    require_author(&user, resource_id, &state.stores.projects).await?;

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryProjectStore, Stores};
    use crate::test_util;

    fn users() -> (User, User, User, User) {
        let designer = test_util::user("designer@atelier.test", Role::Designer);
        let client = test_util::user("client@atelier.test", Role::Client);
        let admin = test_util::user("admin@atelier.test", Role::Admin);
        let outsider = test_util::user("other@atelier.test", Role::Designer);
        (designer, client, admin, outsider)
    }

    fn directory(designer: &User, client: &User) -> Stores {
        let stores = Stores::in_memory();
        let projects = MemoryProjectStore::default();
        projects.add_project("p1", &designer.id, &client.id);
        projects.add_art("art1", "p1");
        projects.add_task("task1", "p1");
        Stores {
            projects: Arc::new(projects),
            ..stores
        }
    }

    #[test]
    fn test_require_role() {
        let (designer, _client, admin, _outsider) = users();

        assert!(require_role(&designer, &[Role::Designer]).is_ok());
        assert!(matches!(
            require_role(&designer, &[Role::Admin]),
            Err(ServerError::Forbidden)
        ));
        // The role gate is the one gate ADMIN does not bypass by identity;
        // it passes only when ADMIN is in the allowed set.
        assert!(require_role(&admin, &[Role::Admin, Role::Client]).is_ok());
        assert!(matches!(
            require_role(&admin, &[Role::Client]),
            Err(ServerError::Forbidden)
        ));
    }

    #[test]
    fn test_require_self() {
        let (designer, _client, admin, outsider) = users();

        assert!(require_self(&designer, &designer.id).is_ok());
        assert!(matches!(
            require_self(&outsider, &designer.id),
            Err(ServerError::Forbidden)
        ));
        assert!(require_self(&admin, &designer.id).is_ok());
    }

    #[tokio::test]
    async fn test_project_membership() {
        let (designer, client, admin, outsider) = users();
        let stores = directory(&designer, &client);

        for member in [&designer, &client, &admin] {
            assert!(require_project_member(member, "p1", &stores.projects)
                .await
                .is_ok());
        }
        assert!(matches!(
            require_project_member(&outsider, "p1", &stores.projects).await,
            Err(ServerError::Forbidden)
        ));
        assert!(matches!(
            require_project_member(&designer, "ghost", &stores.projects).await,
            Err(ServerError::NotFound)
        ));
        // Admin passes even for projects that do not exist.
        assert!(require_project_member(&admin, "ghost", &stores.projects)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_project_id_resolution_order() {
        let (designer, client, _admin, _outsider) = users();
        let stores = directory(&designer, &client);

        // Path parameter wins over everything.
        assert_eq!(
            resolve_project_id(
                &stores.projects,
                Some("p-path"),
                Some("p-body"),
                Some("art1")
            )
            .await
            .unwrap(),
            "p-path"
        );
        // Then the body field.
        assert_eq!(
            resolve_project_id(
                &stores.projects,
                None,
                Some("p-body"),
                Some("art1")
            )
            .await
            .unwrap(),
            "p-body"
        );
        // Then walking up from an art, then a task.
        assert_eq!(
            resolve_project_id(&stores.projects, None, None, Some("art1"))
                .await
                .unwrap(),
            "p1"
        );
        assert_eq!(
            resolve_project_id(&stores.projects, None, None, Some("task1"))
                .await
                .unwrap(),
            "p1"
        );
        // Nothing resolvable is a bad request.
        assert!(matches!(
            resolve_project_id(&stores.projects, None, None, Some("ghost"))
                .await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            resolve_project_id(&stores.projects, None, None, None).await,
            Err(ServerError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_require_author() {
        let (designer, client, admin, outsider) = users();

        let projects = MemoryProjectStore::default();
        projects.add_feedback("f1", &client.id);
        projects.add_approval("a1", &designer.id);
        let projects: Arc<dyn ProjectStore> = Arc::new(projects);

        assert!(require_author(&client, "f1", &projects).await.is_ok());
        assert!(require_author(&designer, "a1", &projects).await.is_ok());
        assert!(require_author(&admin, "f1", &projects).await.is_ok());
        assert!(matches!(
            require_author(&outsider, "f1", &projects).await,
            Err(ServerError::Forbidden)
        ));
        assert!(matches!(
            require_author(&client, "ghost", &projects).await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_gate_layers_compose_over_http() {
        use axum::http::{Method, StatusCode};
        use axum::middleware as AxumMiddleware;
        use axum::routing::{delete, get, post};

        use crate::{make_request, middleware};

        async fn handler() -> StatusCode {
            StatusCode::NO_CONTENT
        }

        let project_store = Arc::new(MemoryProjectStore::default());
        let stores = Stores {
            projects: Arc::clone(&project_store) as Arc<dyn ProjectStore>,
            ..Stores::in_memory()
        };
        let mut config = crate::config::Configuration::default();
        config.name = "Atelier".to_owned();
        let state = crate::AppState::assemble(
            Arc::new(config),
            test_util::crypto(),
            stores,
        );

        let designer = test_util::insert_role_user(
            &state.stores,
            "designer@atelier.test",
            Role::Designer,
        )
        .await;
        let client = test_util::insert_role_user(
            &state.stores,
            "client@atelier.test",
            Role::Client,
        )
        .await;
        let admin = test_util::insert_role_user(
            &state.stores,
            "admin@atelier.test",
            Role::Admin,
        )
        .await;
        let outsider = test_util::insert_role_user(
            &state.stores,
            "other@atelier.test",
            Role::Designer,
        )
        .await;

        project_store.add_project("p1", &designer.id, &client.id);
        project_store.add_art("art1", "p1");
        project_store.add_feedback("f1", &client.id);

        let project_routes = axum::Router::new()
            .route("/projects/{project_id}/arts", get(handler))
            .route("/arts/{id}", get(handler))
            .route("/arts", post(handler))
            .route_layer(AxumMiddleware::from_fn_with_state(
                state.clone(),
                project_access,
            ));
        let author_routes = axum::Router::new()
            .route("/feedbacks/{id}", delete(handler))
            .route_layer(AxumMiddleware::from_fn_with_state(
                state.clone(),
                author_access,
            ));
        let app = project_routes
            .merge(author_routes)
            .route_layer(AxumMiddleware::from_fn_with_state(
                state.clone(),
                middleware::authenticate,
            ));

        let mut tokens = std::collections::HashMap::new();
        for user in [&designer, &client, &admin, &outsider] {
            tokens.insert(
                user.id.clone(),
                state.sessions.issue(&user.id).await.unwrap().composite,
            );
        }
        let token = |user: &User| tokens[&user.id].clone();

        // Authentication runs before any gate.
        let response = make_request(
            app.clone(),
            Method::GET,
            "/projects/p1/arts",
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Path-parameter project resolution.
        for (user, expected) in [
            (&designer, StatusCode::NO_CONTENT),
            (&client, StatusCode::NO_CONTENT),
            (&admin, StatusCode::NO_CONTENT),
            (&outsider, StatusCode::FORBIDDEN),
        ] {
            let response = make_request(
                app.clone(),
                Method::GET,
                "/projects/p1/arts",
                Some(&token(user)),
                String::default(),
            )
            .await;
            assert_eq!(response.status(), expected, "user {}", user.email);
        }
        let response = make_request(
            app.clone(),
            Method::GET,
            "/projects/ghost/arts",
            Some(&token(&designer)),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // Admin short-circuits before the project is even looked up.
        let response = make_request(
            app.clone(),
            Method::GET,
            "/projects/ghost/arts",
            Some(&token(&admin)),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Walking from an art id to its project.
        let response = make_request(
            app.clone(),
            Method::GET,
            "/arts/art1",
            Some(&token(&designer)),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = make_request(
            app.clone(),
            Method::GET,
            "/arts/ghost",
            Some(&token(&designer)),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Project reference in the request body.
        let response = make_request(
            app.clone(),
            Method::POST,
            "/arts",
            Some(&token(&client)),
            serde_json::json!({ "projectId": "p1" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = make_request(
            app.clone(),
            Method::POST,
            "/arts",
            Some(&token(&client)),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Authorship gate.
        for (user, expected) in [
            (&client, StatusCode::NO_CONTENT),
            (&designer, StatusCode::FORBIDDEN),
            (&admin, StatusCode::NO_CONTENT),
        ] {
            let response = make_request(
                app.clone(),
                Method::DELETE,
                "/feedbacks/f1",
                Some(&token(user)),
                String::default(),
            )
            .await;
            assert_eq!(response.status(), expected, "user {}", user.email);
        }
        let response = make_request(
            app,
            Method::DELETE,
            "/feedbacks/ghost",
            Some(&token(&client)),
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
