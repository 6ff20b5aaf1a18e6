//! Atelier is the authentication and access-control core of a design-review
//! platform: composite-token sessions, layered authorization gates and
//! TOTP-based two-factor verification.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod crypto;
pub mod error;
mod guard;
mod middleware;
mod router;
mod security;
mod session;
mod store;
pub mod telemetry;
mod totp;
mod two_factor;
mod user;

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, header};
use axum::routing::{delete, get, post};
use axum::{Router, middleware as AxumMiddleware};
pub use error::ServerError;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder =
            builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(builder.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub crypto: Arc<crypto::Crypto>,
    pub stores: store::Stores,
    pub sessions: session::SessionManager,
    pub two_factor: two_factor::TwoFactorEngine,
    pub monitor: security::SecurityMonitor,
}

impl AppState {
    /// Wire every component onto the injected store handles.
    pub fn assemble(
        config: Arc<config::Configuration>,
        crypto: Arc<crypto::Crypto>,
        stores: store::Stores,
    ) -> Self {
        let sessions = session::SessionManager::new(
            Arc::clone(&stores.users),
            Arc::clone(&stores.sessions),
            Arc::clone(&crypto),
            chrono::Duration::seconds(config.session.ttl_seconds),
        );
        let two_factor = two_factor::TwoFactorEngine::new(
            Arc::clone(&stores.users),
            Arc::clone(&crypto),
            config.name.clone(),
            config.totp.clone(),
        );
        let monitor =
            security::SecurityMonitor::new(Arc::clone(&stores.events));

        Self {
            config,
            crypto,
            stores,
            sessions,
            two_factor,
            monitor,
        }
    }
}

/// Create router. Protected routes run authenticate first, then any
/// per-route authorization layer, then the handler.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_request(DefaultOnRequest::new())
                .on_response(
                    DefaultOnResponse::new().latency_unit(LatencyUnit::Micros),
                ),
        )
        // Set a timeout.
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let admin_router = Router::new()
        // `GET /2fa/stats` goes to enrollment totals.
        .route("/2fa/stats", get(router::two_factor::stats))
        // `GET /security/events` lists unresolved events.
        .route("/security/events", get(router::security::list))
        // `POST /security/events/:ID/resolve` marks one as handled.
        .route(
            "/security/events/{id}/resolve",
            post(router::security::resolve),
        )
        .route_layer(AxumMiddleware::from_fn(guard::admin_only));

    let protected_router = Router::new()
        // `POST /logout` revokes the current session.
        .route("/logout", post(router::login::logout))
        // `GET /sessions` lists the caller's sessions.
        .route("/sessions", get(router::sessions::list))
        // `DELETE /sessions/:ID` revokes one of them.
        .route("/sessions/{session_id}", delete(router::sessions::revoke))
        // Two-factor lifecycle.
        .route("/2fa/enroll", post(router::two_factor::begin))
        .route("/2fa/enroll/verify", post(router::two_factor::complete))
        .route("/2fa/disable", post(router::two_factor::disable))
        .route("/2fa/backup-codes", post(router::two_factor::regenerate))
        // Profiles, owner or admin.
        .route("/users/{user_id}", get(router::users::get))
        .route("/users/{user_id}", delete(router::users::deactivate))
        .merge(admin_router)
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ));

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `POST /create` goes to `create`.
        .route("/create", post(router::create::handler))
        // `POST /login` goes to `login`.
        .route("/login", post(router::login::handler))
        // `POST /login/verify-2fa` completes 2FA logins.
        .route("/login/verify-2fa", post(router::login::verify_2fa))
        .merge(protected_router)
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state. The returned pool handle is the
/// process-lifetime owner of the connections; close it on shutdown.
pub async fn initialize_state()
-> Result<(AppState, sqlx::PgPool), Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let config = config::Configuration::default().read()?;

    let pool = match config.postgres {
        Some(ref config) => {
            store::connect(
                &config.address,
                &config
                    .username
                    .clone()
                    .unwrap_or(store::DEFAULT_CREDENTIALS.into()),
                &config
                    .password
                    .clone()
                    .unwrap_or(store::DEFAULT_CREDENTIALS.into()),
                &config
                    .database
                    .clone()
                    .unwrap_or(store::DEFAULT_DATABASE_NAME.into()),
                config.pool_size.unwrap_or(store::DEFAULT_POOL_SIZE),
            )
            .await?
        },
        None => {
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            std::process::exit(0);
        },
    };

    // execute migrations scripts on start.
    sqlx::migrate!().run(&pool).await?;

    let key =
        std::env::var("KEY").expect("missing `KEY` environnement variable");
    let salt =
        std::env::var("SALT").expect("missing `SALT` environnement variable");
    let crypto =
        Arc::new(crypto::Crypto::new(config.argon2.clone(), key, salt)?);

    let stores = store::Stores::postgres(&pool);

    Ok((AppState::assemble(config, crypto, stores), pool))
}
