//! Persistence ports and their adapters.
//!
//! Every component receives its store handle explicitly; nothing in the
//! crate reaches for a global client. [`Stores::postgres`] wires the sqlx
//! adapters, [`Stores::in_memory`] the process-local ones used by the test
//! suite.

mod memory;
mod postgres;

pub use memory::{
    MemoryEventStore, MemoryProjectStore, MemorySessionStore, MemoryUserStore,
};
pub use postgres::{
    PgEventStore, PgProjectStore, PgSessionStore, PgUserStore,
};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::error::Result;
use crate::security::{EventType, SecurityEvent, Severity};
use crate::session::SessionRecord;
use crate::user::User;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "atelier";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Init the PostgreSQL connection pool.
pub async fn connect(
    hostname: &str,
    username: &str,
    password: &str,
    db: &str,
    pool: u32,
) -> Result<PgPool> {
    let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
    let pool = sqlx::postgres::PgPoolOptions::new().max_connections(pool);
    let postgres = pool.connect(&addr).await?;

    tracing::info!(%hostname, %db, "postgres connected");

    Ok(postgres)
}

/// Aggregate used by the 2FA stats endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TwoFactorCounts {
    pub total: i64,
    pub enabled: i64,
}

/// Designer and client assigned to a project; all the membership data the
/// authorization gates ever look at.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectMembers {
    pub designer_id: String,
    pub client_id: String,
}

impl ProjectMembers {
    pub fn includes(&self, principal_id: &str) -> bool {
        self.designer_id == principal_id || self.client_id == principal_id
    }
}

/// Port for principal persistence operations.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new principal.
    async fn insert(&self, user: &User) -> Result<()>;

    /// Find a principal by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;

    /// Find a principal by its unique email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Flip the active flag; returns false when the principal is unknown.
    async fn set_active(&self, id: &str, active: bool) -> Result<bool>;

    /// Commit a complete 2FA state transition in a single write.
    async fn set_two_factor(
        &self,
        id: &str,
        enabled: bool,
        secret_cipher: Option<String>,
        backup_code_hashes: Vec<String>,
    ) -> Result<()>;

    /// Atomically replace the remaining backup-code hashes.
    async fn replace_backup_codes(
        &self,
        id: &str,
        backup_code_hashes: Vec<String>,
    ) -> Result<()>;

    /// Enrollment totals across all principals.
    async fn two_factor_counts(&self) -> Result<TwoFactorCounts>;
}

/// Port for session persistence operations.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a freshly issued session.
    async fn insert(&self, session: &SessionRecord) -> Result<()>;

    /// Look up a session by id.
    async fn find(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Set `active := false`; returns false when the session is unknown.
    async fn deactivate(&self, id: &str) -> Result<bool>;

    /// Sessions of one owner, newest first, optionally filtered on the
    /// active flag.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        active: Option<bool>,
    ) -> Result<Vec<SessionRecord>>;
}

/// Port for the append-only security event sink.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event.
    async fn append(&self, event: &SecurityEvent) -> Result<()>;

    /// Events of one type for one principal since a cutoff.
    async fn count_since(
        &self,
        principal_id: &str,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Unresolved events, most severe first.
    async fn list_unresolved(
        &self,
        severity: Option<Severity>,
    ) -> Result<Vec<SecurityEvent>>;

    /// Mark an event resolved; returns false when the event is unknown.
    async fn resolve(&self, id: &str, resolved_by: &str) -> Result<bool>;
}

/// Port for the project-graph lookups authorization needs. The graph itself
/// belongs to the review service.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Assigned designer and client of a project.
    async fn project_members(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectMembers>>;

    /// Walk from an art asset to its owning project.
    async fn project_of_art(&self, art_id: &str) -> Result<Option<String>>;

    /// Walk from a task to its owning project.
    async fn project_of_task(&self, task_id: &str) -> Result<Option<String>>;

    /// Author of a feedback entry.
    async fn feedback_author(
        &self,
        feedback_id: &str,
    ) -> Result<Option<String>>;

    /// Author of an approval entry.
    async fn approval_author(
        &self,
        approval_id: &str,
    ) -> Result<Option<String>>;
}

/// Injected bundle of store handles.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventStore>,
    pub projects: Arc<dyn ProjectStore>,
}

impl Stores {
    /// Stores backed by a shared PostgreSQL pool.
    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            users: Arc::new(PgUserStore::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            events: Arc::new(PgEventStore::new(pool.clone())),
            projects: Arc::new(PgProjectStore::new(pool.clone())),
        }
    }

    /// Process-local stores, mainly for the test suite.
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(MemoryUserStore::default()),
            sessions: Arc::new(MemorySessionStore::default()),
            events: Arc::new(MemoryEventStore::default()),
            projects: Arc::new(MemoryProjectStore::default()),
        }
    }
}
