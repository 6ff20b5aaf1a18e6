//! PostgreSQL store adapters.
//!
//! Row structs stay private to this module; the rest of the crate only sees
//! the domain types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;
use crate::security::{EventType, SecurityEvent, Severity};
use crate::session::SessionRecord;
use crate::store::{
    EventStore, ProjectMembers, ProjectStore, SessionStore, TwoFactorCounts,
    UserStore,
};
use crate::user::{Role, User};

const USER_COLUMNS: &str = "id, email, name, password_hash, role, active, \
    two_factor_enabled, two_factor_secret, two_factor_backup_codes, \
    created_at";

const SESSION_COLUMNS: &str =
    "id, token_hash, owner_id, active, expires_at, created_at";

const EVENT_COLUMNS: &str = "id, event_type, severity, description, \
    principal_id, ip_address, resolved, resolved_by, resolved_at, created_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    name: String,
    password_hash: Option<String>,
    role: String,
    active: bool,
    two_factor_enabled: bool,
    two_factor_secret: Option<String>,
    two_factor_backup_codes: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let role = row.role.parse().unwrap_or_else(|err| {
            tracing::warn!(user_id = %row.id, error = %err, "invalid stored role");
            Role::default()
        });

        User {
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            role,
            active: row.active,
            two_factor_enabled: row.two_factor_enabled,
            two_factor_secret: row.two_factor_secret,
            two_factor_backup_codes: row.two_factor_backup_codes,
            created_at: row.created_at,
        }
    }
}

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    /// Create a new [`PgUserStore`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO principals (id, email, name, password_hash, role,
                active, two_factor_enabled, two_factor_secret,
                two_factor_backup_codes, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.active)
        .bind(user.two_factor_enabled)
        .bind(&user.two_factor_secret)
        .bind(&user.two_factor_backup_codes)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM principals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM principals WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE principals SET active = $2 WHERE id = $1")
                .bind(id)
                .bind(active)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_two_factor(
        &self,
        id: &str,
        enabled: bool,
        secret_cipher: Option<String>,
        backup_code_hashes: Vec<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE principals
                SET two_factor_enabled = $2,
                    two_factor_secret = $3,
                    two_factor_backup_codes = $4
                WHERE id = $1"#,
        )
        .bind(id)
        .bind(enabled)
        .bind(secret_cipher)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_backup_codes(
        &self,
        id: &str,
        backup_code_hashes: Vec<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE principals SET two_factor_backup_codes = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn two_factor_counts(&self) -> Result<TwoFactorCounts> {
        let (total, enabled) = sqlx::query_as::<_, (i64, i64)>(
            r#"SELECT COUNT(*),
                COUNT(*) FILTER (WHERE two_factor_enabled)
                FROM principals"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TwoFactorCounts { total, enabled })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    token_hash: String,
    owner_id: String,
    active: bool,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        SessionRecord {
            id: row.id,
            token_hash: row.token_hash,
            owner_id: row.owner_id,
            active: row.active,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Create a new [`PgSessionStore`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sessions (id, token_hash, owner_id, active,
                expires_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&session.id)
        .bind(&session.token_hash)
        .bind(&session.owner_id)
        .bind(session.active)
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SessionRecord::from))
    }

    async fn deactivate(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE sessions SET active = FALSE WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        active: Option<bool>,
    ) -> Result<Vec<SessionRecord>> {
        let rows = match active {
            Some(flag) => {
                sqlx::query_as::<_, SessionRow>(&format!(
                    r#"SELECT {SESSION_COLUMNS} FROM sessions
                        WHERE owner_id = $1 AND active = $2
                        ORDER BY created_at DESC"#
                ))
                .bind(owner_id)
                .bind(flag)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, SessionRow>(&format!(
                    r#"SELECT {SESSION_COLUMNS} FROM sessions
                        WHERE owner_id = $1
                        ORDER BY created_at DESC"#
                ))
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?
            },
        };

        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    event_type: String,
    severity: String,
    description: String,
    principal_id: Option<String>,
    ip_address: Option<String>,
    resolved: bool,
    resolved_by: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Option<SecurityEvent> {
        let event_type: EventType = match self.event_type.parse() {
            Ok(event_type) => event_type,
            Err(err) => {
                tracing::warn!(event_id = %self.id, %err, "skipping event row");
                return None;
            },
        };
        let severity: Severity = match self.severity.parse() {
            Ok(severity) => severity,
            Err(err) => {
                tracing::warn!(event_id = %self.id, %err, "skipping event row");
                return None;
            },
        };

        Some(SecurityEvent {
            id: self.id,
            event_type,
            severity,
            description: self.description,
            principal_id: self.principal_id,
            ip_address: self.ip_address,
            resolved: self.resolved,
            resolved_by: self.resolved_by,
            resolved_at: self.resolved_at,
            created_at: self.created_at,
        })
    }
}

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Create a new [`PgEventStore`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO security_events (id, event_type, severity,
                description, principal_id, ip_address, resolved, resolved_by,
                resolved_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&event.id)
        .bind(event.event_type.as_str())
        .bind(event.severity.as_str())
        .bind(&event.description)
        .bind(&event.principal_id)
        .bind(&event.ip_address)
        .bind(event.resolved)
        .bind(&event.resolved_by)
        .bind(event.resolved_at)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_since(
        &self,
        principal_id: &str,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM security_events
                WHERE principal_id = $1
                AND event_type = $2
                AND created_at >= $3"#,
        )
        .bind(principal_id)
        .bind(event_type.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_unresolved(
        &self,
        severity: Option<Severity>,
    ) -> Result<Vec<SecurityEvent>> {
        let order = r#"ORDER BY CASE severity
                WHEN 'CRITICAL' THEN 4
                WHEN 'HIGH' THEN 3
                WHEN 'MEDIUM' THEN 2
                ELSE 1
            END DESC, created_at DESC"#;

        let rows = match severity {
            Some(wanted) => {
                sqlx::query_as::<_, EventRow>(&format!(
                    r#"SELECT {EVENT_COLUMNS} FROM security_events
                        WHERE resolved = FALSE AND severity = $1 {order}"#
                ))
                .bind(wanted.as_str())
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, EventRow>(&format!(
                    r#"SELECT {EVENT_COLUMNS} FROM security_events
                        WHERE resolved = FALSE {order}"#
                ))
                .fetch_all(&self.pool)
                .await?
            },
        };

        Ok(rows.into_iter().filter_map(EventRow::into_event).collect())
    }

    async fn resolve(&self, id: &str, resolved_by: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE security_events
                SET resolved = TRUE, resolved_by = $2, resolved_at = NOW()
                WHERE id = $1"#,
        )
        .bind(id)
        .bind(resolved_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct PgProjectStore {
    pool: PgPool,
}

impl PgProjectStore {
    /// Create a new [`PgProjectStore`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn scalar_lookup(
        &self,
        query: &str,
        id: &str,
    ) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn project_members(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectMembers>> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT designer_id, client_id FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(designer_id, client_id)| ProjectMembers {
            designer_id,
            client_id,
        }))
    }

    async fn project_of_art(&self, art_id: &str) -> Result<Option<String>> {
        self.scalar_lookup("SELECT project_id FROM arts WHERE id = $1", art_id)
            .await
    }

    async fn project_of_task(&self, task_id: &str) -> Result<Option<String>> {
        self.scalar_lookup(
            "SELECT project_id FROM tasks WHERE id = $1",
            task_id,
        )
        .await
    }

    async fn feedback_author(
        &self,
        feedback_id: &str,
    ) -> Result<Option<String>> {
        self.scalar_lookup(
            "SELECT author_id FROM feedbacks WHERE id = $1",
            feedback_id,
        )
        .await
    }

    async fn approval_author(
        &self,
        approval_id: &str,
    ) -> Result<Option<String>> {
        self.scalar_lookup(
            "SELECT approver_id FROM approvals WHERE id = $1",
            approval_id,
        )
        .await
    }
}
