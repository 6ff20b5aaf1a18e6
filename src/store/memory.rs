//! Process-local store adapters.
//!
//! Same contracts as the PostgreSQL adapters, backed by maps behind a
//! `RwLock`. The test suite runs entirely against these.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, ServerError};
use crate::security::{EventType, SecurityEvent, Severity};
use crate::session::SessionRecord;
use crate::store::{
    EventStore, ProjectMembers, ProjectStore, SessionStore, TwoFactorCounts,
    UserStore,
};
use crate::user::User;

fn poisoned() -> ServerError {
    ServerError::Internal {
        details: "in-memory store lock poisoned".into(),
        source: None,
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, user: &User) -> Result<()> {
        self.users
            .write()
            .map_err(|_| poisoned())?
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .map_err(|_| poisoned())?
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        match users.get_mut(id) {
            Some(user) => {
                user.active = active;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn set_two_factor(
        &self,
        id: &str,
        enabled: bool,
        secret_cipher: Option<String>,
        backup_code_hashes: Vec<String>,
    ) -> Result<()> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        let user = users.get_mut(id).ok_or(ServerError::NotFound)?;

        user.two_factor_enabled = enabled;
        user.two_factor_secret = secret_cipher;
        user.two_factor_backup_codes = backup_code_hashes;
        Ok(())
    }

    async fn replace_backup_codes(
        &self,
        id: &str,
        backup_code_hashes: Vec<String>,
    ) -> Result<()> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        let user = users.get_mut(id).ok_or(ServerError::NotFound)?;

        user.two_factor_backup_codes = backup_code_hashes;
        Ok(())
    }

    async fn two_factor_counts(&self) -> Result<TwoFactorCounts> {
        let users = self.users.read().map_err(|_| poisoned())?;

        Ok(TwoFactorCounts {
            total: users.len() as i64,
            enabled: users
                .values()
                .filter(|user| user.two_factor_enabled)
                .count() as i64,
        })
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &SessionRecord) -> Result<()> {
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| poisoned())?
            .get(id)
            .cloned())
    }

    async fn deactivate(&self, id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        match sessions.get_mut(id) {
            Some(session) => {
                session.active = false;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        active: Option<bool>,
    ) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;

        let mut owned: Vec<SessionRecord> = sessions
            .values()
            .filter(|session| session.owner_id == owner_id)
            .filter(|session| active.is_none_or(|flag| session.active == flag))
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(owned)
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<SecurityEvent>>,
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        self.events
            .write()
            .map_err(|_| poisoned())?
            .push(event.clone());
        Ok(())
    }

    async fn count_since(
        &self,
        principal_id: &str,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let events = self.events.read().map_err(|_| poisoned())?;

        Ok(events
            .iter()
            .filter(|event| {
                event.principal_id.as_deref() == Some(principal_id)
                    && event.event_type == event_type
                    && event.created_at >= since
            })
            .count() as i64)
    }

    async fn list_unresolved(
        &self,
        severity: Option<Severity>,
    ) -> Result<Vec<SecurityEvent>> {
        let events = self.events.read().map_err(|_| poisoned())?;

        let mut unresolved: Vec<SecurityEvent> = events
            .iter()
            .filter(|event| !event.resolved)
            .filter(|event| {
                severity.is_none_or(|wanted| event.severity == wanted)
            })
            .cloned()
            .collect();
        unresolved.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.created_at.cmp(&a.created_at))
        });

        Ok(unresolved)
    }

    async fn resolve(&self, id: &str, resolved_by: &str) -> Result<bool> {
        let mut events = self.events.write().map_err(|_| poisoned())?;

        match events.iter_mut().find(|event| event.id == id) {
            Some(event) => {
                event.resolved = true;
                event.resolved_by = Some(resolved_by.to_owned());
                event.resolved_at = Some(Utc::now());
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<String, ProjectMembers>>,
    arts: RwLock<HashMap<String, String>>,
    tasks: RwLock<HashMap<String, String>>,
    feedbacks: RwLock<HashMap<String, String>>,
    approvals: RwLock<HashMap<String, String>>,
}

impl MemoryProjectStore {
    pub fn add_project(&self, id: &str, designer_id: &str, client_id: &str) {
        if let Ok(mut projects) = self.projects.write() {
            projects.insert(
                id.to_owned(),
                ProjectMembers {
                    designer_id: designer_id.to_owned(),
                    client_id: client_id.to_owned(),
                },
            );
        }
    }

    pub fn add_art(&self, id: &str, project_id: &str) {
        if let Ok(mut arts) = self.arts.write() {
            arts.insert(id.to_owned(), project_id.to_owned());
        }
    }

    pub fn add_task(&self, id: &str, project_id: &str) {
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert(id.to_owned(), project_id.to_owned());
        }
    }

    pub fn add_feedback(&self, id: &str, author_id: &str) {
        if let Ok(mut feedbacks) = self.feedbacks.write() {
            feedbacks.insert(id.to_owned(), author_id.to_owned());
        }
    }

    pub fn add_approval(&self, id: &str, author_id: &str) {
        if let Ok(mut approvals) = self.approvals.write() {
            approvals.insert(id.to_owned(), author_id.to_owned());
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn project_members(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectMembers>> {
        Ok(self
            .projects
            .read()
            .map_err(|_| poisoned())?
            .get(project_id)
            .cloned())
    }

    async fn project_of_art(&self, art_id: &str) -> Result<Option<String>> {
        Ok(self.arts.read().map_err(|_| poisoned())?.get(art_id).cloned())
    }

    async fn project_of_task(&self, task_id: &str) -> Result<Option<String>> {
        Ok(self
            .tasks
            .read()
            .map_err(|_| poisoned())?
            .get(task_id)
            .cloned())
    }

    async fn feedback_author(
        &self,
        feedback_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .feedbacks
            .read()
            .map_err(|_| poisoned())?
            .get(feedback_id)
            .cloned())
    }

    async fn approval_author(
        &self,
        approval_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .approvals
            .read()
            .map_err(|_| poisoned())?
            .get(approval_id)
            .cloned())
    }
}
