//! Session issuance, resolution and revocation.
//!
//! The bearer value handed to clients is `sessionId:rawSecret`. The id is a
//! plain lookup key; the secret is only ever persisted as an argon2 hash, so
//! a database read alone can never yield a usable credential.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Crypto};
use crate::error::{Result, ServerError};
use crate::store::{SessionStore, UserStore};
use crate::user::User;

pub const SEPARATOR: char = ':';
/// Entropy of the raw secret, in bytes.
const SECRET_LENGTH: usize = 32;

/// Session as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(skip)]
    pub token_hash: String,
    pub owner_id: String,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }
}

/// Why a bearer credential failed to resolve.
///
/// These distinctions exist for server-side logs only; the authentication
/// gate collapses every variant into one opaque 401 so callers cannot probe
/// which part failed.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("credential is not `sessionId:rawSecret`")]
    MalformedToken,
    #[error("session does not exist")]
    SessionNotFound,
    #[error("session was revoked")]
    SessionInactive,
    #[error("session expired")]
    SessionExpired,
    #[error("secret does not match stored hash")]
    InvalidToken,
    #[error("session owner is deactivated")]
    OwnerInactive,
    #[error("session owner no longer exists")]
    OwnerMissing,
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Returned exactly once at issuance; the raw secret is unrecoverable
/// afterwards.
pub struct IssuedSession {
    pub session_id: String,
    pub composite: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and resolves composite-token sessions.
#[derive(Clone)]
pub struct SessionManager {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    crypto: Arc<Crypto>,
    ttl: Duration,
}

impl SessionManager {
    /// Create a new [`SessionManager`].
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        crypto: Arc<Crypto>,
        ttl: Duration,
    ) -> Self {
        Self {
            users,
            sessions,
            crypto,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a session with the configured lifetime.
    pub async fn issue(&self, owner_id: &str) -> Result<IssuedSession> {
        self.issue_with_ttl(owner_id, self.ttl).await
    }

    /// Issue a session, persisting only the hash of its raw secret.
    pub async fn issue_with_ttl(
        &self,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<IssuedSession> {
        let mut bytes = [0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        let raw_secret = hex::encode(bytes);

        let token_hash =
            crypto::hash_password(&self.crypto, raw_secret.clone()).await?;

        let now = Utc::now();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            token_hash,
            owner_id: owner_id.to_owned(),
            active: true,
            expires_at: now + ttl,
            created_at: now,
        };
        self.sessions.insert(&record).await?;

        Ok(IssuedSession {
            composite: format!("{}{}{}", record.id, SEPARATOR, raw_secret),
            session_id: record.id,
            expires_at: record.expires_at,
        })
    }

    /// Resolve a composite bearer credential to its owning principal.
    pub async fn resolve(
        &self,
        composite: &str,
    ) -> std::result::Result<(User, SessionRecord), ResolveError> {
        let (session_id, raw_secret) = composite
            .split_once(SEPARATOR)
            .ok_or(ResolveError::MalformedToken)?;
        if session_id.is_empty()
            || raw_secret.is_empty()
            || raw_secret.contains(SEPARATOR)
        {
            return Err(ResolveError::MalformedToken);
        }

        let session = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(ResolveError::SessionNotFound)?;

        if !session.active {
            return Err(ResolveError::SessionInactive);
        }
        if session.expires_at <= Utc::now() {
            return Err(ResolveError::SessionExpired);
        }

        let matches = crypto::verify_password(
            &self.crypto,
            raw_secret,
            session.token_hash.clone(),
        )
        .await?;
        if !matches {
            return Err(ResolveError::InvalidToken);
        }

        let owner = self
            .users
            .find_by_id(&session.owner_id)
            .await?
            .ok_or(ResolveError::OwnerMissing)?;
        if !owner.active {
            return Err(ResolveError::OwnerInactive);
        }

        Ok((owner, session))
    }

    /// Revoke a session. A second revocation of the same session is a no-op
    /// in terms of observable state.
    pub async fn revoke(&self, session_id: &str) -> Result<()> {
        if self.sessions.deactivate(session_id).await? {
            Ok(())
        } else {
            Err(ServerError::NotFound)
        }
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.sessions.find(session_id).await
    }

    pub async fn list(
        &self,
        owner_id: &str,
        active: Option<bool>,
    ) -> Result<Vec<SessionRecord>> {
        self.sessions.list_for_owner(owner_id, active).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    fn manager() -> (SessionManager, crate::store::Stores) {
        let stores = crate::store::Stores::in_memory();
        let manager = SessionManager::new(
            Arc::clone(&stores.users),
            Arc::clone(&stores.sessions),
            test_util::crypto(),
            Duration::hours(1),
        );
        (manager, stores)
    }

    #[tokio::test]
    async fn test_issue_then_resolve() {
        let (manager, stores) = manager();
        let user = test_util::insert_user(&stores, "ana@atelier.test").await;

        let issued = manager.issue(&user.id).await.unwrap();
        assert!(issued.composite.starts_with(&issued.session_id));

        let (owner, session) = manager.resolve(&issued.composite).await.unwrap();
        assert_eq!(owner.id, user.id);
        assert_eq!(session.id, issued.session_id);
        assert!(session.usable_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_resolve_rejects_malformed_credentials() {
        let (manager, _stores) = manager();

        for token in ["", "nocolon", ":", "id:", ":secret", "a:b:c"] {
            assert!(matches!(
                manager.resolve(token).await,
                Err(ResolveError::MalformedToken)
            ));
        }
    }

    #[tokio::test]
    async fn test_resolve_distinguishes_internally() {
        let (manager, stores) = manager();
        let user = test_util::insert_user(&stores, "ana@atelier.test").await;

        assert!(matches!(
            manager.resolve("ghost:secret").await,
            Err(ResolveError::SessionNotFound)
        ));

        let issued = manager.issue(&user.id).await.unwrap();
        let wrong = format!("{}:definitely-not-the-secret", issued.session_id);
        assert!(matches!(
            manager.resolve(&wrong).await,
            Err(ResolveError::InvalidToken)
        ));

        manager.revoke(&issued.session_id).await.unwrap();
        assert!(matches!(
            manager.resolve(&issued.composite).await,
            Err(ResolveError::SessionInactive)
        ));
    }

    #[tokio::test]
    async fn test_zero_ttl_session_expires() {
        let (manager, stores) = manager();
        let user = test_util::insert_user(&stores, "ana@atelier.test").await;

        let issued = manager
            .issue_with_ttl(&user.id, Duration::zero())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert!(matches!(
            manager.resolve(&issued.composite).await,
            Err(ResolveError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_in_effect() {
        let (manager, stores) = manager();
        let user = test_util::insert_user(&stores, "ana@atelier.test").await;
        let issued = manager.issue(&user.id).await.unwrap();

        manager.revoke(&issued.session_id).await.unwrap();
        // Second revocation observes the same inactive state.
        manager.revoke(&issued.session_id).await.unwrap();

        assert!(matches!(
            manager.revoke("missing").await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_deactivated_owner_cannot_resolve() {
        let (manager, stores) = manager();
        let user = test_util::insert_user(&stores, "ana@atelier.test").await;
        let issued = manager.issue(&user.id).await.unwrap();

        stores.users.set_active(&user.id, false).await.unwrap();
        assert!(matches!(
            manager.resolve(&issued.composite).await,
            Err(ResolveError::OwnerInactive)
        ));
    }

    #[tokio::test]
    async fn test_multiple_concurrent_sessions() {
        let (manager, stores) = manager();
        let user = test_util::insert_user(&stores, "ana@atelier.test").await;

        let first = manager.issue(&user.id).await.unwrap();
        let second = manager.issue(&user.id).await.unwrap();

        assert!(manager.resolve(&first.composite).await.is_ok());
        assert!(manager.resolve(&second.composite).await.is_ok());

        manager.revoke(&first.session_id).await.unwrap();
        assert!(manager.resolve(&first.composite).await.is_err());
        // Revoking one device leaves the other untouched.
        assert!(manager.resolve(&second.composite).await.is_ok());
    }
}
