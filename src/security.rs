//! Security events and the lockout policy they drive.
//!
//! The policy records and reports; it never rejects a request by itself.
//! Enforcement belongs to the login handlers, based on the flags returned
//! here. Sink write failures are logged and swallowed so auditing can never
//! break the operation being audited.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::EventStore;

/// Failed logins tolerated inside [`failed_login_window`] before lockout.
pub const FAILED_LOGIN_THRESHOLD: i64 = 5;
/// Failed 2FA checks tolerated inside [`failed_2fa_window`] before the
/// activity is flagged as suspicious.
pub const FAILED_2FA_THRESHOLD: i64 = 3;

fn failed_login_window() -> Duration {
    Duration::minutes(15)
}

fn lockout_window() -> Duration {
    Duration::minutes(30)
}

fn failed_2fa_window() -> Duration {
    Duration::minutes(5)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "FAILED_LOGIN")]
    FailedLogin,
    #[serde(rename = "ACCOUNT_LOCKOUT")]
    AccountLockout,
    #[serde(rename = "MULTIPLE_FAILED_2FA")]
    MultipleFailed2fa,
    #[serde(rename = "SUSPICIOUS_ACTIVITY")]
    SuspiciousActivity,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FailedLogin => "FAILED_LOGIN",
            EventType::AccountLockout => "ACCOUNT_LOCKOUT",
            EventType::MultipleFailed2fa => "MULTIPLE_FAILED_2FA",
            EventType::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "FAILED_LOGIN" => Ok(EventType::FailedLogin),
            "ACCOUNT_LOCKOUT" => Ok(EventType::AccountLockout),
            "MULTIPLE_FAILED_2FA" => Ok(EventType::MultipleFailed2fa),
            "SUSPICIOUS_ACTIVITY" => Ok(EventType::SuspiciousActivity),
            other => Err(format!("unknown event type `{other}`")),
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity `{other}`")),
        }
    }
}

/// Append-only security event. The only mutation ever applied is the
/// explicit resolved transition performed by an admin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub description: String,
    pub principal_id: Option<String>,
    pub ip_address: Option<String>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        description: impl Into<String>,
        principal_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            severity,
            description: description.into(),
            principal_id: principal_id.map(str::to_owned),
            ip_address: ip_address.map(str::to_owned),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of tracking one failed login.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginTracking {
    pub locked: bool,
    pub remaining_attempts: i64,
}

/// Counts failure events and decides when an account becomes locked.
#[derive(Clone)]
pub struct SecurityMonitor {
    events: Arc<dyn EventStore>,
}

impl SecurityMonitor {
    /// Create a new [`SecurityMonitor`].
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Record a failed login and report whether the account just crossed the
    /// lockout threshold.
    pub async fn track_failed_login(
        &self,
        principal_id: &str,
        ip_address: Option<&str>,
    ) -> LoginTracking {
        self.append_isolated(SecurityEvent::new(
            EventType::FailedLogin,
            Severity::Low,
            "login attempt failed",
            Some(principal_id),
            ip_address,
        ))
        .await;

        let since = Utc::now() - failed_login_window();
        let recent = match self
            .events
            .count_since(principal_id, EventType::FailedLogin, since)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "failed-login count unavailable");
                return LoginTracking {
                    locked: false,
                    remaining_attempts: FAILED_LOGIN_THRESHOLD,
                };
            },
        };

        if recent >= FAILED_LOGIN_THRESHOLD {
            self.append_isolated(SecurityEvent::new(
                EventType::AccountLockout,
                Severity::High,
                format!("account locked after {recent} failed login attempts"),
                Some(principal_id),
                ip_address,
            ))
            .await;

            return LoginTracking {
                locked: true,
                remaining_attempts: 0,
            };
        }

        LoginTracking {
            locked: false,
            remaining_attempts: FAILED_LOGIN_THRESHOLD - recent,
        }
    }

    /// A lockout event inside the trailing window keeps the account locked.
    /// Reads fail open: a broken event store must not block logins.
    pub async fn is_account_locked(&self, principal_id: &str) -> bool {
        let since = Utc::now() - lockout_window();

        match self
            .events
            .count_since(principal_id, EventType::AccountLockout, since)
            .await
        {
            Ok(count) => count > 0,
            Err(err) => {
                tracing::warn!(error = %err, "lockout lookup unavailable");
                false
            },
        }
    }

    /// Record a failed 2FA verification, escalating repeated failures.
    pub async fn track_failed_2fa(
        &self,
        principal_id: &str,
        ip_address: Option<&str>,
    ) {
        self.append_isolated(SecurityEvent::new(
            EventType::MultipleFailed2fa,
            Severity::Medium,
            "2FA verification failed",
            Some(principal_id),
            ip_address,
        ))
        .await;

        let since = Utc::now() - failed_2fa_window();
        let recent = match self
            .events
            .count_since(principal_id, EventType::MultipleFailed2fa, since)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "failed-2fa count unavailable");
                return;
            },
        };

        if recent >= FAILED_2FA_THRESHOLD {
            self.append_isolated(SecurityEvent::new(
                EventType::SuspiciousActivity,
                Severity::High,
                format!("{recent} failed 2FA verifications in a row"),
                Some(principal_id),
                ip_address,
            ))
            .await;
        }
    }

    /// Unresolved events, most severe first. Admin surface.
    pub async fn unresolved_events(
        &self,
        severity: Option<Severity>,
    ) -> Result<Vec<SecurityEvent>> {
        self.events.list_unresolved(severity).await
    }

    /// Mark an event as handled.
    pub async fn resolve_event(
        &self,
        event_id: &str,
        resolved_by: &str,
    ) -> Result<()> {
        if self.events.resolve(event_id, resolved_by).await? {
            Ok(())
        } else {
            Err(crate::ServerError::NotFound)
        }
    }

    async fn append_isolated(&self, event: SecurityEvent) {
        if let Err(err) = self.events.append(&event).await {
            tracing::warn!(
                error = %err,
                event_type = event.event_type.as_str(),
                "security event dropped"
            );
        }
    }
}
