//! Principal (user account) model.

use serde::{Deserialize, Serialize};

/// Access level of a principal on the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    Designer,
    Client,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Designer => "DESIGNER",
            Role::Client => "CLIENT",
            Role::Admin => "ADMIN",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DESIGNER" => Ok(Role::Designer),
            "CLIENT" => Ok(Role::Client),
            "ADMIN" => Ok(Role::Admin),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User as saved on database.
///
/// `password_hash` is absent for identities created through a federated
/// provider. The 2FA fields only ever change through the two-factor engine:
/// `two_factor_secret` holds the AES-encrypted TOTP seed and
/// `two_factor_backup_codes` the argon2 hashes of the remaining single-use
/// recovery codes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub role: Role,
    pub active: bool,
    pub two_factor_enabled: bool,
    #[serde(skip)]
    pub two_factor_secret: Option<String>,
    #[serde(skip)]
    pub two_factor_backup_codes: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// What login and profile endpoints reveal about a principal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub two_factor_enabled: bool,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn summary(&self) -> Summary {
        Summary {
            id: self.id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            role: self.role,
            two_factor_enabled: self.two_factor_enabled,
        }
    }
}
