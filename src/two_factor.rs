//! Two-factor enrollment, login verification and recovery codes.
//!
//! Per principal the state machine is DISABLED -> PENDING_ENROLLMENT ->
//! ENABLED -> DISABLED. Enrollment persists nothing until the submitted code
//! proves the authenticator holds the secret, so an interrupted enrollment
//! leaves no half-enabled account behind.
//!
//! At rest, the TOTP secret is AES-256-GCM encrypted while backup codes are
//! argon2-hashed. The secret must stay recoverable to generate comparison
//! codes at login; the backup codes never need to be.

use std::sync::Arc;

use axum::http::StatusCode;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::crypto::{self, Crypto};
use crate::error::Result;
use crate::store::UserStore;
use crate::totp;
use crate::user::User;

pub const BACKUP_CODE_COUNT: u64 = 10;

/// User-actionable two-factor failures; surfaced distinctly, unlike
/// authentication failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TwoFactorError {
    #[error("two-factor authentication is already enabled")]
    AlreadyEnabled,
    #[error("two-factor authentication is not enabled")]
    NotEnabled,
    #[error("verification code is invalid")]
    InvalidCode,
    #[error("password is incorrect")]
    WrongPassword,
    #[error("account has no password configured")]
    NoPasswordConfigured,
}

impl TwoFactorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TwoFactorError::AlreadyEnabled | TwoFactorError::NotEnabled => {
                StatusCode::CONFLICT
            },
            TwoFactorError::InvalidCode
            | TwoFactorError::NoPasswordConfigured => StatusCode::BAD_REQUEST,
            TwoFactorError::WrongPassword => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Secret material shown to the user exactly once, at enrollment.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

/// Outcome of a login-time verification.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub valid: bool,
    pub used_backup_code: bool,
}

/// Enrollment totals for the admin dashboard.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total: i64,
    pub enabled: i64,
    pub disabled: i64,
    pub enabled_percentage: f64,
}

/// Drives the per-principal two-factor lifecycle.
#[derive(Clone)]
pub struct TwoFactorEngine {
    users: Arc<dyn UserStore>,
    crypto: Arc<Crypto>,
    issuer: String,
    params: config::Totp,
}

impl TwoFactorEngine {
    /// Create a new [`TwoFactorEngine`].
    pub fn new(
        users: Arc<dyn UserStore>,
        crypto: Arc<Crypto>,
        issuer: impl Into<String>,
        params: config::Totp,
    ) -> Self {
        Self {
            users,
            crypto,
            issuer: issuer.into(),
            params,
        }
    }

    async fn user(&self, principal_id: &str) -> Result<User> {
        self.users
            .find_by_id(principal_id)
            .await?
            .ok_or(crate::ServerError::NotFound)
    }

    /// Generate secret material for a new enrollment. Nothing is persisted:
    /// the caller must echo the secret and codes back through
    /// [`Self::complete_enrollment`] to commit.
    pub async fn begin_enrollment(
        &self,
        principal_id: &str,
    ) -> Result<Enrollment> {
        let user = self.user(principal_id).await?;
        if user.two_factor_enabled {
            return Err(TwoFactorError::AlreadyEnabled.into());
        }

        let secret = totp::generate_secret();
        let provisioning_uri = totp::provisioning_uri(
            &secret,
            &self.issuer,
            &user.email,
            &self.params,
        );

        Ok(Enrollment {
            provisioning_uri,
            secret,
            backup_codes: generate_backup_codes(),
        })
    }

    /// Verify the first code from the authenticator and commit the 2FA state
    /// in a single write.
    pub async fn complete_enrollment(
        &self,
        principal_id: &str,
        secret: &str,
        code: &str,
        backup_codes: &[String],
    ) -> Result<()> {
        let user = self.user(principal_id).await?;
        if user.two_factor_enabled {
            return Err(TwoFactorError::AlreadyEnabled.into());
        }

        let valid = totp::verify_totp(
            secret,
            code,
            self.params.period,
            self.params.digits,
        )
        .map_err(|_| TwoFactorError::InvalidCode)?;
        if !valid {
            return Err(TwoFactorError::InvalidCode.into());
        }

        let secret_cipher = self.crypto.symmetric.encrypt_and_hex(secret)?;
        let mut code_hashes = Vec::with_capacity(backup_codes.len());
        for backup_code in backup_codes {
            code_hashes
                .push(crypto::hash_password(&self.crypto, backup_code).await?);
        }

        self.users
            .set_two_factor(principal_id, true, Some(secret_cipher), code_hashes)
            .await
    }

    /// Check a login-time code: backup codes first (single use), then TOTP
    /// against the decrypted secret. Which stored credential failed is never
    /// reported.
    pub async fn verify_at_login(
        &self,
        principal_id: &str,
        code: &str,
    ) -> Result<Verification> {
        let user = self.user(principal_id).await?;
        let Some(secret_cipher) = user
            .two_factor_secret
            .as_ref()
            .filter(|_| user.two_factor_enabled)
        else {
            return Err(TwoFactorError::NotEnabled.into());
        };

        for (index, hash) in user.two_factor_backup_codes.iter().enumerate() {
            if crypto::verify_password(&self.crypto, code, hash.clone()).await?
            {
                let mut remaining = user.two_factor_backup_codes.clone();
                remaining.remove(index);
                self.users
                    .replace_backup_codes(principal_id, remaining)
                    .await?;

                return Ok(Verification {
                    valid: true,
                    used_backup_code: true,
                });
            }
        }

        let secret = self.crypto.symmetric.decrypt_from_hex(secret_cipher)?;
        let valid = totp::verify_totp(
            &secret,
            code,
            self.params.period,
            self.params.digits,
        )?;

        Ok(Verification {
            valid,
            used_backup_code: false,
        })
    }

    /// Turn 2FA off, clearing the secret and every backup code.
    pub async fn disable(
        &self,
        principal_id: &str,
        password: &str,
    ) -> Result<()> {
        let user = self.user(principal_id).await?;
        if !user.two_factor_enabled {
            return Err(TwoFactorError::NotEnabled.into());
        }
        self.check_password(&user, password).await?;

        self.users
            .set_two_factor(principal_id, false, None, Vec::new())
            .await
    }

    /// Replace the backup-code set with ten fresh codes, returned in the
    /// clear exactly once.
    pub async fn regenerate_backup_codes(
        &self,
        principal_id: &str,
        password: &str,
    ) -> Result<Vec<String>> {
        let user = self.user(principal_id).await?;
        if !user.two_factor_enabled {
            return Err(TwoFactorError::NotEnabled.into());
        }
        self.check_password(&user, password).await?;

        let backup_codes = generate_backup_codes();
        let mut code_hashes = Vec::with_capacity(backup_codes.len());
        for backup_code in &backup_codes {
            code_hashes
                .push(crypto::hash_password(&self.crypto, backup_code).await?);
        }
        self.users
            .replace_backup_codes(principal_id, code_hashes)
            .await?;

        Ok(backup_codes)
    }

    pub async fn is_enabled(&self, principal_id: &str) -> Result<bool> {
        Ok(self.user(principal_id).await?.two_factor_enabled)
    }

    /// Enrollment totals across all principals.
    pub async fn stats(&self) -> Result<Stats> {
        let counts = self.users.two_factor_counts().await?;

        let enabled_percentage = if counts.total > 0 {
            let ratio = counts.enabled as f64 / counts.total as f64;
            (ratio * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(Stats {
            total: counts.total,
            enabled: counts.enabled,
            disabled: counts.total - counts.enabled,
            enabled_percentage,
        })
    }

    /// Identities from a federated provider carry no local password and
    /// cannot pass this gate.
    async fn check_password(&self, user: &User, password: &str) -> Result<()> {
        let Some(password_hash) = user.password_hash.as_ref() else {
            return Err(TwoFactorError::NoPasswordConfigured.into());
        };

        if !crypto::verify_password(
            &self.crypto,
            password,
            password_hash.clone(),
        )
        .await?
        {
            return Err(TwoFactorError::WrongPassword.into());
        }

        Ok(())
    }
}

/// Ten single-use codes, `XXXX-XXXX` uppercase hex, typable from a printout.
fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; 4];
            OsRng.fill_bytes(&mut bytes);
            let hex = hex::encode_upper(bytes);
            format!("{}-{}", &hex[..4], &hex[4..])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerError;
    use crate::test_util;

    const PASSWORD: &str = "P$soW%920$n&";

    async fn engine() -> (TwoFactorEngine, crate::store::Stores, User) {
        let stores = crate::store::Stores::in_memory();
        let user = test_util::insert_password_user(
            &stores,
            "ana@atelier.test",
            PASSWORD,
        )
        .await;
        let engine = TwoFactorEngine::new(
            Arc::clone(&stores.users),
            test_util::crypto(),
            "Atelier",
            config::Totp::default(),
        );
        (engine, stores, user)
    }

    async fn enroll(engine: &TwoFactorEngine, user: &User) -> Enrollment {
        let enrollment = engine.begin_enrollment(&user.id).await.unwrap();
        let code = totp::generate_totp(&enrollment.secret, 30, 6).unwrap();
        engine
            .complete_enrollment(
                &user.id,
                &enrollment.secret,
                &code,
                &enrollment.backup_codes,
            )
            .await
            .unwrap();
        enrollment
    }

    #[tokio::test]
    async fn test_full_enrollment() {
        let (engine, stores, user) = engine().await;

        let enrollment = engine.begin_enrollment(&user.id).await.unwrap();
        assert_eq!(enrollment.backup_codes.len(), BACKUP_CODE_COUNT as usize);
        assert!(enrollment
            .provisioning_uri
            .contains(&format!("secret={}", enrollment.secret)));

        // Nothing persisted before the code round-trips.
        assert!(!engine.is_enabled(&user.id).await.unwrap());

        let code = totp::generate_totp(&enrollment.secret, 30, 6).unwrap();
        engine
            .complete_enrollment(
                &user.id,
                &enrollment.secret,
                &code,
                &enrollment.backup_codes,
            )
            .await
            .unwrap();

        assert!(engine.is_enabled(&user.id).await.unwrap());
        let stored = stores.users.find_by_id(&user.id).await.unwrap().unwrap();
        // Neither the secret nor the codes are stored in the clear.
        assert_ne!(stored.two_factor_secret.unwrap(), enrollment.secret);
        for (hash, code) in stored
            .two_factor_backup_codes
            .iter()
            .zip(&enrollment.backup_codes)
        {
            assert_ne!(hash, code);
        }
    }

    #[tokio::test]
    async fn test_wrong_code_never_enables() {
        let (engine, _stores, user) = engine().await;
        let enrollment = engine.begin_enrollment(&user.id).await.unwrap();

        let result = engine
            .complete_enrollment(
                &user.id,
                &enrollment.secret,
                "000000",
                &enrollment.backup_codes,
            )
            .await;
        // A six digit code matches its window with probability 1e-6 times
        // three candidates; treat a collision as a rerun.
        if let Err(err) = result {
            assert!(matches!(
                err,
                ServerError::TwoFactor(TwoFactorError::InvalidCode)
            ));
            assert!(!engine.is_enabled(&user.id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_enrollment_conflicts() {
        let (engine, _stores, user) = engine().await;

        // Two pending enrollments do not conflict: neither persisted.
        let first = engine.begin_enrollment(&user.id).await.unwrap();
        let second = engine.begin_enrollment(&user.id).await.unwrap();
        assert_ne!(first.secret, second.secret);

        enroll(&engine, &user).await;

        assert!(matches!(
            engine.begin_enrollment(&user.id).await,
            Err(ServerError::TwoFactor(TwoFactorError::AlreadyEnabled))
        ));
        let code = totp::generate_totp(&second.secret, 30, 6).unwrap();
        assert!(matches!(
            engine
                .complete_enrollment(
                    &user.id,
                    &second.secret,
                    &code,
                    &second.backup_codes
                )
                .await,
            Err(ServerError::TwoFactor(TwoFactorError::AlreadyEnabled))
        ));
    }

    #[tokio::test]
    async fn test_totp_verification_at_login() {
        let (engine, _stores, user) = engine().await;
        let enrollment = enroll(&engine, &user).await;

        let code = totp::generate_totp(&enrollment.secret, 30, 6).unwrap();
        let verification =
            engine.verify_at_login(&user.id, &code).await.unwrap();
        assert!(verification.valid);
        assert!(!verification.used_backup_code);

        let wrong = engine.verify_at_login(&user.id, "999999").await.unwrap();
        if !wrong.valid {
            assert!(!wrong.used_backup_code);
        }
    }

    #[tokio::test]
    async fn test_backup_code_is_single_use() {
        let (engine, _stores, user) = engine().await;
        let enrollment = enroll(&engine, &user).await;
        let backup_code = enrollment.backup_codes[3].clone();

        let first = engine
            .verify_at_login(&user.id, &backup_code)
            .await
            .unwrap();
        assert!(first.valid);
        assert!(first.used_backup_code);

        let second = engine
            .verify_at_login(&user.id, &backup_code)
            .await
            .unwrap();
        assert!(!second.valid);

        // The other codes are left intact.
        let other = engine
            .verify_at_login(&user.id, &enrollment.backup_codes[0])
            .await
            .unwrap();
        assert!(other.valid);
    }

    #[tokio::test]
    async fn test_verify_requires_enrollment() {
        let (engine, _stores, user) = engine().await;

        assert!(matches!(
            engine.verify_at_login(&user.id, "123456").await,
            Err(ServerError::TwoFactor(TwoFactorError::NotEnabled))
        ));
    }

    #[tokio::test]
    async fn test_disable_requires_password() {
        let (engine, _stores, user) = engine().await;
        let enrollment = enroll(&engine, &user).await;

        assert!(matches!(
            engine.disable(&user.id, "wrong password").await,
            Err(ServerError::TwoFactor(TwoFactorError::WrongPassword))
        ));
        // Failed attempts leave the enrollment untouched.
        assert!(engine.is_enabled(&user.id).await.unwrap());
        assert!(engine
            .verify_at_login(&user.id, &enrollment.backup_codes[0])
            .await
            .unwrap()
            .valid);

        engine.disable(&user.id, PASSWORD).await.unwrap();
        assert!(!engine.is_enabled(&user.id).await.unwrap());
        assert!(matches!(
            engine.disable(&user.id, PASSWORD).await,
            Err(ServerError::TwoFactor(TwoFactorError::NotEnabled))
        ));
    }

    #[tokio::test]
    async fn test_disable_without_password_configured() {
        let (engine, stores, _user) = engine().await;
        let federated =
            test_util::insert_user(&stores, "sso@atelier.test").await;
        enroll(&engine, &federated).await;

        assert!(matches!(
            engine.disable(&federated.id, "anything").await,
            Err(ServerError::TwoFactor(TwoFactorError::NoPasswordConfigured))
        ));
    }

    #[tokio::test]
    async fn test_regenerate_backup_codes() {
        let (engine, _stores, user) = engine().await;
        let enrollment = enroll(&engine, &user).await;

        assert!(matches!(
            engine
                .regenerate_backup_codes(&user.id, "wrong password")
                .await,
            Err(ServerError::TwoFactor(TwoFactorError::WrongPassword))
        ));

        let fresh = engine
            .regenerate_backup_codes(&user.id, PASSWORD)
            .await
            .unwrap();
        assert_eq!(fresh.len(), BACKUP_CODE_COUNT as usize);

        // Old codes died with the regeneration; new ones work.
        let stale = engine
            .verify_at_login(&user.id, &enrollment.backup_codes[0])
            .await
            .unwrap();
        assert!(!stale.valid);
        let current =
            engine.verify_at_login(&user.id, &fresh[0]).await.unwrap();
        assert!(current.valid);
        assert!(current.used_backup_code);
    }

    #[tokio::test]
    async fn test_regenerate_requires_enrollment() {
        let (engine, _stores, user) = engine().await;

        assert!(matches!(
            engine.regenerate_backup_codes(&user.id, PASSWORD).await,
            Err(ServerError::TwoFactor(TwoFactorError::NotEnabled))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let (engine, stores, user) = engine().await;
        test_util::insert_user(&stores, "bo@atelier.test").await;
        test_util::insert_user(&stores, "cy@atelier.test").await;
        test_util::insert_user(&stores, "di@atelier.test").await;
        enroll(&engine, &user).await;

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.disabled, 3);
        assert_eq!(stats.enabled_percentage, 25.0);
    }

    #[test]
    fn test_backup_code_format() {
        for code in generate_backup_codes() {
            assert_eq!(code.len(), 9);
            let (head, tail) = code.split_once('-').unwrap();
            assert!(head.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(tail.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
