//! Cryptographic logics.

use std::sync::Arc;

use aes_gcm::aead::{Aead, Nonce};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::ServerError;
use crate::config::Argon2 as ArgonConfig;

const NONCE_SIZE: usize = 12;
const KEY_LENGTH: usize = 32;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("aes-gcm error: {0}")]
    AesGcm(aes_gcm::Error),
    #[error("argon2 error: {0}")]
    Argon2(String),

    #[error("hex is not valid")]
    Hex(#[from] hex::FromHexError),
    #[error("encrypted data is not utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("data length is {value} while at least {excepted} is excepted")]
    Length { value: usize, excepted: usize },
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(err: aes_gcm::Error) -> Self {
        Self::AesGcm(err)
    }
}

/// Cryptographic manager.
pub struct Crypto {
    pub symmetric: SymmetricCipher,
    pub pwd: PasswordManager,
}

impl Crypto {
    /// Create a new [`Crypto`].
    pub fn new(
        config: Option<ArgonConfig>,
        master_key: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let key = SymmetricKey::derive_from_password(master_key, &salt)?;
        let symmetric = SymmetricCipher::new(key);
        let pwd = PasswordManager::new(config)?;

        Ok(Self { symmetric, pwd })
    }
}

/// Run the adaptive hash on the blocking pool; it is far too CPU-hungry for
/// the async workers.
pub async fn hash_password(
    crypto: &Arc<Crypto>,
    secret: impl Into<String>,
) -> crate::error::Result<String> {
    let crypto = Arc::clone(crypto);
    let secret = secret.into();

    tokio::task::spawn_blocking(move || crypto.pwd.hash_password(secret))
        .await
        .map_err(|err| ServerError::internal("hashing task aborted", err))?
        .map_err(Into::into)
}

/// Blocking-pool counterpart of [`PasswordManager::verify_password`].
pub async fn verify_password(
    crypto: &Arc<Crypto>,
    secret: impl Into<String>,
    phc_hash: impl Into<String>,
) -> crate::error::Result<bool> {
    let crypto = Arc::clone(crypto);
    let secret = secret.into();
    let phc_hash = phc_hash.into();

    tokio::task::spawn_blocking(move || {
        crypto.pwd.verify_password(secret.as_bytes(), &phc_hash)
    })
    .await
    .map_err(|err| ServerError::internal("verification task aborted", err))
}

/// SymmetricKey holds a fixed-size key protected by Zeroizing.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; KEY_LENGTH]>);

impl SymmetricKey {
    /// Create from raw bytes (must be 32 bytes).
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let len = bytes.len();
        let bytes: [u8; KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::Length {
                value: len,
                excepted: KEY_LENGTH,
            })?;

        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Derive key from a password + salt using Argon2.
    pub fn derive_from_password(
        password: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let config = ArgonConfig {
            memory_cost: 1024 * 64,
            iterations: 8,
            parallelism: 2,
            hash_length: KEY_LENGTH,
        };

        let mut pwd = PasswordManager::new(Some(config))?;
        pwd.salt(Some(salt.as_ref().to_vec()));
        let phc_hash_string = pwd.hash_password(password)?;
        pwd.salt(None); // remove fixed salt.
        let password_hash = PasswordHash::new(&phc_hash_string)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;
        let hash = password_hash
            .hash
            .ok_or_else(|| CryptoError::Argon2("empty hash output".into()))?;

        Self::from_bytes(hash.as_bytes().to_vec())
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// SymmetricCipher provides encrypt/decrypt operations with AES-256-GCM.
pub struct SymmetricCipher {
    key: SymmetricKey,
}

impl SymmetricCipher {
    /// Create a new [`SymmetricCipher`].
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    pub fn encrypt_and_hex(
        &self,
        plaintext: impl AsRef<[u8]>,
    ) -> Result<String> {
        let cipher_text = self.encrypt(plaintext)?;
        Ok(hex::encode(cipher_text))
    }

    pub fn decrypt_from_hex(&self, data: impl AsRef<[u8]>) -> Result<String> {
        let data = hex::decode(data)?;
        let plain = self.decrypt(data)?;
        Ok(String::from_utf8(plain)?)
    }

    /// Encrypts data returning raw bytes.
    pub fn encrypt(&self, plaintext: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        // Generate random 96-bit nonce.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let cipher_text = cipher.encrypt(nonce, plaintext.as_ref())?;

        let mut out = Vec::with_capacity(NONCE_SIZE + cipher_text.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&cipher_text);
        Ok(out)
    }

    /// Decrypt raw data.
    pub fn decrypt(&self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let data = data.as_ref();
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::Length {
                value: data.len(),
                excepted: NONCE_SIZE,
            });
        }

        let (nonce_bytes, cipher_text) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        let plain = cipher.decrypt(&nonce, cipher_text.as_ref())?;

        Ok(plain)
    }
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification. The same primitive covers account passwords, session raw
/// secrets and 2FA backup codes.
pub struct PasswordManager {
    params: Params,
    fixed_salt: Option<Vec<u8>>,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self {
            params,
            fixed_salt: None,
        })
    }

    /// Set a fixed salt.
    /// **Used for derivation password only!**
    fn salt(&mut self, salt: Option<Vec<u8>>) {
        self.fixed_salt = salt;
    }

    /// Hash secret using Argon2id.
    pub fn hash_password(
        &self,
        password: impl AsRef<[u8]>,
    ) -> std::result::Result<String, CryptoError> {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        );
        let salt = match &self.fixed_salt {
            Some(salt) => SaltString::encode_b64(salt)
                .map_err(|e| CryptoError::Argon2(e.to_string()))?,
            None => SaltString::generate(&mut OsRng),
        };
        let hash = argon2
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify a secret against a PHC string. Comparison happens inside the
    /// argon2 primitive; a malformed stored hash counts as a mismatch.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> bool {
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        );

        let Ok(parsed) = PasswordHash::new(phc_hash) else {
            return false;
        };

        argon2.verify_password(password.as_ref(), &parsed).is_ok()
    }
}
