//! RFC-6238 time-based one-time passwords over HMAC-SHA1.

use std::time::{SystemTime, UNIX_EPOCH};

use base32::Alphabet;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;

/// 160-bit seed as recommended by RFC 4226.
const SECRET_LENGTH: usize = 20;
/// Accepted drift, in time steps, on either side of the current one.
const SKEW: u64 = 1;

#[derive(thiserror::Error, Debug)]
pub enum TotpError {
    #[error("secret is not valid base32")]
    InvalidSecret,
    #[error("system time error")]
    Clock,
}

/// Generate a fresh shared secret, base32-armored for authenticator apps.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LENGTH];
    OsRng.fill_bytes(&mut bytes);

    base32::encode(Alphabet::Rfc4648 { padding: false }, &bytes)
}

/// Build the otpauth:// payload encoded into the enrollment QR code.
pub fn provisioning_uri(
    secret: &str,
    issuer: &str,
    account: &str,
    params: &crate::config::Totp,
) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        encode_component(issuer),
        encode_component(account),
        secret,
        encode_component(issuer),
        params.digits,
        params.period,
    )
}

fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Time step counter for the current wall clock.
pub fn current_counter(time_step: u64) -> Result<u64, TotpError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TotpError::Clock)?
        .as_secs();

    Ok(now / time_step)
}

/// Generates a TOTP code for the current time step.
pub fn generate_totp(
    secret: &str,
    time_step: u64,
    digits: u32,
) -> Result<String, TotpError> {
    generate_totp_at(secret, digits, current_counter(time_step)?)
}

/// Generates a TOTP code for an explicit time step counter.
pub fn generate_totp_at(
    secret: &str,
    digits: u32,
    counter: u64,
) -> Result<String, TotpError> {
    let key = base32::decode(Alphabet::Rfc4648 { padding: false }, secret)
        .ok_or(TotpError::InvalidSecret)?;

    let counter_bytes = counter.to_be_bytes();
    let mut mac = Hmac::<Sha1>::new_from_slice(&key)
        .map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter_bytes);
    let result = mac.finalize().into_bytes();

    let offset = (result[result.len() - 1] & 0x0f) as usize;
    let binary_code = ((result[offset] as u32 & 0x7f) << 24)
        | ((result[offset + 1] as u32) << 16)
        | ((result[offset + 2] as u32) << 8)
        | (result[offset + 3] as u32);

    let mut code = (binary_code % 10u32.pow(digits)).to_string();

    // Ensure the code has the correct number of digits.
    while code.len() < digits as usize {
        code.insert(0, '0');
    }

    Ok(code)
}

/// Check a submitted code against the current counter, accepting the
/// immediately adjacent time steps to absorb clock skew.
pub fn verify_totp(
    secret: &str,
    code: &str,
    time_step: u64,
    digits: u32,
) -> Result<bool, TotpError> {
    verify_totp_at(secret, code, digits, current_counter(time_step)?)
}

pub fn verify_totp_at(
    secret: &str,
    code: &str,
    digits: u32,
    counter: u64,
) -> Result<bool, TotpError> {
    for candidate in counter.saturating_sub(SKEW)..=counter.saturating_add(SKEW)
    {
        if generate_totp_at(secret, digits, candidate)? == code {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B reference secret, "12345678901234567890".
    const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vectors() {
        // T=59s and T=1111111109s with a 30s step, truncated to 6 digits.
        assert_eq!(generate_totp_at(SECRET, 6, 1).unwrap(), "287082");
        assert_eq!(generate_totp_at(SECRET, 6, 37037036).unwrap(), "081804");
    }

    #[test]
    fn test_code_is_zero_padded() {
        let code = generate_totp_at(SECRET, 6, 2).unwrap();
        assert_eq!(code.len(), 6);
    }

    #[test]
    fn test_verify_accepts_adjacent_steps() {
        let counter = 37037036;
        let previous = generate_totp_at(SECRET, 6, counter - 1).unwrap();
        let next = generate_totp_at(SECRET, 6, counter + 1).unwrap();

        assert!(verify_totp_at(SECRET, &previous, 6, counter).unwrap());
        assert!(verify_totp_at(SECRET, &next, 6, counter).unwrap());

        let stale = generate_totp_at(SECRET, 6, counter - 2).unwrap();
        assert!(!verify_totp_at(SECRET, &stale, 6, counter).unwrap());
    }

    #[test]
    fn test_invalid_base32_rejected() {
        assert!(matches!(
            generate_totp_at("not base32!", 6, 1),
            Err(TotpError::InvalidSecret)
        ));
    }

    #[test]
    fn test_generated_secret_is_usable() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert!(generate_totp_at(&secret, 6, 42).is_ok());
    }

    #[test]
    fn test_provisioning_uri_shape() {
        let uri = provisioning_uri(
            "JBSWY3DPEHPK3PXP",
            "Atelier",
            "a@b.com",
            &crate::config::Totp::default(),
        );
        assert!(uri.starts_with("otpauth://totp/Atelier:a%40b.com?secret="));
        assert!(uri.contains("issuer=Atelier"));
        assert!(uri.contains("period=30"));
    }
}
