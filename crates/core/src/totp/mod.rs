//! Time-based one-time password derivation (RFC 4226 / RFC 6238).
//!
//! Pure functions of secret + time window. No mutable state, safe to call
//! from any number of display refresh timers concurrently.

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::errors::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Standard TOTP window length in seconds.
pub const DEFAULT_PERIOD: u64 = 30;

/// Standard code width.
pub const DEFAULT_DIGITS: u32 = 6;

/// A derived token, distinguishing real codes from the display-safe
/// sentinels used for empty or undecodable secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Code(String),
    EmptySecret,
    InvalidSecret,
}

impl Token {
    pub fn is_code(&self) -> bool {
        matches!(self, Self::Code(_))
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) if code.len() == 6 => {
                write!(formatter, "{} {}", &code[..3], &code[3..])
            }
            Self::Code(code) => write!(formatter, "{}", code),
            Self::EmptySecret => write!(formatter, "Secret Empty"),
            Self::InvalidSecret => write!(formatter, "Secret Invalid"),
        }
    }
}

/// RFC 4226 HOTP: HMAC-SHA1 over the big-endian counter with dynamic
/// truncation, reduced to `digits` decimal digits.
pub fn hotp(key: &[u8], counter: u64, digits: u32) -> u32 {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    binary % 10u32.pow(digits)
}

/// Decode a base32 secret leniently: whitespace and trailing padding are
/// stripped, case is ignored.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let normalized = normalized.trim_end_matches('=');
    if normalized.is_empty() {
        return Err(Error::validation("secret is empty"));
    }
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| Error::validation("secret is not valid base32"))
}

/// RFC 6238 TOTP at an explicit unix time, zero-padded to `digits`.
pub fn totp_at(secret: &str, period: u64, digits: u32, unix_time: u64) -> Result<String> {
    let key = decode_secret(secret)?;
    let code = hotp(&key, unix_time / period, digits);
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Derive the display token for a secret at `now`. Never fails: empty and
/// malformed secrets yield sentinels instead of codes.
pub fn derive_token(secret: &str, now: DateTime<Utc>) -> Token {
    if secret.is_empty() {
        return Token::EmptySecret;
    }
    match totp_at(secret, DEFAULT_PERIOD, DEFAULT_DIGITS, now.timestamp() as u64) {
        Ok(code) => Token::Code(code),
        Err(_) => Token::InvalidSecret,
    }
}

/// Convenience for callers caching the rendered token string.
pub fn display_token(secret: &str, now: DateTime<Utc>) -> String {
    derive_token(secret, now).to_string()
}

/// Seconds until the current window rolls over, in `(0, period]` for a
/// nonzero period; a zero period yields zero instead of dividing by it.
/// Display-only; recomputed, never persisted.
pub fn time_remaining(period: u64, now: DateTime<Utc>) -> u64 {
    if period == 0 {
        return 0;
    }
    period - (now.timestamp() as u64 % period)
}

/// Strict secret validation for inline form feedback: base32 alphabet with
/// optional trailing padding, length a multiple of 8.
pub fn validate_secret(secret: &str) -> bool {
    if secret.is_empty() || secret.len() % 8 != 0 {
        return false;
    }
    let trimmed = secret.trim_end_matches('=');
    if trimmed.is_empty() {
        return false;
    }
    trimmed
        .bytes()
        .all(|b| b.is_ascii_alphabetic() || (b'2'..=b'7').contains(&b))
}
