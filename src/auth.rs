//! Exchange API credentials and request signing.
//!
//! Private exchange calls carry two headers:
//! - `API-Key`: the public key
//! - `API-Sign`: `Base64(HMAC-SHA512(Base64Decode(secret), path + SHA256(nonce + body)))`
//!
//! A credential may be delegated with an expiry; once expired the engine
//! logs the user out instead of sending requests that will be refused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::Result;

/// Tracks the last nonce issued so every call returns a strictly
/// increasing value even when the wall-clock hasn't advanced.
///
/// Uses nanosecond resolution in a `u64`, which overflows around year 2554.
static LAST_NONCE: AtomicU64 = AtomicU64::new(0);

/// An API key, its secret and an optional delegation expiry.
#[derive(Clone)]
pub struct Credential {
    api_key: String,
    secret: Zeroizing<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: Zeroizing::new(secret.into()),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// A credential without an expiry never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Stable identity used to key per-credential caches: hex SHA-256 of
    /// the API key. Never reveals the secret.
    pub fn identity(&self) -> String {
        hex::encode(Sha256::digest(self.api_key.as_bytes()))
    }

    /// Signs a private request body for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchSyncError::Config`](crate::BatchSyncError::Config)
    /// if the secret is not valid base64.
    pub fn sign(&self, path: &str, nonce: u64, body: &str) -> Result<String> {
        sign(&self.secret, path, nonce, body)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Returns a strictly monotonically-increasing nonce with nanosecond resolution.
///
/// Uses the wall-clock as the baseline but guarantees that successive calls
/// always return a value larger than the previous one, even when the clock
/// resolution is too coarse or the clock jumps backwards.
pub fn next_nonce() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let mut prev = LAST_NONCE.load(Ordering::Relaxed);
    loop {
        let nonce = now.max(prev + 1);
        match LAST_NONCE.compare_exchange_weak(prev, nonce, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return nonce,
            Err(actual) => prev = actual,
        }
    }
}

fn sign(api_secret: &str, path: &str, nonce: u64, post_data: &str) -> Result<String> {
    let secret = Zeroizing::new(BASE64_STANDARD.decode(api_secret).map_err(|e| {
        crate::BatchSyncError::Config(format!("invalid base64 api secret: {e}"))
    })?);

    let mut sha256 = Sha256::new();
    sha256.update(format!("{nonce}{post_data}").as_bytes());
    let sha256_digest = sha256.finalize();

    let mut hmac_input = Vec::from(path.as_bytes());
    hmac_input.extend_from_slice(&sha256_digest);

    let mut mac = Hmac::<Sha512>::new_from_slice(&secret)
        .map_err(|e| crate::BatchSyncError::Config(format!("invalid HMAC key: {e}")))?;
    mac.update(&hmac_input);
    let result = mac.finalize().into_bytes();

    Ok(BASE64_STANDARD.encode(result))
}
