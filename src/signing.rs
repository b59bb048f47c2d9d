//! Webhook payload signing and replay bookkeeping.
//!
//! Signatures are HMAC-SHA256 over `{timestamp}.{body}`, rendered as
//! `sha256=<hex>`. Binding the timestamp into the MAC lets receivers reject
//! captured requests once they fall outside the skew window.

use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{cache::CoordinationCache, utils::destination_key};

pub const SIGNATURE_PREFIX: &str = "sha256=";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

type HmacSha256 = Hmac<Sha256>;

pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("Invalid signing key: {}", e))?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifies `signature` against the current wall clock.
pub fn verify(
    secret: &str,
    timestamp: i64,
    body: &[u8],
    signature: &str,
    max_skew: Duration,
) -> bool {
    verify_at(
        secret,
        timestamp,
        body,
        signature,
        max_skew,
        Utc::now().timestamp(),
    )
}

/// Verifies `signature` as if the current time were `now` (unix seconds).
pub fn verify_at(
    secret: &str,
    timestamp: i64,
    body: &[u8],
    signature: &str,
    max_skew: Duration,
    now: i64,
) -> bool {
    if now.abs_diff(timestamp) > max_skew.as_secs() {
        return false;
    }

    let Ok(expected) = sign(secret, timestamp, body) else {
        return false;
    };

    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Short-lived record of signatures issued per destination.
///
/// The sender records every `(timestamp, signature)` it emits. A receiver
/// sharing the cache can then `accept` each pair exactly once; a second
/// acceptance of the same pair is a replay.
#[derive(Clone)]
pub struct ReplayGuard {
    cache: Arc<dyn CoordinationCache>,
    ttl: Duration,
}

impl ReplayGuard {
    pub fn new(cache: Arc<dyn CoordinationCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(destination: &str, timestamp: i64, signature: &str, suffix: &str) -> String {
        let digest = signature.trim_start_matches(SIGNATURE_PREFIX);
        format!(
            "nonce:{}:{}:{}:{}",
            destination_key(destination),
            timestamp,
            digest,
            suffix
        )
    }

    /// Returns `false` when the same pair was already issued within the TTL.
    pub async fn record_issued(
        &self,
        destination: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<bool, Error> {
        let key = Self::key(destination, timestamp, signature, "issued");
        self.cache.set_nx_ex(&key, "1".to_string(), self.ttl).await
    }

    pub async fn was_issued(
        &self,
        destination: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<bool, Error> {
        let key = Self::key(destination, timestamp, signature, "issued");
        Ok(self.cache.get(&key).await?.is_some())
    }

    /// Receiver-side check: true only for the first presentation of a pair we issued.
    pub async fn accept(
        &self,
        destination: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<bool, Error> {
        if !self.was_issued(destination, timestamp, signature).await? {
            return Ok(false);
        }

        let key = Self::key(destination, timestamp, signature, "seen");
        self.cache.set_nx_ex(&key, "1".to_string(), self.ttl).await
    }
}
