//! Key-value store client.
//!
//! [`KvStore`] is the seam the lock manager, redelivery tracker, health
//! reporter, and admin surface program against. [`RedisStore`] talks to a
//! real server over one multiplexed connection; [`MemoryStore`] is an
//! in-process stand-in with the same expiry semantics.
//!
//! Transport failures surface as [`Error::StoreUnavailable`] and are never
//! folded into an "absent" result.
//!
//! [`Error::StoreUnavailable`]: crate::error::Error::StoreUnavailable

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Parsed server INFO text: section name → key → value.
pub type InfoSections = BTreeMap<String, BTreeMap<String, String>>;

/// Snapshot returned by [`KvStore::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub connected: bool,
    pub db_size: u64,
    pub info: InfoSections,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, expiring after `ttl_seconds` when given.
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    /// Delete a key. Returns whether anything was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys matching a glob pattern, unordered.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomically set `key` only if it does not exist, with a millisecond
    /// expiry. Returns true iff this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// Atomically delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Increment an integer counter and (re)arm its expiry. Returns the new count.
    async fn incr(&self, key: &str, ttl_seconds: u64) -> Result<i64>;

    /// Remaining time to live in seconds. -2 when absent, -1 when it never expires.
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Set an expiry on an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;

    /// Active round trip. Ok(true) only for an exact `PONG` reply.
    async fn ping(&self) -> Result<bool>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Last known connection state, no round trip.
    fn is_connected(&self) -> bool;

    /// Health as seen by the admin surface: a failed ping is just "down".
    async fn is_healthy(&self) -> bool {
        self.ping().await.unwrap_or(false)
    }
}

/// Parse server INFO output into sections.
///
/// `# Name` lines open a section (lower-cased); `key:value` lines belong
/// to the current section. Lines before the first header are dropped.
pub fn parse_info(info: &str) -> InfoSections {
    let mut parsed = InfoSections::new();
    let mut section: Option<String> = None;

    for line in info.lines().map(|l| l.trim_end_matches('\r')) {
        if let Some(header) = line.strip_prefix('#') {
            let name = header.trim().to_lowercase();
            parsed.entry(name.clone()).or_default();
            section = Some(name);
        } else if let Some((key, value)) = line.split_once(':') {
            if let Some(ref name) = section {
                parsed
                    .entry(name.clone())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
        }
    }

    parsed
}
