//! In-process [`KvStore`] for tests and single-node development.
//!
//! Expiry is lazy: an entry past its deadline is treated as absent and
//! evicted the next time it is touched. `set_online(false)` simulates a
//! dropped connection; every operation then fails as unavailable.

use super::{KvStore, StoreStats, parse_info};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    online: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Flip the simulated connection state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store is offline".to_string()))
        }
    }

    /// Lock the map with expired entries already evicted.
    async fn live(&self) -> Result<tokio::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.live().await?;
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut entries = self.live().await?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut entries = self.live().await?;
        Ok(entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.live().await?;
        Ok(entries.contains_key(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::Other(format!("invalid key pattern {pattern:?}: {e}")))?;
        let entries = self.live().await?;
        Ok(entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut entries = self.live().await?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.live().await?;
        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl_seconds: u64) -> Result<i64> {
        let mut entries = self.live().await?;
        let current = match entries.get(key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|_| {
                Error::Other(format!("value at {key:?} is not an integer"))
            })?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let entries = self.live().await?;
        Ok(match entries.get(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                ((remaining.as_millis() + 500) / 1000) as i64
            }
        })
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut entries = self.live().await?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<bool> {
        self.check_online()?;
        Ok(true)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let entries = self.live().await?;
        let db_size = entries.len() as u64;
        let expiring = entries.values().filter(|e| e.expires_at.is_some()).count();
        let info = format!(
            "# Server\r\nredis_mode:memory\r\n# Keyspace\r\ndb0:keys={db_size},expires={expiring}\r\n"
        );

        Ok(StoreStats {
            connected: true,
            db_size,
            info: parse_info(&info),
        })
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
