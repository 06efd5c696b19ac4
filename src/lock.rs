//! Distributed lock manager.
//!
//! A lock is the store entry `lock:<key>` with a millisecond expiry. Its
//! value is a random owner token minted per acquisition, so a holder whose
//! lock already expired cannot release a later holder's claim.
//!
//! Locks are advisory: nothing fences a slow holder that runs past the
//! deadline. Work guarded by a lock must finish well inside its ttl.

use crate::error::Result;
use crate::store::KvStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const LOCK_PREFIX: &str = "lock:";
pub const DEFAULT_LOCK_TTL_MS: u64 = 10_000;

/// Store key backing the lock named `key`.
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

/// Proof of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
    pub ttl_ms: u64,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Try once to take the lock. Never blocks or retries.
    ///
    /// Returns `Some` iff this call created the entry.
    pub async fn acquire(&self, key: &str, ttl_ms: u64) -> Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_if_absent(&lock_key(key), &token, ttl_ms)
            .await?;
        record("acquire", acquired);
        debug!(key, ttl_ms, acquired, "lock acquire");

        Ok(acquired.then(|| LockGuard {
            key: key.to_string(),
            token,
            ttl_ms,
        }))
    }

    /// Release a lock this caller holds. Deletes only if the stored token
    /// still matches, so returns false once the lock expired or changed hands.
    pub async fn release(&self, guard: &LockGuard) -> Result<bool> {
        self.release_token(&guard.key, &guard.token).await
    }

    /// Token-checked release for callers that only kept the key and token.
    pub async fn release_token(&self, key: &str, token: &str) -> Result<bool> {
        let released = self.store.compare_and_delete(&lock_key(key), token).await?;
        record("release", released);
        debug!(key, released, "lock release");
        Ok(released)
    }

    /// Unconditionally delete the lock, whoever holds it.
    ///
    /// Operator escape hatch. A caller whose own lock expired can remove a
    /// newer holder's claim with this.
    pub async fn force_release(&self, key: &str) -> Result<bool> {
        let released = self.store.del(&lock_key(key)).await?;
        record("force_release", released);
        debug!(key, released, "lock force release");
        Ok(released)
    }

    /// Whether any holder currently owns the lock.
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        self.store.exists(&lock_key(key)).await
    }
}

fn record(operation: &'static str, ok: bool) {
    metrics::lock_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", if ok { "ok" } else { "contended" }),
        ],
    );
}
