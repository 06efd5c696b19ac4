//! Redis-backed [`KvStore`].
//!
//! One multiplexed connection per process. It is cheap to clone and safe
//! to drive from every consumer loop and the admin surface at once.

use super::{KvStore, StoreStats, parse_info};
use crate::config::StoreConfig;
use crate::config::secrets::expose_opt;
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisResult, Script};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisStore {
    conn: MultiplexedConnection,
    connected: Arc<AtomicBool>,
    compare_and_delete: Script,
}

impl RedisStore {
    /// Connect to the store. Failure here is fatal at startup.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.database,
                password: expose_opt(&config.password).map(str::to_string),
                ..Default::default()
            },
        };

        let client = Client::open(info)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            Error::StoreUnavailable(format!(
                "failed to connect to {}:{}: {e}",
                config.host, config.port
            ))
        })?;

        info!(host = %config.host, port = config.port, db = config.database, "store connected");

        Ok(Self {
            conn,
            connected: Arc::new(AtomicBool::new(true)),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Send QUIT and mark the store disconnected. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("QUIT").query_async(&mut conn).await;
        match result {
            Ok(()) => info!("store disconnected"),
            Err(e) => warn!("error while disconnecting store: {e}"),
        }
    }

    /// Fold a command result into the crate error type, tracking connection state.
    fn track<T>(&self, result: RedisResult<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.connected.store(true, Ordering::Relaxed);
                Ok(value)
            }
            Err(e)
                if e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout() =>
            {
                if self.connected.swap(false, Ordering::Relaxed) {
                    warn!("store connection lost: {e}");
                }
                Err(Error::StoreUnavailable(e.to_string()))
            }
            Err(e) => Err(Error::Store(e)),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("GET").arg(key).query_async(&mut conn).await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_seconds {
            cmd.arg("EX").arg(ttl);
        }
        let result: RedisResult<()> = cmd.query_async(&mut conn).await;
        self.track(result)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        self.track(result).map(|n| n > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await;
        self.track(result).map(|n| n == 1)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await;
        self.track(result)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX PX replies OK on success and nil when the key already exists.
        let result: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;
        self.track(result).map(|reply| reply.as_deref() == Some("OK"))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await;
        self.track(result).map(|n| n > 0)
    }

    async fn incr(&self, key: &str, ttl_seconds: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let result: RedisResult<(i64,)> = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await;
        self.track(result).map(|(count,)| count)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("TTL").arg(key).query_async(&mut conn).await;
        self.track(result)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await;
        self.track(result).map(|n| n == 1)
    }

    async fn ping(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.track(result).map(|reply| reply == "PONG")
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut conn = self.conn.clone();
        let info: RedisResult<String> = redis::cmd("INFO").query_async(&mut conn).await;
        let info = self.track(info)?;
        let db_size: RedisResult<u64> = redis::cmd("DBSIZE").query_async(&mut conn).await;
        let db_size = self.track(db_size)?;

        Ok(StoreStats {
            connected: self.is_connected(),
            db_size,
            info: parse_info(&info),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
