use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use super::{KeyTtl, SharedStore};
use crate::config::RedisConfig;
use crate::error::{ErrorCode, Result, TollgateError};

/// INCR and the first-increment EXPIRE in one server-side step.
const INCR_WITH_EXPIRY: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// ARGV: expect_present ("0"/"1"), expected value, new value, ttl ms (0 = none).
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then return 0 end
else
    if current then return 0 end
end
if tonumber(ARGV[4]) > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Redis-backed [`SharedStore`].
///
/// Holds a [`ConnectionManager`], which multiplexes commands over one
/// connection and reconnects transparently. Every command is bounded by the
/// configured command timeout.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    incr_script: Script,
    cas_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect, retrying with a linearly growing delay up to
    /// `config.connect_retries` attempts.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            TollgateError::with_internal(
                ErrorCode::StoreUnavailable,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut attempt = 0u32;
        let conn = loop {
            attempt += 1;
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) if attempt < config.connect_retries => {
                    let delay = config.connect_backoff * attempt;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(TollgateError::with_internal(
                        ErrorCode::StoreUnavailable,
                        "Failed to connect to Redis",
                        format!("gave up after {} attempts: {}", attempt, e),
                    ))
                }
            }
        };

        let store = Self::from_manager(conn, config);
        store.ping().await?;
        info!(url = %config.url, "Redis store connected");
        Ok(store)
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager, config: &RedisConfig) -> Self {
        Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout,
            incr_script: Script::new(INCR_WITH_EXPIRY),
            cas_script: Script::new(COMPARE_AND_SET),
        }
    }

    /// A clone of the underlying connection, for the job store.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(TollgateError::from),
            Err(_) => Err(TollgateError::store_timeout(operation)),
        }
    }
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        self.bounded("INCR", async move { conn.incr(&key, 1i64).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        let ms = millis(ttl);
        self.bounded("PEXPIRE", async move {
            redis::cmd("PEXPIRE").arg(&key).arg(ms).query_async(&mut conn).await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        self.bounded("GET", async move { conn.get(&key).await }).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        let value = value.to_string();
        self.bounded("SET", async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd.query_async(&mut conn).await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        let pttl: i64 = self
            .bounded("PTTL", async move {
                redis::cmd("PTTL").arg(&key).query_async(&mut conn).await
            })
            .await?;

        Ok(match pttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.full_key(key);
        let removed: i64 = self.bounded("DEL", async move { conn.del(&key).await }).await?;
        Ok(removed > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.cas_script.key(self.full_key(key));
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl.map(millis).unwrap_or(0));

        let swapped: i64 = self
            .bounded("CAS", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(swapped == 1)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let mut invocation = self.incr_script.key(self.full_key(key));
        invocation.arg(millis(window));

        self.bounded("INCR_WITH_EXPIRY", async move {
            invocation.invoke_async(&mut conn).await
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .bounded("PING", async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
