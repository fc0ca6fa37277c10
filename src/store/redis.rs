//! Redis-backed durable store.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Cmd, FromRedisValue, Script};
use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::{duration_millis, DurableStore, Expiry};
use crate::error::StoreError;

// INCR and PEXPIRE in one server-side step. `PTTL < 0` also repairs a counter
// that lost its expiry to an earlier non-atomic write.
const INCREMENT_WITH_EXPIRY_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if ARGV[2] == 'refresh' or redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis implementation of [`DurableStore`].
///
/// The connection is opened lazily on first use and then shared; the
/// `ConnectionManager` reconnects on its own after failures. Every command,
/// including the initial connect, is bounded by `timeout`.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.connection.initialized())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Parse `url` without connecting.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|error| StoreError::Connection(format!("invalid redis url: {error}")))?;
        Ok(Self { client, connection: OnceCell::new(), timeout })
    }

    async fn bounded<T, F>(&self, command: &'static str, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = ::redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Err(_) => Err(StoreError::Timeout { command, timeout: self.timeout }),
            Ok(Err(error)) => Err(StoreError::Command { command, message: error.to_string() }),
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                self.bounded("CONNECT", ConnectionManager::new(self.client.clone()))
                    .await
                    .map_err(|error| StoreError::Connection(error.to_string()))
            })
            .await?;
        Ok(manager.clone())
    }

    async fn run<T>(&self, command: &'static str, cmd: Cmd) -> Result<T, StoreError>
    where
        T: FromRedisValue + Send,
    {
        let mut connection = self.connection().await?;
        self.bounded(command, cmd.query_async(&mut connection)).await
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut cmd = ::redis::cmd("GET");
        cmd.arg(key);
        self.run("GET", cmd).await
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = ::redis::cmd("INCR");
        cmd.arg(key);
        self.run("INCR", cmd).await
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = ::redis::cmd("DECR");
        cmd.arg(key);
        self.run("DECR", cmd).await
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
        expiry: Expiry,
    ) -> Result<i64, StoreError> {
        let mode = match expiry {
            Expiry::Refresh => "refresh",
            Expiry::IfMissing => "if_missing",
        };
        let mut connection = self.connection().await?;
        let script = Script::new(INCREMENT_WITH_EXPIRY_SCRIPT);
        let mut invocation = script.key(key);
        invocation.arg(duration_millis(ttl)).arg(mode);
        self.bounded("INCR+PEXPIRE", invocation.invoke_async::<i64>(&mut connection)).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut cmd = ::redis::cmd("PEXPIRE");
        cmd.arg(key).arg(duration_millis(ttl));
        let _applied: i64 = self.run("PEXPIRE", cmd).await?;
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(duration_millis(ttl));
        self.run("SET", cmd).await
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = ::redis::cmd("DEL");
        for key in keys {
            cmd.arg(*key);
        }
        let _removed: i64 = self.run("DEL", cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let err = RedisStore::open("not a url", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn unreachable_server_fails_within_bound() {
        // Port 1 on loopback refuses or stalls; either way the call must return.
        let store = RedisStore::open("redis://127.0.0.1:1/", Duration::from_millis(200))
            .expect("well-formed url");
        let started = std::time::Instant::now();
        let err = store.increment("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_) | StoreError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
