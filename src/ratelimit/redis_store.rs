//! Redis-backed counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::store::{ttl_millis, CounterStore, StoreError, StoreResult};

/// Upper bound on a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before the first reconnect attempt; doubles up to [`RETRY_MAX`].
const RETRY_MIN: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// Counter store backed by a shared Redis instance.
///
/// All gate replicas pointed at the same Redis database share window
/// counters and block flags. Until the first connection succeeds every
/// operation fails with [`StoreError::Unavailable`]. After that the
/// connection manager reconnects on its own. A failed command is reported
/// once and never retried here.
#[derive(Clone)]
pub struct RedisStore {
    addr: String,
    client: Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.addr)
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for Redis at `addr` (`host:port`), authenticating with
    /// `password` when one is given, and start connecting in the background.
    ///
    /// Only the address is validated here. Must be called from within a
    /// tokio runtime.
    pub fn new(addr: &str, password: Option<&str>) -> StoreResult<Self> {
        let store = Self::unconnected(addr, password)?;

        let connector = store.clone();
        tokio::spawn(async move { connector.connect_in_background().await });

        Ok(store)
    }

    /// Create a store and wait for its first connection.
    pub async fn connect(addr: &str, password: Option<&str>) -> StoreResult<Self> {
        let store = Self::unconnected(addr, password)?;
        let conn = store.dial().await?;
        let _ = store.conn.set(conn);
        Ok(store)
    }

    /// Whether a connection to Redis has been established.
    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }

    /// Remove every key in the selected database.
    ///
    /// Intended for test setup against a dedicated Redis instance.
    pub async fn flush(&self) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        debug!("Flushed Redis counter store");
        Ok(())
    }

    fn unconnected(addr: &str, password: Option<&str>) -> StoreResult<Self> {
        let url = format!("redis://{}/0", addr);
        let mut info = url.as_str().into_connection_info()?;
        info.redis.password = password.map(str::to_owned);

        Ok(Self {
            addr: addr.to_owned(),
            client: Client::open(info)?,
            conn: Arc::new(OnceCell::new()),
        })
    }

    async fn dial(&self) -> StoreResult<ConnectionManager> {
        let attempt = ConnectionManager::new(self.client.clone());
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, attempt)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!("timed out connecting to {}", self.addr))
            })?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(addr = %self.addr, "Connected to Redis counter store");
        Ok(conn)
    }

    async fn connect_in_background(self) {
        let mut delay = RETRY_MIN;
        loop {
            match self.dial().await {
                Ok(conn) => {
                    let _ = self.conn.set(conn);
                    return;
                }
                Err(e) => {
                    warn!(
                        addr = %self.addr,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Redis unreachable, requests will be rejected"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX);
                }
            }
        }
    }

    fn connection(&self) -> StoreResult<ConnectionManager> {
        self.conn.get().cloned().ok_or_else(|| {
            StoreError::Unavailable(format!("not connected to Redis at {}", self.addr))
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection()?;
        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        // SET NX replies OK when the key was written and nil otherwise.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}
