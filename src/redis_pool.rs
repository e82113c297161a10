//! Shared blocking Redis pool.
//!
//! Quota and conversation stores share one r2d2 pool of synchronous
//! connections and run their commands on tokio's blocking thread pool.

use std::sync::Arc;

use thiserror::Error;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
pub const DEFAULT_POOL_MAX: u32 = 16;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
}

pub struct RedisConnectionManager {
    client: redis::Client,
}

impl RedisConnectionManager {
    pub fn new(url: &str) -> Result<Self, PoolError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = redis::Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.client.get_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let _: String = redis::cmd("PING").query(conn)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Cloneable handle to the pool.
#[derive(Clone)]
pub struct RedisPool {
    inner: Arc<r2d2::Pool<RedisConnectionManager>>,
}

impl RedisPool {
    /// Build a pool. Connections are opened lazily so an unreachable server
    /// does not prevent startup; stores fail per call instead.
    pub fn connect(url: &str, max_size: u32) -> Result<Self, PoolError> {
        let manager = RedisConnectionManager::new(url)?;
        let pool = r2d2::Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(std::time::Duration::from_secs(2))
            .build_unchecked(manager);
        Ok(Self {
            inner: Arc::new(pool),
        })
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let pool = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<T, PoolError> {
            let mut conn = pool.get()?;
            Ok(f(&mut *conn)?)
        })
        .await
        .map_err(|e| PoolError::Join(e.to_string()))?
    }

    pub async fn ping(&self) -> Result<bool, PoolError> {
        self.run(|conn| {
            let pong: String = redis::cmd("PING").query(conn)?;
            Ok(pong == "PONG")
        })
        .await
    }
}
