//! Redis-backed cache for shared deployments.
//!
//! All keys are namespaced under `nophr:`. Errors degrade to the
//! uncached path and are logged once per connection lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands as _;
use tracing::warn;

use crate::{Cache, CacheStats, Counters, LOG_TARGET};

const NAMESPACE: &str = "nophr:";

pub struct RedisCache {
    client: redis::Client,
    counters: Counters,
    error_logged: AtomicBool,
}

impl RedisCache {
    pub fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            counters: Counters::default(),
            error_logged: AtomicBool::new(false),
        })
    }

    fn namespaced(key: &str) -> String {
        format!("{NAMESPACE}{key}")
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(err) => {
                self.log_once(&err);
                None
            }
        }
    }

    fn log_once(&self, err: &redis::RedisError) {
        if !self.error_logged.swap(true, Ordering::Relaxed) {
            warn!(target: LOG_TARGET, %err, "Redis cache unavailable, degrading to uncached path");
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<Vec<u8>>>(Self::namespaced(key)).await {
            Ok(Some(value)) => {
                self.counters.hit();
                Some(value)
            }
            Ok(None) => {
                self.counters.miss();
                None
            }
            Err(err) => {
                self.log_once(&err);
                self.counters.miss();
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let result: redis::RedisResult<()> = conn
            .set_ex(Self::namespaced(key), value, ttl.as_secs().max(1))
            .await;
        if let Err(err) = result {
            self.log_once(&err);
        }
    }

    async fn delete(&self, key: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let result: redis::RedisResult<()> = conn.del(Self::namespaced(key)).await;
        if let Err(err) = result {
            self.log_once(&err);
        }
    }

    async fn delete_pattern(&self, pattern: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let namespaced = Self::namespaced(pattern);
        let keys: Vec<String> = {
            let mut found = Vec::new();
            match conn.scan_match::<_, String>(&namespaced).await {
                Ok(mut iter) => {
                    while let Some(key) = iter.next_item().await {
                        found.push(key);
                    }
                }
                Err(err) => {
                    self.log_once(&err);
                    return;
                }
            }
            found
        };
        if keys.is_empty() {
            return;
        }
        let result: redis::RedisResult<()> = conn.del(keys).await;
        if let Err(err) = result {
            self.log_once(&err);
        }
    }

    async fn has(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        conn.exists(Self::namespaced(key)).await.unwrap_or(false)
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    async fn close(&self) {}
}
