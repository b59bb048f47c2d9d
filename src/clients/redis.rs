use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use futures_util::{FutureExt, future::BoxFuture};
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::cache::CoordinationCache;

/// Coordination cache backed by Redis, shared by every dispatcher instance.
#[derive(Clone)]
pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self { connection })
    }
}

impl CoordinationCache for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, Error>> {
        let mut conn = self.connection.clone();
        async move {
            let value: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| anyhow!("Failed to read '{}': {}", key, e))?;
            Ok(value)
        }
        .boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), Error>> {
        let mut conn = self.connection.clone();
        async move {
            conn.set::<_, _, ()>(key, value)
                .await
                .map_err(|e| anyhow!("Failed to write '{}': {}", key, e))
        }
        .boxed()
    }

    fn set_nx_ex<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        let mut conn = self.connection.clone();
        async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow!("Failed to set '{}' if absent: {}", key, e))?;
            Ok(reply.is_some())
        }
        .boxed()
    }

    fn incr<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<i64, Error>> {
        let mut conn = self.connection.clone();
        async move {
            let count: i64 = conn
                .incr(key, 1)
                .await
                .map_err(|e| anyhow!("Failed to increment '{}': {}", key, e))?;
            Ok(count)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<(), Error>> {
        let mut conn = self.connection.clone();
        async move {
            if keys.is_empty() {
                return Ok(());
            }
            conn.del::<_, ()>(keys)
                .await
                .map_err(|e| anyhow!("Failed to delete keys: {}", e))
        }
        .boxed()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), Error>> {
        let mut conn = self.connection.clone();
        async move {
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow!("Redis ping failed: {}", e))?;
            Ok(())
        }
        .boxed()
    }
}
