use anyhow::{Error, Result, anyhow};
use redis::{Client, aio::MultiplexedConnection};
use tracing::info;

use crate::config::Config;

/// Shared connection to the Redis instance that stores the job queues.
#[derive(Clone)]
pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        Self::connect_url(&config.redis_url).await
    }

    pub async fn connect_url(redis_url: &str) -> Result<Self, Error> {
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

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}
