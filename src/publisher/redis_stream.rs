//! Redis Streams publisher.
//!
//! Each entity becomes one `XADD <topic> * key <external_id>` entry. The
//! topic is the stream name. Redis acknowledges the entry once it is in
//! memory; durability beyond that is the Redis deployment's business.
//!
//! Uses `redis::aio::ConnectionManager`, which reconnects on its own and is
//! cheap to clone, so one publisher is shared by every walk in the process.

use super::Publisher;
use crate::config::BrokerConfig;
use crate::error::{FanoutError, Result};
use crate::resilience::RetryConfig;
use crate::types::BoxFuture;
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::{AsyncCommands, Client};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Field name that carries the message key in each stream entry.
pub const KEY_FIELD: &str = "key";

pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    max_len: Option<usize>,
}

impl RedisStreamPublisher {
    /// Connect with bounded retries.
    pub async fn connect(config: &BrokerConfig, retry_config: &RetryConfig) -> Result<Self> {
        info!(url = %config.redis_url, "Connecting to broker");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| FanoutError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let failure = match timeout(retry_config.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(attempt, "Connected to broker after retry");
                    } else {
                        info!("Connected to broker");
                    }
                    return Ok(Self {
                        conn,
                        max_len: config.stream_max_len,
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "connection timed out ({}ms)",
                    retry_config.connection_timeout.as_millis()
                ),
            };

            if !retry_config.allows_retry(attempt) {
                error!(attempt, error = %failure, "Failed to connect to broker after max retries");
                return Err(FanoutError::publish_msg(
                    "*",
                    "",
                    format!("broker connection failed after {} attempts: {}", attempt, failure),
                ));
            }

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %failure,
                "Broker connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: ConnectionManager, max_len: Option<usize>) -> Self {
        Self { conn, max_len }
    }

    /// Round-trip check used by `fanout status`.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| FanoutError::publish("*", "", e))?;
        Ok(())
    }
}

impl Publisher for RedisStreamPublisher {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let fields = [(KEY_FIELD, key)];

            let entry_id: String = match self.max_len {
                Some(max_len) => {
                    conn.xadd_maxlen(topic, StreamMaxlen::Approx(max_len), "*", &fields)
                        .await
                }
                None => conn.xadd(topic, "*", &fields).await,
            }
            .map_err(|e| FanoutError::publish(topic, key, e))?;

            debug!(topic, key, entry_id = %entry_id, "Published entity");
            Ok(())
        })
    }
}
