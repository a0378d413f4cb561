// src/collect/redis.rs
//! Redis-backed checkpoints (`checkpoint:{channel}`) and a Redis Streams publisher.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::collect::checkpoint::{decode_checkpoint, CheckpointStore};
use crate::collect::publish::Publisher;
use crate::collect::types::{format_timestamp, Channel, StoredItem, Timestamp};
use crate::error::{CheckpointError, PublishError};

pub async fn connect(url: &str) -> redis::RedisResult<MultiplexedConnection> {
    let client = redis::Client::open(url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    tracing::info!(url, "redis connected");
    Ok(conn)
}

fn checkpoint_key(channel: Channel) -> String {
    format!("checkpoint:{channel}")
}

#[derive(Clone)]
pub struct RedisCheckpointStore {
    conn: MultiplexedConnection,
}

impl RedisCheckpointStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, channel: Channel) -> Result<Option<Timestamp>, CheckpointError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(checkpoint_key(channel)).await?;
        Ok(raw.and_then(|s| decode_checkpoint(channel, &s)))
    }

    async fn set(&self, channel: Channel, checkpoint: Timestamp) -> Result<(), CheckpointError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(checkpoint_key(channel), format_timestamp(&checkpoint))
            .await?;
        tracing::debug!(%channel, checkpoint = %checkpoint, "checkpoint saved");
        Ok(())
    }
}

/// `XADD <stream> * data <record-json>`; the stream entry id is the delivery token.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: MultiplexedConnection,
    stream: String,
}

impl RedisStreamPublisher {
    pub fn new(conn: MultiplexedConnection, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl Publisher for RedisStreamPublisher {
    async fn publish(&self, item: &StoredItem) -> Result<String, PublishError> {
        let payload = serde_json::to_string(&item.to_record())?;
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(&self.stream, "*", &[("data", payload.as_str())])
            .await?;
        tracing::debug!(
            entry_id = %entry_id,
            id = item.id,
            channel = %item.item.channel,
            "record appended to stream"
        );
        Ok(entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_keys_use_channel_value() {
        assert_eq!(checkpoint_key(Channel::TruthSocial), "checkpoint:truth_social");
        assert_eq!(checkpoint_key(Channel::Dummy), "checkpoint:dummy");
    }
}
