use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamAutoClaimOptions, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed stream entry: missing payload field")]
    MissingPayload,
}

/// A single delivered message: the raw bytes plus enough identity to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Contract fixed by spec §2: topic/subscription pub/sub with per-message
/// acknowledgement, nack (negative ack -> redelivery), and automatic
/// redelivery on ack-deadline expiry. Implemented on Redis Streams, where a
/// "subscription" is a consumer group and nack is simply the *absence* of
/// an ack: an unacked entry stays in the group's pending-entries list and
/// is reclaimed by `recv` once it has been idle past `visibility_timeout`.
///
/// Takes pre-serialized bytes rather than a generic `T: Serialize` so the
/// trait stays object-safe — every component holds its bus as `Arc<dyn
/// Bus>`. Use the free `publish_json` function below for the typed,
/// serializing call site.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Serialize `msg` to JSON and publish it on `topic`.
pub async fn publish_json<T: Serialize + Sync>(bus: &dyn Bus, topic: &str, msg: &T) -> Result<(), BusError> {
    let payload = serde_json::to_vec(msg)?;
    bus.publish(topic, payload).await
}

/// One subscriber's view onto a topic: receives deliveries and acks them.
#[async_trait]
pub trait Subscription: Send {
    /// Block (up to the bus's internal poll timeout) for the next message,
    /// preferring reclaim of stale pending entries over fresh ones so a
    /// crashed consumer's backlog drains before new work is admitted.
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError>;
    async fn ack(&mut self, id: &str) -> Result<(), BusError>;
}

const PAYLOAD_FIELD: &str = "payload";

/// Redis Streams-backed message bus.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    visibility_timeout: Duration,
}

impl RedisBus {
    pub fn new(redis_url: &str, visibility_timeout: Duration) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            visibility_timeout,
        })
    }

    /// Open a subscription for `topic` under `group`, creating the stream
    /// and consumer group if they don't exist yet (idempotent — mirrors
    /// the spec's "at-least-once" setup where any worker may be first up).
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<RedisSubscription, BusError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(topic, group, "$").await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }

        Ok(RedisSubscription {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            visibility_timeout: self.visibility_timeout,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = conn
            .xadd(topic, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        Ok(())
    }
}

pub struct RedisSubscription {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl RedisSubscription {
    fn extract(reply: StreamReadReply) -> Vec<Delivery> {
        let mut out = Vec::new();
        for key in reply.keys {
            for id_entry in key.ids {
                if let Some(redis::Value::BulkString(bytes)) = id_entry.map.get(PAYLOAD_FIELD) {
                    out.push(Delivery {
                        id: id_entry.id,
                        payload: bytes.clone(),
                    });
                }
            }
        }
        out
    }

    /// Reclaim entries that have been pending (unacked) longer than the
    /// visibility timeout — this is the bus's redelivery-on-deadline-expiry
    /// mechanism (spec §2 "automatic redelivery on ack deadline expiry").
    async fn reclaim_stale(&mut self) -> Result<Vec<Delivery>, BusError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as usize;
        let opts = StreamAutoClaimOptions::default().count(16);
        let reply: redis::streams::StreamAutoClaimReply = self
            .conn
            .xautoclaim_options(
                &self.topic,
                &self.group,
                &self.consumer,
                min_idle_ms,
                "0-0",
                opts,
            )
            .await?;

        let mut out = Vec::new();
        for id_entry in reply.claimed {
            if let Some(redis::Value::BulkString(bytes)) = id_entry.map.get(PAYLOAD_FIELD) {
                out.push(Delivery {
                    id: id_entry.id,
                    payload: bytes.clone(),
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>, BusError> {
        let reclaimed = self.reclaim_stale().await?;
        if let Some(first) = reclaimed.into_iter().next() {
            return Ok(Some(first));
        }

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(1000);
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[self.topic.clone()], &[">"], &opts)
            .await?;

        Ok(Self::extract(reply).into_iter().next())
    }

    async fn ack(&mut self, id: &str) -> Result<(), BusError> {
        let _: i64 = self.conn.xack(&self.topic, &self.group, &[id]).await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// In-process fake bus used by component unit tests: each topic is a
    /// plain FIFO queue, ack is a no-op (there is nothing to reclaim).
    #[derive(Default)]
    pub struct InMemoryBus {
        topics: Mutex<std::collections::HashMap<String, VecDeque<Vec<u8>>>>,
    }

    #[async_trait]
    impl Bus for InMemoryBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            self.topics
                .lock()
                .await
                .entry(topic.to_string())
                .or_default()
                .push_back(payload);
            Ok(())
        }
    }

    impl InMemoryBus {
        pub async fn drain(&self, topic: &str) -> Vec<Vec<u8>> {
            self.topics
                .lock()
                .await
                .get_mut(topic)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        }

        pub async fn decode_all<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
            self.drain(topic)
                .await
                .iter()
                .filter_map(|bytes| serde_json::from_slice(bytes).ok())
                .collect()
        }

        pub async fn len(&self, topic: &str) -> usize {
            self.topics.lock().await.get(topic).map(|q| q.len()).unwrap_or(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::InMemoryBus;
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn publish_is_observable_by_topic() {
        let bus = InMemoryBus::default();
        publish_json(&bus, "t", &Ping { n: 1 }).await.unwrap();
        publish_json(&bus, "t", &Ping { n: 2 }).await.unwrap();
        assert_eq!(bus.len("t").await, 2);
        let decoded: Vec<Ping> = bus.decode_all("t").await;
        assert_eq!(decoded, vec![Ping { n: 1 }, Ping { n: 2 }]);
        assert_eq!(bus.len("t").await, 0);
    }
}
