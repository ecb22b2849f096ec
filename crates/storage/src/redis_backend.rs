use crate::StorageError;
use crate::cache::{CacheStore, RangeOrder, RangeQuery};
use crate::stream::{
    PresenceBus, PresenceSubscription, ReadCursor, ReadRequest, StreamEntry, StreamTransport,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parley_events::{FieldMap, StreamEntryId};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamPendingReply, StreamReadReply};
use std::time::Duration;
use tracing::warn;

/// Shared Redis client for cache commands and presence pub/sub.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    redis: MultiplexedConnection,
}

/// Stream client owning a dedicated connection; blocking reads on it never
/// hold up commands issued through other connections.
#[derive(Clone)]
pub struct RedisStreams {
    redis: MultiplexedConnection,
}

/// Establishes connectivity to Redis.
pub async fn connect(redis_url: &str) -> Result<RedisBackend, StorageError> {
    let client = redis::Client::open(redis_url)?;
    let redis = client.get_multiplexed_async_connection().await?;
    Ok(RedisBackend { client, redis })
}

impl RedisBackend {
    /// Executes a lightweight probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    /// Opens a stream client on its own connection.
    pub async fn streams(&self) -> Result<RedisStreams, StorageError> {
        let redis = self.client.get_multiplexed_async_connection().await?;
        Ok(RedisStreams { redis })
    }
}

fn entry_from(raw: StreamId, redelivered: bool) -> Option<StreamEntry> {
    let id = match raw.id.parse::<StreamEntryId>() {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "stream returned an unparseable entry id");
            return None;
        }
    };
    let mut fields = FieldMap::with_capacity(raw.map.len());
    let mut readable = !raw.map.is_empty();
    for (name, value) in raw.map.iter() {
        match redis::from_redis_value::<String>(value) {
            Ok(text) => {
                fields.insert(name.clone(), text);
            }
            Err(_) => {
                readable = false;
                break;
            }
        }
    }
    Some(StreamEntry {
        id,
        fields: readable.then_some(fields),
        redelivered,
    })
}

#[async_trait]
impl StreamTransport for RedisStreams {
    async fn append(&self, topic: &str, fields: &FieldMap) -> Result<StreamEntryId, StorageError> {
        if fields.is_empty() {
            return Err(StorageError::Invalid("empty field map".to_string()));
        }
        let mut conn = self.redis.clone();
        let mut pairs = fields.iter().collect::<Vec<_>>();
        pairs.sort();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic).arg("*");
        for (name, value) in pairs {
            cmd.arg(name).arg(value);
        }
        let id = cmd.query_async::<String>(&mut conn).await?;
        id.parse::<StreamEntryId>()
            .map_err(|err| StorageError::Invalid(err.to_string()))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read(&self, request: &ReadRequest<'_>) -> Result<Vec<StreamEntry>, StorageError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(request.group)
            .arg(request.consumer)
            .arg("COUNT")
            .arg(request.count.max(1));
        let (start, redelivered) = match request.cursor {
            ReadCursor::Backlog(after) => (after.to_string(), true),
            ReadCursor::New => {
                // BLOCK 0 waits forever; a finite timeout is at least one millisecond
                let block_ms = request
                    .block
                    .map(|timeout| timeout.as_millis().max(1) as u64)
                    .unwrap_or(0);
                cmd.arg("BLOCK").arg(block_ms);
                (">".to_string(), false)
            }
        };
        cmd.arg("STREAMS").arg(request.topic).arg(start);
        let reply = cmd.query_async::<Option<StreamReadReply>>(&mut conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids.into_iter())
            .filter_map(|raw| entry_from(raw, redelivered))
            .collect())
    }

    async fn ack(
        &self,
        topic: &str,
        group: &str,
        ids: &[StreamEntryId],
    ) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(topic).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        Ok(cmd.query_async::<usize>(&mut conn).await?)
    }

    async fn claim_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut conn = self.redis.clone();
        let reply = redis::cmd("XAUTOCLAIM")
            .arg(topic)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count.max(1))
            .query_async::<StreamAutoClaimReply>(&mut conn)
            .await?;
        Ok(reply
            .claimed
            .into_iter()
            .filter_map(|raw| entry_from(raw, true))
            .collect())
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize, StorageError> {
        let mut conn = self.redis.clone();
        let reply = redis::cmd("XPENDING")
            .arg(topic)
            .arg(group)
            .query_async::<StreamPendingReply>(&mut conn)
            .await?;
        Ok(reply.count())
    }
}

#[async_trait]
impl CacheStore for RedisBackend {
    async fn set_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.redis.clone();
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<Option<String>>(&mut conn)
            .await?)
    }

    async fn get_all_fields(&self, key: &str) -> Result<Vec<(String, String)>, StorageError> {
        let mut conn = self.redis.clone();
        let mut fields = redis::cmd("HGETALL")
            .arg(key)
            .query_async::<Vec<(String, String)>>(&mut conn)
            .await?;
        fields.sort();
        Ok(fields)
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ordered_add(
        &self,
        key: &str,
        members: &[(String, f64)],
    ) -> Result<usize, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (member, score) in members {
            cmd.arg(*score).arg(member);
        }
        Ok(cmd.query_async::<usize>(&mut conn).await?)
    }

    async fn ordered_raise(
        &self,
        key: &str,
        members: &[(String, f64)],
    ) -> Result<usize, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg("GT");
        for (member, score) in members {
            cmd.arg(*score).arg(member);
        }
        Ok(cmd.query_async::<usize>(&mut conn).await?)
    }

    async fn ordered_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        redis::cmd("ZREM")
            .arg(key)
            .arg(members)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ordered_range(
        &self,
        key: &str,
        query: &RangeQuery,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(key);
        match query.order {
            RangeOrder::Ascending => {
                cmd.arg(query.min.to_arg()).arg(query.max.to_arg()).arg("BYSCORE");
            }
            RangeOrder::Descending => {
                cmd.arg(query.max.to_arg())
                    .arg(query.min.to_arg())
                    .arg("BYSCORE")
                    .arg("REV");
            }
        }
        if let Some(limit) = query.limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        cmd.arg("WITHSCORES");
        Ok(cmd.query_async::<Vec<(String, f64)>>(&mut conn).await?)
    }

    async fn ordered_cardinality(&self, key: &str) -> Result<usize, StorageError> {
        let mut conn = self.redis.clone();
        Ok(redis::cmd("ZCARD")
            .arg(key)
            .query_async::<usize>(&mut conn)
            .await?)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.redis.clone();
        let mut members = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<Vec<String>>(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }

    async fn set_cardinality(&self, key: &str) -> Result<usize, StorageError> {
        let mut conn = self.redis.clone();
        Ok(redis::cmd("SCARD")
            .arg(key)
            .query_async::<usize>(&mut conn)
            .await?)
    }
}

#[async_trait]
impl PresenceBus for RedisBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        let mut conn = self.redis.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PresenceSubscription, StorageError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .filter_map(|message| async move { message.get_payload::<String>().ok() });
        Ok(Box::pin(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::stream::ReadRequest;

    #[tokio::test]
    async fn redis_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let url = match std::env::var("PARLEY_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping redis_integration_flow: PARLEY_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let backend = connect(&url).await?;
        backend.readiness().await?;
        let suffix = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let history = format!("test:{}:history", suffix);
        let added = backend
            .ordered_add(
                &history,
                &[("che-1".to_string(), 1700.0), ("che-2".to_string(), 1700.5)],
            )
            .await?;
        assert_eq!(added, 2);
        let again = backend
            .ordered_add(&history, &[("che-2".to_string(), 1700.5)])
            .await?;
        assert_eq!(again, 0);
        let latest = backend
            .ordered_range(&history, &RangeQuery::latest(1))
            .await?;
        assert_eq!(latest, vec![("che-2".to_string(), 1700.5)]);
        let older = backend
            .ordered_range(&history, &RangeQuery::before(1700.5, 10))
            .await?;
        assert_eq!(older, vec![("che-1".to_string(), 1700.0)]);

        let roster = keys::group_members(&format!("g{}", suffix));
        backend
            .set_add(&roster, &["a".to_string(), "b".to_string()])
            .await?;
        backend.set_add(&roster, &["a".to_string()]).await?;
        assert_eq!(backend.set_cardinality(&roster).await?, 2);

        let streams = backend.streams().await?;
        let topic = format!("test_topic_{}", suffix);
        streams.ensure_group(&topic, "projector").await?;
        streams.ensure_group(&topic, "projector").await?;
        let mut fields = FieldMap::new();
        fields.insert("username".to_string(), "alice".to_string());
        let id = streams.append(&topic, &fields).await?;
        let request = ReadRequest {
            topic: &topic,
            group: "projector",
            consumer: "c1",
            count: 10,
            block: Some(Duration::from_millis(100)),
            cursor: ReadCursor::New,
        };
        let batch = streams.read(&request).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].fields.as_ref().unwrap()["username"], "alice");
        let backlog = streams
            .read(&ReadRequest {
                cursor: ReadCursor::Backlog(StreamEntryId::ZERO),
                ..request.clone()
            })
            .await?;
        assert_eq!(backlog.len(), 1);
        assert!(backlog[0].redelivered);
        assert_eq!(streams.pending_count(&topic, "projector").await?, 1);
        assert_eq!(streams.ack(&topic, "projector", &[id]).await?, 1);
        assert_eq!(streams.pending_count(&topic, "projector").await?, 0);
        Ok(())
    }
}
