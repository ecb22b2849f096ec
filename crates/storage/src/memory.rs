//! In-process backend with the same semantics as the Redis one.
//!
//! Used by the test suites and by single-node development runs
//! (`storage.backend = memory`).

use crate::StorageError;
use crate::cache::{CacheStore, RangeOrder, RangeQuery};
use crate::stream::{
    PresenceBus, PresenceSubscription, ReadCursor, ReadRequest, StreamEntry, StreamTransport,
};
use async_trait::async_trait;
use chrono::Utc;
use parley_events::{FieldMap, StreamEntryId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;

const PRESENCE_CAPACITY: usize = 256;

/// Full copy of the cache contents, comparable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub hashes: BTreeMap<String, BTreeMap<String, String>>,
    pub ordered: BTreeMap<String, BTreeMap<String, f64>>,
    pub sets: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct TopicLog {
    entries: BTreeMap<StreamEntryId, Option<FieldMap>>,
    last_id: StreamEntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: StreamEntryId,
    pending: BTreeMap<StreamEntryId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

pub struct MemoryStore {
    cache: Mutex<CacheSnapshot>,
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
    presence: broadcast::Sender<(String, String)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (presence, _) = broadcast::channel(PRESENCE_CAPACITY);
        Self {
            cache: Mutex::new(CacheSnapshot::default()),
            topics: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            presence,
        }
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        self.cache.lock().await.clone()
    }

    /// Appends with a caller-chosen id, which must exceed the topic's last id.
    pub async fn append_at(
        &self,
        topic: &str,
        id: StreamEntryId,
        fields: FieldMap,
    ) -> Result<(), StorageError> {
        let mut topics = self.topics.lock().await;
        let log = topics.entry(topic.to_string()).or_default();
        if id <= log.last_id {
            return Err(StorageError::Invalid(format!(
                "entry id {} is not greater than {}",
                id, log.last_id
            )));
        }
        log.entries.insert(id, Some(fields));
        log.last_id = id;
        drop(topics);
        self.appended.notify_waiters();
        Ok(())
    }

    /// Drops an entry's payload while leaving any pending reference behind,
    /// the way `XDEL` leaves dangling ids in a consumer group.
    pub async fn delete_entry(&self, topic: &str, id: StreamEntryId) {
        let mut topics = self.topics.lock().await;
        if let Some(log) = topics.get_mut(topic) {
            log.entries.remove(&id);
        }
    }

    /// Ids still pending for `group`, oldest first.
    pub async fn pending_ids(&self, topic: &str, group: &str) -> Vec<StreamEntryId> {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map(|state| state.pending.keys().copied().collect())
            .unwrap_or_default()
    }

    fn deliver_new(
        log: &mut TopicLog,
        request: &ReadRequest<'_>,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let TopicLog { entries, groups, .. } = log;
        let state = groups
            .get_mut(request.group)
            .ok_or_else(|| StorageError::MissingGroup(request.group.to_string()))?;
        let now = Instant::now();
        let fresh = entries
            .range(state.last_delivered.successor()..)
            .take(request.count.max(1))
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
                redelivered: false,
            })
            .collect::<Vec<_>>();
        for entry in &fresh {
            state.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: request.consumer.to_string(),
                    delivered_at: now,
                },
            );
            state.last_delivered = entry.id;
        }
        Ok(fresh)
    }
}

fn drop_empty<V>(map: &mut BTreeMap<String, V>, key: &str, is_empty: impl Fn(&V) -> bool) {
    if map.get(key).is_some_and(is_empty) {
        map.remove(key);
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn set_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.lock().await;
        let hash = cache.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let cache = self.cache.lock().await;
        Ok(cache
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn get_all_fields(&self, key: &str) -> Result<Vec<(String, String)>, StorageError> {
        let cache = self.cache.lock().await;
        Ok(cache
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        if let Some(hash) = cache.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
        }
        drop_empty(&mut cache.hashes, key, BTreeMap::is_empty);
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
        let mut cache = self.cache.lock().await;
        let set = cache.ordered.entry(key.to_string()).or_default();
        let mut added = 0;
        for (member, score) in members {
            if set.insert(member.clone(), *score).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn ordered_raise(
        &self,
        key: &str,
        members: &[(String, f64)],
    ) -> Result<usize, StorageError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cache = self.cache.lock().await;
        let set = cache.ordered.entry(key.to_string()).or_default();
        let mut added = 0;
        for (member, score) in members {
            match set.get_mut(member) {
                Some(current) => {
                    if *score > *current {
                        *current = *score;
                    }
                }
                None => {
                    set.insert(member.clone(), *score);
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    async fn ordered_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        if let Some(set) = cache.ordered.get_mut(key) {
            for member in members {
                set.remove(member);
            }
        }
        drop_empty(&mut cache.ordered, key, BTreeMap::is_empty);
        Ok(())
    }

    async fn ordered_range(
        &self,
        key: &str,
        query: &RangeQuery,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        let cache = self.cache.lock().await;
        let Some(set) = cache.ordered.get(key) else {
            return Ok(Vec::new());
        };
        let mut members = set
            .iter()
            .filter(|(_, score)| query.min.admits_above(**score) && query.max.admits_below(**score))
            .map(|(member, score)| (member.clone(), *score))
            .collect::<Vec<_>>();
        // ties resolve lexicographically, as in redis
        members.sort_by(|left, right| left.1.total_cmp(&right.1).then_with(|| left.0.cmp(&right.0)));
        if query.order == RangeOrder::Descending {
            members.reverse();
        }
        if let Some(limit) = query.limit {
            members.truncate(limit);
        }
        Ok(members)
    }

    async fn ordered_cardinality(&self, key: &str) -> Result<usize, StorageError> {
        let cache = self.cache.lock().await;
        Ok(cache.ordered.get(key).map(BTreeMap::len).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.lock().await;
        let set = cache.sets.entry(key.to_string()).or_default();
        set.extend(members.iter().cloned());
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        if let Some(set) = cache.sets.get_mut(key) {
            for member in members {
                set.remove(member);
            }
        }
        drop_empty(&mut cache.sets, key, BTreeSet::is_empty);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let cache = self.cache.lock().await;
        Ok(cache
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_cardinality(&self, key: &str) -> Result<usize, StorageError> {
        let cache = self.cache.lock().await;
        Ok(cache.sets.get(key).map(BTreeSet::len).unwrap_or(0))
    }
}

#[async_trait]
impl StreamTransport for MemoryStore {
    async fn append(&self, topic: &str, fields: &FieldMap) -> Result<StreamEntryId, StorageError> {
        if fields.is_empty() {
            return Err(StorageError::Invalid("empty field map".to_string()));
        }
        let mut topics = self.topics.lock().await;
        let log = topics.entry(topic.to_string()).or_default();
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let id = if now > log.last_id.millis {
            StreamEntryId::new(now, 0)
        } else {
            log.last_id.successor()
        };
        log.entries.insert(id, Some(fields.clone()));
        log.last_id = id;
        drop(topics);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StorageError> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read(&self, request: &ReadRequest<'_>) -> Result<Vec<StreamEntry>, StorageError> {
        if let ReadCursor::Backlog(after) = request.cursor {
            let mut topics = self.topics.lock().await;
            let log = topics
                .get_mut(request.topic)
                .ok_or_else(|| StorageError::MissingGroup(request.group.to_string()))?;
            let TopicLog { entries, groups, .. } = log;
            let state = groups
                .get_mut(request.group)
                .ok_or_else(|| StorageError::MissingGroup(request.group.to_string()))?;
            let now = Instant::now();
            let backlog = state
                .pending
                .range_mut(after.successor()..)
                .filter(|(_, pending)| pending.consumer == request.consumer)
                .take(request.count.max(1))
                .map(|(id, pending)| {
                    pending.delivered_at = now;
                    StreamEntry {
                        id: *id,
                        fields: entries.get(id).cloned().flatten(),
                        redelivered: true,
                    }
                })
                .collect();
            return Ok(backlog);
        }

        let deadline = request.block.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut topics = self.topics.lock().await;
                let log = topics
                    .get_mut(request.topic)
                    .ok_or_else(|| StorageError::MissingGroup(request.group.to_string()))?;
                let fresh = Self::deliver_new(log, request)?;
                if !fresh.is_empty() {
                    return Ok(fresh);
                }
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    async fn ack(
        &self,
        topic: &str,
        group: &str,
        ids: &[StreamEntryId],
    ) -> Result<usize, StorageError> {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics
            .get_mut(topic)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| state.pending.remove(id).is_some())
            .count())
    }

    async fn claim_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut topics = self.topics.lock().await;
        let log = topics
            .get_mut(topic)
            .ok_or_else(|| StorageError::MissingGroup(group.to_string()))?;
        let TopicLog { entries, groups, .. } = log;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| StorageError::MissingGroup(group.to_string()))?;
        let now = Instant::now();
        let idle = state
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count.max(1))
            .collect::<Vec<_>>();
        let mut claimed = Vec::with_capacity(idle.len());
        for id in idle {
            match entries.get(&id).cloned().flatten() {
                Some(fields) => {
                    state.pending.insert(
                        id,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                        },
                    );
                    claimed.push(StreamEntry {
                        id,
                        fields: Some(fields),
                        redelivered: true,
                    });
                }
                // deleted entries leave the pending list when claimed
                None => {
                    state.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize, StorageError> {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map(|state| state.pending.len())
            .ok_or_else(|| StorageError::MissingGroup(group.to_string()))
    }
}

#[async_trait]
impl PresenceBus for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        // no subscribers is not an error for fire-and-forget pub/sub
        let _ = self
            .presence
            .send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PresenceSubscription, StorageError> {
        let receiver = self.presence.subscribe();
        let channel = channel.to_string();
        let messages = futures_util::stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((topic, payload)) if topic == channel => {
                            return Some((payload, receiver));
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn request(cursor: ReadCursor) -> ReadRequest<'static> {
        ReadRequest {
            topic: "new_users",
            group: "projector",
            consumer: "c1",
            count: 10,
            block: Some(Duration::from_millis(10)),
            cursor,
        }
    }

    #[tokio::test]
    async fn ordered_range_pages_backwards() {
        let store = MemoryStore::new();
        let members = (0..5)
            .map(|index| (format!("che-{}", index), 1700.0 + index as f64))
            .collect::<Vec<_>>();
        assert_eq!(store.ordered_add("h", &members).await.unwrap(), 5);
        assert_eq!(store.ordered_add("h", &members[..2]).await.unwrap(), 0);

        let page = store.ordered_range("h", &RangeQuery::latest(2)).await.unwrap();
        assert_eq!(
            page.iter().map(|(member, _)| member.as_str()).collect::<Vec<_>>(),
            vec!["che-4", "che-3"]
        );
        let older = store
            .ordered_range("h", &RangeQuery::before(page[1].1, 10))
            .await
            .unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].0, "che-2");
    }

    #[tokio::test]
    async fn tied_scores_keep_both_members() {
        let store = MemoryStore::new();
        let tied = 1700.0 + 255.0 / 256.0;
        store
            .ordered_add("h", &[("che-b".to_string(), tied), ("che-a".to_string(), tied)])
            .await
            .unwrap();
        store.ordered_add("h", &[("che-0".to_string(), 1700.0)]).await.unwrap();
        let all = store.ordered_range("h", &RangeQuery::all()).await.unwrap();
        assert_eq!(
            all.iter().map(|(member, _)| member.as_str()).collect::<Vec<_>>(),
            vec!["che-0", "che-a", "che-b"]
        );
        let latest = store.ordered_range("h", &RangeQuery::latest(1)).await.unwrap();
        assert_eq!(latest[0].0, "che-b");
    }

    #[tokio::test]
    async fn raise_never_lowers() {
        let store = MemoryStore::new();
        let chat = "direct:bob".to_string();
        assert_eq!(store.ordered_raise("chats", &[(chat.clone(), 1700.5)]).await.unwrap(), 1);
        assert_eq!(store.ordered_raise("chats", &[(chat.clone(), 1700.0)]).await.unwrap(), 0);
        store.ordered_raise("chats", &[(chat.clone(), 1800.0)]).await.unwrap();
        let all = store.ordered_range("chats", &RangeQuery::all()).await.unwrap();
        assert_eq!(all, vec![(chat, 1800.0)]);
    }

    #[tokio::test]
    async fn emptied_containers_disappear() {
        let store = MemoryStore::new();
        store
            .set_fields("users", &[("alice".to_string(), "{}".to_string())])
            .await
            .unwrap();
        store.delete_fields("users", &["alice".to_string()]).await.unwrap();
        store.set_add("s", &["a".to_string()]).await.unwrap();
        store.set_remove("s", &["a".to_string()]).await.unwrap();
        assert_eq!(store.snapshot().await, CacheSnapshot::default());
    }

    #[tokio::test]
    async fn group_delivery_and_backlog() {
        let store = MemoryStore::new();
        store.ensure_group("new_users", "projector").await.unwrap();
        for seq in 0..3 {
            store
                .append_at("new_users", StreamEntryId::new(1700, seq), fields(&[("username", "a")]))
                .await
                .unwrap();
        }
        let first = store.read(&request(ReadCursor::New)).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|entry| !entry.redelivered));
        assert!(store.read(&request(ReadCursor::New)).await.unwrap().is_empty());

        store
            .ack("new_users", "projector", &[StreamEntryId::new(1700, 1)])
            .await
            .unwrap();
        let backlog = store
            .read(&request(ReadCursor::Backlog(StreamEntryId::ZERO)))
            .await
            .unwrap();
        assert_eq!(
            backlog.iter().map(|entry| entry.id).collect::<Vec<_>>(),
            vec![StreamEntryId::new(1700, 0), StreamEntryId::new(1700, 2)]
        );
        assert!(backlog.iter().all(|entry| entry.redelivered));
        let after = store
            .read(&request(ReadCursor::Backlog(StreamEntryId::new(1700, 0))))
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(store.pending_count("new_users", "projector").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deleted_entries_surface_without_fields() {
        let store = MemoryStore::new();
        store.ensure_group("new_users", "projector").await.unwrap();
        let id = store.append("new_users", &fields(&[("username", "a")])).await.unwrap();
        store.read(&request(ReadCursor::New)).await.unwrap();
        store.delete_entry("new_users", id).await;
        let backlog = store
            .read(&request(ReadCursor::Backlog(StreamEntryId::ZERO)))
            .await
            .unwrap();
        assert_eq!(backlog.len(), 1);
        assert!(backlog[0].fields.is_none());
    }

    #[tokio::test]
    async fn reading_without_group_fails() {
        let store = MemoryStore::new();
        store.append("new_users", &fields(&[("username", "a")])).await.unwrap();
        let err = store.read(&request(ReadCursor::New)).await.unwrap_err();
        assert!(matches!(err, StorageError::MissingGroup(_)));
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.ensure_group("new_users", "projector").await.unwrap();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut blocking = request(ReadCursor::New);
                blocking.block = Some(Duration::from_secs(5));
                store.read(&blocking).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("new_users", &fields(&[("username", "a")])).await.unwrap();
        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn stale_entries_move_to_claimer() {
        let store = MemoryStore::new();
        store.ensure_group("new_users", "projector").await.unwrap();
        store.append("new_users", &fields(&[("username", "a")])).await.unwrap();
        store.read(&request(ReadCursor::New)).await.unwrap();
        let claimed = store
            .claim_stale("new_users", "projector", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(claimed[0].redelivered);
        let mut other = request(ReadCursor::Backlog(StreamEntryId::ZERO));
        other.consumer = "c2";
        assert_eq!(store.read(&other).await.unwrap().len(), 1);
        assert!(
            store
                .read(&request(ReadCursor::Backlog(StreamEntryId::ZERO)))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn presence_filters_by_channel() {
        let store = MemoryStore::new();
        let mut updates = store.subscribe("presence_updates").await.unwrap();
        store.publish("elsewhere", "ignored").await.unwrap();
        store.publish("presence_updates", "payload").await.unwrap();
        assert_eq!(updates.next().await.as_deref(), Some("payload"));
    }
}
