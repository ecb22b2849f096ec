use crate::app::AppState;
use crate::app::convergence;
use crate::app::projection::{Decoded, Effect, KeyedWork, Projection, ProjectionPlan};
use parley_events::{StreamEntryId, StreamEvent};
use parley_storage::{ReadCursor, ReadRequest, StorageError, StreamEntry, StreamTransport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("cache failure on `{key}`: {source}")]
    Cache { key: String, source: StorageError },
    #[error("acknowledgement failed: {0}")]
    Ack(StorageError),
    #[error("projection cancelled")]
    Cancelled,
    #[error("projection task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Option<Duration>,
    pub claim_idle: Option<Duration>,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub projected: usize,
    pub corrupt: usize,
    pub acked: usize,
}

/// Drains one topic for one consumer group.
pub struct Worker<P: Projection> {
    projection: P,
    transport: Arc<dyn StreamTransport>,
    state: Arc<AppState>,
    settings: WorkerSettings,
}

impl<P: Projection> Worker<P> {
    pub fn new(
        projection: P,
        transport: Arc<dyn StreamTransport>,
        state: Arc<AppState>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            projection,
            transport,
            state,
            settings,
        }
    }

    fn topic(&self) -> &'static str {
        P::Event::TOPIC.as_str()
    }

    /// Runs until `shutdown` fires; the loop only exits between batches.
    pub async fn run(self, shutdown: CancellationToken) {
        let topic = self.topic();
        if !self.init(&shutdown).await {
            return;
        }
        info!(topic, group = %self.settings.group, consumer = %self.settings.consumer, "worker started");
        let mut cursor = ReadCursor::Backlog(StreamEntryId::ZERO);
        let mut last_claim = Instant::now();
        while !shutdown.is_cancelled() {
            if let Some(min_idle) = self.settings.claim_idle
                && last_claim.elapsed() >= min_idle
            {
                last_claim = Instant::now();
                self.claim(min_idle).await;
            }

            let request = ReadRequest {
                topic,
                group: &self.settings.group,
                consumer: &self.settings.consumer,
                count: self.settings.batch_size,
                block: self.read_block(),
                cursor,
            };
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.transport.read(&request) => read,
            };
            let entries = match read {
                Ok(entries) => entries,
                Err(err) => {
                    self.state.metrics.mark_transport_error();
                    warn!(topic, error = %err, "stream read failed");
                    if matches!(err, StorageError::MissingGroup(_))
                        && let Err(err) = self.transport.ensure_group(topic, &self.settings.group).await
                    {
                        warn!(topic, error = %err, "consumer group recreation failed");
                    }
                    self.pause(&shutdown).await;
                    continue;
                }
            };
            if entries.is_empty() {
                if let ReadCursor::Backlog(_) = cursor {
                    debug!(topic, "backlog drained");
                    cursor = ReadCursor::New;
                }
                continue;
            }
            let last_seen = entries.last().map(|entry| entry.id).unwrap_or(StreamEntryId::ZERO);
            match self.process_batch(entries).await {
                Ok(_) => {
                    if let ReadCursor::Backlog(_) = cursor {
                        cursor = ReadCursor::Backlog(last_seen);
                    }
                }
                Err(err) => {
                    self.state.metrics.mark_batch_failure();
                    error!(topic, error = %err, "batch projection failed; batch left pending");
                    cursor = ReadCursor::Backlog(StreamEntryId::ZERO);
                    self.pause(&shutdown).await;
                }
            }
        }
        info!(topic, "worker stopped");
    }

    async fn init(&self, shutdown: &CancellationToken) -> bool {
        let topic = self.topic();
        loop {
            let created = tokio::select! {
                _ = shutdown.cancelled() => return false,
                created = self.transport.ensure_group(topic, &self.settings.group) => created,
            };
            match created {
                Ok(()) => return true,
                Err(err) => {
                    self.state.metrics.mark_transport_error();
                    warn!(topic, error = %err, "consumer group creation failed");
                    self.pause(shutdown).await;
                    if shutdown.is_cancelled() {
                        return false;
                    }
                }
            }
        }
    }

    fn read_block(&self) -> Option<Duration> {
        match self.settings.claim_idle {
            // wake up in time for the next claim pass
            Some(min_idle) => Some(self.settings.block.map_or(min_idle, |block| block.min(min_idle))),
            None => self.settings.block,
        }
    }

    async fn claim(&self, min_idle: Duration) {
        let topic = self.topic();
        let claimed = self
            .transport
            .claim_stale(
                topic,
                &self.settings.group,
                &self.settings.consumer,
                min_idle,
                self.settings.batch_size,
            )
            .await;
        match claimed {
            Ok(entries) if entries.is_empty() => {}
            Ok(entries) => {
                info!(topic, count = entries.len(), "claimed stale entries");
                if let Err(err) = self.process_batch(entries).await {
                    self.state.metrics.mark_batch_failure();
                    error!(topic, error = %err, "claimed batch projection failed");
                }
            }
            Err(err) => {
                self.state.metrics.mark_transport_error();
                warn!(topic, error = %err, "stale entry claim failed");
            }
        }
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(self.settings.retry_delay) => {}
        }
    }

    /// Decodes, projects and acknowledges one batch.
    ///
    /// Corrupt entries are never acknowledged. Nothing is acknowledged when
    /// any key fails to project.
    pub async fn process_batch(
        &self,
        entries: Vec<StreamEntry>,
    ) -> Result<BatchOutcome, ProjectionError> {
        let topic = self.topic();
        let mut outcome = BatchOutcome::default();
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(fields) = entry.fields else {
                outcome.corrupt += 1;
                self.state.metrics.mark_corrupt();
                error!(topic, entry = %entry.id, reason = "no readable fields", "corrupt stream entry");
                continue;
            };
            match P::Event::from_map(&fields) {
                Ok(event) => decoded.push(Decoded {
                    id: entry.id,
                    redelivered: entry.redelivered,
                    event,
                }),
                Err(err) => {
                    outcome.corrupt += 1;
                    self.state.metrics.mark_corrupt();
                    error!(topic, entry = %entry.id, reason = %err, "corrupt stream entry");
                }
            }
        }
        if decoded.is_empty() {
            return Ok(outcome);
        }

        let mut plan = ProjectionPlan::default();
        self.projection.plan(&decoded, &mut plan);
        let (keyed, effects) = plan.into_parts();
        let keys = keyed.len();
        project_keys(&self.state, keyed).await?;
        run_effects(&self.state, effects).await;

        let ids = decoded.iter().map(|entry| entry.id).collect::<Vec<_>>();
        outcome.projected = ids.len();
        outcome.acked = self
            .transport
            .ack(topic, &self.settings.group, &ids)
            .await
            .map_err(ProjectionError::Ack)?;
        self.state.metrics.mark_batch(outcome.acked);
        debug!(
            topic,
            projected = outcome.projected,
            corrupt = outcome.corrupt,
            acked = outcome.acked,
            keys,
            "batch projected"
        );
        Ok(outcome)
    }
}

/// One task per key under a shared token; the first failure cancels the rest.
async fn project_keys(
    state: &Arc<AppState>,
    keyed: BTreeMap<String, KeyedWork>,
) -> Result<(), ProjectionError> {
    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for (key, work) in keyed {
        let state = Arc::clone(state);
        let token = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(ProjectionError::Cancelled),
                result = project_key(&state, &key, work) => result,
            }
        });
    }
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|err| ProjectionError::Join(err.to_string()))
            .and_then(|result| result);
        if let Err(err) = result
            && failure.is_none()
        {
            token.cancel();
            failure = Some(err);
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn project_key(state: &AppState, key: &str, work: KeyedWork) -> Result<(), ProjectionError> {
    let mut added = 0;
    for mutation in &work.mutations {
        added += mutation
            .apply(state.cache.as_ref(), key)
            .await
            .map_err(|source| ProjectionError::Cache {
                key: key.to_string(),
                source,
            })?;
    }
    if let Some(check) = work.convergence {
        convergence::evaluate(state, key, &check, added).await;
    }
    Ok(())
}

async fn run_effects(state: &AppState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Notify { recipients, event } => {
                state.sessions.broadcast(&recipients, &event).await;
            }
            Effect::Mirror(record) => {
                state.mirror.enqueue(record);
            }
            Effect::PublishPresence(payload) => {
                if let Err(err) = state
                    .presence
                    .publish(&state.presence_channel, &payload)
                    .await
                {
                    warn!(error = %err, "presence publish failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::projection::direct::NewDirectMessages;
    use crate::app::projection::group::GroupMessagesDelivered;
    use crate::app::projection::users::NewUsers;
    use crate::app::testing::{memory_state, memory_state_with_cache};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use parley_events::{
        ChatKind, FieldMap, GroupMessageDelivered, NewDirectMessage, NewUser, Topic,
    };
    use parley_storage::{
        CacheStore, MemoryStore, PresenceBus, RangeQuery, ScoreBound, keys,
    };
    use serde_json::json;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            group: "projector".to_string(),
            consumer: "c1".to_string(),
            batch_size: 500,
            block: Some(Duration::from_millis(10)),
            claim_idle: None,
            retry_delay: Duration::from_millis(10),
        }
    }

    async fn read_backlog(store: &MemoryStore, topic: &str) -> Vec<StreamEntry> {
        store
            .read(&ReadRequest {
                topic,
                group: "projector",
                consumer: "c1",
                count: 1000,
                block: None,
                cursor: ReadCursor::Backlog(StreamEntryId::ZERO),
            })
            .await
            .unwrap()
    }

    async fn read_new(store: &MemoryStore, topic: &str) -> Vec<StreamEntry> {
        store
            .read(&ReadRequest {
                topic,
                group: "projector",
                consumer: "c1",
                count: 1000,
                block: Some(Duration::from_millis(5)),
                cursor: ReadCursor::New,
            })
            .await
            .unwrap()
    }

    fn direct_message(index: u64) -> FieldMap {
        NewDirectMessage {
            from_user: "alice".to_string(),
            to_user: "bob".to_string(),
            message_id: format!("m{}", index),
            che_id: format!("che{}", index),
            message: json!({"text": format!("hello {}", index)}),
        }
        .encode()
    }

    #[tokio::test]
    async fn malformed_entry_stays_pending() {
        let (state, store) = memory_state();
        let topic = Topic::NewUsers.as_str();
        store.ensure_group(topic, "projector").await.unwrap();
        let mut malformed = StreamEntryId::ZERO;
        for seq in 0..500u64 {
            let id = StreamEntryId::new(1700, seq);
            let fields = if seq == 250 {
                malformed = id;
                let mut broken = FieldMap::new();
                broken.insert("username".to_string(), "eve".to_string());
                broken.insert("user_data".to_string(), "{broken".to_string());
                broken
            } else {
                NewUser {
                    username: format!("user{}", seq),
                    user_data: json!({"n": seq}),
                }
                .encode()
            };
            store.append_at(topic, id, fields).await.unwrap();
        }
        let worker = Worker::new(NewUsers, store.clone(), state.clone(), settings());
        let batch = read_new(&store, topic).await;
        assert_eq!(batch.len(), 500);
        let outcome = worker.process_batch(batch).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                projected: 499,
                corrupt: 1,
                acked: 499
            }
        );
        assert_eq!(store.pending_ids(topic, "projector").await, vec![malformed]);
        assert_eq!(state.metrics.snapshot().corrupt_events, 1);
        assert_eq!(store.get_all_fields(keys::USERS).await.unwrap().len(), 499);
    }

    #[tokio::test]
    async fn replaying_a_batch_is_idempotent() {
        let (state, store) = memory_state();
        let topic = Topic::NewDirectMessages.as_str();
        store.ensure_group(topic, "projector").await.unwrap();
        for seq in 0..3u64 {
            store
                .append_at(topic, StreamEntryId::new(1700, seq), direct_message(seq))
                .await
                .unwrap();
        }
        let worker = Worker::new(NewDirectMessages, store.clone(), state.clone(), settings());
        let batch = read_new(&store, topic).await;
        worker.process_batch(batch.clone()).await.unwrap();
        let once = store.snapshot().await;
        worker.process_batch(batch).await.unwrap();
        assert_eq!(store.snapshot().await, once);

        let history = store
            .ordered_range(
                &keys::history(ChatKind::Direct, "bob", "alice"),
                &RangeQuery::all(),
            )
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|pair| pair[0].1 < pair[1].1));
        let chats = store
            .ordered_range(&keys::chats_sorted("bob"), &RangeQuery::all())
            .await
            .unwrap();
        assert_eq!(chats, vec![("direct:alice".to_string(), history[2].1)]);
    }

    struct FailingCache {
        inner: Arc<MemoryStore>,
        poisoned: String,
    }

    #[async_trait]
    impl CacheStore for FailingCache {
        async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StorageError> {
            self.inner.set_fields(key, fields).await
        }
        async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_field(key, field).await
        }
        async fn get_all_fields(&self, key: &str) -> Result<Vec<(String, String)>, StorageError> {
            self.inner.get_all_fields(key).await
        }
        async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<(), StorageError> {
            self.inner.delete_fields(key, fields).await
        }
        async fn ordered_add(&self, key: &str, members: &[(String, f64)]) -> Result<usize, StorageError> {
            if key == self.poisoned {
                return Err(StorageError::Redis("connection reset".to_string()));
            }
            self.inner.ordered_add(key, members).await
        }
        async fn ordered_raise(&self, key: &str, members: &[(String, f64)]) -> Result<usize, StorageError> {
            self.inner.ordered_raise(key, members).await
        }
        async fn ordered_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
            self.inner.ordered_remove(key, members).await
        }
        async fn ordered_range(&self, key: &str, query: &RangeQuery) -> Result<Vec<(String, f64)>, StorageError> {
            self.inner.ordered_range(key, query).await
        }
        async fn ordered_cardinality(&self, key: &str) -> Result<usize, StorageError> {
            self.inner.ordered_cardinality(key).await
        }
        async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
            self.inner.set_add(key, members).await
        }
        async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StorageError> {
            self.inner.set_remove(key, members).await
        }
        async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
            self.inner.set_members(key).await
        }
        async fn set_cardinality(&self, key: &str) -> Result<usize, StorageError> {
            self.inner.set_cardinality(key).await
        }
    }

    #[tokio::test]
    async fn failed_key_blocks_acknowledgement() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(FailingCache {
            inner: store.clone(),
            poisoned: keys::history(ChatKind::Direct, "bob", "alice"),
        });
        let state = memory_state_with_cache(cache, store.clone());
        let topic = Topic::NewDirectMessages.as_str();
        store.ensure_group(topic, "projector").await.unwrap();
        store
            .append_at(topic, StreamEntryId::new(1700, 0), direct_message(0))
            .await
            .unwrap();
        let worker = Worker::new(NewDirectMessages, store.clone(), state.clone(), settings());
        let batch = read_new(&store, topic).await;
        let err = worker.process_batch(batch).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Cache { .. }));
        assert_eq!(store.pending_count(topic, "projector").await.unwrap(), 1);
        let redelivered = read_backlog(&store, topic).await;
        assert_eq!(redelivered.len(), 1);
        assert!(redelivered[0].redelivered);
    }

    #[tokio::test]
    async fn redelivered_ack_still_converges() {
        let (state, store) = memory_state();
        let topic = Topic::GroupMessagesDelivered.as_str();
        store.ensure_group(topic, "projector").await.unwrap();
        store
            .set_add(&keys::group_members("g"), &["s".to_string(), "a".to_string()])
            .await
            .unwrap();
        // mutation landed but the process died before the check
        store
            .ordered_add(&keys::delivered_to_users("g", "m"), &[("a".to_string(), 5.0)])
            .await
            .unwrap();
        let event = GroupMessageDelivered {
            group_id: "g".to_string(),
            user: "a".to_string(),
            message_id: "m".to_string(),
            sender: "s".to_string(),
            delivered_at: 5,
        };
        store
            .append_at(topic, StreamEntryId::new(1700, 0), event.encode())
            .await
            .unwrap();
        let worker = Worker::new(GroupMessagesDelivered, store.clone(), state.clone(), settings());
        let first = read_new(&store, topic).await;
        worker.process_batch(first).await.unwrap();
        assert_eq!(state.metrics.snapshot().convergence_fired, 0);

        store
            .append_at(topic, StreamEntryId::new(1700, 1), event.encode())
            .await
            .unwrap();
        let mut replay = read_new(&store, topic).await;
        replay[0].redelivered = true;
        worker.process_batch(replay).await.unwrap();
        assert_eq!(state.metrics.snapshot().convergence_fired, 1);
        assert_eq!(
            store
                .get_field(&keys::message_status("m"), "delivered")
                .await
                .unwrap()
                .as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn worker_loop_projects_and_stops() {
        let (state, store) = memory_state();
        let topic = Topic::NewUsers.as_str();
        let shutdown = CancellationToken::new();
        let worker = Worker::new(NewUsers, store.clone(), state.clone(), settings());
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let user = NewUser {
            username: "alice".to_string(),
            user_data: json!({"name": "Alice"}),
        };
        store.append(topic, &user.encode()).await.unwrap();
        let mut projected = None;
        for _ in 0..100 {
            projected = store.get_field(keys::USERS, "alice").await.unwrap();
            if projected.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(projected.as_deref(), Some("{\"name\":\"Alice\"}"));
        for _ in 0..100 {
            if store.pending_count(topic, "projector").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.pending_count(topic, "projector").await.unwrap(), 0);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn user_index_and_history_agree_on_recency() {
        let (state, store) = memory_state();
        let topic = Topic::NewDirectMessages.as_str();
        store.ensure_group(topic, "projector").await.unwrap();
        for seq in 0..20u64 {
            store
                .append_at(topic, StreamEntryId::new(1700 + seq / 7, seq % 7), direct_message(seq))
                .await
                .unwrap();
        }
        let worker = Worker::new(NewDirectMessages, store.clone(), state, settings());
        worker.process_batch(read_new(&store, topic).await).await.unwrap();
        let latest = store
            .ordered_range(
                &keys::history(ChatKind::Direct, "alice", "bob"),
                &RangeQuery::latest(1),
            )
            .await
            .unwrap();
        let chat = store
            .ordered_range(&keys::chats_sorted("alice"), &RangeQuery::latest(1))
            .await
            .unwrap();
        assert_eq!(latest[0].0, "che19");
        assert_eq!(chat[0].1, latest[0].1);
        let newer = store
            .ordered_range(
                &keys::history(ChatKind::Direct, "alice", "bob"),
                &RangeQuery {
                    min: ScoreBound::Exclusive(chat[0].1),
                    ..RangeQuery::all()
                },
            )
            .await
            .unwrap();
        assert!(newer.is_empty());
    }

    #[tokio::test]
    async fn presence_effects_publish() {
        let (state, store) = memory_state();
        let mut updates = store.subscribe(&state.presence_channel).await.unwrap();
        run_effects(&state, vec![Effect::PublishPresence("{}".to_string())]).await;
        assert_eq!(updates.next().await.as_deref(), Some("{}"));
    }
}
