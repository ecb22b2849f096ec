pub mod convergence;
pub mod fanout;
pub mod mirror;
pub mod presence;
pub mod projection;
pub mod worker;

use self::fanout::SessionRegistry;
use self::mirror::MirrorQueue;
use self::projection::Projection;
use self::projection::direct::{
    DirectDeliveries, DirectReactionRemovals, DirectReactions, DirectReads, NewDirectMessages,
};
use self::projection::group::{
    AdminsAdded, GroupEdits, GroupMessagesDelivered, GroupMessagesRead, GroupReactionRemovals,
    GroupReactions, MemberRemovals, MembersAdded, MembersLeft, NewGroupMessages, NewGroups,
};
use self::projection::users::{NewUsers, PresenceChanges, UserEdits};
use self::worker::{Worker, WorkerSettings};
use crate::config::{BackendKind, ProjectorConfig};
use crate::metrics::Metrics;
use parley_events::Topic;
use parley_mirror::MirrorError;
use parley_storage::{
    CacheStore, MemoryStore, PresenceBus, RedisBackend, StorageError, StreamTransport, connect,
};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub enum AppError {
    Storage(StorageError),
    Mirror(MirrorError),
    Config(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(err) => write!(f, "storage failure: {}", err),
            Self::Mirror(err) => write!(f, "status mirror failure: {}", err),
            Self::Config(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl Error for AppError {}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<MirrorError> for AppError {
    fn from(err: MirrorError) -> Self {
        Self::Mirror(err)
    }
}

/// Shared handles every worker projects through.
pub struct AppState {
    pub cache: Arc<dyn CacheStore>,
    pub presence: Arc<dyn PresenceBus>,
    pub presence_channel: String,
    pub sessions: Arc<SessionRegistry>,
    pub mirror: MirrorQueue,
    pub metrics: Arc<Metrics>,
}

enum Backend {
    Redis(RedisBackend),
    Memory(Arc<MemoryStore>),
}

impl Backend {
    /// Blocking reads hold a connection, so every Redis worker gets its own.
    async fn transport(&self) -> Result<Arc<dyn StreamTransport>, StorageError> {
        match self {
            Backend::Redis(backend) => Ok(Arc::new(backend.streams().await?)),
            Backend::Memory(store) => Ok(store.clone()),
        }
    }
}

pub struct ProjectorApp {
    pub state: Arc<AppState>,
    config: ProjectorConfig,
    backend: Backend,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    mirror_task: Option<JoinHandle<()>>,
    mirror_shutdown: CancellationToken,
}

impl ProjectorApp {
    pub async fn init(config: ProjectorConfig) -> Result<Self, AppError> {
        let metrics = Arc::new(Metrics::new());
        let (backend, cache, presence): (Backend, Arc<dyn CacheStore>, Arc<dyn PresenceBus>) =
            match config.storage.backend {
                BackendKind::Redis => {
                    let url = config.storage.redis_url.as_deref().ok_or_else(|| {
                        AppError::Config("storage.redis_url is required for redis".to_string())
                    })?;
                    let backend = connect(url).await?;
                    backend.readiness().await?;
                    info!("redis backend ready");
                    let shared = Arc::new(backend.clone());
                    (Backend::Redis(backend), shared.clone(), shared)
                }
                BackendKind::Memory => {
                    warn!("in-memory backend selected; projections are not durable");
                    let store = Arc::new(MemoryStore::new());
                    (Backend::Memory(store.clone()), store.clone(), store)
                }
            };
        let status_mirror =
            parley_mirror::build(config.mirror.mode, config.mirror.target.as_deref()).await?;
        info!(mode = ?config.mirror.mode, "status mirror ready");
        // the mirror writer outlives the workers so that their last records drain
        let mirror_shutdown = CancellationToken::new();
        let (mirror, mirror_task) = MirrorQueue::spawn(
            status_mirror,
            config.mirror.queue_capacity,
            Arc::clone(&metrics),
            mirror_shutdown.clone(),
        );
        let sessions = Arc::new(SessionRegistry::new(
            config.session_buffer,
            Arc::clone(&metrics),
        ));
        let state = Arc::new(AppState {
            cache,
            presence,
            presence_channel: config.presence_channel.clone(),
            sessions,
            mirror,
            metrics,
        });
        Ok(Self {
            state,
            config,
            backend,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            mirror_task: Some(mirror_task),
            mirror_shutdown,
        })
    }

    /// Spawns one worker per configured topic, the presence relay and the
    /// metrics logger.
    pub async fn start(&mut self) -> Result<(), AppError> {
        let streams = &self.config.streams;
        for topic in streams.topics.clone() {
            let settings = WorkerSettings {
                group: streams.group.clone(),
                consumer: streams.consumer.clone(),
                batch_size: streams.batch_size,
                block: streams.block,
                claim_idle: streams.claim_idle,
                retry_delay: streams.retry_delay,
            };
            let transport = self.backend.transport().await?;
            let task = self.spawn_worker(topic, transport, settings);
            self.tasks.push(task);
        }
        info!(
            workers = self.tasks.len(),
            group = %streams.group,
            consumer = %streams.consumer,
            "projection workers started"
        );

        self.tasks.push(presence::spawn_relay(
            Arc::clone(&self.state.presence),
            self.state.presence_channel.clone(),
            Arc::clone(&self.state.sessions),
            streams.retry_delay,
            self.shutdown.clone(),
        ));

        if let Some(period) = self.config.metrics_interval {
            let metrics = Arc::clone(&self.state.metrics);
            let shutdown = self.shutdown.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let snapshot = metrics.snapshot();
                    info!(
                        batches = snapshot.batches,
                        acked = snapshot.entries_acked,
                        corrupt = snapshot.corrupt_events,
                        failures = snapshot.batch_failures,
                        transport_errors = snapshot.transport_errors,
                        converged = snapshot.convergence_fired,
                        fanout_sent = snapshot.fanout_sent,
                        fanout_dropped = snapshot.fanout_dropped,
                        mirror_dropped = snapshot.mirror_dropped,
                        mirror_failed = snapshot.mirror_failed,
                        "projector metrics"
                    );
                }
            }));
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        topic: Topic,
        transport: Arc<dyn StreamTransport>,
        settings: WorkerSettings,
    ) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        match topic {
            Topic::NewUsers => run(NewUsers, transport, state, settings, shutdown),
            Topic::UserEdits => run(UserEdits, transport, state, settings, shutdown),
            Topic::UserPresenceChanges => {
                run(PresenceChanges, transport, state, settings, shutdown)
            }
            Topic::NewDirectMessages => {
                run(NewDirectMessages, transport, state, settings, shutdown)
            }
            Topic::DirectMessageReactions => {
                run(DirectReactions, transport, state, settings, shutdown)
            }
            Topic::DirectMessageReactionRemovals => {
                run(DirectReactionRemovals, transport, state, settings, shutdown)
            }
            Topic::DirectMessagesDelivered => {
                run(DirectDeliveries, transport, state, settings, shutdown)
            }
            Topic::DirectMessagesRead => run(DirectReads, transport, state, settings, shutdown),
            Topic::NewGroups => run(NewGroups, transport, state, settings, shutdown),
            Topic::GroupEdits => run(GroupEdits, transport, state, settings, shutdown),
            Topic::GroupMembersAdded => run(MembersAdded, transport, state, settings, shutdown),
            Topic::GroupMembersRemoved => {
                run(MemberRemovals, transport, state, settings, shutdown)
            }
            Topic::GroupMembersLeft => run(MembersLeft, transport, state, settings, shutdown),
            Topic::GroupAdminsAdded => run(AdminsAdded, transport, state, settings, shutdown),
            Topic::NewGroupMessages => {
                run(NewGroupMessages, transport, state, settings, shutdown)
            }
            Topic::GroupMessageReactions => {
                run(GroupReactions, transport, state, settings, shutdown)
            }
            Topic::GroupMessageReactionRemovals => {
                run(GroupReactionRemovals, transport, state, settings, shutdown)
            }
            Topic::GroupMessagesDelivered => {
                run(GroupMessagesDelivered, transport, state, settings, shutdown)
            }
            Topic::GroupMessagesRead => {
                run(GroupMessagesRead, transport, state, settings, shutdown)
            }
        }
    }

    /// Stops workers between batches, then drains the mirror queue.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "task ended abnormally");
            }
        }
        self.mirror_shutdown.cancel();
        if let Some(task) = self.mirror_task.take()
            && let Err(err) = task.await
        {
            warn!(error = %err, "mirror writer ended abnormally");
        }
        info!(metrics = %self.state.metrics.encode_prometheus(), "projector stopped");
    }
}

fn run<P: Projection>(
    projection: P,
    transport: Arc<dyn StreamTransport>,
    state: Arc<AppState>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let worker = Worker::new(projection, transport, state, settings);
    tokio::spawn(worker.run(shutdown))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parley_mirror::NullMirror;

    pub fn memory_state() -> (Arc<AppState>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = memory_state_with_cache(store.clone(), store.clone());
        (state, store)
    }

    /// State whose cache may differ from the store carrying streams and presence.
    pub fn memory_state_with_cache(
        cache: Arc<dyn CacheStore>,
        store: Arc<MemoryStore>,
    ) -> Arc<AppState> {
        let metrics = Arc::new(Metrics::new());
        let (mirror, _task) = MirrorQueue::spawn(
            Arc::new(NullMirror),
            64,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        Arc::new(AppState {
            cache,
            presence: store,
            presence_channel: "presence_updates".to_string(),
            sessions: Arc::new(SessionRegistry::new(16, Arc::clone(&metrics))),
            mirror,
            metrics,
        })
    }
}
