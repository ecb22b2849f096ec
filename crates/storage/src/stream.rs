use crate::StorageError;
use async_trait::async_trait;
use futures_util::Stream;
use parley_events::{FieldMap, StreamEntryId};
use std::pin::Pin;
use std::time::Duration;

/// Entry as handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    /// `None` when the transport could not produce a text field map
    /// (entry trimmed from the log, non-utf8 values).
    pub fields: Option<FieldMap>,
    /// Entry was handed out before and never acknowledged.
    pub redelivered: bool,
}

/// Where a consumer-group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// This consumer's own unacknowledged entries with an id greater than the given one.
    Backlog(StreamEntryId),
    /// Entries never delivered to any consumer of the group.
    New,
}

#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub topic: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub count: usize,
    /// `None` blocks until entries arrive. Backlog reads never block.
    pub block: Option<Duration>,
    pub cursor: ReadCursor,
}

/// Append-only per-topic log with consumer-group delivery.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn append(&self, topic: &str, fields: &FieldMap) -> Result<StreamEntryId, StorageError>;

    /// Creates the group at the start of the log; an existing group is left untouched.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StorageError>;

    async fn read(&self, request: &ReadRequest<'_>) -> Result<Vec<StreamEntry>, StorageError>;

    /// Returns the number of entries that were pending and are now retired.
    async fn ack(
        &self,
        topic: &str,
        group: &str,
        ids: &[StreamEntryId],
    ) -> Result<usize, StorageError>;

    /// Moves entries idle for at least `min_idle` to `consumer`.
    async fn claim_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize, StorageError>;
}

pub type PresenceSubscription = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Thin fire-and-forget pub/sub used only for presence updates.
#[async_trait]
pub trait PresenceBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError>;

    async fn subscribe(&self, channel: &str) -> Result<PresenceSubscription, StorageError>;
}
