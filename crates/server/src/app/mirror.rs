use crate::metrics::Metrics;
use parley_mirror::{MirrorRecord, StatusMirror};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded hand-off to the background mirror writer.
#[derive(Clone)]
pub struct MirrorQueue {
    sender: mpsc::Sender<MirrorRecord>,
    metrics: Arc<Metrics>,
}

impl MirrorQueue {
    /// Starts the writer; it drains what is queued once `shutdown` fires.
    pub fn spawn(
        mirror: Arc<dyn StatusMirror>,
        capacity: usize,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let writer_metrics = Arc::clone(&metrics);
        let task = tokio::spawn(async move {
            drain(receiver, mirror, writer_metrics, shutdown).await;
        });
        (Self { sender, metrics }, task)
    }

    /// Never waits; a full queue drops the record.
    pub fn enqueue(&self, record: MirrorRecord) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.metrics.mark_mirror_enqueued();
                true
            }
            Err(TrySendError::Full(record)) => {
                self.metrics.mark_mirror_dropped();
                warn!(message_id = %record.message_id, status = %record.status, "mirror queue full; record dropped");
                false
            }
            Err(TrySendError::Closed(record)) => {
                self.metrics.mark_mirror_dropped();
                warn!(message_id = %record.message_id, "mirror writer stopped; record dropped");
                false
            }
        }
    }
}

async fn drain(
    mut receiver: mpsc::Receiver<MirrorRecord>,
    mirror: Arc<dyn StatusMirror>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = receiver.recv() => match record {
                Some(record) => record,
                None => return,
            },
        };
        submit(mirror.as_ref(), &metrics, &record).await;
    }
    receiver.close();
    let mut flushed = 0;
    while let Some(record) = receiver.recv().await {
        submit(mirror.as_ref(), &metrics, &record).await;
        flushed += 1;
    }
    info!(flushed, "mirror writer stopped");
}

async fn submit(mirror: &dyn StatusMirror, metrics: &Metrics, record: &MirrorRecord) {
    match mirror.submit(record).await {
        Ok(()) => {
            debug!(message_id = %record.message_id, status = %record.status, "status mirrored");
        }
        Err(err) => {
            metrics.mark_mirror_failed();
            warn!(
                message_id = %record.message_id,
                status = %record.status,
                idempotency_key = %record.idempotency_key(),
                error = %err,
                "status mirror write failed"
            );
        }
    }
}
