use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    batches: AtomicU64,
    entries_acked: AtomicU64,
    corrupt_events: AtomicU64,
    batch_failures: AtomicU64,
    transport_errors: AtomicU64,
    convergence_fired: AtomicU64,
    fanout_sent: AtomicU64,
    fanout_dropped: AtomicU64,
    mirror_enqueued: AtomicU64,
    mirror_dropped: AtomicU64,
    mirror_failed: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub entries_acked: u64,
    pub corrupt_events: u64,
    pub batch_failures: u64,
    pub transport_errors: u64,
    pub convergence_fired: u64,
    pub fanout_sent: u64,
    pub fanout_dropped: u64,
    pub mirror_enqueued: u64,
    pub mirror_dropped: u64,
    pub mirror_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_batch(&self, acked: usize) {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.entries_acked.fetch_add(acked as u64, Ordering::SeqCst);
    }

    pub fn mark_corrupt(&self) {
        self.corrupt_events.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_batch_failure(&self) {
        self.batch_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_convergence(&self) {
        self.convergence_fired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_fanout_sent(&self) {
        self.fanout_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_fanout_dropped(&self) {
        self.fanout_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_mirror_enqueued(&self) {
        self.mirror_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_mirror_dropped(&self) {
        self.mirror_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_mirror_failed(&self) {
        self.mirror_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::SeqCst),
            entries_acked: self.entries_acked.load(Ordering::SeqCst),
            corrupt_events: self.corrupt_events.load(Ordering::SeqCst),
            batch_failures: self.batch_failures.load(Ordering::SeqCst),
            transport_errors: self.transport_errors.load(Ordering::SeqCst),
            convergence_fired: self.convergence_fired.load(Ordering::SeqCst),
            fanout_sent: self.fanout_sent.load(Ordering::SeqCst),
            fanout_dropped: self.fanout_dropped.load(Ordering::SeqCst),
            mirror_enqueued: self.mirror_enqueued.load(Ordering::SeqCst),
            mirror_dropped: self.mirror_dropped.load(Ordering::SeqCst),
            mirror_failed: self.mirror_failed.load(Ordering::SeqCst),
        }
    }

    pub fn encode_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("parley_batches", snapshot.batches),
            ("parley_entries_acked", snapshot.entries_acked),
            ("parley_corrupt_events", snapshot.corrupt_events),
            ("parley_batch_failures", snapshot.batch_failures),
            ("parley_transport_errors", snapshot.transport_errors),
            ("parley_convergence_fired", snapshot.convergence_fired),
            ("parley_fanout_sent", snapshot.fanout_sent),
            ("parley_fanout_dropped", snapshot.fanout_dropped),
            ("parley_mirror_enqueued", snapshot.mirror_enqueued),
            ("parley_mirror_dropped", snapshot.mirror_dropped),
            ("parley_mirror_failed", snapshot.mirror_failed),
        ];
        let mut output = String::new();
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_lists_counters() {
        let metrics = Metrics::new();
        metrics.mark_batch(499);
        metrics.mark_corrupt();
        let text = metrics.encode_prometheus();
        assert!(text.contains("# TYPE parley_batches counter\nparley_batches 1\n"));
        assert!(text.contains("parley_entries_acked 499\n"));
        assert!(text.contains("parley_corrupt_events 1\n"));
        assert_eq!(metrics.snapshot().mirror_failed, 0);
    }
}
