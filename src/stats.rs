use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free process-wide guardrail counters.
///
/// Guardrails never block ingest; when a budget is exceeded the engine
/// drops the oldest data or marks an overflow, and records it here. The
/// snapshot is embedded in every dumped report and mirrored to the
/// Prometheus export.
#[derive(Default)]
pub struct GuardrailStats {
    /// Events rejected by the wire decoder.
    event_parse_failures: AtomicU64,
    /// Matcher evaluations that hit an unsupported construct.
    matcher_errors: AtomicU64,
    /// Dimension keys folded into an overflow bucket.
    dimension_overflows: AtomicU64,
    /// Change records evicted from the uid map to stay under the byte budget.
    uid_map_records_dropped: AtomicU64,
    /// Tombstoned uid-map entries fully erased beyond the deleted-app cap.
    uid_map_tombstones_dropped: AtomicU64,
    /// Puller invocations that failed or timed out.
    pull_failures: AtomicU64,
    /// Gauge/value samples marked absent because a pull produced nothing.
    samples_absent: AtomicU64,
    /// Live uid-map memory estimate, maintained by the uid map.
    uid_map_bytes: AtomicUsize,
    /// Live uid-map change-record count.
    uid_map_changes: AtomicUsize,
}

/// Point-in-time view of the guardrail counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardrailSnapshot {
    pub event_parse_failures: u64,
    pub matcher_errors: u64,
    pub dimension_overflows: u64,
    pub uid_map_records_dropped: u64,
    pub uid_map_tombstones_dropped: u64,
    pub pull_failures: u64,
    pub samples_absent: u64,
    pub uid_map_bytes: usize,
    pub uid_map_changes: usize,
}

impl GuardrailStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_event_parse_failure(&self) {
        self.event_parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_matcher_error(&self) {
        self.matcher_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_dimension_overflow(&self) {
        self.dimension_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_uid_map_record_dropped(&self, n: u64) {
        self.uid_map_records_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn note_uid_map_tombstone_dropped(&self) {
        self.uid_map_tombstones_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_failure(&self) {
        self.pull_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_sample_absent(&self) {
        self.samples_absent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_uid_map_bytes(&self, bytes: usize) {
        self.uid_map_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_uid_map_changes(&self, n: usize) {
        self.uid_map_changes.store(n, Ordering::Relaxed);
    }

    /// Reads all counters without resetting them; dumped reports carry the
    /// running totals.
    pub fn snapshot(&self) -> GuardrailSnapshot {
        GuardrailSnapshot {
            event_parse_failures: self.event_parse_failures.load(Ordering::Relaxed),
            matcher_errors: self.matcher_errors.load(Ordering::Relaxed),
            dimension_overflows: self.dimension_overflows.load(Ordering::Relaxed),
            uid_map_records_dropped: self.uid_map_records_dropped.load(Ordering::Relaxed),
            uid_map_tombstones_dropped: self.uid_map_tombstones_dropped.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
            samples_absent: self.samples_absent.load(Ordering::Relaxed),
            uid_map_bytes: self.uid_map_bytes.load(Ordering::Relaxed),
            uid_map_changes: self.uid_map_changes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = GuardrailStats::new();
        stats.note_event_parse_failure();
        stats.note_event_parse_failure();
        stats.note_dimension_overflow();
        stats.set_uid_map_bytes(4096);

        let snap = stats.snapshot();
        assert_eq!(snap.event_parse_failures, 2);
        assert_eq!(snap.dimension_overflows, 1);
        assert_eq!(snap.uid_map_bytes, 4096);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let stats = GuardrailStats::new();
        stats.note_pull_failure();
        assert_eq!(stats.snapshot().pull_failures, 1);
        assert_eq!(stats.snapshot().pull_failures, 1);
    }
}
