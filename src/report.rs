//! Structured report egress.
//!
//! The engine emits reports as structured values; the byte layout on the
//! wire is the caller's concern. A [`ReportSink`] receives one
//! [`ConfigReport`] per dump.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::event::{DimensionKey, FieldValue};
use crate::stats::GuardrailSnapshot;

/// A string literal, or its 64-bit hash when
/// `hash_strings_in_metric_report` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrOrHash {
    Str(String),
    Hash(u64),
}

impl StrOrHash {
    /// Hashes when `hash` is set, also interning the literal into `pool` so
    /// the report carries the reverse mapping.
    pub fn from_string(s: &str, hash: bool, pool: Option<&mut BTreeSet<String>>) -> Self {
        if hash {
            if let Some(pool) = pool {
                pool.insert(s.to_string());
            }
            StrOrHash::Hash(hash64(s))
        } else {
            StrOrHash::Str(s.to_string())
        }
    }
}

/// Stable 64-bit string hash: the first 8 bytes of SHA-256.
pub fn hash64(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// One aggregated value inside a bucket slice.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    /// Count metrics.
    Count(i64),
    /// Duration metrics, nanoseconds.
    DurationNs(i64),
    /// Value metrics with integral output.
    Long(i64),
    /// Value metrics with AVG aggregation.
    Double(f64),
    /// Gauge metrics: sampled field values with their timestamps.
    Samples(Vec<(i64, Vec<FieldValue>)>),
    /// KLL metrics: serialized sketch plus the stream length.
    Sketch { encoded: Vec<u8>, count: u64 },
}

/// One (dimension, state-tuple) slice of a sealed bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceEntry {
    pub dimensions: DimensionKey,
    /// (state atom, state value) pairs, in slice declaration order.
    pub state_tuple: Vec<(i32, i32)>,
    pub value: AggregateValue,
}

/// A sealed aggregation bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub entries: Vec<SliceEntry>,
}

/// One recorded event from an event metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedEvent {
    pub elapsed_ns: i64,
    pub values: Vec<FieldValue>,
}

/// All output of one metric producer.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReport {
    pub metric_id: i64,
    pub buckets: Vec<ReportBucket>,
    /// Event metrics only.
    pub events: Vec<ReportedEvent>,
    /// Dimension keys folded into the overflow tombstone while this data
    /// was collected.
    pub dimension_overflow_count: u64,
}

impl MetricReport {
    pub fn empty(metric_id: i64) -> Self {
        Self {
            metric_id,
            buckets: Vec::new(),
            events: Vec::new(),
            dimension_overflow_count: 0,
        }
    }
}

/// A change record as it appears in a report.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeReportRecord {
    pub deletion: bool,
    pub timestamp_ns: i64,
    pub package: StrOrHash,
    pub uid: i32,
    pub new_version: i64,
    pub prev_version: i64,
    pub new_version_string: StrOrHash,
    pub prev_version_string: StrOrHash,
}

/// One package entry in a uid-map snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageSnapshot {
    pub name: StrOrHash,
    pub version: i64,
    pub version_string: StrOrHash,
    pub uid: i32,
    pub deleted: bool,
    /// Index into [`UidMapDelta::installers`].
    pub installer_index: Option<u32>,
    pub truncated_cert_hash: Option<Vec<u8>>,
}

/// Full uid-map snapshot at dump time.
#[derive(Debug, Clone, PartialEq)]
pub struct UidMapSnapshot {
    pub timestamp_ns: i64,
    pub packages: Vec<PackageSnapshot>,
}

/// Per-config uid-map delta: changes since the last dump, plus a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UidMapDelta {
    pub changes: Vec<ChangeReportRecord>,
    pub snapshot: UidMapSnapshot,
    /// Interned installer strings, indexed by `installer_index`.
    pub installers: Vec<StrOrHash>,
}

/// A full report for one configuration.
#[derive(Debug, Clone)]
pub struct ConfigReport {
    pub config_uid: i32,
    pub config_id: i64,
    pub dump_time_ns: i64,
    pub metrics: Vec<MetricReport>,
    pub uid_map: UidMapDelta,
    pub guardrails: GuardrailSnapshot,
    /// Literals behind the 64-bit hashes when string hashing is on.
    pub hashed_strings: Vec<String>,
}

/// Receives dumped reports. Byte layout is the sink's concern; failures
/// surface to the dump caller and are not retried internally.
pub trait ReportSink: Send {
    fn write_report(&mut self, report: ConfigReport) -> anyhow::Result<()>;
}

/// Collects reports in memory. The default sink for tests and for callers
/// that serialize elsewhere.
#[derive(Default)]
pub struct VecSink {
    pub reports: Vec<ConfigReport>,
}

impl ReportSink for VecSink {
    fn write_report(&mut self, report: ConfigReport) -> anyhow::Result<()> {
        self.reports.push(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash64_is_deterministic() {
        assert_eq!(hash64("com.example.app"), hash64("com.example.app"));
        assert_ne!(hash64("com.example.app"), hash64("com.example.other"));
    }

    #[test]
    fn test_str_or_hash_interns_into_pool() {
        let mut pool = BTreeSet::new();
        let out = StrOrHash::from_string("pkg", true, Some(&mut pool));
        assert_eq!(out, StrOrHash::Hash(hash64("pkg")));
        assert!(pool.contains("pkg"));
    }

    #[test]
    fn test_str_or_hash_plain() {
        let out = StrOrHash::from_string("pkg", false, None);
        assert_eq!(out, StrOrHash::Str("pkg".to_string()));
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink = VecSink::default();
        let report = ConfigReport {
            config_uid: 1000,
            config_id: 1,
            dump_time_ns: 0,
            metrics: vec![MetricReport::empty(5)],
            uid_map: UidMapDelta {
                changes: vec![],
                snapshot: UidMapSnapshot {
                    timestamp_ns: 0,
                    packages: vec![],
                },
                installers: vec![],
            },
            guardrails: crate::stats::GuardrailStats::new().snapshot(),
            hashed_strings: vec![],
        };
        sink.write_report(report).expect("sink accepts");
        assert_eq!(sink.reports.len(), 1);
        assert_eq!(sink.reports[0].metrics[0].metric_id, 5);
    }
}
