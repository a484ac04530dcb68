//! Metric producers.
//!
//! Six kinds, all bucketed the same way: buckets `[start, start + B)`
//! aligned to the config's time base, sealed lazily when a later event or a
//! report dump crosses the boundary. App-upgrade splits seal a partial
//! bucket that ends off-alignment; the next bucket re-aligns.
//!
//! Producers are driven by the engine: `flush_if_needed` first, then the
//! event/condition/state callback. Sealed bucket sums are handed back so
//! the engine can feed anomaly trackers.

pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod kll;
pub mod kll_sketch;
pub mod value;

use std::collections::HashMap;

use crate::condition::{ConditionState, ConditionTracker, DimTransition};
use crate::event::{DimensionKey, FieldPath, FieldSpec, FieldValue, LogEvent, Value};
use crate::report::MetricReport;
use crate::schema::ActivationType;
use crate::state::{StateChange, StateTracker};
use crate::stats::GuardrailStats;

pub use count::CountMetricProducer;
pub use duration::DurationMetricProducer;
pub use event::EventMetricProducer;
pub use gauge::GaugeMetricProducer;
pub use kll::KllMetricProducer;
pub use value::ValueMetricProducer;

/// Dimension cap applied when a metric declares none.
pub const DEFAULT_MAX_DIMENSIONS: usize = 800;

/// Key of one aggregation slice: projected dimensions plus the state tuple
/// in effect at aggregation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MetricDimensionKey {
    pub dims: DimensionKey,
    /// (state atom, state value) pairs in slice declaration order.
    pub states: Vec<(i32, i32)>,
}

impl MetricDimensionKey {
    /// The tombstone key that absorbs aggregation beyond the dimension cap.
    pub fn overflow() -> Self {
        Self {
            dims: DimensionKey::new(vec![FieldValue::new(
                FieldPath::new(0),
                Value::Str("__OVERFLOW__".to_string()),
            )]),
            states: Vec::new(),
        }
    }

    pub fn is_overflow(&self) -> bool {
        self.dims
            .values()
            .first()
            .is_some_and(|v| v.value == Value::Str("__OVERFLOW__".to_string()))
    }
}

/// A condition link with its runtime condition index resolved.
#[derive(Debug, Clone)]
pub struct CompiledConditionLink {
    pub condition_index: usize,
    pub fields_in_what: Vec<FieldSpec>,
}

/// A state slice with its runtime state-tracker index resolved.
#[derive(Debug, Clone)]
pub struct CompiledStateSlice {
    pub state_index: usize,
    pub atom: i32,
    /// Event fields joined against the tracker's primary key; empty uses
    /// the tracker's unkeyed entry.
    pub fields_in_what: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    Inactive,
    Active { expiry_ns: i64 },
    /// Fired with ACTIVATE_ON_BOOT: armed at the next boot signal.
    PendingBoot,
}

/// One compiled activation trigger with its live status.
#[derive(Debug, Clone)]
pub struct Activation {
    pub matcher_index: usize,
    pub ttl_ns: i64,
    pub activation_type: ActivationType,
    pub deactivation_matcher_index: Option<usize>,
    pub status: ActivationStatus,
}

/// Sums of a just-sealed bucket, fed to anomaly trackers.
#[derive(Debug, Clone)]
pub struct SealedBucketSums {
    /// Bucket ordinal since the time base.
    pub bucket_num: i64,
    pub end_ns: i64,
    pub entries: Vec<(MetricDimensionKey, i64)>,
}

/// Read-only context handed to producers during ingest.
pub struct MetricContext<'a> {
    pub event: &'a LogEvent,
    pub conditions: &'a [ConditionTracker],
    pub states: &'a [StateTracker],
    pub stats: &'a GuardrailStats,
}

/// State shared by all six producer kinds.
#[derive(Debug, Clone)]
pub struct MetricCommon {
    pub id: i64,
    pub fingerprint: Vec<u8>,
    /// Matcher index (predicate index for duration metrics).
    pub what_index: usize,
    pub condition_index: Option<usize>,
    pub condition_links: Vec<CompiledConditionLink>,
    pub state_slices: Vec<CompiledStateSlice>,
    pub dimensions: Vec<FieldSpec>,
    pub bucket_size_ns: i64,
    pub time_base_ns: i64,
    pub current_bucket_start_ns: i64,
    /// Scalar condition pushed by the engine on condition changes.
    pub condition: ConditionState,
    pub max_dimensions: usize,
    pub activations: Vec<Activation>,
    /// Dimension-cap hits since the last dump.
    pub overflow_count: u64,
}

impl MetricCommon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        fingerprint: Vec<u8>,
        what_index: usize,
        condition_index: Option<usize>,
        condition_links: Vec<CompiledConditionLink>,
        state_slices: Vec<CompiledStateSlice>,
        dimensions: Vec<FieldSpec>,
        bucket_size_ns: i64,
        time_base_ns: i64,
        max_dimensions: Option<usize>,
    ) -> Self {
        Self {
            id,
            fingerprint,
            what_index,
            condition_index,
            condition_links,
            state_slices,
            dimensions,
            bucket_size_ns,
            time_base_ns,
            current_bucket_start_ns: time_base_ns,
            condition: if condition_index.is_some() {
                ConditionState::Unknown
            } else {
                ConditionState::True
            },
            max_dimensions: max_dimensions.unwrap_or(DEFAULT_MAX_DIMENSIONS),
            activations: Vec::new(),
            overflow_count: 0,
        }
    }

    /// End of the current bucket: the next aligned boundary after its
    /// start, which also closes partial buckets opened by an app upgrade.
    pub fn current_bucket_end_ns(&self) -> i64 {
        let offset = self.current_bucket_start_ns - self.time_base_ns;
        self.time_base_ns + (offset / self.bucket_size_ns + 1) * self.bucket_size_ns
    }

    /// Ordinal of the current bucket since the time base.
    pub fn current_bucket_num(&self) -> i64 {
        (self.current_bucket_start_ns - self.time_base_ns) / self.bucket_size_ns
    }

    /// Whether `event_time_ns` falls past the current bucket; callers seal
    /// and then advance via [`MetricCommon::advance_to`].
    pub fn needs_flush(&self, event_time_ns: i64) -> bool {
        event_time_ns >= self.current_bucket_end_ns()
    }

    /// Moves the current bucket to the aligned bucket containing
    /// `event_time_ns`.
    pub fn advance_to(&mut self, event_time_ns: i64) {
        let offset = event_time_ns - self.time_base_ns;
        self.current_bucket_start_ns =
            self.time_base_ns + (offset / self.bucket_size_ns) * self.bucket_size_ns;
    }

    /// Starts a partial bucket at `now_ns` (app-upgrade split).
    pub fn start_partial_bucket(&mut self, now_ns: i64) {
        self.current_bucket_start_ns = now_ns;
    }

    /// Whether aggregation is admitted right now: active (or ungated) and
    /// condition-met, per link when links are present.
    pub fn aggregation_admitted(&self, ctx: &MetricContext<'_>) -> bool {
        if !self.is_active(ctx.event.elapsed_ns()) {
            return false;
        }
        self.condition_met(ctx)
    }

    fn condition_met(&self, ctx: &MetricContext<'_>) -> bool {
        if !self.condition_links.is_empty() {
            return self.condition_links.iter().all(|link| {
                let query = ctx.event.project(&link.fields_in_what).stripped();
                ctx.conditions[link.condition_index]
                    .sliced_state(&query, ctx.conditions)
                    .is_true()
            });
        }
        if self.condition_index.is_some() {
            return self.condition.is_true();
        }
        true
    }

    /// Projects the slice key for one event: dimension fields plus the
    /// current value of every sliced state.
    pub fn extract_key(&self, event: &LogEvent, states: &[StateTracker]) -> MetricDimensionKey {
        let dims = if self.dimensions.is_empty() {
            DimensionKey::default()
        } else {
            event.project(&self.dimensions)
        };
        let state_values = self
            .state_slices
            .iter()
            .map(|slice| {
                let query = event.project(&slice.fields_in_what).stripped();
                (
                    slice.atom,
                    states[slice.state_index].state_value_by_values(&query),
                )
            })
            .collect();
        MetricDimensionKey {
            dims,
            states: state_values,
        }
    }

    /// A metric with no activations is always active; otherwise at least
    /// one activation must be live.
    pub fn is_active(&self, now_ns: i64) -> bool {
        if self.activations.is_empty() {
            return true;
        }
        self.activations.iter().any(|a| match a.status {
            ActivationStatus::Active { expiry_ns } => now_ns < expiry_ns,
            _ => false,
        })
    }

    /// Fires every activation listening on `matcher_index`.
    pub fn on_activation_matched(&mut self, matcher_index: usize, now_ns: i64) {
        for activation in &mut self.activations {
            if activation.matcher_index == matcher_index {
                match activation.activation_type {
                    ActivationType::ActivateImmediately => {
                        activation.status = ActivationStatus::Active {
                            expiry_ns: now_ns + activation.ttl_ns,
                        };
                    }
                    ActivationType::ActivateOnBoot => {
                        if !matches!(activation.status, ActivationStatus::Active { .. }) {
                            activation.status = ActivationStatus::PendingBoot;
                        }
                    }
                }
            }
        }
    }

    /// Cancels every activation whose deactivation matcher fired.
    pub fn on_deactivation_matched(&mut self, matcher_index: usize) {
        for activation in &mut self.activations {
            if activation.deactivation_matcher_index == Some(matcher_index) {
                activation.status = ActivationStatus::Inactive;
            }
        }
    }

    /// Arms every boot-pending activation.
    pub fn on_boot(&mut self, now_ns: i64) {
        for activation in &mut self.activations {
            if activation.status == ActivationStatus::PendingBoot {
                activation.status = ActivationStatus::Active {
                    expiry_ns: now_ns + activation.ttl_ns,
                };
            }
        }
    }
}

/// Looks up the accumulator for `key`, folding into the overflow tombstone
/// once the per-bucket dimension cap is hit.
pub fn guarded_entry<'m, T: Default>(
    current: &'m mut HashMap<MetricDimensionKey, T>,
    key: MetricDimensionKey,
    max_dimensions: usize,
    overflow_count: &mut u64,
    stats: &GuardrailStats,
) -> &'m mut T {
    let key = if current.contains_key(&key) || current.len() < max_dimensions {
        key
    } else {
        *overflow_count += 1;
        stats.note_dimension_overflow();
        MetricDimensionKey::overflow()
    };
    current.entry(key).or_default()
}

/// The tagged producer variant the evaluation graph stores.
#[derive(Debug)]
pub enum MetricProducer {
    Count(CountMetricProducer),
    Duration(DurationMetricProducer),
    Event(EventMetricProducer),
    Gauge(GaugeMetricProducer),
    Value(ValueMetricProducer),
    Kll(KllMetricProducer),
}

impl MetricProducer {
    pub fn common(&self) -> &MetricCommon {
        match self {
            MetricProducer::Count(p) => &p.common,
            MetricProducer::Duration(p) => &p.common,
            MetricProducer::Event(p) => &p.common,
            MetricProducer::Gauge(p) => &p.common,
            MetricProducer::Value(p) => &p.common,
            MetricProducer::Kll(p) => &p.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut MetricCommon {
        match self {
            MetricProducer::Count(p) => &mut p.common,
            MetricProducer::Duration(p) => &mut p.common,
            MetricProducer::Event(p) => &mut p.common,
            MetricProducer::Gauge(p) => &mut p.common,
            MetricProducer::Value(p) => &mut p.common,
            MetricProducer::Kll(p) => &mut p.common,
        }
    }

    pub fn id(&self) -> i64 {
        self.common().id
    }

    /// Seals buckets the event time has crossed. Must run before the
    /// event/condition callbacks for the same timestamp.
    pub fn flush_if_needed(&mut self, event_time_ns: i64) -> Vec<SealedBucketSums> {
        match self {
            MetricProducer::Count(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Duration(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Event(_) => Vec::new(),
            MetricProducer::Gauge(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Value(p) => p.flush_if_needed(event_time_ns),
            MetricProducer::Kll(p) => p.flush_if_needed(event_time_ns),
        }
    }

    /// Handles an event matched by the metric's `what` matcher.
    pub fn on_matched_event(&mut self, ctx: &MetricContext<'_>) {
        match self {
            MetricProducer::Count(p) => p.on_matched_event(ctx),
            // Duration metrics are driven by predicate transitions instead.
            MetricProducer::Duration(_) => {}
            MetricProducer::Event(p) => p.on_matched_event(ctx),
            MetricProducer::Gauge(p) => p.on_matched_event(ctx),
            MetricProducer::Value(p) => p.on_matched_event(ctx),
            MetricProducer::Kll(p) => p.on_matched_event(ctx),
        }
    }

    /// Handles a per-dimension transition of a duration metric's predicate.
    pub fn on_what_transition(&mut self, transition: &DimTransition, event_time_ns: i64) {
        if let MetricProducer::Duration(p) = self {
            p.on_what_transition(transition, event_time_ns);
        }
    }

    /// Pushes a new scalar condition value. Stateful kinds close their
    /// open intervals or diff chains atomically at the transition.
    pub fn on_condition_changed(&mut self, state: ConditionState, event_time_ns: i64) {
        match self {
            MetricProducer::Duration(p) => p.on_condition_changed(state, event_time_ns),
            MetricProducer::Gauge(p) => p.on_condition_changed(state, event_time_ns),
            MetricProducer::Value(p) => p.on_condition_changed(state, event_time_ns),
            other => other.common_mut().condition = state,
        }
    }

    /// Observes a state transition from a sliced state tracker.
    pub fn on_state_changed(&mut self, change: &StateChange) {
        if let MetricProducer::Duration(p) = self {
            p.on_state_changed(change);
        }
        // Other kinds read state per event; each contribution is already
        // tagged with the state in effect at aggregation time.
    }

    /// Seals the open bucket at `now_ns` as a partial bucket.
    pub fn force_flush(&mut self, now_ns: i64) -> Vec<SealedBucketSums> {
        match self {
            MetricProducer::Count(p) => p.force_flush(now_ns),
            MetricProducer::Duration(p) => p.force_flush(now_ns),
            MetricProducer::Event(_) => Vec::new(),
            MetricProducer::Gauge(p) => p.force_flush(now_ns),
            MetricProducer::Value(p) => p.force_flush(now_ns),
            MetricProducer::Kll(p) => p.force_flush(now_ns),
        }
    }

    /// Pull request the producer wants executed outside the engine lock.
    pub fn take_pending_pull(&mut self) -> Option<i32> {
        match self {
            MetricProducer::Gauge(p) => p.take_pending_pull(),
            MetricProducer::Value(p) => p.take_pending_pull(),
            _ => None,
        }
    }

    /// Records that a scheduled pull produced no usable sample.
    pub fn on_pull_failed(&mut self, stats: &GuardrailStats) {
        stats.note_sample_absent();
        if let MetricProducer::Value(p) = self {
            p.break_diff_chains();
        }
    }

    /// Drains accumulated output into a report. `end_time_ns` seals the
    /// open bucket first when `include_partial` is set.
    pub fn dump(&mut self, include_partial: bool, end_time_ns: i64) -> MetricReport {
        match self {
            MetricProducer::Count(p) => p.dump(include_partial, end_time_ns),
            MetricProducer::Duration(p) => p.dump(include_partial, end_time_ns),
            MetricProducer::Event(p) => p.dump(),
            MetricProducer::Gauge(p) => p.dump(include_partial, end_time_ns),
            MetricProducer::Value(p) => p.dump(include_partial, end_time_ns),
            MetricProducer::Kll(p) => p.dump(include_partial, end_time_ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(bucket_ms: i64) -> MetricCommon {
        MetricCommon::new(
            1,
            vec![],
            0,
            None,
            vec![],
            vec![],
            vec![],
            bucket_ms * 1_000_000,
            0,
            None,
        )
    }

    #[test]
    fn test_bucket_alignment() {
        let mut c = common(1_000);
        assert_eq!(c.current_bucket_start_ns, 0);
        assert_eq!(c.current_bucket_end_ns(), 1_000_000_000);

        c.advance_to(3_500_000_000);
        assert_eq!(c.current_bucket_start_ns, 3_000_000_000);
        assert_eq!(c.current_bucket_end_ns(), 4_000_000_000);
        assert_eq!(c.current_bucket_num(), 3);
    }

    #[test]
    fn test_partial_bucket_realigns() {
        let mut c = common(1_000);
        c.start_partial_bucket(500_000_000);
        // A partial bucket still closes at the next aligned boundary.
        assert_eq!(c.current_bucket_end_ns(), 1_000_000_000);
    }

    #[test]
    fn test_needs_flush() {
        let c = common(1_000);
        assert!(!c.needs_flush(999_999_999));
        assert!(c.needs_flush(1_000_000_000));
    }

    #[test]
    fn test_activation_lifecycle() {
        let mut c = common(1_000);
        c.activations.push(Activation {
            matcher_index: 4,
            ttl_ns: 100,
            activation_type: ActivationType::ActivateImmediately,
            deactivation_matcher_index: Some(5),
            status: ActivationStatus::Inactive,
        });

        assert!(!c.is_active(0));
        c.on_activation_matched(4, 10);
        assert!(c.is_active(50));
        // TTL expired.
        assert!(!c.is_active(200));

        c.on_activation_matched(4, 300);
        c.on_deactivation_matched(5);
        assert!(!c.is_active(301));
    }

    #[test]
    fn test_activation_on_boot_waits_for_boot() {
        let mut c = common(1_000);
        c.activations.push(Activation {
            matcher_index: 4,
            ttl_ns: 100,
            activation_type: ActivationType::ActivateOnBoot,
            deactivation_matcher_index: None,
            status: ActivationStatus::Inactive,
        });

        c.on_activation_matched(4, 10);
        assert!(!c.is_active(20));
        c.on_boot(1_000);
        assert!(c.is_active(1_050));
    }

    #[test]
    fn test_guarded_entry_overflow() {
        let stats = GuardrailStats::new();
        let mut current: HashMap<MetricDimensionKey, i64> = HashMap::new();
        let mut overflow = 0u64;

        let key_of = |v: i64| MetricDimensionKey {
            dims: DimensionKey::new(vec![FieldValue::new(
                FieldPath::new(1),
                Value::Long(v),
            )]),
            states: vec![],
        };

        for v in 0..3 {
            *guarded_entry(&mut current, key_of(v), 2, &mut overflow, &stats) += 1;
        }
        // Third distinct key went to the tombstone.
        assert_eq!(overflow, 1);
        assert!(current.contains_key(&MetricDimensionKey::overflow()));
        // An existing key is still reachable past the cap.
        *guarded_entry(&mut current, key_of(0), 2, &mut overflow, &stats) += 1;
        assert_eq!(current[&key_of(0)], 2);
    }
}
