use std::collections::HashMap;

use crate::condition::{ConditionState, DimTransition};
use crate::report::{AggregateValue, MetricReport, ReportBucket, SliceEntry};
use crate::schema::DurationAggregation;
use crate::state::StateChange;

use super::{MetricCommon, MetricDimensionKey, SealedBucketSums};

#[derive(Debug, Clone, Default)]
struct DurationInfo {
    /// Predicate is True for this dimension.
    running: bool,
    /// Start of the current accrual segment; meaningful while running and
    /// the condition is met.
    seg_start_ns: i64,
    /// Wall-clock accrued in the current bucket (SUM).
    accrued_ns: i64,
    /// Length of the ongoing interval, carried across buckets (MAX_SPARSE).
    interval_ns: i64,
    /// Longest interval that completed in the current bucket (MAX_SPARSE).
    max_interval_ns: i64,
}

/// Accrues wall-clock time while (predicate = True ∧ condition = True),
/// per predicate dimension. SUM splits intervals across bucket boundaries;
/// MAX_SPARSE reports an interval in the bucket where it ends.
#[derive(Debug)]
pub struct DurationMetricProducer {
    pub common: MetricCommon,
    aggregation: DurationAggregation,
    infos: HashMap<MetricDimensionKey, DurationInfo>,
    past: Vec<ReportBucket>,
}

impl DurationMetricProducer {
    pub fn new(common: MetricCommon, aggregation: DurationAggregation) -> Self {
        Self {
            common,
            aggregation,
            infos: HashMap::new(),
            past: Vec::new(),
        }
    }

    fn accruing(&self) -> bool {
        self.common.condition_index.is_none() || self.common.condition.is_true()
    }

    /// Predicate edge for one dimension. `stop_all` arrives as one stopped
    /// transition per open dimension.
    pub fn on_what_transition(&mut self, transition: &DimTransition, event_time_ns: i64) {
        let key = MetricDimensionKey {
            dims: transition.key.clone(),
            states: Vec::new(),
        };
        let accruing = self.accruing();

        if transition.started {
            if !self.infos.contains_key(&key) && self.infos.len() >= self.common.max_dimensions {
                self.common.overflow_count += 1;
                return;
            }
            let info = self.infos.entry(key).or_default();
            if !info.running {
                info.running = true;
                if accruing {
                    info.seg_start_ns = event_time_ns;
                }
            }
        } else if let Some(info) = self.infos.get_mut(&key) {
            if info.running {
                if accruing {
                    let delta = event_time_ns - info.seg_start_ns;
                    info.accrued_ns += delta;
                    info.interval_ns += delta;
                }
                info.running = false;
                info.max_interval_ns = info.max_interval_ns.max(info.interval_ns);
                info.interval_ns = 0;
            }
        }
    }

    /// Gating condition edge: pauses or resumes every open interval
    /// atomically at the transition timestamp.
    pub fn on_condition_changed(&mut self, state: ConditionState, event_time_ns: i64) {
        let was = self.accruing();
        self.common.condition = state;
        let now = self.accruing();

        if was && !now {
            for info in self.infos.values_mut() {
                if info.running {
                    let delta = event_time_ns - info.seg_start_ns;
                    info.accrued_ns += delta;
                    info.interval_ns += delta;
                    // A pause ends the single-interval measurement.
                    info.max_interval_ns = info.max_interval_ns.max(info.interval_ns);
                    info.interval_ns = 0;
                }
            }
        } else if !was && now {
            for info in self.infos.values_mut() {
                if info.running {
                    info.seg_start_ns = event_time_ns;
                }
            }
        }
    }

    /// Duration metrics do not slice by state; transitions are absorbed.
    pub fn on_state_changed(&mut self, _change: &StateChange) {}

    pub fn flush_if_needed(&mut self, event_time_ns: i64) -> Vec<SealedBucketSums> {
        let mut sealed = Vec::new();
        // One bucket at a time: an interval spanning several buckets emits
        // a full-bucket entry for each.
        while self.common.needs_flush(event_time_ns) {
            let end = self.common.current_bucket_end_ns();
            if let Some(sums) = self.seal_current(end) {
                sealed.push(sums);
            }
            self.common.current_bucket_start_ns = end;
        }
        sealed
    }

    pub fn force_flush(&mut self, now_ns: i64) -> Vec<SealedBucketSums> {
        let sealed = self.seal_current(now_ns);
        self.common.start_partial_bucket(now_ns);
        sealed.into_iter().collect()
    }

    fn seal_current(&mut self, end_ns: i64) -> Option<SealedBucketSums> {
        if end_ns <= self.common.current_bucket_start_ns {
            return None;
        }
        let accruing = self.accruing();
        let bucket_num = self.common.current_bucket_num();
        let mut entries = Vec::new();

        for (key, info) in self.infos.iter_mut() {
            if info.running && accruing {
                let delta = end_ns - info.seg_start_ns;
                info.accrued_ns += delta;
                info.interval_ns += delta;
                info.seg_start_ns = end_ns;
            }
            let value = match self.aggregation {
                DurationAggregation::Sum => std::mem::take(&mut info.accrued_ns),
                DurationAggregation::MaxSparse => {
                    // Ongoing intervals wait for their stop; only completed
                    // intervals report, in the bucket where they ended.
                    std::mem::take(&mut info.max_interval_ns)
                }
            };
            if value > 0 {
                entries.push((key.clone(), value));
            }
        }
        // Idle dimensions with nothing accrued can go.
        self.infos
            .retain(|_, info| info.running || info.interval_ns > 0);

        if entries.is_empty() {
            return None;
        }
        self.past.push(ReportBucket {
            start_ns: self.common.current_bucket_start_ns,
            end_ns,
            entries: entries
                .iter()
                .map(|(key, ns)| SliceEntry {
                    dimensions: key.dims.clone(),
                    state_tuple: key.states.clone(),
                    value: AggregateValue::DurationNs(*ns),
                })
                .collect(),
        });
        Some(SealedBucketSums {
            bucket_num,
            end_ns,
            entries,
        })
    }

    pub fn dump(&mut self, include_partial: bool, end_time_ns: i64) -> MetricReport {
        if include_partial {
            self.seal_current(end_time_ns);
            self.common.start_partial_bucket(end_time_ns);
        }
        MetricReport {
            metric_id: self.common.id,
            buckets: std::mem::take(&mut self.past),
            events: Vec::new(),
            dimension_overflow_count: std::mem::take(&mut self.common.overflow_count),
        }
    }

    pub fn adopt_runtime(&mut self, old: &mut DurationMetricProducer) {
        self.infos = std::mem::take(&mut old.infos);
        self.past = std::mem::take(&mut old.past);
        self.common.current_bucket_start_ns = old.common.current_bucket_start_ns;
        self.common.condition = old.common.condition;
        self.common.overflow_count = old.common.overflow_count;
    }
}
