use std::collections::HashMap;

use crate::condition::ConditionState;
use crate::event::FieldSpec;
use crate::report::{AggregateValue, MetricReport, ReportBucket, SliceEntry};
use crate::schema::ValueAggregation;

use super::{MetricCommon, MetricContext, MetricDimensionKey, SealedBucketSums};

#[derive(Debug, Clone, Default)]
struct ValueInfo {
    /// Previous raw sample; the diff anchor. Survives bucket boundaries,
    /// cleared when a sample goes missing.
    base: Option<i64>,
    sum: i64,
    count: u64,
    min: i64,
    max: i64,
    /// Whether any contribution landed in the current bucket.
    seen: bool,
}

impl ValueInfo {
    fn contribute(&mut self, v: i64) {
        if !self.seen {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
        self.seen = true;
    }

    fn reset_bucket(&mut self) {
        self.sum = 0;
        self.count = 0;
        self.min = 0;
        self.max = 0;
        self.seen = false;
    }
}

/// Aggregates a numeric field per (dimension, state-tuple): SUM, MIN, MAX
/// or AVG, with optional difference mode for monotonic counters.
#[derive(Debug)]
pub struct ValueMetricProducer {
    pub common: MetricCommon,
    value_field: FieldSpec,
    aggregation: ValueAggregation,
    use_diff: bool,
    skip_zero_diff_output: bool,
    /// Snapshot atom pulled at bucket boundaries, if configured.
    pull_atom: Option<i32>,
    current: HashMap<MetricDimensionKey, ValueInfo>,
    past: Vec<ReportBucket>,
    pending_pull: Option<i32>,
}

impl ValueMetricProducer {
    pub fn new(
        common: MetricCommon,
        value_field: FieldSpec,
        aggregation: ValueAggregation,
        use_diff: bool,
        skip_zero_diff_output: bool,
        pull_atom: Option<i32>,
    ) -> Self {
        Self {
            common,
            value_field,
            aggregation,
            use_diff,
            skip_zero_diff_output,
            pull_atom,
            current: HashMap::new(),
            past: Vec::new(),
            pending_pull: pull_atom,
        }
    }

    pub fn on_matched_event(&mut self, ctx: &MetricContext<'_>) {
        if !self.common.aggregation_admitted(ctx) {
            return;
        }
        let key = self.common.extract_key(ctx.event, ctx.states);
        let key = if self.current.contains_key(&key)
            || self.current.len() < self.common.max_dimensions
        {
            key
        } else {
            self.common.overflow_count += 1;
            ctx.stats.note_dimension_overflow();
            MetricDimensionKey::overflow()
        };

        let sample = ctx
            .event
            .project(&[self.value_field.clone()])
            .values()
            .first()
            .and_then(|v| v.value.as_i64());
        let info = self.current.entry(key).or_default();

        let Some(sample) = sample else {
            // A missing sample breaks the diff chain: the next sample only
            // re-anchors and produces no output.
            info.base = None;
            ctx.stats.note_sample_absent();
            return;
        };

        if self.use_diff {
            match info.base.replace(sample) {
                None => {}
                Some(prev) => {
                    // A decrease means the counter reset; emit 0 and
                    // re-anchor at the new value.
                    let delta = if sample < prev { 0 } else { sample - prev };
                    if !(self.skip_zero_diff_output && delta == 0) {
                        info.contribute(delta);
                    }
                }
            }
        } else {
            info.contribute(sample);
        }
    }

    /// Gating condition edge. Leaving True closes the diff chain
    /// atomically at the transition: anchors from before the gate must not
    /// contribute to the first post-resume delta.
    pub fn on_condition_changed(&mut self, state: ConditionState, _event_time_ns: i64) {
        let was_true = self.common.condition.is_true();
        self.common.condition = state;
        if was_true && !state.is_true() {
            self.break_diff_chains();
        }
    }

    /// Clears every diff anchor; the next sample only re-anchors. Invoked
    /// on failed pulls and when the gating condition leaves True.
    pub fn break_diff_chains(&mut self) {
        if self.use_diff {
            for info in self.current.values_mut() {
                info.base = None;
            }
        }
    }

    pub fn take_pending_pull(&mut self) -> Option<i32> {
        self.pending_pull.take()
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) -> Vec<SealedBucketSums> {
        if !self.common.needs_flush(event_time_ns) {
            return Vec::new();
        }
        let sealed = self.seal_current(self.common.current_bucket_end_ns());
        self.common.advance_to(event_time_ns);
        if self.pull_atom.is_some() {
            self.pending_pull = self.pull_atom;
        }
        sealed.into_iter().collect()
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
        let bucket_num = self.common.current_bucket_num();
        let mut entries = Vec::new();
        let mut sums = Vec::new();
        for (key, info) in self.current.iter_mut() {
            if !info.seen {
                continue;
            }
            let value = match self.aggregation {
                ValueAggregation::Sum => AggregateValue::Long(info.sum),
                ValueAggregation::Min => AggregateValue::Long(info.min),
                ValueAggregation::Max => AggregateValue::Long(info.max),
                ValueAggregation::Avg => {
                    AggregateValue::Double(info.sum as f64 / info.count as f64)
                }
            };
            let sum_for_alerts = match self.aggregation {
                ValueAggregation::Sum => info.sum,
                ValueAggregation::Min => info.min,
                ValueAggregation::Max => info.max,
                ValueAggregation::Avg => info.sum / info.count as i64,
            };
            entries.push(SliceEntry {
                dimensions: key.dims.clone(),
                state_tuple: key.states.clone(),
                value,
            });
            sums.push((key.clone(), sum_for_alerts));
            info.reset_bucket();
        }
        // Keys with no diff anchor and no data can go.
        self.current.retain(|_, info| info.seen || info.base.is_some());

        if entries.is_empty() {
            return None;
        }
        self.past.push(ReportBucket {
            start_ns: self.common.current_bucket_start_ns,
            end_ns,
            entries,
        });
        Some(SealedBucketSums {
            bucket_num,
            end_ns,
            entries: sums,
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

    pub fn adopt_runtime(&mut self, old: &mut ValueMetricProducer) {
        self.current = std::mem::take(&mut old.current);
        self.past = std::mem::take(&mut old.past);
        self.common.current_bucket_start_ns = old.common.current_bucket_start_ns;
        self.common.condition = old.common.condition;
        self.common.overflow_count = old.common.overflow_count;
    }
}
