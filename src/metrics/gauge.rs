use std::collections::HashMap;

use rand::Rng;

use crate::condition::ConditionState;
use crate::event::FieldSpec;
use crate::report::{AggregateValue, MetricReport, ReportBucket, SliceEntry};
use crate::schema::GaugeTrigger;

use super::{MetricCommon, MetricContext, MetricDimensionKey, SealedBucketSums};

#[derive(Debug, Default)]
struct GaugeSlice {
    samples: Vec<(i64, Vec<crate::event::FieldValue>)>,
    /// Candidates seen this bucket (RANDOM_ONE_SAMPLE reservoir).
    candidates: u64,
}

/// Samples field values at trigger instants, per (dimension, bucket).
#[derive(Debug)]
pub struct GaugeMetricProducer {
    pub common: MetricCommon,
    trigger: GaugeTrigger,
    gauge_fields: Vec<FieldSpec>,
    max_samples: usize,
    /// Snapshot atom pulled at trigger instants, if configured.
    pull_atom: Option<i32>,
    current: HashMap<MetricDimensionKey, GaugeSlice>,
    past: Vec<ReportBucket>,
    /// Condition-change triggers arm the next matched event for sampling.
    armed: bool,
    pending_pull: Option<i32>,
}

impl GaugeMetricProducer {
    pub fn new(
        common: MetricCommon,
        trigger: GaugeTrigger,
        gauge_fields: Vec<FieldSpec>,
        max_samples: usize,
        pull_atom: Option<i32>,
    ) -> Self {
        Self {
            common,
            trigger,
            gauge_fields,
            max_samples: max_samples.max(1),
            pull_atom,
            current: HashMap::new(),
            past: Vec::new(),
            armed: false,
            pending_pull: None,
        }
    }

    pub fn on_matched_event(&mut self, ctx: &MetricContext<'_>) {
        if !self.common.aggregation_admitted(ctx) {
            return;
        }
        match self.trigger {
            GaugeTrigger::RandomOneSample | GaugeTrigger::FirstNSamples => {}
            GaugeTrigger::AllConditionChanges | GaugeTrigger::ConditionChangeToTrue => {
                // Only the first event after a trigger edge samples.
                if !self.armed {
                    return;
                }
                self.armed = false;
            }
        }

        let key = self.common.extract_key(ctx.event, ctx.states);
        let key = if self.current.contains_key(&key) || self.current.len() < self.common.max_dimensions
        {
            key
        } else {
            self.common.overflow_count += 1;
            ctx.stats.note_dimension_overflow();
            MetricDimensionKey::overflow()
        };
        let slice = self.current.entry(key).or_default();

        let sample = (
            ctx.event.elapsed_ns(),
            if self.gauge_fields.is_empty() {
                ctx.event.values().to_vec()
            } else {
                ctx.event.project(&self.gauge_fields).values().to_vec()
            },
        );

        match self.trigger {
            GaugeTrigger::RandomOneSample => {
                // Uniform choice among the bucket's candidates.
                slice.candidates += 1;
                if slice.samples.is_empty() {
                    slice.samples.push(sample);
                } else if rand::thread_rng().gen_range(0..slice.candidates) == 0 {
                    slice.samples[0] = sample;
                }
            }
            _ => {
                if slice.samples.len() < self.max_samples {
                    slice.samples.push(sample);
                }
            }
        }
    }

    /// Condition edges drive the two condition triggers. With a pull atom
    /// the sample comes from a pull; otherwise the next matched event is
    /// sampled.
    pub fn on_condition_changed(&mut self, state: ConditionState, _event_time_ns: i64) {
        let was_true = self.common.condition.is_true();
        self.common.condition = state;
        let fire = match self.trigger {
            GaugeTrigger::AllConditionChanges => state.is_true(),
            GaugeTrigger::ConditionChangeToTrue => state.is_true() && !was_true,
            _ => false,
        };
        if fire {
            match self.pull_atom {
                Some(atom) => self.pending_pull = Some(atom),
                None => self.armed = true,
            }
        }
    }

    pub fn take_pending_pull(&mut self) -> Option<i32> {
        let pending = self.pending_pull.take();
        if pending.is_some() {
            // The pulled atom re-enters as a synthetic event; sample it.
            self.armed = true;
        }
        pending
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) -> Vec<SealedBucketSums> {
        if !self.common.needs_flush(event_time_ns) {
            return Vec::new();
        }
        self.seal_current(self.common.current_bucket_end_ns());
        self.common.advance_to(event_time_ns);
        // Pulled gauges re-sample each bucket.
        if self.pull_atom.is_some() && matches!(self.trigger, GaugeTrigger::RandomOneSample) {
            self.pending_pull = self.pull_atom;
        }
        Vec::new()
    }

    pub fn force_flush(&mut self, now_ns: i64) -> Vec<SealedBucketSums> {
        self.seal_current(now_ns);
        self.common.start_partial_bucket(now_ns);
        Vec::new()
    }

    fn seal_current(&mut self, end_ns: i64) {
        if end_ns <= self.common.current_bucket_start_ns || self.current.is_empty() {
            self.current.clear();
            return;
        }
        let entries: Vec<SliceEntry> = self
            .current
            .drain()
            .filter(|(_, slice)| !slice.samples.is_empty())
            .map(|(key, slice)| SliceEntry {
                dimensions: key.dims,
                state_tuple: key.states,
                value: AggregateValue::Samples(slice.samples),
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        self.past.push(ReportBucket {
            start_ns: self.common.current_bucket_start_ns,
            end_ns,
            entries,
        });
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

    pub fn adopt_runtime(&mut self, old: &mut GaugeMetricProducer) {
        self.current = std::mem::take(&mut old.current);
        self.past = std::mem::take(&mut old.past);
        self.common.current_bucket_start_ns = old.common.current_bucket_start_ns;
        self.common.condition = old.common.condition;
        self.common.overflow_count = old.common.overflow_count;
        self.armed = old.armed;
    }
}
