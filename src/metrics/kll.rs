use std::collections::HashMap;

use crate::event::FieldSpec;
use crate::report::{AggregateValue, MetricReport, ReportBucket, SliceEntry};

use super::kll_sketch::KllSketch;
use super::{MetricCommon, MetricContext, MetricDimensionKey, SealedBucketSums};

/// Feeds a numeric field into a KLL sketch per (dimension, state-tuple);
/// sketches serialize into the report at bucket close.
#[derive(Debug)]
pub struct KllMetricProducer {
    pub common: MetricCommon,
    value_field: FieldSpec,
    current: HashMap<MetricDimensionKey, KllSketch>,
    past: Vec<ReportBucket>,
}

impl KllMetricProducer {
    pub fn new(common: MetricCommon, value_field: FieldSpec) -> Self {
        Self {
            common,
            value_field,
            current: HashMap::new(),
            past: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, ctx: &MetricContext<'_>) {
        if !self.common.aggregation_admitted(ctx) {
            return;
        }
        let Some(sample) = ctx
            .event
            .project(&[self.value_field.clone()])
            .values()
            .first()
            .and_then(|v| v.value.as_i64())
        else {
            ctx.stats.note_sample_absent();
            return;
        };
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
        self.current.entry(key).or_default().insert(sample);
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) -> Vec<SealedBucketSums> {
        if !self.common.needs_flush(event_time_ns) {
            return Vec::new();
        }
        self.seal_current(self.common.current_bucket_end_ns());
        self.common.advance_to(event_time_ns);
        Vec::new()
    }

    pub fn force_flush(&mut self, now_ns: i64) -> Vec<SealedBucketSums> {
        self.seal_current(now_ns);
        self.common.start_partial_bucket(now_ns);
        Vec::new()
    }

    fn seal_current(&mut self, end_ns: i64) {
        if end_ns <= self.common.current_bucket_start_ns {
            return;
        }
        let entries: Vec<SliceEntry> = self
            .current
            .drain()
            .filter(|(_, sketch)| !sketch.is_empty())
            .map(|(key, sketch)| SliceEntry {
                dimensions: key.dims,
                state_tuple: key.states,
                value: AggregateValue::Sketch {
                    encoded: sketch.encode(),
                    count: sketch.count(),
                },
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

    pub fn adopt_runtime(&mut self, old: &mut KllMetricProducer) {
        self.current = std::mem::take(&mut old.current);
        self.past = std::mem::take(&mut old.past);
        self.common.current_bucket_start_ns = old.common.current_bucket_start_ns;
        self.common.condition = old.common.condition;
        self.common.overflow_count = old.common.overflow_count;
    }
}
