use std::collections::HashMap;

use crate::report::{AggregateValue, MetricReport, ReportBucket, SliceEntry};

use super::{
    guarded_entry, MetricCommon, MetricContext, MetricDimensionKey, SealedBucketSums,
};

/// Increments a bucketed counter per (dimension, state-tuple).
#[derive(Debug)]
pub struct CountMetricProducer {
    pub common: MetricCommon,
    current: HashMap<MetricDimensionKey, i64>,
    past: Vec<ReportBucket>,
}

impl CountMetricProducer {
    pub fn new(common: MetricCommon) -> Self {
        Self {
            common,
            current: HashMap::new(),
            past: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, ctx: &MetricContext<'_>) {
        if !self.common.aggregation_admitted(ctx) {
            return;
        }
        let key = self.common.extract_key(ctx.event, ctx.states);
        *guarded_entry(
            &mut self.current,
            key,
            self.common.max_dimensions,
            &mut self.common.overflow_count,
            ctx.stats,
        ) += 1;
    }

    pub fn flush_if_needed(&mut self, event_time_ns: i64) -> Vec<SealedBucketSums> {
        if !self.common.needs_flush(event_time_ns) {
            return Vec::new();
        }
        let sealed = self.seal_current(self.common.current_bucket_end_ns());
        self.common.advance_to(event_time_ns);
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
        let drained: Vec<(MetricDimensionKey, i64)> = self.current.drain().collect();
        if drained.is_empty() {
            return None;
        }
        let bucket_num = self.common.current_bucket_num();
        self.past.push(ReportBucket {
            start_ns: self.common.current_bucket_start_ns,
            end_ns,
            entries: drained
                .iter()
                .map(|(key, count)| SliceEntry {
                    dimensions: key.dims.clone(),
                    state_tuple: key.states.clone(),
                    value: AggregateValue::Count(*count),
                })
                .collect(),
        });
        Some(SealedBucketSums {
            bucket_num,
            end_ns,
            entries: drained,
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

    /// Moves accumulated state from the old instance of a preserved metric.
    pub fn adopt_runtime(&mut self, old: &mut CountMetricProducer) {
        self.current = std::mem::take(&mut old.current);
        self.past = std::mem::take(&mut old.past);
        self.common.current_bucket_start_ns = old.common.current_bucket_start_ns;
        self.common.condition = old.common.condition;
        self.common.overflow_count = old.common.overflow_count;
    }
}
