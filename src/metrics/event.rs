use rand::Rng;

use crate::report::{MetricReport, ReportedEvent};

use super::{MetricCommon, MetricContext};

/// Hard cap on recorded events between dumps.
const MAX_EVENTS_PER_METRIC: usize = 5000;

/// Records matched events verbatim; no aggregation.
#[derive(Debug)]
pub struct EventMetricProducer {
    pub common: MetricCommon,
    /// Probability a matched event is kept; None keeps all.
    sampling_fraction: Option<f64>,
    events: Vec<ReportedEvent>,
}

impl EventMetricProducer {
    pub fn new(common: MetricCommon, sampling_fraction: Option<f64>) -> Self {
        Self {
            common,
            sampling_fraction,
            events: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, ctx: &MetricContext<'_>) {
        if !self.common.aggregation_admitted(ctx) {
            return;
        }
        if let Some(fraction) = self.sampling_fraction {
            if rand::thread_rng().gen::<f64>() >= fraction {
                return;
            }
        }
        if self.events.len() >= MAX_EVENTS_PER_METRIC {
            self.common.overflow_count += 1;
            ctx.stats.note_dimension_overflow();
            return;
        }
        self.events.push(ReportedEvent {
            elapsed_ns: ctx.event.elapsed_ns(),
            values: ctx.event.values().to_vec(),
        });
    }

    pub fn dump(&mut self) -> MetricReport {
        MetricReport {
            metric_id: self.common.id,
            buckets: Vec::new(),
            events: std::mem::take(&mut self.events),
            dimension_overflow_count: std::mem::take(&mut self.common.overflow_count),
        }
    }

    pub fn adopt_runtime(&mut self, old: &mut EventMetricProducer) {
        self.events = std::mem::take(&mut old.events);
        self.common.condition = old.common.condition;
        self.common.overflow_count = old.common.overflow_count;
    }
}
