//! The compiled evaluation graph for one configuration.
//!
//! All node kinds live in indexed arrays with id→index maps; dependency
//! edges are stored as indexes. The reverse indexes used during ingest are
//! recomputed on every install.

use std::collections::{HashMap, HashSet};

use crate::alarm::AlarmTracker;
use crate::anomaly::AnomalyTracker;
use crate::condition::{ConditionState, ConditionTracker};
use crate::matcher::{AtomMatcherTracker, TrackerKind};
use crate::metrics::MetricProducer;
use crate::schema::MetricsConfig;
use crate::state::StateTracker;

#[derive(Default, Debug)]
pub struct EvaluationGraph {
    /// Alignment origin for every bucket in this config.
    pub time_base_ns: i64,
    /// The configuration this graph was compiled from, kept for diffing.
    pub config: MetricsConfig,

    pub matchers: Vec<AtomMatcherTracker>,
    pub matcher_map: HashMap<i64, usize>,
    /// Children before parents.
    pub matcher_eval_order: Vec<usize>,
    pub tag_to_matchers: HashMap<i32, Vec<usize>>,

    pub conditions: Vec<ConditionTracker>,
    pub condition_map: HashMap<i64, usize>,
    pub condition_eval_order: Vec<usize>,
    /// Persistent per-condition output cache, updated during ingest.
    pub condition_cache: Vec<ConditionState>,

    pub states: Vec<StateTracker>,
    pub state_map_by_id: HashMap<i64, usize>,
    pub state_by_atom: HashMap<i32, usize>,

    pub producers: Vec<MetricProducer>,
    pub producer_map: HashMap<i64, usize>,

    pub alerts: Vec<AnomalyTracker>,
    pub alert_map: HashMap<i64, usize>,

    pub alarms: Vec<AlarmTracker>,
    pub alarm_map: HashMap<i64, usize>,

    // --- Reverse indexes ---
    /// what-matcher index → metric indexes.
    pub matcher_to_metrics: HashMap<usize, Vec<usize>>,
    /// matcher index → simple condition indexes listening to it.
    pub matcher_to_conditions: HashMap<usize, Vec<usize>>,
    /// condition index → metric indexes gated by it.
    pub condition_to_metrics: HashMap<usize, Vec<usize>>,
    /// predicate (condition) index → duration metrics whose what it is.
    pub what_to_durations: HashMap<usize, Vec<usize>>,
    /// state tracker index → metric indexes slicing by it.
    pub state_to_metrics: HashMap<usize, Vec<usize>>,
    /// metric index → alert indexes watching it.
    pub metric_to_alerts: HashMap<usize, Vec<usize>>,
    /// activation matcher index → metric indexes.
    pub activation_to_metrics: HashMap<usize, Vec<usize>>,
    /// deactivation matcher index → metric indexes.
    pub deactivation_to_metrics: HashMap<usize, Vec<usize>>,
    /// Metric ids excluded from report egress.
    pub no_report: HashSet<i64>,
}

impl EvaluationGraph {
    /// Whether any node cares about this atom.
    pub fn handles_atom(&self, atom: i32) -> bool {
        self.tag_to_matchers.contains_key(&atom) || self.state_by_atom.contains_key(&atom)
    }

    /// Atoms a matcher can fire on: its own atom for simples, the union of
    /// children for combinations.
    fn matcher_atoms(&self, index: usize, out: &mut HashSet<i32>) {
        match self.matchers[index].kind() {
            TrackerKind::Simple { matcher } => {
                out.insert(matcher.atom);
            }
            TrackerKind::Combination { children, .. } => {
                for &child in children {
                    self.matcher_atoms(child, out);
                }
            }
        }
    }

    /// Recomputes every reverse index from the node arrays.
    pub fn rebuild_reverse_indexes(&mut self) {
        self.tag_to_matchers.clear();
        for index in 0..self.matchers.len() {
            let mut atoms = HashSet::new();
            self.matcher_atoms(index, &mut atoms);
            for atom in atoms {
                self.tag_to_matchers.entry(atom).or_default().push(index);
            }
        }

        self.matcher_to_conditions.clear();
        for (index, condition) in self.conditions.iter().enumerate() {
            for matcher_index in condition.matcher_indexes() {
                self.matcher_to_conditions
                    .entry(matcher_index)
                    .or_default()
                    .push(index);
            }
        }

        self.matcher_to_metrics.clear();
        self.condition_to_metrics.clear();
        self.what_to_durations.clear();
        self.state_to_metrics.clear();
        self.activation_to_metrics.clear();
        self.deactivation_to_metrics.clear();
        for (index, producer) in self.producers.iter().enumerate() {
            let common = producer.common();
            match producer {
                MetricProducer::Duration(_) => {
                    self.what_to_durations
                        .entry(common.what_index)
                        .or_default()
                        .push(index);
                }
                _ => {
                    self.matcher_to_metrics
                        .entry(common.what_index)
                        .or_default()
                        .push(index);
                }
            }
            if let Some(condition_index) = common.condition_index {
                self.condition_to_metrics
                    .entry(condition_index)
                    .or_default()
                    .push(index);
            }
            for link in &common.condition_links {
                self.condition_to_metrics
                    .entry(link.condition_index)
                    .or_default()
                    .push(index);
            }
            for slice in &common.state_slices {
                self.state_to_metrics
                    .entry(slice.state_index)
                    .or_default()
                    .push(index);
            }
            for activation in &common.activations {
                self.activation_to_metrics
                    .entry(activation.matcher_index)
                    .or_default()
                    .push(index);
                if let Some(deactivation) = activation.deactivation_matcher_index {
                    self.deactivation_to_metrics
                        .entry(deactivation)
                        .or_default()
                        .push(index);
                }
            }
        }

        self.metric_to_alerts.clear();
        for (index, alert) in self.alerts.iter().enumerate() {
            self.metric_to_alerts
                .entry(alert.metric_index)
                .or_default()
                .push(index);
        }

        // Deduplicate: a metric linked to one condition both directly and
        // via links would otherwise be notified twice.
        for list in self.condition_to_metrics.values_mut() {
            list.sort_unstable();
            list.dedup();
        }
    }

    /// Seeds the condition cache from each tracker's current state, in
    /// evaluation order so combinations see their children.
    pub fn prime_condition_cache(&mut self) {
        self.condition_cache = vec![ConditionState::Unknown; self.conditions.len()];
        let order = self.condition_eval_order.clone();
        for index in order {
            let Self {
                conditions,
                condition_cache,
                ..
            } = self;
            conditions[index].prime(index, condition_cache);
        }
    }

}
