//! The hot-update diff: preserve / replace / new / removed.
//!
//! Each node of the freshly compiled graph is compared with the old graph
//! by id and canonical fingerprint. A node is preserved only when its own
//! definition is identical AND every transitive dependency is preserved;
//! otherwise the fresh node (with empty state) replaces it. The decision
//! runs as a DFS with a tri-state marker so combination cycles are caught
//! and nothing is decided twice. Preserved nodes adopt the old runtime
//! state; replaced and removed producers seal their open bucket into the
//! pre-update report buffer.

use tracing::{debug, info};

use crate::metrics::MetricProducer;
use crate::report::MetricReport;
use crate::schema::MetricsConfig;

use super::compile::{compile, InvalidConfigReason};
use super::graph::EvaluationGraph;

/// Per-node outcome of the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Unknown,
    Preserve,
    Replace,
    New,
}

/// Statuses for every node kind of the new graph, indexed like the graph
/// arrays.
#[derive(Debug, Default)]
pub struct DiffOutcome {
    pub matchers: Vec<UpdateStatus>,
    pub conditions: Vec<UpdateStatus>,
    pub states: Vec<UpdateStatus>,
    pub metrics: Vec<UpdateStatus>,
    pub alerts: Vec<UpdateStatus>,
    pub alarms: Vec<UpdateStatus>,
}

/// Computes the diff between an old graph and a freshly compiled one.
pub fn diff_graphs(
    old: &EvaluationGraph,
    new: &EvaluationGraph,
) -> Result<DiffOutcome, InvalidConfigReason> {
    let mut outcome = DiffOutcome {
        matchers: vec![UpdateStatus::Unknown; new.matchers.len()],
        conditions: vec![UpdateStatus::Unknown; new.conditions.len()],
        states: vec![UpdateStatus::Unknown; new.states.len()],
        metrics: vec![UpdateStatus::Unknown; new.producers.len()],
        alerts: vec![UpdateStatus::Unknown; new.alerts.len()],
        alarms: vec![UpdateStatus::Unknown; new.alarms.len()],
    };

    let mut cycle = vec![false; new.matchers.len()];
    for index in 0..new.matchers.len() {
        matcher_status(index, old, new, &mut outcome.matchers, &mut cycle)?;
    }

    let mut cycle = vec![false; new.conditions.len()];
    for index in 0..new.conditions.len() {
        condition_status(index, old, new, &outcome.matchers, &mut outcome.conditions, &mut cycle)?;
    }

    for (index, state) in new.states.iter().enumerate() {
        outcome.states[index] = match old.state_map_by_id.get(&state.id()) {
            None => UpdateStatus::New,
            Some(&old_index) => {
                if old.states[old_index].fingerprint() == state.fingerprint() {
                    UpdateStatus::Preserve
                } else {
                    UpdateStatus::Replace
                }
            }
        };
    }

    for index in 0..new.producers.len() {
        outcome.metrics[index] = metric_status(index, old, new, &outcome);
    }

    for (index, alert) in new.alerts.iter().enumerate() {
        outcome.alerts[index] = match old.alert_map.get(&alert.id()) {
            None => UpdateStatus::New,
            Some(&old_index) => {
                let same_def = old.alerts[old_index].fingerprint() == alert.fingerprint();
                if same_def && outcome.metrics[alert.metric_index] == UpdateStatus::Preserve {
                    UpdateStatus::Preserve
                } else {
                    UpdateStatus::Replace
                }
            }
        };
    }

    for (index, alarm) in new.alarms.iter().enumerate() {
        outcome.alarms[index] = match old.alarm_map.get(&alarm.id()) {
            None => UpdateStatus::New,
            Some(&old_index) => {
                if old.alarms[old_index].fingerprint() == alarm.fingerprint() {
                    UpdateStatus::Preserve
                } else {
                    UpdateStatus::Replace
                }
            }
        };
    }

    Ok(outcome)
}

/// Matcher decision: identical definition and all children preserved.
/// Combination children are re-checked even when the parent definition is
/// unchanged, because a changed child means the parent must re-bind.
fn matcher_status(
    index: usize,
    old: &EvaluationGraph,
    new: &EvaluationGraph,
    statuses: &mut Vec<UpdateStatus>,
    cycle: &mut Vec<bool>,
) -> Result<UpdateStatus, InvalidConfigReason> {
    if statuses[index] != UpdateStatus::Unknown {
        return Ok(statuses[index]);
    }
    if cycle[index] {
        return Err(InvalidConfigReason::MatcherCycle {
            id: new.matchers[index].id(),
        });
    }
    cycle[index] = true;

    let tracker = &new.matchers[index];
    let status = match old.matcher_map.get(&tracker.id()) {
        None => UpdateStatus::New,
        Some(&old_index) => {
            if old.matchers[old_index].fingerprint() != tracker.fingerprint() {
                UpdateStatus::Replace
            } else {
                let mut status = UpdateStatus::Preserve;
                for &child in tracker.children().to_vec().iter() {
                    if matcher_status(child, old, new, statuses, cycle)? != UpdateStatus::Preserve
                    {
                        status = UpdateStatus::Replace;
                        break;
                    }
                }
                status
            }
        }
    };

    cycle[index] = false;
    statuses[index] = status;
    Ok(status)
}

/// Condition decision: simple conditions depend on their matchers;
/// combinations recurse into child conditions.
fn condition_status(
    index: usize,
    old: &EvaluationGraph,
    new: &EvaluationGraph,
    matcher_statuses: &[UpdateStatus],
    statuses: &mut Vec<UpdateStatus>,
    cycle: &mut Vec<bool>,
) -> Result<UpdateStatus, InvalidConfigReason> {
    if statuses[index] != UpdateStatus::Unknown {
        return Ok(statuses[index]);
    }
    if cycle[index] {
        return Err(InvalidConfigReason::ConditionCycle {
            id: new.conditions[index].id(),
        });
    }
    cycle[index] = true;

    let tracker = &new.conditions[index];
    let status = match old.condition_map.get(&tracker.id()) {
        None => UpdateStatus::New,
        Some(&old_index) => {
            if old.conditions[old_index].fingerprint() != tracker.fingerprint() {
                UpdateStatus::Replace
            } else {
                let mut status = UpdateStatus::Preserve;
                for matcher_index in tracker.matcher_indexes() {
                    if matcher_statuses[matcher_index] != UpdateStatus::Preserve {
                        status = UpdateStatus::Replace;
                        break;
                    }
                }
                if status == UpdateStatus::Preserve {
                    for &child in tracker.children().to_vec().iter() {
                        if condition_status(child, old, new, matcher_statuses, statuses, cycle)?
                            != UpdateStatus::Preserve
                        {
                            status = UpdateStatus::Replace;
                            break;
                        }
                    }
                }
                status
            }
        }
    };

    cycle[index] = false;
    statuses[index] = status;
    Ok(status)
}

/// Metric decision: identical definition plus preserved what, condition,
/// condition-link conditions, sliced states, and activation matchers.
fn metric_status(
    index: usize,
    old: &EvaluationGraph,
    new: &EvaluationGraph,
    outcome: &DiffOutcome,
) -> UpdateStatus {
    let producer = &new.producers[index];
    let common = producer.common();
    let Some(&old_index) = old.producer_map.get(&common.id) else {
        return UpdateStatus::New;
    };
    if old.producers[old_index].common().fingerprint != common.fingerprint {
        return UpdateStatus::Replace;
    }

    let what_preserved = match producer {
        MetricProducer::Duration(_) => outcome.conditions[common.what_index],
        _ => outcome.matchers[common.what_index],
    } == UpdateStatus::Preserve;
    if !what_preserved {
        return UpdateStatus::Replace;
    }
    if let Some(condition_index) = common.condition_index {
        if outcome.conditions[condition_index] != UpdateStatus::Preserve {
            return UpdateStatus::Replace;
        }
    }
    for link in &common.condition_links {
        if outcome.conditions[link.condition_index] != UpdateStatus::Preserve {
            return UpdateStatus::Replace;
        }
    }
    for slice in &common.state_slices {
        if outcome.states[slice.state_index] != UpdateStatus::Preserve {
            return UpdateStatus::Replace;
        }
    }
    for activation in &common.activations {
        if outcome.matchers[activation.matcher_index] != UpdateStatus::Preserve {
            return UpdateStatus::Replace;
        }
        if let Some(deactivation) = activation.deactivation_matcher_index {
            if outcome.matchers[deactivation] != UpdateStatus::Preserve {
                return UpdateStatus::Replace;
            }
        }
    }
    UpdateStatus::Preserve
}

/// Applies a new configuration over a live graph: compiles fresh arrays,
/// diffs, transfers preserved runtime state, and seals replaced/removed
/// producers into the returned pre-update reports. The caller swaps the
/// returned graph in under the engine lock.
pub fn update_graph(
    old: &mut EvaluationGraph,
    new_config: &MetricsConfig,
    now_elapsed_ns: i64,
    now_wall_ns: i64,
) -> Result<(EvaluationGraph, Vec<MetricReport>), InvalidConfigReason> {
    // Bucket alignment survives updates: the new graph keeps the old base.
    let mut new = compile(new_config, old.time_base_ns, now_wall_ns)?;
    let outcome = diff_graphs(old, &new)?;

    let mut pre_update_reports = Vec::new();

    for (index, status) in outcome.conditions.iter().enumerate() {
        if *status == UpdateStatus::Preserve {
            let old_index = old.condition_map[&new.conditions[index].id()];
            new.conditions[index].adopt_runtime(&mut old.conditions[old_index]);
        }
    }
    new.prime_condition_cache();

    for (index, status) in outcome.states.iter().enumerate() {
        if *status == UpdateStatus::Preserve {
            let old_index = old.state_map_by_id[&new.states[index].id()];
            new.states[index].adopt_runtime(&mut old.states[old_index]);
        }
    }

    for (index, status) in outcome.metrics.iter().enumerate() {
        let id = new.producers[index].id();
        match status {
            UpdateStatus::Preserve => {
                let old_index = old.producer_map[&id];
                adopt_producer(&mut new.producers[index], &mut old.producers[old_index]);
                debug!(metric = id, "metric preserved across config update");
            }
            UpdateStatus::Replace => {
                let old_index = old.producer_map[&id];
                pre_update_reports
                    .push(old.producers[old_index].dump(true, now_elapsed_ns));
                new.producers[index].common_mut().current_bucket_start_ns = now_elapsed_ns;
                // A replaced metric whose activation definition is intact
                // keeps its remaining TTL.
                let old_activation = old
                    .config
                    .metric_activations
                    .iter()
                    .find(|a| a.metric_id == id);
                let new_activation = new
                    .config
                    .metric_activations
                    .iter()
                    .find(|a| a.metric_id == id);
                if old_activation.is_some() && old_activation == new_activation {
                    copy_activation_state(
                        &mut new.producers[index],
                        &old.producers[old_index],
                    );
                }
                debug!(metric = id, "metric replaced; open bucket sealed");
            }
            UpdateStatus::New => {
                new.producers[index].common_mut().current_bucket_start_ns = now_elapsed_ns;
            }
            UpdateStatus::Unknown => {}
        }
    }

    // Old metrics with no counterpart in the new config flush their data
    // one last time.
    for (id, &old_index) in &old.producer_map {
        if !new.producer_map.contains_key(id) {
            pre_update_reports.push(old.producers[old_index].dump(true, now_elapsed_ns));
            debug!(metric = id, "metric removed by config update");
        }
    }

    for (index, status) in outcome.alerts.iter().enumerate() {
        if *status == UpdateStatus::Preserve {
            let old_index = old.alert_map[&new.alerts[index].id()];
            new.alerts[index].adopt_runtime(&mut old.alerts[old_index]);
        }
    }

    for alarm in &mut new.alarms {
        if let Some(&old_index) = old.alarm_map.get(&alarm.id()) {
            alarm.adopt_schedule(&old.alarms[old_index]);
        }
    }

    info!(
        matchers = new.matchers.len(),
        conditions = new.conditions.len(),
        metrics = new.producers.len(),
        preserved = outcome
            .metrics
            .iter()
            .filter(|s| **s == UpdateStatus::Preserve)
            .count(),
        "config update applied"
    );
    Ok((new, pre_update_reports))
}

/// Moves runtime state between same-kind producer instances. The diff
/// guarantees kinds match when a metric is preserved.
fn adopt_producer(new: &mut MetricProducer, old: &mut MetricProducer) {
    match (&mut *new, &mut *old) {
        (MetricProducer::Count(n), MetricProducer::Count(o)) => n.adopt_runtime(o),
        (MetricProducer::Duration(n), MetricProducer::Duration(o)) => n.adopt_runtime(o),
        (MetricProducer::Event(n), MetricProducer::Event(o)) => n.adopt_runtime(o),
        (MetricProducer::Gauge(n), MetricProducer::Gauge(o)) => n.adopt_runtime(o),
        (MetricProducer::Value(n), MetricProducer::Value(o)) => n.adopt_runtime(o),
        (MetricProducer::Kll(n), MetricProducer::Kll(o)) => n.adopt_runtime(o),
        _ => debug!("metric kind changed under an unchanged id; state dropped"),
    }
    copy_activation_state(new, old);
}

/// Copies live activation statuses between aligned activation lists.
fn copy_activation_state(new: &mut MetricProducer, old: &MetricProducer) {
    let statuses: Vec<_> = old.common().activations.iter().map(|a| a.status).collect();
    for (activation, status) in new
        .common_mut()
        .activations
        .iter_mut()
        .zip(statuses)
    {
        activation.status = status;
    }
}
