//! Configuration validation and graph construction.
//!
//! Compilation is all-or-nothing: any invalid node rejects the whole
//! config with a structured [`InvalidConfigReason`] and the running graph
//! stays untouched. Nodes are instantiated in dependency order (matchers,
//! conditions, states, metrics, alerts, alarms) with a cycle-marker DFS.

use std::collections::HashSet;

use thiserror::Error;

use crate::alarm::AlarmTracker;
use crate::anomaly::AnomalyTracker;
use crate::condition::ConditionTracker;
use crate::matcher::AtomMatcherTracker;
use crate::metrics::{
    Activation, ActivationStatus, CompiledConditionLink, CompiledStateSlice,
    CountMetricProducer, DurationMetricProducer, EventMetricProducer, GaugeMetricProducer,
    KllMetricProducer, MetricCommon, MetricProducer, ValueMetricProducer,
};
use crate::schema::{
    ConditionLink, FieldValueMatcher, Fingerprinted, LogicalOperation, MatcherKind,
    MetricsConfig, Position, PredicateKind, StateLink, ValueMatcher,
};
use crate::state::StateTracker;

use super::graph::EvaluationGraph;

/// Why a configuration was rejected. The engine returns this unchanged to
/// the config source; no partial install ever happens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidConfigReason {
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: &'static str, id: i64 },
    #[error("matcher {id} participates in a cycle")]
    MatcherCycle { id: i64 },
    #[error("condition {id} participates in a cycle")]
    ConditionCycle { id: i64 },
    #[error("node {referenced_by} references unknown matcher {id}")]
    UnknownMatcher { id: i64, referenced_by: i64 },
    #[error("node {referenced_by} references unknown condition {id}")]
    UnknownCondition { id: i64, referenced_by: i64 },
    #[error("metric {referenced_by} references unknown state {id}")]
    UnknownState { id: i64, referenced_by: i64 },
    #[error("alert {referenced_by} references unknown metric {id}")]
    UnknownMetric { id: i64, referenced_by: i64 },
    #[error("matcher {id}: matches_tuple nested deeper than two levels")]
    TupleTooDeep { id: i64 },
    #[error("matcher {id}: position ALL is not supported")]
    IllegalPosition { id: i64 },
    #[error("matcher {id}: NOT takes exactly one child")]
    NotOperandCount { id: i64 },
    #[error("condition {id}: NOT takes exactly one child")]
    ConditionNotOperandCount { id: i64 },
    #[error("combination {id} has no children")]
    EmptyCombination { id: i64 },
    #[error("metric {id} has multiple activation entries")]
    MultipleActivations { id: i64 },
    #[error("no_report metric {id} does not exist")]
    NoReportMetricNotFound { id: i64 },
    #[error("restricted-metric delegate requires event metrics; metric {id} is not one")]
    RestrictedDelegateNonEventMetric { id: i64 },
    #[error("metric {id}: state atom {atom} is uid-restricted and not whitelisted")]
    StateAtomNotWhitelisted { id: i64, atom: i32 },
    #[error("state {id}: atom {atom} already tracked by state {other}")]
    DuplicateStateAtom { id: i64, atom: i32, other: i64 },
    #[error("metric {id}: bucket size must be positive")]
    BadBucketSize { id: i64 },
    #[error("alert {id}: num_buckets must be positive")]
    BadAlertWindow { id: i64 },
    #[error("alarm {id}: period must be positive")]
    BadAlarmPeriod { id: i64 },
}

/// Compiles a configuration into a fresh evaluation graph. Producers start
/// with their first bucket at `time_base_ns`; the engine advances them to
/// the install instant.
pub fn compile(
    config: &MetricsConfig,
    time_base_ns: i64,
    now_wall_ns: i64,
) -> Result<EvaluationGraph, InvalidConfigReason> {
    let mut graph = EvaluationGraph {
        time_base_ns,
        config: config.clone(),
        ..Default::default()
    };

    build_matchers(config, &mut graph)?;
    build_conditions(config, &mut graph)?;
    build_states(config, &mut graph)?;
    build_metrics(config, &mut graph)?;
    attach_activations(config, &mut graph)?;
    check_no_report(config, &mut graph)?;
    build_alerts(config, &mut graph)?;
    build_alarms(config, &mut graph, now_wall_ns)?;

    graph.rebuild_reverse_indexes();
    graph.prime_condition_cache();
    Ok(graph)
}

fn build_matchers(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    // Ids first, so combinations can reference matchers in any order.
    for (index, matcher) in config.atom_matchers.iter().enumerate() {
        if graph.matcher_map.insert(matcher.id, index).is_some() {
            return Err(InvalidConfigReason::DuplicateId {
                kind: "matcher",
                id: matcher.id,
            });
        }
    }

    for matcher in &config.atom_matchers {
        let fingerprint = matcher.fingerprint();
        let tracker = match &matcher.kind {
            MatcherKind::Simple(simple) => {
                for field_matcher in &simple.field_matchers {
                    validate_field_matcher(matcher.id, field_matcher, 0)?;
                }
                AtomMatcherTracker::new_simple(matcher.id, fingerprint, simple.clone())
            }
            MatcherKind::Combination(combo) => {
                if combo.children.is_empty() {
                    return Err(InvalidConfigReason::EmptyCombination { id: matcher.id });
                }
                if combo.operation == LogicalOperation::Not && combo.children.len() != 1 {
                    return Err(InvalidConfigReason::NotOperandCount { id: matcher.id });
                }
                let children = combo
                    .children
                    .iter()
                    .map(|child_id| {
                        graph.matcher_map.get(child_id).copied().ok_or(
                            InvalidConfigReason::UnknownMatcher {
                                id: *child_id,
                                referenced_by: matcher.id,
                            },
                        )
                    })
                    .collect::<Result<Vec<usize>, _>>()?;
                AtomMatcherTracker::new_combination(
                    matcher.id,
                    fingerprint,
                    combo.operation,
                    children,
                )
            }
        };
        graph.matchers.push(tracker);
    }

    graph.matcher_eval_order = topological_order(
        graph.matchers.len(),
        |index| graph.matchers[index].children().to_vec(),
        |index| InvalidConfigReason::MatcherCycle {
            id: graph.matchers[index].id(),
        },
    )?;
    Ok(())
}

fn validate_field_matcher(
    matcher_id: i64,
    field_matcher: &FieldValueMatcher,
    depth: usize,
) -> Result<(), InvalidConfigReason> {
    if field_matcher.position == Some(Position::All) {
        return Err(InvalidConfigReason::IllegalPosition { id: matcher_id });
    }
    if let ValueMatcher::MatchesTuple(children) = &field_matcher.value {
        if depth >= 2 {
            return Err(InvalidConfigReason::TupleTooDeep { id: matcher_id });
        }
        for child in children {
            validate_field_matcher(matcher_id, child, depth + 1)?;
        }
    }
    Ok(())
}

fn build_conditions(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    for (index, predicate) in config.predicates.iter().enumerate() {
        if graph.condition_map.insert(predicate.id, index).is_some() {
            return Err(InvalidConfigReason::DuplicateId {
                kind: "condition",
                id: predicate.id,
            });
        }
    }

    for predicate in &config.predicates {
        let fingerprint = predicate.fingerprint();
        let tracker = match &predicate.kind {
            PredicateKind::Simple(simple) => {
                let resolve = |matcher_id: i64| {
                    graph.matcher_map.get(&matcher_id).copied().ok_or(
                        InvalidConfigReason::UnknownMatcher {
                            id: matcher_id,
                            referenced_by: predicate.id,
                        },
                    )
                };
                ConditionTracker::new_simple(
                    predicate.id,
                    fingerprint,
                    resolve(simple.start)?,
                    simple.stop.map(resolve).transpose()?,
                    simple.stop_all.map(resolve).transpose()?,
                    simple.count_nesting,
                    simple.dimensions.clone(),
                    simple.initial_value,
                )
            }
            PredicateKind::Combination(combo) => {
                if combo.children.is_empty() {
                    return Err(InvalidConfigReason::EmptyCombination { id: predicate.id });
                }
                if combo.operation == LogicalOperation::Not && combo.children.len() != 1 {
                    return Err(InvalidConfigReason::ConditionNotOperandCount {
                        id: predicate.id,
                    });
                }
                let children = combo
                    .children
                    .iter()
                    .map(|child_id| {
                        graph.condition_map.get(child_id).copied().ok_or(
                            InvalidConfigReason::UnknownCondition {
                                id: *child_id,
                                referenced_by: predicate.id,
                            },
                        )
                    })
                    .collect::<Result<Vec<usize>, _>>()?;
                ConditionTracker::new_combination(
                    predicate.id,
                    fingerprint,
                    combo.operation,
                    children,
                )
            }
        };
        graph.conditions.push(tracker);
    }

    graph.condition_eval_order = topological_order(
        graph.conditions.len(),
        |index| graph.conditions[index].children().to_vec(),
        |index| InvalidConfigReason::ConditionCycle {
            id: graph.conditions[index].id(),
        },
    )?;
    Ok(())
}

fn build_states(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    for state in &config.states {
        if graph.state_map_by_id.contains_key(&state.id) {
            return Err(InvalidConfigReason::DuplicateId {
                kind: "state",
                id: state.id,
            });
        }
        if let Some(&other_index) = graph.state_by_atom.get(&state.atom) {
            return Err(InvalidConfigReason::DuplicateStateAtom {
                id: state.id,
                atom: state.atom,
                other: graph.states[other_index].id(),
            });
        }
        let index = graph.states.len();
        graph.states.push(StateTracker::new(
            state.id,
            state.fingerprint(),
            state.atom,
            state.exclusive_state_field,
            state.nested,
            state.primary_fields.clone(),
            state.state_map.as_ref(),
        ));
        graph.state_map_by_id.insert(state.id, index);
        graph.state_by_atom.insert(state.atom, index);
    }
    Ok(())
}

struct MetricRefs<'c> {
    id: i64,
    what: i64,
    condition: Option<i64>,
    condition_links: &'c [ConditionLink],
    slice_by_state: &'c [i64],
    state_links: &'c [StateLink],
    dimensions: &'c [crate::event::FieldSpec],
    bucket_size_ms: i64,
    max_dimensions: Option<usize>,
}

fn build_common(
    refs: &MetricRefs<'_>,
    fingerprint: Vec<u8>,
    what_is_predicate: bool,
    config: &MetricsConfig,
    graph: &EvaluationGraph,
) -> Result<MetricCommon, InvalidConfigReason> {
    if refs.bucket_size_ms <= 0 {
        return Err(InvalidConfigReason::BadBucketSize { id: refs.id });
    }
    let what_index = if what_is_predicate {
        *graph
            .condition_map
            .get(&refs.what)
            .ok_or(InvalidConfigReason::UnknownCondition {
                id: refs.what,
                referenced_by: refs.id,
            })?
    } else {
        *graph
            .matcher_map
            .get(&refs.what)
            .ok_or(InvalidConfigReason::UnknownMatcher {
                id: refs.what,
                referenced_by: refs.id,
            })?
    };

    let condition_index = refs
        .condition
        .map(|condition_id| {
            graph.condition_map.get(&condition_id).copied().ok_or(
                InvalidConfigReason::UnknownCondition {
                    id: condition_id,
                    referenced_by: refs.id,
                },
            )
        })
        .transpose()?;

    let condition_links = refs
        .condition_links
        .iter()
        .map(|link| {
            graph
                .condition_map
                .get(&link.condition)
                .copied()
                .map(|condition_index| CompiledConditionLink {
                    condition_index,
                    fields_in_what: link.fields_in_what.clone(),
                })
                .ok_or(InvalidConfigReason::UnknownCondition {
                    id: link.condition,
                    referenced_by: refs.id,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let state_slices = refs
        .slice_by_state
        .iter()
        .map(|state_id| {
            let state_index = graph.state_map_by_id.get(state_id).copied().ok_or(
                InvalidConfigReason::UnknownState {
                    id: *state_id,
                    referenced_by: refs.id,
                },
            )?;
            let atom = graph.states[state_index].atom();
            if config.options.uid_restricted_state_atoms.contains(&atom)
                && !config.options.whitelisted_atom_ids.contains(&atom)
            {
                return Err(InvalidConfigReason::StateAtomNotWhitelisted {
                    id: refs.id,
                    atom,
                });
            }
            let fields_in_what = refs
                .state_links
                .iter()
                .find(|link| link.state_atom == atom)
                .map(|link| link.fields_in_what.clone())
                .unwrap_or_default();
            Ok(CompiledStateSlice {
                state_index,
                atom,
                fields_in_what,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MetricCommon::new(
        refs.id,
        fingerprint,
        what_index,
        condition_index,
        condition_links,
        state_slices,
        refs.dimensions.to_vec(),
        refs.bucket_size_ms * 1_000_000,
        graph.time_base_ns,
        refs.max_dimensions,
    ))
}

fn register_metric(
    graph: &mut EvaluationGraph,
    id: i64,
    producer: MetricProducer,
) -> Result<(), InvalidConfigReason> {
    if graph
        .producer_map
        .insert(id, graph.producers.len())
        .is_some()
    {
        return Err(InvalidConfigReason::DuplicateId { kind: "metric", id });
    }
    graph.producers.push(producer);
    Ok(())
}

fn build_metrics(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    let restricted = config
        .options
        .restricted_metrics_delegate_package_name
        .is_some();
    if restricted {
        for id in config.metric_ids() {
            if !config.event_metrics.iter().any(|m| m.id == id) {
                return Err(InvalidConfigReason::RestrictedDelegateNonEventMetric { id });
            }
        }
    }

    for def in &config.count_metrics {
        let refs = MetricRefs {
            id: def.id,
            what: def.what,
            condition: def.condition,
            condition_links: &def.condition_links,
            slice_by_state: &def.slice_by_state,
            state_links: &def.state_links,
            dimensions: &def.dimensions_in_what,
            bucket_size_ms: def.bucket_size_ms,
            max_dimensions: def.max_dimensions_per_bucket,
        };
        let common = build_common(&refs, def.fingerprint(), false, config, graph)?;
        register_metric(graph, def.id, MetricProducer::Count(CountMetricProducer::new(common)))?;
    }

    for def in &config.duration_metrics {
        let refs = MetricRefs {
            id: def.id,
            what: def.what,
            condition: def.condition,
            condition_links: &def.condition_links,
            slice_by_state: &[],
            state_links: &[],
            dimensions: &[],
            bucket_size_ms: def.bucket_size_ms,
            max_dimensions: def.max_dimensions_per_bucket,
        };
        let common = build_common(&refs, def.fingerprint(), true, config, graph)?;
        register_metric(
            graph,
            def.id,
            MetricProducer::Duration(DurationMetricProducer::new(common, def.aggregation)),
        )?;
    }

    for def in &config.event_metrics {
        let refs = MetricRefs {
            id: def.id,
            what: def.what,
            condition: def.condition,
            condition_links: &def.condition_links,
            slice_by_state: &[],
            state_links: &[],
            dimensions: &[],
            // Event metrics do not bucket; a nominal size keeps the common
            // bookkeeping uniform.
            bucket_size_ms: i64::MAX / 2_000_000,
            max_dimensions: None,
        };
        let common = build_common(&refs, def.fingerprint(), false, config, graph)?;
        register_metric(
            graph,
            def.id,
            MetricProducer::Event(EventMetricProducer::new(common, def.sampling_fraction)),
        )?;
    }

    for def in &config.gauge_metrics {
        let refs = MetricRefs {
            id: def.id,
            what: def.what,
            condition: def.condition,
            condition_links: &def.condition_links,
            slice_by_state: &def.slice_by_state,
            state_links: &def.state_links,
            dimensions: &def.dimensions_in_what,
            bucket_size_ms: def.bucket_size_ms,
            max_dimensions: def.max_dimensions_per_bucket,
        };
        let common = build_common(&refs, def.fingerprint(), false, config, graph)?;
        register_metric(
            graph,
            def.id,
            MetricProducer::Gauge(GaugeMetricProducer::new(
                common,
                def.trigger,
                def.gauge_fields.clone(),
                def.max_num_gauge_atoms_per_bucket,
                def.pull_atom,
            )),
        )?;
    }

    for def in &config.value_metrics {
        let refs = MetricRefs {
            id: def.id,
            what: def.what,
            condition: def.condition,
            condition_links: &def.condition_links,
            slice_by_state: &def.slice_by_state,
            state_links: &def.state_links,
            dimensions: &def.dimensions_in_what,
            bucket_size_ms: def.bucket_size_ms,
            max_dimensions: def.max_dimensions_per_bucket,
        };
        let common = build_common(&refs, def.fingerprint(), false, config, graph)?;
        register_metric(
            graph,
            def.id,
            MetricProducer::Value(ValueMetricProducer::new(
                common,
                def.value_field.clone(),
                def.aggregation,
                def.use_diff,
                def.skip_zero_diff_output,
                def.pull_atom,
            )),
        )?;
    }

    for def in &config.kll_metrics {
        let refs = MetricRefs {
            id: def.id,
            what: def.what,
            condition: def.condition,
            condition_links: &def.condition_links,
            slice_by_state: &def.slice_by_state,
            state_links: &def.state_links,
            dimensions: &def.dimensions_in_what,
            bucket_size_ms: def.bucket_size_ms,
            max_dimensions: def.max_dimensions_per_bucket,
        };
        let common = build_common(&refs, def.fingerprint(), false, config, graph)?;
        register_metric(
            graph,
            def.id,
            MetricProducer::Kll(KllMetricProducer::new(common, def.value_field.clone())),
        )?;
    }

    Ok(())
}

fn attach_activations(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    // An activation is part of its metric's effective definition: adding,
    // removing or editing one must replace the metric on update.
    let mut seen: HashSet<i64> = HashSet::new();
    for activation in &config.metric_activations {
        if !seen.insert(activation.metric_id) {
            return Err(InvalidConfigReason::MultipleActivations {
                id: activation.metric_id,
            });
        }
        let metric_index = *graph.producer_map.get(&activation.metric_id).ok_or(
            InvalidConfigReason::UnknownMetric {
                id: activation.metric_id,
                referenced_by: activation.metric_id,
            },
        )?;
        let mut compiled = Vec::with_capacity(activation.event_activations.len());
        for event_activation in &activation.event_activations {
            let matcher_index = *graph
                .matcher_map
                .get(&event_activation.activation_matcher)
                .ok_or(InvalidConfigReason::UnknownMatcher {
                    id: event_activation.activation_matcher,
                    referenced_by: activation.metric_id,
                })?;
            let deactivation_matcher_index = event_activation
                .deactivation_matcher
                .map(|id| {
                    graph.matcher_map.get(&id).copied().ok_or(
                        InvalidConfigReason::UnknownMatcher {
                            id,
                            referenced_by: activation.metric_id,
                        },
                    )
                })
                .transpose()?;
            compiled.push(Activation {
                matcher_index,
                ttl_ns: event_activation.ttl_ns,
                activation_type: event_activation.activation_type,
                deactivation_matcher_index,
                status: ActivationStatus::Inactive,
            });
        }
        let common = graph.producers[metric_index].common_mut();
        common.activations = compiled;
        common.fingerprint.extend(activation.fingerprint());
    }
    Ok(())
}

fn check_no_report(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    for id in &config.no_report_metrics {
        if !graph.producer_map.contains_key(id) {
            return Err(InvalidConfigReason::NoReportMetricNotFound { id: *id });
        }
        graph.no_report.insert(*id);
    }
    Ok(())
}

fn build_alerts(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
) -> Result<(), InvalidConfigReason> {
    for alert in &config.alerts {
        if graph.alert_map.contains_key(&alert.id) {
            return Err(InvalidConfigReason::DuplicateId {
                kind: "alert",
                id: alert.id,
            });
        }
        if alert.num_buckets == 0 {
            return Err(InvalidConfigReason::BadAlertWindow { id: alert.id });
        }
        let metric_index = *graph.producer_map.get(&alert.metric_id).ok_or(
            InvalidConfigReason::UnknownMetric {
                id: alert.metric_id,
                referenced_by: alert.id,
            },
        )?;
        graph.alert_map.insert(alert.id, graph.alerts.len());
        graph
            .alerts
            .push(AnomalyTracker::new(alert, alert.fingerprint(), metric_index));
    }
    Ok(())
}

fn build_alarms(
    config: &MetricsConfig,
    graph: &mut EvaluationGraph,
    now_wall_ns: i64,
) -> Result<(), InvalidConfigReason> {
    for alarm in &config.alarms {
        if graph.alarm_map.contains_key(&alarm.id) {
            return Err(InvalidConfigReason::DuplicateId {
                kind: "alarm",
                id: alarm.id,
            });
        }
        if alarm.period_ms <= 0 {
            return Err(InvalidConfigReason::BadAlarmPeriod { id: alarm.id });
        }
        graph.alarm_map.insert(alarm.id, graph.alarms.len());
        graph
            .alarms
            .push(AlarmTracker::new(alarm, alarm.fingerprint(), now_wall_ns));
    }
    Ok(())
}

/// DFS topological order (children before parents) with cycle detection.
fn topological_order(
    count: usize,
    children_of: impl Fn(usize) -> Vec<usize>,
    cycle_error: impl Fn(usize) -> InvalidConfigReason,
) -> Result<Vec<usize>, InvalidConfigReason> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }
    let mut marks = vec![Mark::Unvisited; count];
    let mut order = Vec::with_capacity(count);

    fn visit(
        node: usize,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
        children_of: &impl Fn(usize) -> Vec<usize>,
        cycle_error: &impl Fn(usize) -> InvalidConfigReason,
    ) -> Result<(), InvalidConfigReason> {
        match marks[node] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(cycle_error(node)),
            Mark::Unvisited => {}
        }
        marks[node] = Mark::InProgress;
        for child in children_of(node) {
            visit(child, marks, order, children_of, cycle_error)?;
        }
        marks[node] = Mark::Done;
        order.push(node);
        Ok(())
    }

    for node in 0..count {
        visit(node, &mut marks, &mut order, &children_of, &cycle_error)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        Alarm, Alert, AtomMatcher, Combination, CountMetricDef, EventMetricDef, Predicate,
        SimpleAtomMatcher, SimplePredicate,
    };

    fn simple_matcher(id: i64, atom: i32) -> AtomMatcher {
        AtomMatcher {
            id,
            kind: MatcherKind::Simple(SimpleAtomMatcher {
                atom,
                field_matchers: vec![],
            }),
        }
    }

    fn combination_matcher(id: i64, op: LogicalOperation, children: Vec<i64>) -> AtomMatcher {
        AtomMatcher {
            id,
            kind: MatcherKind::Combination(Combination {
                operation: op,
                children,
            }),
        }
    }

    fn count_metric(id: i64, what: i64) -> CountMetricDef {
        CountMetricDef {
            id,
            what,
            condition: None,
            condition_links: vec![],
            dimensions_in_what: vec![],
            slice_by_state: vec![],
            state_links: vec![],
            bucket_size_ms: 1000,
            max_dimensions_per_bucket: None,
        }
    }

    #[test]
    fn test_compile_minimal_config() {
        let config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29)],
            count_metrics: vec![count_metric(100, 1)],
            ..Default::default()
        };
        let graph = compile(&config, 0, 0).expect("compiles");
        assert_eq!(graph.matchers.len(), 1);
        assert_eq!(graph.producers.len(), 1);
        assert_eq!(graph.matcher_to_metrics[&0], vec![0]);
        assert!(graph.handles_atom(29));
        assert!(!graph.handles_atom(30));
    }

    #[test]
    fn test_duplicate_matcher_id_rejected() {
        let config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29), simple_matcher(1, 30)],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::DuplicateId {
                kind: "matcher",
                id: 1
            }
        );
    }

    #[test]
    fn test_matcher_cycle_rejected() {
        let config = MetricsConfig {
            atom_matchers: vec![
                combination_matcher(1, LogicalOperation::Or, vec![2]),
                combination_matcher(2, LogicalOperation::Or, vec![1]),
            ],
            ..Default::default()
        };
        assert!(matches!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::MatcherCycle { .. }
        ));
    }

    #[test]
    fn test_not_arity_rejected() {
        let config = MetricsConfig {
            atom_matchers: vec![
                simple_matcher(1, 29),
                simple_matcher(2, 30),
                combination_matcher(3, LogicalOperation::Not, vec![1, 2]),
            ],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::NotOperandCount { id: 3 }
        );
    }

    #[test]
    fn test_position_all_rejected() {
        let config = MetricsConfig {
            atom_matchers: vec![AtomMatcher {
                id: 1,
                kind: MatcherKind::Simple(SimpleAtomMatcher {
                    atom: 29,
                    field_matchers: vec![FieldValueMatcher {
                        field: 1,
                        position: Some(Position::All),
                        value: ValueMatcher::EqInt(1),
                    }],
                }),
            }],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::IllegalPosition { id: 1 }
        );
    }

    #[test]
    fn test_tuple_depth_rejected() {
        let too_deep = FieldValueMatcher {
            field: 1,
            position: None,
            value: ValueMatcher::MatchesTuple(vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::MatchesTuple(vec![FieldValueMatcher {
                    field: 1,
                    position: None,
                    value: ValueMatcher::MatchesTuple(vec![]),
                }]),
            }]),
        };
        let config = MetricsConfig {
            atom_matchers: vec![AtomMatcher {
                id: 1,
                kind: MatcherKind::Simple(SimpleAtomMatcher {
                    atom: 29,
                    field_matchers: vec![too_deep],
                }),
            }],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::TupleTooDeep { id: 1 }
        );
    }

    #[test]
    fn test_metric_with_unknown_what_rejected() {
        let config = MetricsConfig {
            count_metrics: vec![count_metric(100, 999)],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::UnknownMatcher {
                id: 999,
                referenced_by: 100
            }
        );
    }

    #[test]
    fn test_condition_references_and_eval_order() {
        let config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29), simple_matcher(2, 30)],
            predicates: vec![
                Predicate {
                    id: 10,
                    kind: PredicateKind::Simple(SimplePredicate {
                        start: 1,
                        stop: Some(2),
                        stop_all: None,
                        count_nesting: false,
                        dimensions: vec![],
                        initial_value: Default::default(),
                    }),
                },
                Predicate {
                    id: 11,
                    kind: PredicateKind::Combination(Combination {
                        operation: LogicalOperation::Not,
                        children: vec![10],
                    }),
                },
            ],
            ..Default::default()
        };
        let graph = compile(&config, 0, 0).expect("compiles");
        // The simple condition must be evaluated before the combination.
        let pos = |id: i64| {
            graph
                .condition_eval_order
                .iter()
                .position(|&i| graph.conditions[i].id() == id)
                .expect("in order")
        };
        assert!(pos(10) < pos(11));
        assert_eq!(graph.matcher_to_conditions[&0], vec![0]);
    }

    #[test]
    fn test_no_report_unknown_metric_rejected() {
        let config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29)],
            count_metrics: vec![count_metric(100, 1)],
            no_report_metrics: vec![999],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::NoReportMetricNotFound { id: 999 }
        );
    }

    #[test]
    fn test_restricted_delegate_requires_event_metrics() {
        let mut config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29)],
            count_metrics: vec![count_metric(100, 1)],
            ..Default::default()
        };
        config.options.restricted_metrics_delegate_package_name = Some("com.delegate".into());
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::RestrictedDelegateNonEventMetric { id: 100 }
        );

        // Event-only config passes.
        config.count_metrics.clear();
        config.event_metrics = vec![EventMetricDef {
            id: 100,
            what: 1,
            condition: None,
            condition_links: vec![],
            sampling_fraction: None,
        }];
        assert!(compile(&config, 0, 0).is_ok());
    }

    #[test]
    fn test_state_slicing_requires_whitelist_for_restricted_atom() {
        let mut config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29)],
            states: vec![crate::schema::StateDef {
                id: 50,
                atom: 77,
                exclusive_state_field: 1,
                nested: false,
                primary_fields: vec![],
                state_map: None,
            }],
            count_metrics: vec![CountMetricDef {
                slice_by_state: vec![50],
                ..count_metric(100, 1)
            }],
            ..Default::default()
        };
        config.options.uid_restricted_state_atoms = vec![77];
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::StateAtomNotWhitelisted { id: 100, atom: 77 }
        );

        config.options.whitelisted_atom_ids = vec![77];
        assert!(compile(&config, 0, 0).is_ok());
    }

    #[test]
    fn test_multiple_activations_rejected() {
        use crate::schema::{EventActivation, MetricActivation};
        let activation = MetricActivation {
            metric_id: 100,
            event_activations: vec![EventActivation {
                activation_matcher: 1,
                ttl_ns: 1_000,
                activation_type: Default::default(),
                deactivation_matcher: None,
            }],
        };
        let config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29)],
            count_metrics: vec![count_metric(100, 1)],
            metric_activations: vec![activation.clone(), activation],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::MultipleActivations { id: 100 }
        );
    }

    #[test]
    fn test_alert_and_alarm_validation() {
        let config = MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 29)],
            count_metrics: vec![count_metric(100, 1)],
            alerts: vec![Alert {
                id: 900,
                metric_id: 999,
                num_buckets: 1,
                trigger_if_sum_gt: 5,
                refractory_period_s: 10,
            }],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::UnknownMetric {
                id: 999,
                referenced_by: 900
            }
        );

        let config = MetricsConfig {
            alarms: vec![Alarm {
                id: 901,
                offset_ms: 0,
                period_ms: 0,
            }],
            ..Default::default()
        };
        assert_eq!(
            compile(&config, 0, 0).expect_err("rejects"),
            InvalidConfigReason::BadAlarmPeriod { id: 901 }
        );
    }
}
