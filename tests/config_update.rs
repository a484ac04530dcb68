//! The preserve/replace/new/removed decision procedure, exercised over
//! compiled graphs the way a live hot-update runs it.

use metricsd::engine::compile::compile;
use metricsd::engine::{diff_graphs, update_graph, EvaluationGraph, UpdateStatus};
use metricsd::event::FieldSpec;
use metricsd::schema::{
    Alert, AtomMatcher, Combination, CountMetricDef, EventActivation, EventMetricDef,
    FieldValueMatcher, GaugeMetricDef, GaugeTrigger, InitialConditionValue, KllMetricDef,
    LogicalOperation, MatcherKind, MetricActivation, MetricsConfig, Predicate, PredicateKind,
    SimpleAtomMatcher, SimplePredicate, StateDef, StateGroup, StateMap, ValueMatcher,
    ValueMetricDef,
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

fn combination(id: i64, operation: LogicalOperation, children: Vec<i64>) -> AtomMatcher {
    AtomMatcher {
        id,
        kind: MatcherKind::Combination(Combination {
            operation,
            children,
        }),
    }
}

fn simple_predicate(id: i64, start: i64, stop: i64) -> Predicate {
    Predicate {
        id,
        kind: PredicateKind::Simple(SimplePredicate {
            start,
            stop: Some(stop),
            stop_all: None,
            count_nesting: false,
            dimensions: vec![],
            initial_value: InitialConditionValue::default(),
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

fn event_metric(id: i64, what: i64) -> EventMetricDef {
    EventMetricDef {
        id,
        what,
        condition: None,
        condition_links: vec![],
        sampling_fraction: None,
    }
}

fn state_def(id: i64, atom: i32) -> StateDef {
    StateDef {
        id,
        atom,
        exclusive_state_field: 2,
        nested: false,
        primary_fields: vec![FieldSpec::top_level(1)],
        state_map: None,
    }
}

fn build(config: &MetricsConfig) -> EvaluationGraph {
    compile(config, 0, 0).expect("config compiles")
}

fn matcher_status(graph: &EvaluationGraph, statuses: &[UpdateStatus], id: i64) -> UpdateStatus {
    statuses[graph.matcher_map[&id]]
}

fn condition_status(graph: &EvaluationGraph, statuses: &[UpdateStatus], id: i64) -> UpdateStatus {
    statuses[graph.condition_map[&id]]
}

fn metric_status(graph: &EvaluationGraph, statuses: &[UpdateStatus], id: i64) -> UpdateStatus {
    statuses[graph.producer_map[&id]]
}

#[test]
fn simple_matcher_preserve_replace_new() {
    let old = build(&MetricsConfig {
        atom_matchers: vec![simple_matcher(1, 10), simple_matcher(2, 11)],
        ..Default::default()
    });

    // Matcher 1 unchanged, matcher 2 points at a new atom, matcher 3 is new.
    let new = build(&MetricsConfig {
        atom_matchers: vec![
            simple_matcher(1, 10),
            simple_matcher(2, 12),
            simple_matcher(3, 13),
        ],
        ..Default::default()
    });
    let outcome = diff_graphs(&old, &new).expect("diffs");

    assert_eq!(matcher_status(&new, &outcome.matchers, 1), UpdateStatus::Preserve);
    assert_eq!(matcher_status(&new, &outcome.matchers, 2), UpdateStatus::Replace);
    assert_eq!(matcher_status(&new, &outcome.matchers, 3), UpdateStatus::New);
}

#[test]
fn combination_matcher_preserved_across_reorder() {
    let parts = vec![
        simple_matcher(1, 10),
        simple_matcher(2, 11),
        combination(3, LogicalOperation::Or, vec![1, 2]),
    ];
    let old = build(&MetricsConfig {
        atom_matchers: parts.clone(),
        ..Default::default()
    });
    let mut reordered = parts;
    reordered.rotate_left(1);
    let new = build(&MetricsConfig {
        atom_matchers: reordered,
        ..Default::default()
    });

    let outcome = diff_graphs(&old, &new).expect("diffs");
    for id in [1, 2, 3] {
        assert_eq!(
            matcher_status(&new, &outcome.matchers, id),
            UpdateStatus::Preserve,
            "matcher {id}"
        );
    }
}

#[test]
fn combination_operation_change_replaces() {
    let make = |op: LogicalOperation| MetricsConfig {
        atom_matchers: vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            combination(3, op, vec![1, 2]),
        ],
        ..Default::default()
    };
    let old = build(&make(LogicalOperation::Or));
    let new = build(&make(LogicalOperation::And));
    let outcome = diff_graphs(&old, &new).expect("diffs");

    assert_eq!(matcher_status(&new, &outcome.matchers, 1), UpdateStatus::Preserve);
    assert_eq!(matcher_status(&new, &outcome.matchers, 2), UpdateStatus::Preserve);
    assert_eq!(matcher_status(&new, &outcome.matchers, 3), UpdateStatus::Replace);
}

#[test]
fn simple_condition_preserve_and_replace() {
    let matchers = vec![simple_matcher(1, 10), simple_matcher(2, 11)];
    let old = build(&MetricsConfig {
        atom_matchers: matchers.clone(),
        predicates: vec![simple_predicate(20, 1, 2)],
        ..Default::default()
    });

    // Identical definition preserves.
    let same = build(&MetricsConfig {
        atom_matchers: matchers.clone(),
        predicates: vec![simple_predicate(20, 1, 2)],
        ..Default::default()
    });
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(condition_status(&same, &outcome.conditions, 20), UpdateStatus::Preserve);

    // Swapped start/stop replaces.
    let swapped = build(&MetricsConfig {
        atom_matchers: matchers,
        predicates: vec![simple_predicate(20, 2, 1)],
        ..Default::default()
    });
    let outcome = diff_graphs(&old, &swapped).expect("diffs");
    assert_eq!(
        condition_status(&swapped, &outcome.conditions, 20),
        UpdateStatus::Replace
    );
}

#[test]
fn condition_replaced_when_matcher_dependency_changes() {
    let make = |atom: i32| MetricsConfig {
        atom_matchers: vec![simple_matcher(1, atom), simple_matcher(2, 11)],
        predicates: vec![simple_predicate(20, 1, 2)],
        ..Default::default()
    };
    let old = build(&make(10));
    let new = build(&make(12));
    let outcome = diff_graphs(&old, &new).expect("diffs");
    assert_eq!(
        condition_status(&new, &outcome.conditions, 20),
        UpdateStatus::Replace
    );
}

#[test]
fn combination_condition_follows_children() {
    let make = |stop: i64| MetricsConfig {
        atom_matchers: vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            simple_matcher(3, 12),
        ],
        predicates: vec![
            simple_predicate(20, 1, stop),
            simple_predicate(21, 1, 3),
            Predicate {
                id: 22,
                kind: PredicateKind::Combination(Combination {
                    operation: LogicalOperation::And,
                    children: vec![20, 21],
                }),
            },
        ],
        ..Default::default()
    };
    let old = build(&make(2));
    let same = build(&make(2));
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(condition_status(&same, &outcome.conditions, 22), UpdateStatus::Preserve);

    // Changing one child's definition cascades into the combination.
    let changed = build(&make(3));
    let outcome = diff_graphs(&old, &changed).expect("diffs");
    assert_eq!(
        condition_status(&changed, &outcome.conditions, 20),
        UpdateStatus::Replace
    );
    assert_eq!(
        condition_status(&changed, &outcome.conditions, 22),
        UpdateStatus::Replace
    );
}

#[test]
fn state_preserve_and_replace() {
    let old = build(&MetricsConfig {
        states: vec![state_def(50, 70)],
        ..Default::default()
    });

    let same = build(&MetricsConfig {
        states: vec![state_def(50, 70)],
        ..Default::default()
    });
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(outcome.states, vec![UpdateStatus::Preserve]);

    let mut with_map = state_def(50, 70);
    with_map.state_map = Some(StateMap {
        groups: vec![StateGroup {
            group_id: 1,
            values: vec![2, 3],
        }],
    });
    let changed = build(&MetricsConfig {
        states: vec![with_map],
        ..Default::default()
    });
    let outcome = diff_graphs(&old, &changed).expect("diffs");
    assert_eq!(outcome.states, vec![UpdateStatus::Replace]);
}

#[test]
fn event_metric_preserve_and_what_change() {
    let make = |what: i64| MetricsConfig {
        atom_matchers: vec![simple_matcher(1, 10), simple_matcher(2, 11)],
        event_metrics: vec![event_metric(100, what)],
        ..Default::default()
    };
    let old = build(&make(1));

    let same = build(&make(1));
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(metric_status(&same, &outcome.metrics, 100), UpdateStatus::Preserve);

    let moved = build(&make(2));
    let outcome = diff_graphs(&old, &moved).expect("diffs");
    assert_eq!(metric_status(&moved, &outcome.metrics, 100), UpdateStatus::Replace);
}

#[test]
fn metric_replaced_when_condition_changes() {
    let make = |stop: i64| MetricsConfig {
        atom_matchers: vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            simple_matcher(3, 12),
        ],
        predicates: vec![simple_predicate(20, 2, stop)],
        count_metrics: vec![CountMetricDef {
            condition: Some(20),
            ..count_metric(100, 1)
        }],
        ..Default::default()
    };
    let old = build(&make(3));
    let changed = build(&make(2));
    let outcome = diff_graphs(&old, &changed).expect("diffs");
    assert_eq!(
        metric_status(&changed, &outcome.metrics, 100),
        UpdateStatus::Replace
    );
}

#[test]
fn metric_replaced_when_sliced_state_changes() {
    let make = |exclusive_field: u8| {
        let mut state = state_def(50, 70);
        state.exclusive_state_field = exclusive_field;
        MetricsConfig {
            atom_matchers: vec![simple_matcher(1, 10)],
            states: vec![state],
            count_metrics: vec![CountMetricDef {
                slice_by_state: vec![50],
                ..count_metric(100, 1)
            }],
            ..Default::default()
        }
    };
    let old = build(&make(2));

    let same = build(&make(2));
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(metric_status(&same, &outcome.metrics, 100), UpdateStatus::Preserve);

    let changed = build(&make(3));
    let outcome = diff_graphs(&old, &changed).expect("diffs");
    assert_eq!(
        metric_status(&changed, &outcome.metrics, 100),
        UpdateStatus::Replace
    );
}

#[test]
fn metric_activation_dependency_change_replaces() {
    let make = |activation_atom: i32| MetricsConfig {
        atom_matchers: vec![
            simple_matcher(1, 10),
            simple_matcher(2, activation_atom),
        ],
        event_metrics: vec![event_metric(100, 1)],
        metric_activations: vec![MetricActivation {
            metric_id: 100,
            event_activations: vec![EventActivation {
                activation_matcher: 2,
                ttl_ns: 1_000_000,
                activation_type: Default::default(),
                deactivation_matcher: None,
            }],
        }],
        ..Default::default()
    };
    let old = build(&make(11));

    let same = build(&make(11));
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(metric_status(&same, &outcome.metrics, 100), UpdateStatus::Preserve);

    let changed = build(&make(12));
    let outcome = diff_graphs(&old, &changed).expect("diffs");
    assert_eq!(
        metric_status(&changed, &outcome.metrics, 100),
        UpdateStatus::Replace
    );
}

#[test]
fn adding_activation_replaces_metric() {
    let base = MetricsConfig {
        atom_matchers: vec![simple_matcher(1, 10), simple_matcher(2, 11)],
        event_metrics: vec![event_metric(100, 1)],
        ..Default::default()
    };
    let old = build(&base);

    let mut with_activation = base;
    with_activation.metric_activations = vec![MetricActivation {
        metric_id: 100,
        event_activations: vec![EventActivation {
            activation_matcher: 2,
            ttl_ns: 1_000,
            activation_type: Default::default(),
            deactivation_matcher: None,
        }],
    }];
    let new = build(&with_activation);
    let outcome = diff_graphs(&old, &new).expect("diffs");
    // The activation is part of the metric's effective definition.
    assert_eq!(metric_status(&new, &outcome.metrics, 100), UpdateStatus::Replace);
}

#[test]
fn gauge_value_kll_definition_changes_replace() {
    let gauge = |trigger: GaugeTrigger| GaugeMetricDef {
        id: 101,
        what: 1,
        trigger,
        gauge_fields: vec![],
        condition: None,
        condition_links: vec![],
        dimensions_in_what: vec![],
        slice_by_state: vec![],
        state_links: vec![],
        bucket_size_ms: 1000,
        max_num_gauge_atoms_per_bucket: 10,
        pull_atom: None,
        max_dimensions_per_bucket: None,
    };
    let value = |use_diff: bool| ValueMetricDef {
        id: 102,
        what: 1,
        value_field: FieldSpec::top_level(2),
        aggregation: Default::default(),
        use_diff,
        skip_zero_diff_output: false,
        condition: None,
        condition_links: vec![],
        dimensions_in_what: vec![],
        slice_by_state: vec![],
        state_links: vec![],
        bucket_size_ms: 1000,
        pull_atom: None,
        max_dimensions_per_bucket: None,
    };
    let kll = |field: u8| KllMetricDef {
        id: 103,
        what: 1,
        value_field: FieldSpec::top_level(field),
        condition: None,
        condition_links: vec![],
        dimensions_in_what: vec![],
        slice_by_state: vec![],
        state_links: vec![],
        bucket_size_ms: 1000,
        max_dimensions_per_bucket: None,
    };
    let make = |trigger, use_diff, field| MetricsConfig {
        atom_matchers: vec![simple_matcher(1, 10)],
        gauge_metrics: vec![gauge(trigger)],
        value_metrics: vec![value(use_diff)],
        kll_metrics: vec![kll(field)],
        ..Default::default()
    };

    let old = build(&make(GaugeTrigger::FirstNSamples, false, 2));
    let new = build(&make(GaugeTrigger::RandomOneSample, true, 3));
    let outcome = diff_graphs(&old, &new).expect("diffs");
    assert_eq!(metric_status(&new, &outcome.metrics, 101), UpdateStatus::Replace);
    assert_eq!(metric_status(&new, &outcome.metrics, 102), UpdateStatus::Replace);
    assert_eq!(metric_status(&new, &outcome.metrics, 103), UpdateStatus::Replace);
}

#[test]
fn alert_preserve_and_replace() {
    let alert = |threshold: i64| Alert {
        id: 900,
        metric_id: 100,
        num_buckets: 3,
        trigger_if_sum_gt: threshold,
        refractory_period_s: 10,
    };
    let make = |atom: i32, threshold: i64| MetricsConfig {
        atom_matchers: vec![simple_matcher(1, atom)],
        count_metrics: vec![count_metric(100, 1)],
        alerts: vec![alert(threshold)],
        ..Default::default()
    };

    let old = build(&make(10, 5));

    let same = build(&make(10, 5));
    let outcome = diff_graphs(&old, &same).expect("diffs");
    assert_eq!(outcome.alerts, vec![UpdateStatus::Preserve]);

    // Changed threshold.
    let new_threshold = build(&make(10, 9));
    let outcome = diff_graphs(&old, &new_threshold).expect("diffs");
    assert_eq!(outcome.alerts, vec![UpdateStatus::Replace]);

    // Unchanged alert definition, replaced metric underneath.
    let new_metric = build(&make(11, 5));
    let outcome = diff_graphs(&old, &new_metric).expect("diffs");
    assert_eq!(outcome.alerts, vec![UpdateStatus::Replace]);
}

#[test]
fn update_seals_replaced_and_removed_metrics() {
    use metricsd::event::{FieldPath, FieldValue, LogEvent, Value};
    use metricsd::metrics::MetricContext;
    use metricsd::stats::GuardrailStats;
    use std::sync::Arc;

    let old_config = MetricsConfig {
        atom_matchers: vec![simple_matcher(1, 10)],
        count_metrics: vec![count_metric(100, 1), count_metric(101, 1)],
        ..Default::default()
    };
    let mut old = build(&old_config);

    // Feed one event straight into both producers.
    let stats = Arc::new(GuardrailStats::new());
    let event = LogEvent::new(10, 100)
        .push(FieldValue::new(FieldPath::new(1), Value::Int(1)))
        .finalize();
    for producer in &mut old.producers {
        producer.on_matched_event(&MetricContext {
            event: &event,
            conditions: &[],
            states: &[],
            stats: &stats,
        });
    }

    // Metric 100 changes its bucket size; metric 101 disappears.
    let new_config = MetricsConfig {
        atom_matchers: vec![simple_matcher(1, 10)],
        count_metrics: vec![CountMetricDef {
            bucket_size_ms: 2000,
            ..count_metric(100, 1)
        }],
        ..Default::default()
    };
    let (new_graph, pre_reports) =
        update_graph(&mut old, &new_config, 500, 500).expect("updates");

    assert_eq!(new_graph.producers.len(), 1);
    // Both the replaced and the removed metric flushed their open buckets.
    assert_eq!(pre_reports.len(), 2);
    assert!(pre_reports.iter().all(|r| !r.buckets.is_empty()));
}

#[test]
fn installing_same_config_twice_is_all_preserve() {
    let config = MetricsConfig {
        atom_matchers: vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            combination(3, LogicalOperation::Or, vec![1, 2]),
        ],
        predicates: vec![simple_predicate(20, 1, 2)],
        states: vec![state_def(50, 70)],
        count_metrics: vec![CountMetricDef {
            condition: Some(20),
            ..count_metric(100, 3)
        }],
        alerts: vec![Alert {
            id: 900,
            metric_id: 100,
            num_buckets: 2,
            trigger_if_sum_gt: 10,
            refractory_period_s: 5,
        }],
        ..Default::default()
    };
    let old = build(&config);
    let new = build(&config);
    let outcome = diff_graphs(&old, &new).expect("diffs");

    assert!(outcome.matchers.iter().all(|s| *s == UpdateStatus::Preserve));
    assert!(outcome
        .conditions
        .iter()
        .all(|s| *s == UpdateStatus::Preserve));
    assert!(outcome.states.iter().all(|s| *s == UpdateStatus::Preserve));
    assert!(outcome.metrics.iter().all(|s| *s == UpdateStatus::Preserve));
    assert!(outcome.alerts.iter().all(|s| *s == UpdateStatus::Preserve));
}

#[test]
fn matcher_with_field_predicates_diffs_by_content() {
    let matcher = |value: i64| AtomMatcher {
        id: 1,
        kind: MatcherKind::Simple(SimpleAtomMatcher {
            atom: 29,
            field_matchers: vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqInt(value),
            }],
        }),
    };
    let old = build(&MetricsConfig {
        atom_matchers: vec![matcher(2)],
        ..Default::default()
    });
    let new = build(&MetricsConfig {
        atom_matchers: vec![matcher(3)],
        ..Default::default()
    });
    let outcome = diff_graphs(&old, &new).expect("diffs");
    assert_eq!(outcome.matchers, vec![UpdateStatus::Replace]);
}
