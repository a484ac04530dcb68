//! The configuration message model.
//!
//! A [`MetricsConfig`] declares atom matchers, predicates, states, metrics,
//! alerts, alarms and activations. Configs arrive as schema-typed messages
//! (any serde format); the compiler in `engine::compile` validates them and
//! builds the evaluation graph.
//!
//! Every node exposes a canonical byte fingerprint with a stable field
//! order. The hot-update diff compares fingerprints to decide whether a
//! node's definition changed across installs.

use serde::{Deserialize, Serialize};

use crate::event::FieldSpec;

/// Logical fold applied by combination matchers and predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
    Nand,
    Nor,
}

/// Repeated-field position qualifier on a field value matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    First,
    Last,
    Any,
    /// Declared for wire compatibility; rejected at validation.
    All,
}

/// Leaf predicate over a single field's value(s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatcher {
    EqBool(bool),
    EqString(String),
    EqAnyString(Vec<String>),
    NeqAnyString(Vec<String>),
    EqWildcardString(String),
    EqAnyWildcardString(Vec<String>),
    NeqAnyWildcardString(Vec<String>),
    EqInt(i64),
    EqAnyInt(Vec<i64>),
    NeqAnyInt(Vec<i64>),
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
    LtFloat(f32),
    GtFloat(f32),
    MatchesTuple(Vec<FieldValueMatcher>),
}

/// Predicate over one field of an atom, possibly recursing into a tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    pub field: u8,
    #[serde(default)]
    pub position: Option<Position>,
    pub value: ValueMatcher,
}

/// Matches single events of one atom against per-field predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAtomMatcher {
    pub atom: i32,
    #[serde(default)]
    pub field_matchers: Vec<FieldValueMatcher>,
}

/// Logical tree over other matchers, referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combination {
    pub operation: LogicalOperation,
    pub children: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Simple(SimpleAtomMatcher),
    Combination(Combination),
}

/// A named atom matcher node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMatcher {
    pub id: i64,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

/// Condition state a simple predicate starts in before any matched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialConditionValue {
    #[default]
    Unknown,
    False,
}

/// Stateful predicate over event history, driven by matcher outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePredicate {
    pub start: i64,
    #[serde(default)]
    pub stop: Option<i64>,
    #[serde(default)]
    pub stop_all: Option<i64>,
    #[serde(default)]
    pub count_nesting: bool,
    #[serde(default)]
    pub dimensions: Vec<FieldSpec>,
    #[serde(default)]
    pub initial_value: InitialConditionValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    Simple(SimplePredicate),
    Combination(Combination),
}

/// A named predicate node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: i64,
    #[serde(flatten)]
    pub kind: PredicateKind,
}

/// Groups raw state integers into named values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMap {
    pub groups: Vec<StateGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateGroup {
    pub group_id: i32,
    pub values: Vec<i32>,
}

/// A sliced state machine over one atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub id: i64,
    pub atom: i32,
    /// Top-level field carrying the exclusive state value.
    pub exclusive_state_field: u8,
    /// Nested ON/OFF counting instead of plain overwrite.
    #[serde(default)]
    pub nested: bool,
    #[serde(default)]
    pub primary_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub state_map: Option<StateMap>,
}

/// Binds a metric's event fields to a sliced condition's dimension fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLink {
    pub condition: i64,
    pub fields_in_what: Vec<FieldSpec>,
    pub fields_in_condition: Vec<FieldSpec>,
}

/// Binds a metric's event fields to a state tracker's primary key fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLink {
    pub state_atom: i32,
    pub fields_in_what: Vec<FieldSpec>,
    pub fields_in_state: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    #[default]
    ActivateImmediately,
    ActivateOnBoot,
}

/// One activation trigger for a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActivation {
    pub activation_matcher: i64,
    pub ttl_ns: i64,
    #[serde(default)]
    pub activation_type: ActivationType,
    #[serde(default)]
    pub deactivation_matcher: Option<i64>,
}

/// Gates a metric behind one or more activation triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricActivation {
    pub metric_id: i64,
    pub event_activations: Vec<EventActivation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    #[default]
    Sum,
    MaxSparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueAggregation {
    #[default]
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeTrigger {
    #[default]
    RandomOneSample,
    AllConditionChanges,
    ConditionChangeToTrue,
    FirstNSamples,
}

/// Counts matched events per (dimension, state-tuple) per bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMetricDef {
    pub id: i64,
    /// Matcher id.
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub condition_links: Vec<ConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_links: Vec<StateLink>,
    pub bucket_size_ms: i64,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<usize>,
}

/// Accumulates wall-clock intervals from a sliced predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetricDef {
    pub id: i64,
    /// Predicate id whose per-dimension True intervals are accrued.
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub condition_links: Vec<ConditionLink>,
    #[serde(default)]
    pub aggregation: DurationAggregation,
    pub bucket_size_ms: i64,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<usize>,
}

/// Records matched events verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub condition_links: Vec<ConditionLink>,
    /// Probability in [0, 1] that a matched event is kept; None keeps all.
    #[serde(default)]
    pub sampling_fraction: Option<f64>,
}

/// Samples a field value at trigger instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub trigger: GaugeTrigger,
    /// Field(s) captured per sample; empty captures all fields.
    #[serde(default)]
    pub gauge_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub condition_links: Vec<ConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_links: Vec<StateLink>,
    pub bucket_size_ms: i64,
    /// Cap for FIRST_N_SAMPLES, and a hard cap for every trigger.
    #[serde(default = "default_max_gauge_atoms")]
    pub max_num_gauge_atoms_per_bucket: usize,
    /// Snapshot atom pulled at trigger instants instead of using the
    /// triggering event's own fields.
    #[serde(default)]
    pub pull_atom: Option<i32>,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<usize>,
}

fn default_max_gauge_atoms() -> usize {
    10
}

/// Aggregates a numeric field; optionally diffs successive samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetricDef {
    pub id: i64,
    pub what: i64,
    pub value_field: FieldSpec,
    #[serde(default)]
    pub aggregation: ValueAggregation,
    #[serde(default)]
    pub use_diff: bool,
    #[serde(default)]
    pub skip_zero_diff_output: bool,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub condition_links: Vec<ConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_links: Vec<StateLink>,
    pub bucket_size_ms: i64,
    /// Snapshot atom pulled at bucket boundaries.
    #[serde(default)]
    pub pull_atom: Option<i32>,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<usize>,
}

/// Feeds a numeric field into a KLL quantile sketch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KllMetricDef {
    pub id: i64,
    pub what: i64,
    pub value_field: FieldSpec,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub condition_links: Vec<ConditionLink>,
    #[serde(default)]
    pub dimensions_in_what: Vec<FieldSpec>,
    #[serde(default)]
    pub slice_by_state: Vec<i64>,
    #[serde(default)]
    pub state_links: Vec<StateLink>,
    pub bucket_size_ms: i64,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<usize>,
}

/// Threshold watcher over a metric's trailing bucket sums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub metric_id: i64,
    pub num_buckets: usize,
    pub trigger_if_sum_gt: i64,
    pub refractory_period_s: u32,
}

/// Wall-clock periodic trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: i64,
    pub offset_ms: i64,
    pub period_ms: i64,
}

/// Config-wide behavior switches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigOptions {
    /// Restricted-metric mode; requires every metric to be an event metric.
    #[serde(default)]
    pub restricted_metrics_delegate_package_name: Option<String>,
    /// Atoms allowed as state-slicing sources despite uid restrictions.
    #[serde(default)]
    pub whitelisted_atom_ids: Vec<i32>,
    /// Insert a bucket boundary when a tracked package upgrades.
    #[serde(default)]
    pub split_bucket_for_app_upgrade: bool,
    /// Emit 64-bit hashes in place of string literals in reports.
    #[serde(default)]
    pub hash_strings_in_metric_report: bool,
    /// 0 disables; else emit the first n bytes of certificate hashes.
    #[serde(default)]
    pub truncated_certificate_hash_size: u8,
    /// Atoms whose state slicing is uid-restricted.
    #[serde(default)]
    pub uid_restricted_state_atoms: Vec<i32>,
}

/// A full configuration: the unit of install and hot update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub atom_matchers: Vec<AtomMatcher>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub states: Vec<StateDef>,
    #[serde(default)]
    pub count_metrics: Vec<CountMetricDef>,
    #[serde(default)]
    pub duration_metrics: Vec<DurationMetricDef>,
    #[serde(default)]
    pub event_metrics: Vec<EventMetricDef>,
    #[serde(default)]
    pub gauge_metrics: Vec<GaugeMetricDef>,
    #[serde(default)]
    pub value_metrics: Vec<ValueMetricDef>,
    #[serde(default)]
    pub kll_metrics: Vec<KllMetricDef>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub alarms: Vec<Alarm>,
    #[serde(default)]
    pub metric_activations: Vec<MetricActivation>,
    /// Metrics evaluated but excluded from report egress.
    #[serde(default)]
    pub no_report_metrics: Vec<i64>,
    #[serde(default)]
    pub options: ConfigOptions,
}

impl MetricsConfig {
    /// Ids of every metric across the six kinds, in declaration order.
    pub fn metric_ids(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        ids.extend(self.count_metrics.iter().map(|m| m.id));
        ids.extend(self.duration_metrics.iter().map(|m| m.id));
        ids.extend(self.event_metrics.iter().map(|m| m.id));
        ids.extend(self.gauge_metrics.iter().map(|m| m.id));
        ids.extend(self.value_metrics.iter().map(|m| m.id));
        ids.extend(self.kll_metrics.iter().map(|m| m.id));
        ids
    }
}

// --- Canonical fingerprints ---

/// Accumulates a canonical, field-ordered byte serialization.
#[derive(Default)]
pub struct Fingerprint {
    bytes: Vec<u8>,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.bytes.push(u8::from(v));
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn usize(&mut self, v: usize) -> &mut Self {
        self.i64(v as i64)
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_bits().to_le_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_bits().to_le_bytes());
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self {
        self.usize(v.len());
        self.bytes.extend_from_slice(v.as_bytes());
        self
    }

    pub fn opt_i64(&mut self, v: Option<i64>) -> &mut Self {
        match v {
            Some(v) => self.bool(true).i64(v),
            None => self.bool(false),
        };
        self
    }

    pub fn list<T: Fingerprinted>(&mut self, items: &[T]) -> &mut Self {
        self.usize(items.len());
        for item in items {
            item.write(self);
        }
        self
    }
}

/// Writes a node's definition into a [`Fingerprint`] with a stable layout.
pub trait Fingerprinted {
    fn write(&self, out: &mut Fingerprint);

    fn fingerprint(&self) -> Vec<u8> {
        let mut out = Fingerprint::new();
        self.write(&mut out);
        out.finish()
    }
}

impl Fingerprinted for i64 {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(*self);
    }
}

impl Fingerprinted for i32 {
    fn write(&self, out: &mut Fingerprint) {
        out.i32(*self);
    }
}

impl Fingerprinted for String {
    fn write(&self, out: &mut Fingerprint) {
        out.str(self);
    }
}

impl Fingerprinted for FieldSpec {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(self.path[0]).u8(self.path[1]).u8(self.path[2]);
        out.u8(match self.position {
            crate::event::SpecPosition::Any => 0,
            crate::event::SpecPosition::First => 1,
            crate::event::SpecPosition::Last => 2,
        });
    }
}

impl LogicalOperation {
    fn tag(self) -> u8 {
        match self {
            LogicalOperation::And => 1,
            LogicalOperation::Or => 2,
            LogicalOperation::Not => 3,
            LogicalOperation::Nand => 4,
            LogicalOperation::Nor => 5,
        }
    }
}

impl Fingerprinted for ValueMatcher {
    fn write(&self, out: &mut Fingerprint) {
        match self {
            ValueMatcher::EqBool(v) => {
                out.u8(1).bool(*v);
            }
            ValueMatcher::EqString(v) => {
                out.u8(2).str(v);
            }
            ValueMatcher::EqAnyString(v) => {
                out.u8(3).list(v);
            }
            ValueMatcher::NeqAnyString(v) => {
                out.u8(4).list(v);
            }
            ValueMatcher::EqWildcardString(v) => {
                out.u8(5).str(v);
            }
            ValueMatcher::EqAnyWildcardString(v) => {
                out.u8(6).list(v);
            }
            ValueMatcher::NeqAnyWildcardString(v) => {
                out.u8(7).list(v);
            }
            ValueMatcher::EqInt(v) => {
                out.u8(8).i64(*v);
            }
            ValueMatcher::EqAnyInt(v) => {
                out.u8(9).list(v);
            }
            ValueMatcher::NeqAnyInt(v) => {
                out.u8(10).list(v);
            }
            ValueMatcher::LtInt(v) => {
                out.u8(11).i64(*v);
            }
            ValueMatcher::GtInt(v) => {
                out.u8(12).i64(*v);
            }
            ValueMatcher::LteInt(v) => {
                out.u8(13).i64(*v);
            }
            ValueMatcher::GteInt(v) => {
                out.u8(14).i64(*v);
            }
            ValueMatcher::LtFloat(v) => {
                out.u8(15).f32(*v);
            }
            ValueMatcher::GtFloat(v) => {
                out.u8(16).f32(*v);
            }
            ValueMatcher::MatchesTuple(children) => {
                out.u8(17).list(children);
            }
        }
    }
}

impl Fingerprinted for FieldValueMatcher {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(self.field);
        out.u8(match self.position {
            None => 0,
            Some(Position::First) => 1,
            Some(Position::Last) => 2,
            Some(Position::Any) => 3,
            Some(Position::All) => 4,
        });
        self.value.write(out);
    }
}

impl Fingerprinted for AtomMatcher {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.id);
        match &self.kind {
            MatcherKind::Simple(simple) => {
                out.u8(1).i32(simple.atom).list(&simple.field_matchers);
            }
            MatcherKind::Combination(combo) => {
                out.u8(2).u8(combo.operation.tag()).list(&combo.children);
            }
        }
    }
}

impl Fingerprinted for Predicate {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.id);
        match &self.kind {
            PredicateKind::Simple(simple) => {
                out.u8(1)
                    .i64(simple.start)
                    .opt_i64(simple.stop)
                    .opt_i64(simple.stop_all)
                    .bool(simple.count_nesting)
                    .list(&simple.dimensions)
                    .u8(match simple.initial_value {
                        InitialConditionValue::Unknown => 0,
                        InitialConditionValue::False => 1,
                    });
            }
            PredicateKind::Combination(combo) => {
                out.u8(2).u8(combo.operation.tag()).list(&combo.children);
            }
        }
    }
}

impl Fingerprinted for StateDef {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.id)
            .i32(self.atom)
            .u8(self.exclusive_state_field)
            .bool(self.nested)
            .list(&self.primary_fields);
        match &self.state_map {
            None => {
                out.bool(false);
            }
            Some(map) => {
                out.bool(true).usize(map.groups.len());
                for group in &map.groups {
                    out.i32(group.group_id).list(&group.values);
                }
            }
        }
    }
}

impl Fingerprinted for ConditionLink {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.condition)
            .list(&self.fields_in_what)
            .list(&self.fields_in_condition);
    }
}

impl Fingerprinted for StateLink {
    fn write(&self, out: &mut Fingerprint) {
        out.i32(self.state_atom)
            .list(&self.fields_in_what)
            .list(&self.fields_in_state);
    }
}

impl Fingerprinted for EventActivation {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.activation_matcher)
            .i64(self.ttl_ns)
            .u8(match self.activation_type {
                ActivationType::ActivateImmediately => 0,
                ActivationType::ActivateOnBoot => 1,
            })
            .opt_i64(self.deactivation_matcher);
    }
}

impl Fingerprinted for MetricActivation {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.metric_id).list(&self.event_activations);
    }
}

impl Fingerprinted for CountMetricDef {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(b'C')
            .i64(self.id)
            .i64(self.what)
            .opt_i64(self.condition)
            .list(&self.condition_links)
            .list(&self.dimensions_in_what)
            .list(&self.slice_by_state)
            .list(&self.state_links)
            .i64(self.bucket_size_ms)
            .opt_i64(self.max_dimensions_per_bucket.map(|v| v as i64));
    }
}

impl Fingerprinted for DurationMetricDef {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(b'D')
            .i64(self.id)
            .i64(self.what)
            .opt_i64(self.condition)
            .list(&self.condition_links)
            .u8(match self.aggregation {
                DurationAggregation::Sum => 0,
                DurationAggregation::MaxSparse => 1,
            })
            .i64(self.bucket_size_ms)
            .opt_i64(self.max_dimensions_per_bucket.map(|v| v as i64));
    }
}

impl Fingerprinted for EventMetricDef {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(b'E')
            .i64(self.id)
            .i64(self.what)
            .opt_i64(self.condition)
            .list(&self.condition_links);
        match self.sampling_fraction {
            None => {
                out.bool(false);
            }
            Some(f) => {
                out.bool(true).f64(f);
            }
        }
    }
}

impl Fingerprinted for GaugeMetricDef {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(b'G')
            .i64(self.id)
            .i64(self.what)
            .u8(match self.trigger {
                GaugeTrigger::RandomOneSample => 0,
                GaugeTrigger::AllConditionChanges => 1,
                GaugeTrigger::ConditionChangeToTrue => 2,
                GaugeTrigger::FirstNSamples => 3,
            })
            .list(&self.gauge_fields)
            .opt_i64(self.condition)
            .list(&self.condition_links)
            .list(&self.dimensions_in_what)
            .list(&self.slice_by_state)
            .list(&self.state_links)
            .i64(self.bucket_size_ms)
            .usize(self.max_num_gauge_atoms_per_bucket)
            .opt_i64(self.pull_atom.map(i64::from))
            .opt_i64(self.max_dimensions_per_bucket.map(|v| v as i64));
    }
}

impl Fingerprinted for ValueMetricDef {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(b'V').i64(self.id).i64(self.what);
        self.value_field.write(out);
        out.u8(match self.aggregation {
            ValueAggregation::Sum => 0,
            ValueAggregation::Min => 1,
            ValueAggregation::Max => 2,
            ValueAggregation::Avg => 3,
        })
        .bool(self.use_diff)
        .bool(self.skip_zero_diff_output)
        .opt_i64(self.condition)
        .list(&self.condition_links)
        .list(&self.dimensions_in_what)
        .list(&self.slice_by_state)
        .list(&self.state_links)
        .i64(self.bucket_size_ms)
        .opt_i64(self.pull_atom.map(i64::from))
        .opt_i64(self.max_dimensions_per_bucket.map(|v| v as i64));
    }
}

impl Fingerprinted for KllMetricDef {
    fn write(&self, out: &mut Fingerprint) {
        out.u8(b'K').i64(self.id).i64(self.what);
        self.value_field.write(out);
        out.opt_i64(self.condition)
            .list(&self.condition_links)
            .list(&self.dimensions_in_what)
            .list(&self.slice_by_state)
            .list(&self.state_links)
            .i64(self.bucket_size_ms)
            .opt_i64(self.max_dimensions_per_bucket.map(|v| v as i64));
    }
}

impl Fingerprinted for Alert {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.id)
            .i64(self.metric_id)
            .usize(self.num_buckets)
            .i64(self.trigger_if_sum_gt)
            .i64(i64::from(self.refractory_period_s));
    }
}

impl Fingerprinted for Alarm {
    fn write(&self, out: &mut Fingerprint) {
        out.i64(self.id).i64(self.offset_ms).i64(self.period_ms);
    }
}
