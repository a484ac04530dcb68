//! Condition trackers: stateful predicates over event history.
//!
//! A simple condition consumes the outcomes of its start/stop/stop-all
//! matchers and keeps per-dimension state when sliced. Combinations fold
//! children with three-valued (Kleene) logic. The engine evaluates
//! conditions in topological order, visiting a node only when one of its
//! dependencies changed for the current event.

use std::collections::HashMap;

use crate::event::{DimensionKey, FieldSpec, LogEvent, Value};
use crate::matcher::MatchingState;
use crate::schema::{InitialConditionValue, LogicalOperation};

/// Three-valued condition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    Unknown,
    False,
    True,
}

impl ConditionState {
    /// Kleene AND: False dominates, Unknown absorbs the rest.
    pub fn and(self, other: ConditionState) -> ConditionState {
        use ConditionState::*;
        match (self, other) {
            (False, _) | (_, False) => False,
            (True, True) => True,
            _ => Unknown,
        }
    }

    /// Kleene OR: True dominates, Unknown absorbs the rest.
    pub fn or(self, other: ConditionState) -> ConditionState {
        use ConditionState::*;
        match (self, other) {
            (True, _) | (_, True) => True,
            (False, False) => False,
            _ => Unknown,
        }
    }

    pub fn not(self) -> ConditionState {
        match self {
            ConditionState::Unknown => ConditionState::Unknown,
            ConditionState::False => ConditionState::True,
            ConditionState::True => ConditionState::False,
        }
    }

    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }
}

impl From<InitialConditionValue> for ConditionState {
    fn from(v: InitialConditionValue) -> Self {
        match v {
            InitialConditionValue::Unknown => ConditionState::Unknown,
            InitialConditionValue::False => ConditionState::False,
        }
    }
}

/// A per-dimension transition reported to duration metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct DimTransition {
    pub key: DimensionKey,
    pub started: bool,
}

#[derive(Debug, Clone)]
pub struct SimpleConditionState {
    pub start_index: usize,
    pub stop_index: Option<usize>,
    pub stop_all_index: Option<usize>,
    pub count_nesting: bool,
    pub dimensions: Vec<FieldSpec>,
    initial: ConditionState,
    /// Start depth per dimension key; presence implies depth > 0.
    depths: HashMap<DimensionKey, u32>,
    /// Aggregate: True if any dimension is True.
    aggregate: ConditionState,
}

#[derive(Debug, Clone)]
pub enum ConditionKind {
    Simple(SimpleConditionState),
    Combination {
        operation: LogicalOperation,
        /// Child indexes into the graph's condition array.
        children: Vec<usize>,
    },
}

/// One node of the condition layer.
#[derive(Debug, Clone)]
pub struct ConditionTracker {
    id: i64,
    fingerprint: Vec<u8>,
    kind: ConditionKind,
    /// Last computed output (the aggregate for sliced simples).
    current: ConditionState,
}

impl ConditionTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new_simple(
        id: i64,
        fingerprint: Vec<u8>,
        start_index: usize,
        stop_index: Option<usize>,
        stop_all_index: Option<usize>,
        count_nesting: bool,
        dimensions: Vec<FieldSpec>,
        initial: InitialConditionValue,
    ) -> Self {
        let initial: ConditionState = initial.into();
        Self {
            id,
            fingerprint,
            kind: ConditionKind::Simple(SimpleConditionState {
                start_index,
                stop_index,
                stop_all_index,
                count_nesting,
                dimensions,
                initial,
                depths: HashMap::new(),
                aggregate: initial,
            }),
            current: initial,
        }
    }

    pub fn new_combination(
        id: i64,
        fingerprint: Vec<u8>,
        operation: LogicalOperation,
        children: Vec<usize>,
    ) -> Self {
        Self {
            id,
            fingerprint,
            kind: ConditionKind::Combination {
                operation,
                children,
            },
            current: ConditionState::Unknown,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn kind(&self) -> &ConditionKind {
        &self.kind
    }

    /// Matcher indexes this simple condition listens to.
    pub fn matcher_indexes(&self) -> Vec<usize> {
        match &self.kind {
            ConditionKind::Simple(s) => {
                let mut out = vec![s.start_index];
                out.extend(s.stop_index);
                out.extend(s.stop_all_index);
                out
            }
            ConditionKind::Combination { .. } => Vec::new(),
        }
    }

    pub fn children(&self) -> &[usize] {
        match &self.kind {
            ConditionKind::Simple(_) => &[],
            ConditionKind::Combination { children, .. } => children,
        }
    }

    /// Whether this condition shards its state by dimension key.
    pub fn is_sliced(&self) -> bool {
        match &self.kind {
            ConditionKind::Simple(s) => !s.dimensions.is_empty(),
            ConditionKind::Combination { .. } => false,
        }
    }

    /// Current (aggregate) output.
    pub fn state(&self) -> ConditionState {
        self.current
    }

    /// Sliced lookup by stripped dimension values; scalar conditions ignore
    /// the key. Combinations join their children per key.
    pub fn sliced_state(&self, query: &[Value], all: &[ConditionTracker]) -> ConditionState {
        match &self.kind {
            ConditionKind::Simple(s) => {
                if s.dimensions.is_empty() {
                    return self.current;
                }
                let any_true = s.depths.keys().any(|k| k.stripped() == query);
                if any_true {
                    ConditionState::True
                } else if self.current == ConditionState::Unknown {
                    ConditionState::Unknown
                } else {
                    ConditionState::False
                }
            }
            ConditionKind::Combination {
                operation,
                children,
            } => fold_children(*operation, children, |i| {
                all[i].sliced_state(query, all)
            }),
        }
    }

    /// Evaluates this node for one event. Returns whether the output
    /// changed, plus per-dimension transitions (sliced simples only).
    pub fn evaluate(
        &mut self,
        self_index: usize,
        event: &LogEvent,
        matcher_results: &[MatchingState],
        cache: &mut [ConditionState],
    ) -> (bool, Vec<DimTransition>) {
        let (new_state, transitions) = match &mut self.kind {
            ConditionKind::Simple(s) => s.apply(event, matcher_results),
            ConditionKind::Combination {
                operation,
                children,
            } => (
                fold_children(*operation, children, |i| cache[i]),
                Vec::new(),
            ),
        };
        let changed = new_state != self.current || !transitions.is_empty();
        self.current = new_state;
        cache[self_index] = new_state;
        (changed, transitions)
    }

    /// Seeds `cache[self_index]` at install time without consuming events.
    pub fn prime(&mut self, self_index: usize, cache: &mut [ConditionState]) {
        if let ConditionKind::Combination {
            operation,
            children,
        } = &self.kind
        {
            self.current = fold_children(*operation, children, |i| cache[i]);
        }
        cache[self_index] = self.current;
    }

    /// Moves runtime state from the old instance of a preserved node. The
    /// caller guarantees the definitions are identical.
    pub fn adopt_runtime(&mut self, old: &mut ConditionTracker) {
        self.current = old.current;
        if let (ConditionKind::Simple(new_s), ConditionKind::Simple(old_s)) =
            (&mut self.kind, &mut old.kind)
        {
            new_s.depths = std::mem::take(&mut old_s.depths);
            new_s.aggregate = old_s.aggregate;
        }
    }

    /// Dimension keys currently True (sliced simples).
    pub fn active_dimensions(&self) -> Vec<DimensionKey> {
        match &self.kind {
            ConditionKind::Simple(s) => s.depths.keys().cloned().collect(),
            ConditionKind::Combination { .. } => Vec::new(),
        }
    }
}

fn fold_children(
    operation: LogicalOperation,
    children: &[usize],
    state_of: impl Fn(usize) -> ConditionState,
) -> ConditionState {
    let fold_and = |children: &[usize]| {
        children
            .iter()
            .fold(ConditionState::True, |acc, &c| acc.and(state_of(c)))
    };
    let fold_or = |children: &[usize]| {
        children
            .iter()
            .fold(ConditionState::False, |acc, &c| acc.or(state_of(c)))
    };
    match operation {
        LogicalOperation::And => fold_and(children),
        LogicalOperation::Or => fold_or(children),
        LogicalOperation::Not => state_of(children[0]).not(),
        LogicalOperation::Nand => fold_and(children).not(),
        LogicalOperation::Nor => fold_or(children).not(),
    }
}

impl SimpleConditionState {
    /// Applies the transition table for one event.
    fn apply(
        &mut self,
        event: &LogEvent,
        matcher_results: &[MatchingState],
    ) -> (ConditionState, Vec<DimTransition>) {
        let matched =
            |index: Option<usize>| index.is_some_and(|i| matcher_results[i] == MatchingState::Matched);

        let start_matched = matcher_results[self.start_index] == MatchingState::Matched;
        let stop_matched = matched(self.stop_index);
        let stop_all_matched = matched(self.stop_all_index);

        if !start_matched && !stop_matched && !stop_all_matched {
            return (self.aggregate, Vec::new());
        }

        let mut transitions = Vec::new();

        if stop_all_matched {
            for key in self.depths.keys() {
                transitions.push(DimTransition {
                    key: key.clone(),
                    started: false,
                });
            }
            self.depths.clear();
            self.aggregate = ConditionState::False;
            return (self.aggregate, transitions);
        }

        let key = if self.dimensions.is_empty() {
            DimensionKey::default()
        } else {
            event.project(&self.dimensions)
        };

        // A single event may match both stop and start; stop applies first
        // so the interval is closed before a new one opens.
        if stop_matched {
            match self.depths.get_mut(&key) {
                Some(depth) => {
                    if self.count_nesting && *depth > 1 {
                        *depth -= 1;
                    } else {
                        self.depths.remove(&key);
                        transitions.push(DimTransition {
                            key: key.clone(),
                            started: false,
                        });
                    }
                }
                // Stop from an unknown or already-false dimension pins it
                // to False without a transition.
                None => {}
            }
        }

        if start_matched {
            match self.depths.get_mut(&key) {
                Some(depth) => {
                    if self.count_nesting {
                        *depth += 1;
                    }
                }
                None => {
                    self.depths.insert(key.clone(), 1);
                    transitions.push(DimTransition { key, started: true });
                }
            }
        }

        self.aggregate = if self.depths.is_empty() {
            ConditionState::False
        } else {
            ConditionState::True
        };
        (self.aggregate, transitions)
    }

    /// Current nesting depth for a key; 0 when absent.
    pub fn depth(&self, key: &DimensionKey) -> u32 {
        self.depths.get(key).copied().unwrap_or(0)
    }
}
