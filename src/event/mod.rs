pub mod parse;

use std::hash::{Hash, Hasher};

/// Numeric tag identifying an atom schema.
pub type AtomId = i32;

/// State value reported when a tracker has no entry for a primary key, or
/// when state extraction fails.
pub const STATE_UNKNOWN: i32 = -1;

/// Position of a field inside an atom, up to three levels deep.
///
/// Positions are 1-based; 0 marks an unused depth. Events store their values
/// sorted by path, which yields DFS order: a contiguous range of the sorted
/// value list always describes one subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath {
    pos: [u8; 3],
    last: u8,
}

impl FieldPath {
    /// A top-level field at position `p0`.
    pub fn new(p0: u8) -> Self {
        Self {
            pos: [p0, 0, 0],
            last: 0,
        }
    }

    /// A path from explicit per-depth positions; trailing zeros are unused.
    pub fn at(p0: u8, p1: u8, p2: u8) -> Self {
        Self {
            pos: [p0, p1, p2],
            last: 0,
        }
    }

    /// Number of used depths (1 to 3).
    pub fn depth(&self) -> usize {
        self.pos.iter().take_while(|p| **p != 0).count()
    }

    /// Position at `depth`, or 0 if the path does not reach that depth.
    pub fn pos_at_depth(&self, depth: usize) -> u8 {
        if depth < 3 {
            self.pos[depth]
        } else {
            0
        }
    }

    /// Whether this value is the last sibling at `depth`.
    pub fn is_last_at(&self, depth: usize) -> bool {
        depth < 3 && self.last & (1 << depth) != 0
    }

    /// Marks this value as the last sibling at `depth`.
    pub fn with_last_at(mut self, depth: usize) -> Self {
        if depth < 3 {
            self.last |= 1 << depth;
        }
        self
    }

    /// Top-level field id.
    pub fn field_id(&self) -> u8 {
        self.pos[0]
    }

    /// Whether every depth specified by `spec` (non-zero) matches this path.
    /// Unspecified depths in the spec match any position.
    pub fn matches_spec(&self, spec: &FieldPath) -> bool {
        for d in 0..3 {
            if spec.pos[d] != 0 && self.pos[d] != spec.pos[d] {
                return false;
            }
        }
        true
    }
}

/// A typed primitive carried by a log event field.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    StorageKey(Vec<u8>),
}

impl Value {
    /// Integer payloads promoted to i64; everything else is None.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Numeric payloads widened to f64 for averaging.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int32",
            Value::Long(_) => "int64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Bool(_) => "bool",
            Value::StorageKey(_) => "storage_key",
        }
    }
}

// Values are used as dimension-key components, so equality and hashing must
// be total. Floats compare by bit pattern.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::StorageKey(a), Value::StorageKey(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::Bool(v) => v.hash(state),
            Value::StorageKey(v) => v.hash(state),
        }
    }
}

/// Per-field annotations attached by the event writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Annotations {
    /// Field carries a uid; string matchers resolve it through the uid map.
    pub is_uid: bool,
    /// State changes through this field use nested ON/OFF counting.
    pub nested: bool,
    /// Field participates in the state tracker's primary key.
    pub primary_field: bool,
}

/// One typed value at a field path inside an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldValue {
    pub path: FieldPath,
    pub value: Value,
    pub annotations: Annotations,
}

impl FieldValue {
    pub fn new(path: FieldPath, value: Value) -> Self {
        Self {
            path,
            value,
            annotations: Annotations::default(),
        }
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    /// Whether string matchers should treat this value as a uid.
    pub fn is_uid_field(&self) -> bool {
        self.annotations.is_uid
    }
}

/// A single structured log event.
#[derive(Debug, Clone)]
pub struct LogEvent {
    atom: AtomId,
    elapsed_ns: i64,
    wall_ns: i64,
    origin_uid: i32,
    values: Vec<FieldValue>,
    exclusive_state_field_index: Option<usize>,
    reset_state: Option<i32>,
}

impl LogEvent {
    pub fn new(atom: AtomId, elapsed_ns: i64) -> Self {
        Self {
            atom,
            elapsed_ns,
            wall_ns: elapsed_ns,
            origin_uid: 0,
            values: Vec::new(),
            exclusive_state_field_index: None,
            reset_state: None,
        }
    }

    pub fn with_wall_clock(mut self, wall_ns: i64) -> Self {
        self.wall_ns = wall_ns;
        self
    }

    pub fn with_origin_uid(mut self, uid: i32) -> Self {
        self.origin_uid = uid;
        self
    }

    pub fn with_reset_state(mut self, state: i32) -> Self {
        self.reset_state = Some(state);
        self
    }

    /// Appends a value. Values must be finalized with [`LogEvent::finalize`]
    /// before the event enters the engine.
    pub fn push_value(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    pub fn push(mut self, value: FieldValue) -> Self {
        self.values.push(value);
        self
    }

    /// Marks the value at `index` as the exclusive state field.
    pub fn set_exclusive_state_field(&mut self, index: usize) {
        self.exclusive_state_field_index = Some(index);
    }

    pub fn with_exclusive_state_field(mut self, index: usize) -> Self {
        self.exclusive_state_field_index = Some(index);
        self
    }

    /// Sorts values into DFS order and computes per-depth is-last flags.
    /// Idempotent.
    pub fn finalize(mut self) -> Self {
        // Remember which value was the exclusive state field across the sort.
        let marker = self.exclusive_state_field_index.map(|i| self.values[i].clone());
        self.values.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(marker) = marker {
            self.exclusive_state_field_index =
                self.values.iter().position(|v| *v == marker);
        }

        // A value is "last at depth d" when its position at d is the highest
        // among all values sharing its container prefix (positions above d).
        let n = self.values.len();
        for i in 0..n {
            let path_i = self.values[i].path;
            for d in 0..path_i.depth() {
                let max_pos = self
                    .values
                    .iter()
                    .filter(|v| {
                        (0..d).all(|k| v.path.pos_at_depth(k) == path_i.pos_at_depth(k))
                    })
                    .map(|v| v.path.pos_at_depth(d))
                    .max()
                    .unwrap_or(0);
                if path_i.pos_at_depth(d) == max_pos {
                    self.values[i].path = self.values[i].path.with_last_at(d);
                }
            }
        }
        self
    }

    pub fn atom(&self) -> AtomId {
        self.atom
    }

    pub fn elapsed_ns(&self) -> i64 {
        self.elapsed_ns
    }

    pub fn wall_ns(&self) -> i64 {
        self.wall_ns
    }

    pub fn origin_uid(&self) -> i32 {
        self.origin_uid
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn exclusive_state_field_index(&self) -> Option<usize> {
        self.exclusive_state_field_index
    }

    pub fn reset_state(&self) -> Option<i32> {
        self.reset_state
    }

    /// Projects the values selected by `specs`, in DFS order, into a
    /// dimension key. See [`project_fields`].
    pub fn project(&self, specs: &[FieldSpec]) -> DimensionKey {
        project_fields(&self.values, specs)
    }
}

/// Selects event fields for dimension keys, primary keys and link joins.
///
/// Non-zero positions in `path` must match; zero positions match any sibling
/// index, letting one spec select a field in every repeated subtree.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldSpec {
    pub path: [u8; 3],
    /// For repeated subtrees: which subtree(s) to take.
    #[serde(default)]
    pub position: SpecPosition,
}

/// Subtree selection for a [`FieldSpec`] over repeated fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecPosition {
    /// Every matching value participates.
    #[default]
    Any,
    /// Only values inside the first repeated subtree.
    First,
    /// Only values inside the last repeated subtree.
    Last,
}

impl FieldSpec {
    pub fn top_level(field: u8) -> Self {
        Self {
            path: [field, 0, 0],
            position: SpecPosition::Any,
        }
    }

    pub fn nested(p0: u8, p2: u8, position: SpecPosition) -> Self {
        Self {
            path: [p0, 0, p2],
            position,
        }
    }

    fn spec_path(&self) -> FieldPath {
        FieldPath::at(self.path[0], self.path[1], self.path[2])
    }
}

/// A tuple of projected field values identifying one aggregation shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DimensionKey {
    values: Vec<FieldValue>,
}

impl DimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// The projected values stripped of their paths, for joining keys that
    /// were projected through different field specs.
    pub fn stripped(&self) -> Vec<Value> {
        self.values.iter().map(|v| v.value.clone()).collect()
    }
}

/// Projects `specs` over DFS-sorted `values` into a dimension key.
pub fn project_fields(values: &[FieldValue], specs: &[FieldSpec]) -> DimensionKey {
    let mut out = Vec::new();
    for spec in specs {
        let spec_path = spec.spec_path();
        let matching: Vec<&FieldValue> = values
            .iter()
            .filter(|v| v.path.matches_spec(&spec_path))
            .collect();
        if matching.is_empty() {
            continue;
        }
        match spec.position {
            SpecPosition::Any => out.extend(matching.into_iter().cloned()),
            SpecPosition::First => {
                let first_pos = matching[0].path.pos_at_depth(1);
                out.extend(
                    matching
                        .into_iter()
                        .filter(|v| v.path.pos_at_depth(1) == first_pos)
                        .cloned(),
                );
            }
            SpecPosition::Last => {
                let last_pos = matching[matching.len() - 1].path.pos_at_depth(1);
                out.extend(
                    matching
                        .into_iter()
                        .filter(|v| v.path.pos_at_depth(1) == last_pos)
                        .cloned(),
                );
            }
        }
    }
    DimensionKey::new(out)
}
