//! Per-atom state trackers.
//!
//! One tracker exists per state atom. Each holds `(state, nested_count)`
//! per primary key and applies either plain overwrite or nested ON/OFF
//! counting. Listeners observe every committed transition; metric
//! producers are fanned out to by the engine through the graph's reverse
//! index, while the weak-handle registry serves out-of-graph observers.

use std::collections::HashMap;
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::debug;

use crate::event::{DimensionKey, FieldSpec, LogEvent, Value, STATE_UNKNOWN};
use crate::schema::StateMap;

/// One committed state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub event_time_ns: i64,
    pub atom: i32,
    pub primary_key: DimensionKey,
    pub old_state: i32,
    pub new_state: i32,
}

/// Observer of state transitions. Registration and unregistration are
/// unordered; dead handles are skipped at notify time.
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, change: &StateChange);
}

#[derive(Debug, Clone, Copy)]
struct StateValueInfo {
    state: i32,
    count: u32,
}

/// Tracks the sliced state machine of one atom.
#[derive(Debug)]
pub struct StateTracker {
    id: i64,
    fingerprint: Vec<u8>,
    atom: i32,
    exclusive_state_field: u8,
    nested_default: bool,
    primary_fields: Vec<FieldSpec>,
    /// raw state value → group id.
    value_groups: HashMap<i32, i32>,
    states: HashMap<DimensionKey, StateValueInfo>,
    listeners: Mutex<Vec<Weak<dyn StateListener>>>,
}

impl StateTracker {
    pub fn new(
        id: i64,
        fingerprint: Vec<u8>,
        atom: i32,
        exclusive_state_field: u8,
        nested_default: bool,
        primary_fields: Vec<FieldSpec>,
        state_map: Option<&StateMap>,
    ) -> Self {
        let mut value_groups = HashMap::new();
        if let Some(map) = state_map {
            for group in &map.groups {
                for value in &group.values {
                    value_groups.insert(*value, group.group_id);
                }
            }
        }
        Self {
            id,
            fingerprint,
            atom,
            exclusive_state_field,
            nested_default,
            primary_fields,
            value_groups,
            states: HashMap::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn atom(&self) -> i32 {
        self.atom
    }

    pub fn register_listener(&self, listener: Weak<dyn StateListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn unregister_listener(&self, listener: &Weak<dyn StateListener>) {
        self.listeners.lock().retain(|l| !l.ptr_eq(listener));
    }

    /// Current state for a primary key; `STATE_UNKNOWN` when absent.
    pub fn state_value(&self, primary_key: &DimensionKey) -> i32 {
        self.states
            .get(primary_key)
            .map(|info| info.state)
            .unwrap_or(STATE_UNKNOWN)
    }

    /// Current state looked up by stripped primary-key values, for state
    /// links whose join fields differ from the tracker's own projection.
    pub fn state_value_by_values(&self, query: &[Value]) -> i32 {
        self.states
            .iter()
            .find(|(k, _)| k.stripped() == query)
            .map(|(_, info)| info.state)
            .unwrap_or(STATE_UNKNOWN)
    }

    /// Applies one event of this tracker's atom, returning every committed
    /// transition. Listeners are notified before returning.
    pub fn on_event(&mut self, event: &LogEvent) -> Vec<StateChange> {
        let event_time_ns = event.elapsed_ns();
        let primary_key = event.project(&self.primary_fields);

        let Some(state_field) = self.extract_state_field(event) else {
            debug!(atom = self.atom, "missing exclusive state field; clearing key");
            let changes = self.clear_for_primary_key(event_time_ns, primary_key);
            self.notify(&changes);
            return changes;
        };

        let Some(raw) = state_field.value.as_i64().and_then(|v| i32::try_from(v).ok()) else {
            debug!(
                atom = self.atom,
                value_type = state_field.value.type_name(),
                "non-integer exclusive state field; clearing key"
            );
            let changes = self.clear_for_primary_key(event_time_ns, primary_key);
            self.notify(&changes);
            return changes;
        };

        if let Some(reset_state) = event.reset_state() {
            let mapped = self.map_value(reset_state);
            let changes = self.handle_reset(event_time_ns, mapped);
            self.notify(&changes);
            return changes;
        }

        let new_state = self.map_value(raw);
        let nested = state_field.annotations.nested || self.nested_default;
        let mut changes = Vec::new();
        self.update_for_primary_key(event_time_ns, primary_key, new_state, nested, &mut changes);
        self.notify(&changes);
        changes
    }

    fn extract_state_field<'e>(&self, event: &'e LogEvent) -> Option<&'e crate::event::FieldValue> {
        if let Some(index) = event.exclusive_state_field_index() {
            return event.values().get(index);
        }
        event
            .values()
            .iter()
            .find(|v| v.path.depth() == 1 && v.path.field_id() == self.exclusive_state_field)
    }

    fn map_value(&self, raw: i32) -> i32 {
        self.value_groups.get(&raw).copied().unwrap_or(raw)
    }

    /// Overwrites every primary key with the reset state, non-nested.
    fn handle_reset(&mut self, event_time_ns: i64, reset_state: i32) -> Vec<StateChange> {
        let keys: Vec<DimensionKey> = self.states.keys().cloned().collect();
        let mut changes = Vec::new();
        for key in keys {
            self.update_for_primary_key(event_time_ns, key, reset_state, false, &mut changes);
        }
        changes
    }

    fn clear_for_primary_key(
        &mut self,
        event_time_ns: i64,
        primary_key: DimensionKey,
    ) -> Vec<StateChange> {
        // Absent entry: the state is already unknown.
        let mut changes = Vec::new();
        if self.states.contains_key(&primary_key) {
            self.update_for_primary_key(
                event_time_ns,
                primary_key,
                STATE_UNKNOWN,
                false,
                &mut changes,
            );
        }
        changes
    }

    fn update_for_primary_key(
        &mut self,
        event_time_ns: i64,
        primary_key: DimensionKey,
        new_state: i32,
        nested: bool,
        changes: &mut Vec<StateChange>,
    ) {
        let atom = self.atom;
        let info = self
            .states
            .entry(primary_key.clone())
            .or_insert(StateValueInfo {
                state: STATE_UNKNOWN,
                count: 0,
            });
        let old_state = info.state;

        let mut push_change = |old: i32, new: i32| {
            changes.push(StateChange {
                event_time_ns,
                atom,
                primary_key: primary_key.clone(),
                old_state: old,
                new_state: new,
            });
        };

        if !nested {
            // Every event overwrites.
            if new_state != old_state {
                info.state = new_state;
                info.count = 1;
                push_change(old_state, new_state);
            }
        } else if new_state == STATE_UNKNOWN {
            if old_state != STATE_UNKNOWN {
                push_change(old_state, new_state);
            }
        } else if old_state == STATE_UNKNOWN {
            info.state = new_state;
            info.count = 1;
            push_change(old_state, new_state);
        } else if old_state == new_state {
            info.count += 1;
        } else {
            // Nested counting is for binary ON/OFF style atoms: the state
            // only flips when as many opposite events arrived as holders.
            info.count -= 1;
            if info.count == 0 {
                info.state = new_state;
                info.count = 1;
                push_change(old_state, new_state);
            }
        }

        if new_state == STATE_UNKNOWN {
            self.states.remove(&primary_key);
        }
    }

    fn notify(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<_> = {
            let mut guard = self.listeners.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for change in changes {
            for listener in &listeners {
                listener.on_state_changed(change);
            }
        }
    }

    /// Moves runtime state from the old instance of a preserved node.
    pub fn adopt_runtime(&mut self, old: &mut StateTracker) {
        self.states = std::mem::take(&mut old.states);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::event::{FieldPath, FieldValue};

    const ATOM: i32 = 50;

    fn tracker(nested: bool) -> StateTracker {
        StateTracker::new(
            1,
            vec![],
            ATOM,
            2,
            nested,
            vec![FieldSpec::top_level(1)],
            None,
        )
    }

    fn state_event(key: i64, state: i32) -> LogEvent {
        LogEvent::new(ATOM, 100)
            .push(FieldValue::new(FieldPath::new(1), Value::Int(key as i32)))
            .push(FieldValue::new(FieldPath::new(2), Value::Int(state)))
            .with_exclusive_state_field(1)
            .finalize()
    }

    fn key(v: i64) -> DimensionKey {
        DimensionKey::new(vec![FieldValue::new(FieldPath::new(1), Value::Int(v as i32))])
    }

    #[test]
    fn test_overwrite_semantics() {
        let mut t = tracker(false);
        let changes = t.on_event(&state_event(1, 2));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_state, STATE_UNKNOWN);
        assert_eq!(changes[0].new_state, 2);

        // Same state again: no notification.
        let changes = t.on_event(&state_event(1, 2));
        assert!(changes.is_empty());

        let changes = t.on_event(&state_event(1, 3));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_state, 2);
    }

    #[test]
    fn test_primary_keys_are_independent() {
        let mut t = tracker(false);
        t.on_event(&state_event(1, 2));
        t.on_event(&state_event(2, 5));

        // The projected key carries its path, so build the query the same way.
        let k1 = state_event(1, 2).project(&[FieldSpec::top_level(1)]);
        let k2 = state_event(2, 5).project(&[FieldSpec::top_level(1)]);
        assert_eq!(t.state_value(&k1), 2);
        assert_eq!(t.state_value(&k2), 5);
        assert_eq!(t.state_value(&key(9)), STATE_UNKNOWN);
    }

    #[test]
    fn test_nested_on_off_counting() {
        let mut t = tracker(true);
        let on = 1;
        let off = 2;

        // Two ONs, one OFF: still ON.
        assert_eq!(t.on_event(&state_event(1, on)).len(), 1);
        assert!(t.on_event(&state_event(1, on)).is_empty());
        assert!(t.on_event(&state_event(1, off)).is_empty());

        // Balancing OFF flips.
        let changes = t.on_event(&state_event(1, off));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_state, on);
        assert_eq!(changes[0].new_state, off);
    }

    #[test]
    fn test_nested_unknown_removes_entry() {
        let mut t = tracker(true);
        t.on_event(&state_event(1, 3));
        let changes = t.on_event(&state_event(1, STATE_UNKNOWN));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_state, STATE_UNKNOWN);

        let k = state_event(1, 3).project(&[FieldSpec::top_level(1)]);
        assert_eq!(t.state_value(&k), STATE_UNKNOWN);
    }

    #[test]
    fn test_reset_state_overwrites_every_key() {
        let mut t = tracker(true);
        t.on_event(&state_event(1, 2));
        t.on_event(&state_event(2, 3));

        let reset = state_event(9, 7).with_reset_state(5).finalize();
        let changes = t.on_event(&reset);
        // Both existing keys move to 5 (the new key is not created).
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.new_state == 5));
    }

    #[test]
    fn test_missing_state_field_clears_key() {
        let mut t = tracker(false);
        t.on_event(&state_event(1, 2));

        // Same key, no exclusive state field and no field 2.
        let bad = LogEvent::new(ATOM, 200)
            .push(FieldValue::new(FieldPath::new(1), Value::Int(1)))
            .finalize();
        let changes = t.on_event(&bad);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_state, STATE_UNKNOWN);
    }

    #[test]
    fn test_non_integer_state_field_clears_key() {
        let mut t = tracker(false);
        t.on_event(&state_event(1, 2));

        let bad = LogEvent::new(ATOM, 200)
            .push(FieldValue::new(FieldPath::new(1), Value::Int(1)))
            .push(FieldValue::new(
                FieldPath::new(2),
                Value::Str("broken".into()),
            ))
            .with_exclusive_state_field(1)
            .finalize();
        let changes = t.on_event(&bad);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_state, STATE_UNKNOWN);
    }

    #[test]
    fn test_state_map_groups_values() {
        let map = StateMap {
            groups: vec![crate::schema::StateGroup {
                group_id: 100,
                values: vec![2, 3],
            }],
        };
        let mut t = StateTracker::new(
            1,
            vec![],
            ATOM,
            2,
            false,
            vec![FieldSpec::top_level(1)],
            Some(&map),
        );
        t.on_event(&state_event(1, 2));
        let k = state_event(1, 2).project(&[FieldSpec::top_level(1)]);
        assert_eq!(t.state_value(&k), 100);

        // 3 maps into the same group: no transition.
        let changes = t.on_event(&state_event(1, 3));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_listener_notification_and_weak_cleanup() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(AtomicUsize);
        impl StateListener for Counter {
            fn on_state_changed(&self, _: &StateChange) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut t = tracker(false);
        let listener = Arc::new(Counter(AtomicUsize::new(0)));
        t.register_listener(Arc::downgrade(&listener) as Weak<dyn StateListener>);

        t.on_event(&state_event(1, 2));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        // Dropped listener is skipped without error.
        drop(listener);
        t.on_event(&state_event(1, 3));
    }

    #[test]
    fn test_state_value_by_values() {
        let mut t = tracker(false);
        t.on_event(&state_event(1, 2));
        assert_eq!(t.state_value_by_values(&[Value::Int(1)]), 2);
        assert_eq!(t.state_value_by_values(&[Value::Int(9)]), STATE_UNKNOWN);
    }
}
