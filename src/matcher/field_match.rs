//! The simple-matcher field matching algorithm.
//!
//! Event values are DFS-sorted, so all values for one field id form a
//! contiguous range; matching narrows `[start, end)` per field, applies the
//! position qualifier, then tests leaf value matchers or recurses into
//! tuples. Tuples under `Position::Any` must match entirely within a single
//! repeated subtree.

use crate::event::{FieldValue, LogEvent, Value};
use crate::schema::{FieldValueMatcher, Position, SimpleAtomMatcher, ValueMatcher};
use crate::uidmap::{aid_name_for_uid, aid_uid, UidMap};

/// Evaluates a simple matcher against one event.
pub fn matches_simple(uid_map: &UidMap, matcher: &SimpleAtomMatcher, event: &LogEvent) -> bool {
    if event.atom() != matcher.atom {
        return false;
    }
    matcher
        .field_matchers
        .iter()
        .all(|m| matches_field(uid_map, m, event.values(), 0, event.values().len(), 0))
}

/// Narrows `[start, end)` to the values whose position at `depth` equals
/// `target`. Sorted order lets the scan stop early.
fn narrow_by_field(
    target: u8,
    start: usize,
    end: usize,
    depth: usize,
    values: &[FieldValue],
) -> Option<(usize, usize)> {
    let mut new_start = None;
    let mut new_end = end;
    for (i, value) in values.iter().enumerate().take(end).skip(start) {
        let pos = value.path.pos_at_depth(depth);
        if pos == target {
            if new_start.is_none() {
                new_start = Some(i);
            }
            new_end = i + 1;
        } else if pos > target {
            break;
        }
    }
    new_start.map(|s| (s, new_end))
}

/// Returns the index ranges participating in the match, applying the
/// position qualifier. With `Position::Any` over a tuple matcher, one range
/// per repeated subtree is returned; otherwise exactly one range.
/// `depth` is advanced when a position qualifier consumes a path level.
fn compute_ranges(
    matcher: &FieldValueMatcher,
    values: &[FieldValue],
    start: usize,
    end: usize,
    depth: &mut usize,
) -> Vec<(usize, usize)> {
    let Some((mut start, mut end)) = narrow_by_field(matcher.field, start, end, *depth, values)
    else {
        return Vec::new();
    };

    let mut ranges = Vec::new();
    match matcher.position {
        Some(position) => {
            // The repeated-field index is stored as its own path level.
            *depth += 1;
            if *depth > 2 {
                return ranges;
            }
            match position {
                Position::First => {
                    for i in start..end {
                        if values[i].path.pos_at_depth(*depth) != 1 {
                            end = i;
                            break;
                        }
                    }
                    ranges.push((start, end));
                }
                Position::Last => {
                    for i in start..end {
                        if values[i].path.is_last_at(*depth) {
                            start = i;
                            break;
                        }
                    }
                    ranges.push((start, end));
                }
                Position::Any => {
                    if matches!(matcher.value, ValueMatcher::MatchesTuple(_)) {
                        // One range per repeated subtree; the tuple must
                        // match inside a single one.
                        let mut current_pos = values[start].path.pos_at_depth(*depth);
                        for i in start..end {
                            let pos = values[i].path.pos_at_depth(*depth);
                            if pos != current_pos {
                                ranges.push((start, i));
                                start = i;
                                current_pos = pos;
                            }
                        }
                    }
                    ranges.push((start, end));
                }
                // Rejected at validation; yields no ranges if it ever
                // reaches evaluation.
                Position::All => {}
            }
        }
        None => ranges.push((start, end)),
    }

    ranges
}

/// Core recursion. Returns whether `matcher` is satisfied over
/// `values[start..end]` at `depth`.
fn matches_field(
    uid_map: &UidMap,
    matcher: &FieldValueMatcher,
    values: &[FieldValue],
    start: usize,
    end: usize,
    mut depth: usize,
) -> bool {
    if depth > 2 || start >= end {
        return false;
    }

    let ranges = compute_ranges(matcher, values, start, end, &mut depth);
    let Some(&(start, end)) = ranges.first() else {
        return false;
    };

    match &matcher.value {
        ValueMatcher::MatchesTuple(children) => {
            let depth = depth + 1;
            ranges.iter().any(|&(range_start, range_end)| {
                children.iter().all(|child| {
                    matches_field(uid_map, child, values, range_start, range_end, depth)
                })
            })
        }
        // Leaf matchers: with a trailing ANY the range can exceed one value,
        // and any single matching value suffices.
        ValueMatcher::EqBool(expected) => values[start..end].iter().any(|v| match &v.value {
            Value::Bool(b) => b == expected,
            Value::Int(i) => (*i != 0) == *expected,
            Value::Long(l) => (*l != 0) == *expected,
            _ => false,
        }),
        ValueMatcher::EqString(target) => values[start..end]
            .iter()
            .any(|v| try_match_string(uid_map, v, target)),
        ValueMatcher::EqAnyString(targets) => values[start..end]
            .iter()
            .any(|v| targets.iter().any(|t| try_match_string(uid_map, v, t))),
        ValueMatcher::NeqAnyString(targets) => values[start..end]
            .iter()
            .any(|v| targets.iter().all(|t| !try_match_string(uid_map, v, t))),
        ValueMatcher::EqWildcardString(pattern) => values[start..end]
            .iter()
            .any(|v| try_match_wildcard(uid_map, v, pattern)),
        ValueMatcher::EqAnyWildcardString(patterns) => values[start..end]
            .iter()
            .any(|v| patterns.iter().any(|p| try_match_wildcard(uid_map, v, p))),
        ValueMatcher::NeqAnyWildcardString(patterns) => values[start..end]
            .iter()
            .any(|v| patterns.iter().all(|p| !try_match_wildcard(uid_map, v, p))),
        ValueMatcher::EqInt(target) => int_match(&values[start..end], |v| v == *target),
        ValueMatcher::EqAnyInt(targets) => {
            int_match(&values[start..end], |v| targets.contains(&v))
        }
        ValueMatcher::NeqAnyInt(targets) => {
            int_match(&values[start..end], |v| !targets.contains(&v))
        }
        ValueMatcher::LtInt(target) => int_match(&values[start..end], |v| v < *target),
        ValueMatcher::GtInt(target) => int_match(&values[start..end], |v| v > *target),
        ValueMatcher::LteInt(target) => int_match(&values[start..end], |v| v <= *target),
        ValueMatcher::GteInt(target) => int_match(&values[start..end], |v| v >= *target),
        ValueMatcher::LtFloat(target) => values[start..end]
            .iter()
            .any(|v| matches!(v.value, Value::Float(f) if f < *target)),
        ValueMatcher::GtFloat(target) => values[start..end]
            .iter()
            .any(|v| matches!(v.value, Value::Float(f) if f > *target)),
    }
}

/// Applies `predicate` to int32/int64 payloads promoted to i64.
fn int_match(values: &[FieldValue], predicate: impl Fn(i64) -> bool) -> bool {
    values.iter().any(|v| match v.value {
        Value::Int(i) => predicate(i64::from(i)),
        Value::Long(l) => predicate(l),
        _ => false,
    })
}

/// String equality; uid fields resolve through the AID table then the live
/// package names for that uid.
fn try_match_string(uid_map: &UidMap, value: &FieldValue, target: &str) -> bool {
    if value.is_uid_field() {
        let Some(uid) = value.value.as_i64() else {
            return false;
        };
        if let Some(aid) = aid_uid(target) {
            return i64::from(aid) == uid;
        }
        let Ok(uid) = i32::try_from(uid) else {
            return false;
        };
        uid_map.app_names_from_uid(uid, true).contains(target)
    } else if let Value::Str(s) = &value.value {
        s == target
    } else {
        false
    }
}

/// Shell-glob match; uid fields glob over the AID name for system uids,
/// else over every live package name at that uid.
fn try_match_wildcard(uid_map: &UidMap, value: &FieldValue, pattern: &str) -> bool {
    if value.is_uid_field() {
        let Some(uid) = value.value.as_i64() else {
            return false;
        };
        if (0..10000).contains(&uid) {
            // At most one AID name per system uid.
            if let Some(name) = aid_name_for_uid(uid as u32) {
                return glob_match(pattern, name);
            }
        }
        let Ok(uid) = i32::try_from(uid) else {
            return false;
        };
        uid_map
            .app_names_from_uid(uid, true)
            .iter()
            .any(|name| glob_match(pattern, name))
    } else if let Value::Str(s) = &value.value {
        glob_match(pattern, s)
    } else {
        false
    }
}

/// Shell-style glob: `*`, `?`, and `[...]` character classes with ranges
/// and `!`/`^` negation. Case-sensitive, byte-oriented.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let mut advanced = false;
        if pi < p.len() {
            match p[pi] {
                b'*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                b'?' => {
                    pi += 1;
                    ti += 1;
                    advanced = true;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            advanced = true;
                        }
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        advanced = true;
                    }
                }
            }
        }
        if advanced {
            continue;
        }
        match star {
            Some((star_pi, star_ti)) => {
                // Let the star swallow one more byte and retry.
                star = Some((star_pi, star_ti + 1));
                pi = star_pi + 1;
                ti = star_ti + 1;
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Matches `c` against the class starting at `p[open]` (which is `[`).
/// Returns (matched, index past the closing bracket), or None if the class
/// is unterminated.
fn match_class(p: &[u8], open: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negate = matches!(p.get(i), Some(b'!') | Some(b'^'));
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == b']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if i + 2 < p.len() && p[i + 1] == b'-' && p[i + 2] != b']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::event::FieldPath;
    use crate::stats::GuardrailStats;

    fn uid_map() -> UidMap {
        UidMap::new(Arc::new(GuardrailStats::new()))
    }

    fn int_event(atom: i32, field: u8, v: i64) -> LogEvent {
        LogEvent::new(atom, 0)
            .push(FieldValue::new(FieldPath::new(field), Value::Int(v as i32)))
            .finalize()
    }

    fn field_eq_int(field: u8, v: i64) -> FieldValueMatcher {
        FieldValueMatcher {
            field,
            position: None,
            value: ValueMatcher::EqInt(v),
        }
    }

    fn simple(atom: i32, fields: Vec<FieldValueMatcher>) -> SimpleAtomMatcher {
        SimpleAtomMatcher {
            atom,
            field_matchers: fields,
        }
    }

    #[test]
    fn test_atom_mismatch_never_matches() {
        let map = uid_map();
        let m = simple(29, vec![]);
        assert!(!matches_simple(&map, &m, &int_event(30, 1, 2)));
    }

    #[test]
    fn test_bare_matcher_matches_on_atom() {
        let map = uid_map();
        let m = simple(29, vec![]);
        assert!(matches_simple(&map, &m, &int_event(29, 1, 2)));
    }

    #[test]
    fn test_eq_int_with_promotion() {
        let map = uid_map();
        let m = simple(29, vec![field_eq_int(1, 2)]);
        assert!(matches_simple(&map, &m, &int_event(29, 1, 2)));
        assert!(!matches_simple(&map, &m, &int_event(29, 1, 3)));

        // Same matcher against an int64 payload.
        let long_event = LogEvent::new(29, 0)
            .push(FieldValue::new(FieldPath::new(1), Value::Long(2)))
            .finalize();
        assert!(matches_simple(&map, &m, &long_event));
    }

    #[test]
    fn test_missing_field_fails() {
        let map = uid_map();
        let m = simple(29, vec![field_eq_int(9, 2)]);
        assert!(!matches_simple(&map, &m, &int_event(29, 1, 2)));
    }

    #[test]
    fn test_int_comparisons() {
        let map = uid_map();
        let event = int_event(29, 1, 5);
        let cases: Vec<(ValueMatcher, bool)> = vec![
            (ValueMatcher::LtInt(6), true),
            (ValueMatcher::LtInt(5), false),
            (ValueMatcher::GtInt(4), true),
            (ValueMatcher::GtInt(5), false),
            (ValueMatcher::LteInt(5), true),
            (ValueMatcher::GteInt(5), true),
            (ValueMatcher::GteInt(6), false),
            (ValueMatcher::EqAnyInt(vec![3, 5]), true),
            (ValueMatcher::NeqAnyInt(vec![3, 5]), false),
            (ValueMatcher::NeqAnyInt(vec![3, 4]), true),
        ];
        for (vm, expected) in cases {
            let m = simple(
                29,
                vec![FieldValueMatcher {
                    field: 1,
                    position: None,
                    value: vm.clone(),
                }],
            );
            assert_eq!(matches_simple(&map, &m, &event), expected, "{vm:?}");
        }
    }

    #[test]
    fn test_eq_bool_accepts_int_payloads() {
        let map = uid_map();
        let m = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqBool(true),
            }],
        );
        assert!(matches_simple(&map, &m, &int_event(29, 1, 1)));
        assert!(!matches_simple(&map, &m, &int_event(29, 1, 0)));
    }

    #[test]
    fn test_string_and_float_matchers() {
        let map = uid_map();
        let event = LogEvent::new(29, 0)
            .push(FieldValue::new(FieldPath::new(1), Value::Str("wifi".into())))
            .push(FieldValue::new(FieldPath::new(2), Value::Float(1.5)))
            .finalize();

        let eq = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqString("wifi".into()),
            }],
        );
        assert!(matches_simple(&map, &eq, &event));

        // Case-sensitive.
        let eq_upper = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqString("WiFi".into()),
            }],
        );
        assert!(!matches_simple(&map, &eq_upper, &event));

        let lt = simple(
            29,
            vec![FieldValueMatcher {
                field: 2,
                position: None,
                value: ValueMatcher::LtFloat(2.0),
            }],
        );
        assert!(matches_simple(&map, &lt, &event));

        let gt = simple(
            29,
            vec![FieldValueMatcher {
                field: 2,
                position: None,
                value: ValueMatcher::GtFloat(2.0),
            }],
        );
        assert!(!matches_simple(&map, &gt, &event));
    }

    #[test]
    fn test_wildcard_string() {
        let map = uid_map();
        let event = LogEvent::new(29, 0)
            .push(FieldValue::new(
                FieldPath::new(1),
                Value::Str("com.example.app".into()),
            ))
            .finalize();
        let m = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqWildcardString("com.example.*".into()),
            }],
        );
        assert!(matches_simple(&map, &m, &event));
    }

    fn attribution_event(nodes: &[(i32, &str)]) -> LogEvent {
        let mut event = LogEvent::new(10, 0);
        for (i, (uid, tag)) in nodes.iter().enumerate() {
            let node = (i + 1) as u8;
            let mut uid_value =
                FieldValue::new(FieldPath::at(1, node, 1), Value::Int(*uid));
            uid_value.annotations.is_uid = true;
            event.push_value(uid_value);
            event.push_value(FieldValue::new(
                FieldPath::at(1, node, 2),
                Value::Str(tag.to_string()),
            ));
        }
        event.finalize()
    }

    fn tuple_matcher(position: Position, uid: i64, tag: &str) -> SimpleAtomMatcher {
        simple(
            10,
            vec![FieldValueMatcher {
                field: 1,
                position: Some(position),
                value: ValueMatcher::MatchesTuple(vec![
                    field_eq_int(1, uid),
                    FieldValueMatcher {
                        field: 2,
                        position: None,
                        value: ValueMatcher::EqString(tag.to_string()),
                    },
                ]),
            }],
        )
    }

    #[test]
    fn test_any_tuple_matches_within_one_subtree() {
        let map = uid_map();
        let event = attribution_event(&[(10, "A"), (11, "B")]);
        assert!(matches_simple(&map, &tuple_matcher(Position::Any, 10, "A"), &event));
        assert!(matches_simple(&map, &tuple_matcher(Position::Any, 11, "B"), &event));
    }

    #[test]
    fn test_any_tuple_rejects_cross_subtree_combination() {
        // uid=10 is in node 1, tag="A" is in node 2: no single subtree has
        // both, so the tuple must not match.
        let map = uid_map();
        let event = attribution_event(&[(10, "B"), (11, "A")]);
        assert!(!matches_simple(&map, &tuple_matcher(Position::Any, 10, "A"), &event));
    }

    #[test]
    fn test_first_and_last_position() {
        let map = uid_map();
        let event = attribution_event(&[(10, "A"), (11, "B")]);
        assert!(matches_simple(&map, &tuple_matcher(Position::First, 10, "A"), &event));
        assert!(!matches_simple(&map, &tuple_matcher(Position::First, 11, "B"), &event));
        assert!(matches_simple(&map, &tuple_matcher(Position::Last, 11, "B"), &event));
        assert!(!matches_simple(&map, &tuple_matcher(Position::Last, 10, "A"), &event));
    }

    #[test]
    fn test_all_position_yields_no_match() {
        let map = uid_map();
        let event = attribution_event(&[(10, "A")]);
        assert!(!matches_simple(&map, &tuple_matcher(Position::All, 10, "A"), &event));
    }

    #[test]
    fn test_uid_field_matches_package_name() {
        let map = uid_map();
        map.update_app(1, "com.example.app", 10001, 1, "1.0", "i", vec![]);

        let mut uid_value = FieldValue::new(FieldPath::new(1), Value::Int(10001));
        uid_value.annotations.is_uid = true;
        let event = LogEvent::new(29, 0).push(uid_value).finalize();

        let m = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqString("com.example.app".into()),
            }],
        );
        assert!(matches_simple(&map, &m, &event));

        let miss = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqString("com.other".into()),
            }],
        );
        assert!(!matches_simple(&map, &miss, &event));
    }

    #[test]
    fn test_uid_field_matches_aid_name() {
        let map = uid_map();
        let mut uid_value = FieldValue::new(FieldPath::new(1), Value::Int(1000));
        uid_value.annotations.is_uid = true;
        let event = LogEvent::new(29, 0).push(uid_value).finalize();

        let m = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqString("AID_SYSTEM".into()),
            }],
        );
        assert!(matches_simple(&map, &m, &event));
    }

    #[test]
    fn test_uid_field_wildcard_over_aid_name() {
        let map = uid_map();
        let mut uid_value = FieldValue::new(FieldPath::new(1), Value::Int(1000));
        uid_value.annotations.is_uid = true;
        let event = LogEvent::new(29, 0).push(uid_value).finalize();

        let m = simple(
            29,
            vec![FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::EqWildcardString("AID_SYS*".into()),
            }],
        );
        assert!(matches_simple(&map, &m, &event));
    }

    #[test]
    fn test_narrowing_equals_full_scan() {
        // Field-path locality: narrowing to the contiguous range gives the
        // same result as testing every value.
        let map = uid_map();
        let event = LogEvent::new(29, 0)
            .push(FieldValue::new(FieldPath::new(1), Value::Int(7)))
            .push(FieldValue::new(FieldPath::new(2), Value::Int(8)))
            .push(FieldValue::new(FieldPath::new(3), Value::Int(9)))
            .finalize();
        for (field, value, expected) in
            [(1u8, 7i64, true), (2, 8, true), (3, 9, true), (2, 9, false)]
        {
            let m = simple(29, vec![field_eq_int(field, value)]);
            let brute = event
                .values()
                .iter()
                .any(|v| v.path.field_id() == field && v.value.as_i64() == Some(value));
            assert_eq!(matches_simple(&map, &m, &event), expected);
            assert_eq!(brute, expected);
        }
    }

    #[test]
    fn test_glob_match_basics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("com.*", "com.example"));
        assert!(!glob_match("com.*", "org.example"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("file[0-9]", "file7"));
        assert!(!glob_match("file[0-9]", "filex"));
        assert!(glob_match("file[!0-9]", "filex"));
        assert!(glob_match("*.so", "libfoo.so"));
        assert!(!glob_match("*.so", "libfoo.so.1"));
        assert!(glob_match("a*b*c", "aXbYc"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

}
