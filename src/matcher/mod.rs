//! Atom matcher trackers.
//!
//! Simple trackers test one event against per-field predicates; combination
//! trackers fold child outcomes with a logical operation. Children are
//! evaluated before parents (the compiler emits a topological evaluation
//! order), so a combination only reads already-computed results.

mod field_match;

pub use field_match::{glob_match, matches_simple};

use crate::event::LogEvent;
use crate::schema::{LogicalOperation, SimpleAtomMatcher};
use crate::uidmap::UidMap;

/// Outcome of one matcher for the event being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingState {
    /// Not evaluated for this event.
    Unknown,
    Matched,
    NotMatched,
}

#[derive(Debug, Clone)]
pub enum TrackerKind {
    Simple { matcher: SimpleAtomMatcher },
    Combination {
        operation: LogicalOperation,
        /// Child indexes into the graph's matcher array.
        children: Vec<usize>,
    },
}

/// One node of the matcher layer, pure and stateless across events.
#[derive(Debug, Clone)]
pub struct AtomMatcherTracker {
    id: i64,
    fingerprint: Vec<u8>,
    kind: TrackerKind,
}

impl AtomMatcherTracker {
    pub fn new_simple(id: i64, fingerprint: Vec<u8>, matcher: SimpleAtomMatcher) -> Self {
        Self {
            id,
            fingerprint,
            kind: TrackerKind::Simple { matcher },
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
            kind: TrackerKind::Combination {
                operation,
                children,
            },
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn kind(&self) -> &TrackerKind {
        &self.kind
    }

    /// The atom a simple tracker filters on.
    pub fn atom(&self) -> Option<i32> {
        match &self.kind {
            TrackerKind::Simple { matcher } => Some(matcher.atom),
            TrackerKind::Combination { .. } => None,
        }
    }

    pub fn children(&self) -> &[usize] {
        match &self.kind {
            TrackerKind::Simple { .. } => &[],
            TrackerKind::Combination { children, .. } => children,
        }
    }

    /// Writes this tracker's outcome into `results[self_index]`. Pure:
    /// two evaluations of the same event yield the same result.
    pub fn evaluate(
        &self,
        self_index: usize,
        event: &LogEvent,
        uid_map: &UidMap,
        results: &mut [MatchingState],
    ) {
        let matched = match &self.kind {
            TrackerKind::Simple { matcher } => matches_simple(uid_map, matcher, event),
            TrackerKind::Combination {
                operation,
                children,
            } => combination_match(children, *operation, results),
        };
        results[self_index] = if matched {
            MatchingState::Matched
        } else {
            MatchingState::NotMatched
        };
    }
}

/// Folds child outcomes. An `Unknown` child is not `NotMatched`: NOT of
/// Unknown is false, so unevaluated children never satisfy negations.
pub fn combination_match(
    children: &[usize],
    operation: LogicalOperation,
    results: &[MatchingState],
) -> bool {
    match operation {
        LogicalOperation::And => children
            .iter()
            .all(|&c| results[c] == MatchingState::Matched),
        LogicalOperation::Or => children
            .iter()
            .any(|&c| results[c] == MatchingState::Matched),
        LogicalOperation::Not => {
            results[children[0]] == MatchingState::NotMatched
        }
        LogicalOperation::Nand => children
            .iter()
            .any(|&c| results[c] != MatchingState::Matched),
        LogicalOperation::Nor => children
            .iter()
            .all(|&c| results[c] != MatchingState::Matched),
    }
}
