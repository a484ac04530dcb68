//! Periodic wall-clock alarms.
//!
//! An alarm `(offset, period)` fires at epochs `offset + k·period`. Each
//! tracker keeps its next fire time; the engine's monitor task polls the
//! nearest pending alarm and dispatches subscriptions on fire.

use crate::schema::Alarm;

/// Callback invoked per firing, with (alarm id, fire time). Rebuilt from
/// the configuration on every install.
pub type AlarmSubscription = Box<dyn Fn(i64, i64) + Send + Sync>;

pub struct AlarmTracker {
    id: i64,
    fingerprint: Vec<u8>,
    offset_ns: i64,
    period_ns: i64,
    next_fire_ns: i64,
    subscriptions: Vec<AlarmSubscription>,
}

impl std::fmt::Debug for AlarmTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmTracker")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("offset_ns", &self.offset_ns)
            .field("period_ns", &self.period_ns)
            .field("next_fire_ns", &self.next_fire_ns)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// First epoch `offset + k·period` strictly after `now`.
pub fn next_fire_after(now_ns: i64, offset_ns: i64, period_ns: i64) -> i64 {
    let k = (now_ns - offset_ns).div_euclid(period_ns) + 1;
    offset_ns + k * period_ns
}

impl AlarmTracker {
    pub fn new(alarm: &Alarm, fingerprint: Vec<u8>, now_wall_ns: i64) -> Self {
        let offset_ns = alarm.offset_ms * 1_000_000;
        let period_ns = (alarm.period_ms * 1_000_000).max(1);
        Self {
            id: alarm.id,
            fingerprint,
            offset_ns,
            period_ns,
            next_fire_ns: next_fire_after(now_wall_ns, offset_ns, period_ns),
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn next_fire_ns(&self) -> i64 {
        self.next_fire_ns
    }

    pub fn offset_and_period_ns(&self) -> (i64, i64) {
        (self.offset_ns, self.period_ns)
    }

    pub fn add_subscription(&mut self, subscription: AlarmSubscription) {
        self.subscriptions.push(subscription);
    }

    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    /// Fires every epoch at or before `now` and re-arms with the next one.
    /// Returns the epochs fired.
    pub fn fire_due(&mut self, now_wall_ns: i64) -> Vec<i64> {
        let mut fired = Vec::new();
        while self.next_fire_ns <= now_wall_ns {
            fired.push(self.next_fire_ns);
            for subscription in &self.subscriptions {
                subscription(self.id, self.next_fire_ns);
            }
            self.next_fire_ns += self.period_ns;
        }
        fired
    }

    /// Preserved alarms keep their next fire time when offset and period
    /// are unchanged; otherwise the schedule restarts from `now`.
    pub fn adopt_schedule(&mut self, old: &AlarmTracker) {
        if (self.offset_ns, self.period_ns) == old.offset_and_period_ns() {
            self.next_fire_ns = old.next_fire_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    fn alarm(offset_s: i64, period_s: i64) -> Alarm {
        Alarm {
            id: 77,
            offset_ms: offset_s * 1000,
            period_ms: period_s * 1000,
        }
    }

    #[test]
    fn test_next_fire_before_first_epoch() {
        // (offset=10s, period=5000s), now 2s: next fire at 10s.
        let t = AlarmTracker::new(&alarm(10, 5000), vec![], 2 * SEC);
        assert_eq!(t.next_fire_ns(), 10 * SEC);
    }

    #[test]
    fn test_next_fire_after_first_epoch() {
        // Now 60s: next fire at 10s + 5000s.
        let t = AlarmTracker::new(&alarm(10, 5000), vec![], 60 * SEC);
        assert_eq!(t.next_fire_ns(), 5010 * SEC);
    }

    #[test]
    fn test_fire_due_rearms() {
        let mut t = AlarmTracker::new(&alarm(10, 100), vec![], 0);
        let fired = t.fire_due(250 * SEC);
        assert_eq!(fired, vec![10 * SEC, 110 * SEC, 210 * SEC]);
        assert_eq!(t.next_fire_ns(), 310 * SEC);
    }

    #[test]
    fn test_fire_due_nothing_pending() {
        let mut t = AlarmTracker::new(&alarm(10, 100), vec![], 0);
        assert!(t.fire_due(5 * SEC).is_empty());
    }

    #[test]
    fn test_subscription_receives_epoch() {
        use std::sync::atomic::{AtomicI64, Ordering};
        use std::sync::Arc;

        let mut t = AlarmTracker::new(&alarm(10, 100), vec![], 0);
        let seen = Arc::new(AtomicI64::new(0));
        let seen_clone = Arc::clone(&seen);
        t.add_subscription(Box::new(move |_, fire_time| {
            seen_clone.store(fire_time, Ordering::SeqCst);
        }));
        t.fire_due(15 * SEC);
        assert_eq!(seen.load(Ordering::SeqCst), 10 * SEC);
    }

    #[test]
    fn test_adopt_schedule_keeps_next_fire_when_unchanged() {
        let mut old = AlarmTracker::new(&alarm(10, 100), vec![], 0);
        old.fire_due(15 * SEC);
        let old_next = old.next_fire_ns();

        let mut preserved = AlarmTracker::new(&alarm(10, 100), vec![], 50 * SEC);
        preserved.adopt_schedule(&old);
        assert_eq!(preserved.next_fire_ns(), old_next);

        // Changed period: recomputed from install time.
        let mut changed = AlarmTracker::new(&alarm(10, 200), vec![], 50 * SEC);
        changed.adopt_schedule(&old);
        assert_eq!(changed.next_fire_ns(), 210 * SEC);
    }
}
