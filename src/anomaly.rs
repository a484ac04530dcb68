//! Anomaly (alert) trackers.
//!
//! Each alert watches one metric's sealed buckets: a ring of the trailing
//! `num_buckets` per-dimension sums. Crossing the threshold fires the
//! alert's subscriptions unless the dimension is inside its refractory
//! window.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::metrics::{MetricDimensionKey, SealedBucketSums};
use crate::schema::Alert;

/// One alert firing.
#[derive(Debug, Clone)]
pub struct AlertFire {
    pub alert_id: i64,
    pub key: MetricDimensionKey,
    pub fire_time_ns: i64,
}

/// Callback invoked on each firing. Rebuilt from the configuration on
/// every install.
pub type AlertSubscription = Box<dyn Fn(&AlertFire) + Send + Sync>;

pub struct AnomalyTracker {
    id: i64,
    fingerprint: Vec<u8>,
    /// Index of the watched metric in the graph's producer array.
    pub metric_index: usize,
    num_buckets: usize,
    threshold: i64,
    refractory_ns: i64,
    /// Trailing (bucket ordinal, per-dimension sums).
    past: VecDeque<(i64, HashMap<MetricDimensionKey, i64>)>,
    refractory_until: HashMap<MetricDimensionKey, i64>,
    subscriptions: Vec<AlertSubscription>,
}

impl std::fmt::Debug for AnomalyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyTracker")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("metric_index", &self.metric_index)
            .field("num_buckets", &self.num_buckets)
            .field("threshold", &self.threshold)
            .field("refractory_ns", &self.refractory_ns)
            .field("past", &self.past)
            .field("refractory_until", &self.refractory_until)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl AnomalyTracker {
    pub fn new(alert: &Alert, fingerprint: Vec<u8>, metric_index: usize) -> Self {
        Self {
            id: alert.id,
            fingerprint,
            metric_index,
            num_buckets: alert.num_buckets.max(1),
            threshold: alert.trigger_if_sum_gt,
            refractory_ns: i64::from(alert.refractory_period_s) * 1_000_000_000,
            past: VecDeque::new(),
            refractory_until: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn add_subscription(&mut self, subscription: AlertSubscription) {
        self.subscriptions.push(subscription);
    }

    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    /// Consumes one sealed bucket of the watched metric and fires where the
    /// trailing-window sum exceeds the threshold.
    pub fn on_bucket_sealed(&mut self, sealed: &SealedBucketSums) -> Vec<AlertFire> {
        let sums: HashMap<MetricDimensionKey, i64> = sealed.entries.iter().cloned().collect();
        self.past.push_back((sealed.bucket_num, sums));

        // Buckets that left the trailing window, including gaps of empty
        // (skipped) buckets, fall off by ordinal.
        let window_start = sealed.bucket_num - self.num_buckets as i64 + 1;
        while self
            .past
            .front()
            .is_some_and(|(num, _)| *num < window_start)
        {
            self.past.pop_front();
        }

        let mut fires = Vec::new();
        for (key, _) in &sealed.entries {
            let total: i64 = self
                .past
                .iter()
                .filter_map(|(_, sums)| sums.get(key))
                .sum();
            if total <= self.threshold {
                continue;
            }
            let fire_time_ns = sealed.end_ns;
            let blocked = self
                .refractory_until
                .get(key)
                .is_some_and(|until| fire_time_ns < *until);
            if blocked {
                debug!(alert = self.id, "suppressed by refractory window");
                continue;
            }
            self.refractory_until
                .insert(key.clone(), fire_time_ns + self.refractory_ns);
            fires.push(AlertFire {
                alert_id: self.id,
                key: key.clone(),
                fire_time_ns,
            });
        }

        for fire in &fires {
            for subscription in &self.subscriptions {
                subscription(fire);
            }
        }
        fires
    }

    /// Moves window and refractory state from the old instance of a
    /// preserved alert. Subscriptions are rebuilt by the caller.
    pub fn adopt_runtime(&mut self, old: &mut AnomalyTracker) {
        self.past = std::mem::take(&mut old.past);
        self.refractory_until = std::mem::take(&mut old.refractory_until);
    }
}
