//! The metrics engine: serialized ingest over installed configurations,
//! hot config update, report dumps, pull scheduling and alarm firing.
//!
//! Ingest is single-writer: one task drains the event queue and holds the
//! engine lock while mutating graph state. Config installs validate and
//! compile without the lock and take it only to swap; listener and
//! subscription callbacks are always invoked after the lock is released.

pub mod compile;
pub mod graph;
pub mod update;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anomaly::AlertFire;
use crate::condition::{ConditionKind, DimTransition};
use crate::event::LogEvent;
use crate::matcher::MatchingState;
use crate::metrics::{MetricContext, SealedBucketSums};
use crate::report::{ConfigReport, MetricReport, ReportSink};
use crate::schema::MetricsConfig;
use crate::state::StateChange;
use crate::stats::GuardrailStats;
use crate::uidmap::{PackageListener, SnapshotOptions, UidMap};

pub use compile::InvalidConfigReason;
pub use graph::EvaluationGraph;
pub use update::{diff_graphs, update_graph, DiffOutcome, UpdateStatus};

/// Identifies one installed configuration: the requesting uid plus the
/// config's own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    uid: i32,
    id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.id)
    }
}

/// Materializes snapshot atoms on demand. Implementations may block on
/// I/O; the engine always calls them with no lock held.
pub trait Puller: Send + Sync {
    fn pull(&self, atom: i32) -> anyhow::Result<Vec<LogEvent>>;
}

/// A pull requested by a producer during ingest, executed after the lock
/// is released.
#[derive(Debug, Clone, Copy)]
struct PullRequest {
    key: ConfigKey,
    metric_id: i64,
    atom: i32,
}

type AlertCallback = Arc<dyn Fn(&AlertFire) + Send + Sync>;
type AlarmCallback = Arc<dyn Fn(i64, i64) + Send + Sync>;

#[derive(Default)]
struct EngineInner {
    graphs: HashMap<ConfigKey, EvaluationGraph>,
    /// Reports sealed by config updates, prepended to the next dump.
    pending_reports: HashMap<ConfigKey, Vec<MetricReport>>,
}

pub struct MetricsEngine {
    inner: Mutex<EngineInner>,
    /// Serializes installs; `inner` is only held for the swap step.
    install_lock: Mutex<()>,
    uid_map: Arc<UidMap>,
    stats: Arc<GuardrailStats>,
    pullers: Mutex<HashMap<i32, Arc<dyn Puller>>>,
    pull_timeout: Duration,
    alert_subscribers: Mutex<HashMap<(ConfigKey, i64), Vec<AlertCallback>>>,
    alarm_subscribers: Mutex<HashMap<(ConfigKey, i64), Vec<AlarmCallback>>>,
}

impl MetricsEngine {
    pub fn new(uid_map: Arc<UidMap>, stats: Arc<GuardrailStats>) -> Self {
        Self {
            inner: Mutex::new(EngineInner::default()),
            install_lock: Mutex::new(()),
            uid_map,
            stats,
            pullers: Mutex::new(HashMap::new()),
            pull_timeout: Duration::from_secs(10),
            alert_subscribers: Mutex::new(HashMap::new()),
            alarm_subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    pub fn stats(&self) -> &Arc<GuardrailStats> {
        &self.stats
    }

    pub fn register_puller(&self, atom: i32, puller: Arc<dyn Puller>) {
        self.pullers.lock().insert(atom, puller);
    }

    pub fn subscribe_alert(&self, key: ConfigKey, alert_id: i64, callback: AlertCallback) {
        self.alert_subscribers
            .lock()
            .entry((key, alert_id))
            .or_default()
            .push(callback);
    }

    pub fn subscribe_alarm(&self, key: ConfigKey, alarm_id: i64, callback: AlarmCallback) {
        self.alarm_subscribers
            .lock()
            .entry((key, alarm_id))
            .or_default()
            .push(callback);
    }

    /// Installs or hot-updates a configuration. Validation and compilation
    /// run without the engine lock; a validation failure leaves the running
    /// graph untouched.
    pub fn install_config(
        &self,
        key: ConfigKey,
        config: MetricsConfig,
        now_elapsed_ns: i64,
        now_wall_ns: i64,
    ) -> Result<(), InvalidConfigReason> {
        let _install_guard = self.install_lock.lock();

        let is_update = self.inner.lock().graphs.contains_key(&key);
        if !is_update {
            let mut graph = compile::compile(&config, now_elapsed_ns, now_wall_ns)?;
            for producer in &mut graph.producers {
                producer.common_mut().advance_to(now_elapsed_ns);
            }
            self.inner.lock().graphs.insert(key, graph);
            info!(config = %key, "config installed");
        } else {
            // Pre-validate outside the lock so a bad config never stalls
            // ingest; the authoritative compile happens in update_graph.
            compile::compile(&config, now_elapsed_ns, now_wall_ns)?;

            let mut inner = self.inner.lock();
            let old = inner.graphs.get_mut(&key).expect("checked above");
            let (new_graph, pre_reports) =
                update_graph(old, &config, now_elapsed_ns, now_wall_ns)?;
            *old = new_graph;
            if !pre_reports.is_empty() {
                inner.pending_reports.entry(key).or_default().extend(pre_reports);
            }
            info!(config = %key, "config updated in place");
        }

        self.uid_map.on_config_updated(key);
        Ok(())
    }

    /// Removes a configuration and its pending data. Callers wanting the
    /// final data must dump before removing.
    pub fn remove_config(&self, key: ConfigKey) {
        let _install_guard = self.install_lock.lock();
        let mut inner = self.inner.lock();
        inner.graphs.remove(&key);
        inner.pending_reports.remove(&key);
        drop(inner);
        self.uid_map.on_config_removed(key);
        self.alert_subscribers.lock().retain(|(k, _), _| *k != key);
        self.alarm_subscribers.lock().retain(|(k, _), _| *k != key);
        info!(config = %key, "config removed");
    }

    /// Decodes and ingests a raw event buffer. Malformed buffers are
    /// dropped with a guardrail bump.
    pub fn process_raw_event(
        &self,
        buf: &[u8],
        elapsed_ns: i64,
        wall_ns: i64,
        origin_uid: i32,
    ) {
        match crate::event::parse::parse_event(buf, elapsed_ns, wall_ns, origin_uid) {
            Ok(event) => self.process_event(&event),
            Err(err) => {
                self.stats.note_event_parse_failure();
                debug!(%err, "dropped malformed event");
            }
        }
    }

    /// Ingests one event through every installed config.
    pub fn process_event(&self, event: &LogEvent) {
        self.process_event_internal(event, true);
    }

    fn process_event_internal(&self, event: &LogEvent, allow_pulls: bool) {
        // Isolated-process uids resolve to their host before matching.
        let host_uid = self.uid_map.host_uid_or_self(event.origin_uid());
        let resolved;
        let event = if host_uid != event.origin_uid() {
            resolved = event.clone().with_origin_uid(host_uid);
            &resolved
        } else {
            event
        };

        let mut fires: Vec<(ConfigKey, AlertFire)> = Vec::new();
        let mut pulls: Vec<PullRequest> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (key, graph) in inner.graphs.iter_mut() {
                process_event_on_graph(
                    *key,
                    graph,
                    event,
                    &self.uid_map,
                    &self.stats,
                    &mut fires,
                    &mut pulls,
                );
            }
        }

        self.dispatch_alert_fires(fires);

        if allow_pulls {
            for request in pulls {
                self.execute_pull(request);
            }
        }
    }

    fn dispatch_alert_fires(&self, fires: Vec<(ConfigKey, AlertFire)>) {
        if fires.is_empty() {
            return;
        }
        let subscribers = self.alert_subscribers.lock();
        for (key, fire) in fires {
            if let Some(callbacks) = subscribers.get(&(key, fire.alert_id)) {
                for callback in callbacks {
                    callback(&fire);
                }
            }
        }
    }

    /// Runs one pull with no engine lock held, feeding the pulled atoms
    /// back through ingest as synthetic events. Nested pulls are not
    /// executed.
    fn execute_pull(&self, request: PullRequest) {
        let puller = self.pullers.lock().get(&request.atom).cloned();
        let Some(puller) = puller else {
            warn!(atom = request.atom, "no puller registered");
            self.note_pull_failure(request);
            return;
        };

        let started = Instant::now();
        match puller.pull(request.atom) {
            Ok(events) if started.elapsed() <= self.pull_timeout => {
                for event in &events {
                    self.process_event_internal(event, false);
                }
            }
            Ok(_) => {
                debug!(atom = request.atom, "pull exceeded timeout; sample dropped");
                self.note_pull_failure(request);
            }
            Err(err) => {
                warn!(atom = request.atom, %err, "pull failed");
                self.note_pull_failure(request);
            }
        }
    }

    fn note_pull_failure(&self, request: PullRequest) {
        self.stats.note_pull_failure();
        let mut inner = self.inner.lock();
        if let Some(graph) = inner.graphs.get_mut(&request.key) {
            if let Some(&index) = graph.producer_map.get(&request.metric_id) {
                graph.producers[index].on_pull_failed(&self.stats);
            }
        }
    }

    /// Dumps one config's report into `sink`. The report is assembled
    /// under the lock; the sink write happens after release.
    pub fn dump_report(
        &self,
        key: ConfigKey,
        now_elapsed_ns: i64,
        include_current_bucket: bool,
        sink: &mut dyn ReportSink,
    ) -> anyhow::Result<()> {
        let (metrics, options) = {
            let mut inner = self.inner.lock();
            let Some(graph) = inner.graphs.get_mut(&key) else {
                anyhow::bail!("no config installed for {key}");
            };
            let options = graph.config.options.clone();
            let no_report = graph.no_report.clone();
            let mut metrics: Vec<MetricReport> = Vec::new();
            for producer in &mut graph.producers {
                let report = producer.dump(include_current_bucket, now_elapsed_ns);
                if !no_report.contains(&report.metric_id) {
                    metrics.push(report);
                }
            }
            let pending = inner.pending_reports.remove(&key).unwrap_or_default();
            (
                {
                    let mut all = pending;
                    all.extend(metrics);
                    all
                },
                options,
            )
        };

        let hash_strings = options.hash_strings_in_metric_report;
        let mut pool = std::collections::BTreeSet::new();
        let snapshot_options = SnapshotOptions {
            include_version_strings: true,
            include_installer: true,
            truncated_certificate_hash_size: options.truncated_certificate_hash_size,
            hash_strings,
        };
        let uid_delta = self.uid_map.append_uid_map(
            now_elapsed_ns,
            key,
            &snapshot_options,
            hash_strings.then_some(&mut pool),
        );

        let report = ConfigReport {
            config_uid: key.uid(),
            config_id: key.id(),
            dump_time_ns: now_elapsed_ns,
            metrics,
            uid_map: uid_delta,
            guardrails: self.stats.snapshot(),
            hashed_strings: pool.into_iter().collect(),
        };
        sink.write_report(report)
    }

    /// Seals a partial bucket in every config that opted into upgrade
    /// splits. Wired to [`UidMap`] upgrade notifications.
    pub fn on_app_upgrade(&self, timestamp_ns: i64) {
        let mut fires: Vec<(ConfigKey, AlertFire)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (key, graph) in inner.graphs.iter_mut() {
                if !graph.config.options.split_bucket_for_app_upgrade {
                    continue;
                }
                let graph::EvaluationGraph {
                    producers,
                    alerts,
                    metric_to_alerts,
                    ..
                } = graph;
                for (index, producer) in producers.iter_mut().enumerate() {
                    for sealed in producer.force_flush(timestamp_ns) {
                        if let Some(alert_indexes) = metric_to_alerts.get(&index) {
                            for &alert_index in alert_indexes {
                                for fire in alerts[alert_index].on_bucket_sealed(&sealed) {
                                    fires.push((*key, fire));
                                }
                            }
                        }
                    }
                }
                debug!(config = %key, timestamp_ns, "split buckets for app upgrade");
            }
        }
        self.dispatch_alert_fires(fires);
    }

    /// Boot signal: arms every ACTIVATE_ON_BOOT activation.
    pub fn on_boot(&self, now_elapsed_ns: i64) {
        let mut inner = self.inner.lock();
        for graph in inner.graphs.values_mut() {
            for producer in &mut graph.producers {
                producer.common_mut().on_boot(now_elapsed_ns);
            }
        }
    }

    /// Fires every due periodic alarm and re-arms. Subscriptions run after
    /// the lock is released. Returns the number of firings.
    pub fn fire_due_alarms(&self, now_wall_ns: i64) -> usize {
        let mut fired: Vec<(ConfigKey, i64, i64)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (key, graph) in inner.graphs.iter_mut() {
                for alarm in &mut graph.alarms {
                    for fire_time in alarm.fire_due(now_wall_ns) {
                        fired.push((*key, alarm.id(), fire_time));
                    }
                }
            }
        }

        let count = fired.len();
        if count > 0 {
            let subscribers = self.alarm_subscribers.lock();
            for (key, alarm_id, fire_time) in fired {
                if let Some(callbacks) = subscribers.get(&(key, alarm_id)) {
                    for callback in callbacks {
                        callback(alarm_id, fire_time);
                    }
                }
            }
        }
        count
    }

    /// Nearest pending alarm across every config, if any.
    pub fn next_alarm_ns(&self) -> Option<i64> {
        let inner = self.inner.lock();
        inner
            .graphs
            .values()
            .flat_map(|g| g.alarms.iter().map(|a| a.next_fire_ns()))
            .min()
    }

    /// Background task polling the nearest pending alarm.
    pub fn spawn_alarm_monitor(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("alarm monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let now = wall_clock_ns();
                        engine.fire_due_alarms(now);
                    }
                }
            }
        });
    }

    /// Installed config keys, for debug surfaces.
    pub fn config_keys(&self) -> Vec<ConfigKey> {
        self.inner.lock().graphs.keys().copied().collect()
    }
}

/// Bridges uid-map package notifications into the engine without a strong
/// reference cycle.
pub struct EngineUpgradeBridge(pub std::sync::Weak<MetricsEngine>);

impl PackageListener for EngineUpgradeBridge {
    fn notify_app_upgrade(&self, timestamp_ns: i64, _package: &str, _uid: i32, _version: i64) {
        if let Some(engine) = self.0.upgrade() {
            engine.on_app_upgrade(timestamp_ns);
        }
    }
}

/// Current wall-clock time as nanoseconds since the epoch.
pub fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Runs one event through one graph: matchers, conditions, states, then
/// the producers subscribed to whatever changed.
fn process_event_on_graph(
    key: ConfigKey,
    graph: &mut EvaluationGraph,
    event: &LogEvent,
    uid_map: &UidMap,
    stats: &GuardrailStats,
    fires: &mut Vec<(ConfigKey, AlertFire)>,
    pulls: &mut Vec<PullRequest>,
) {
    if !graph.handles_atom(event.atom()) {
        return;
    }
    let event_time_ns = event.elapsed_ns();

    let graph::EvaluationGraph {
        matchers,
        matcher_eval_order,
        conditions,
        condition_eval_order,
        condition_cache,
        states,
        state_by_atom,
        producers,
        alerts,
        matcher_to_metrics,
        condition_to_metrics,
        what_to_durations,
        state_to_metrics,
        metric_to_alerts,
        activation_to_metrics,
        deactivation_to_metrics,
        ..
    } = graph;

    // 1. Matchers, children before parents.
    let mut results = vec![MatchingState::Unknown; matchers.len()];
    for &index in matcher_eval_order.iter() {
        matchers[index].evaluate(index, event, uid_map, &mut results);
    }

    // 2. Conditions: a node is visited only when one of its dependencies
    // is in the changed set (its matchers fired, or a child changed).
    let mut condition_changed = vec![false; conditions.len()];
    let mut transitions: Vec<(usize, Vec<DimTransition>)> = Vec::new();
    for &index in condition_eval_order.iter() {
        let visit = match conditions[index].kind() {
            ConditionKind::Simple(_) => conditions[index]
                .matcher_indexes()
                .iter()
                .any(|&m| results[m] == MatchingState::Matched),
            ConditionKind::Combination { .. } => conditions[index]
                .children()
                .iter()
                .any(|&c| condition_changed[c]),
        };
        if !visit {
            continue;
        }
        let (changed, dim_transitions) =
            conditions[index].evaluate(index, event, &results, condition_cache);
        condition_changed[index] = changed;
        if !dim_transitions.is_empty() {
            transitions.push((index, dim_transitions));
        }
    }

    // 3. State trackers for state atoms.
    let mut state_changes: Vec<(usize, Vec<StateChange>)> = Vec::new();
    if let Some(&state_index) = state_by_atom.get(&event.atom()) {
        let changes = states[state_index].on_event(event);
        if !changes.is_empty() {
            state_changes.push((state_index, changes));
        }
    }

    // Mutation of the condition and state layers is complete; producers
    // read them from here on.
    let conditions: &[crate::condition::ConditionTracker] = conditions.as_slice();
    let states: &[crate::state::StateTracker] = states.as_slice();

    let mut route_sealed = |metric_index: usize, sealed: Vec<SealedBucketSums>| {
        for sums in sealed {
            if let Some(alert_indexes) = metric_to_alerts.get(&metric_index) {
                for &alert_index in alert_indexes {
                    for fire in alerts[alert_index].on_bucket_sealed(&sums) {
                        fires.push((key, fire));
                    }
                }
            }
        }
    };

    // 4. Activations ride on matcher fires.
    for (matcher_index, result) in results.iter().enumerate() {
        if *result != MatchingState::Matched {
            continue;
        }
        if let Some(metric_indexes) = activation_to_metrics.get(&matcher_index) {
            for &metric_index in metric_indexes {
                producers[metric_index]
                    .common_mut()
                    .on_activation_matched(matcher_index, event_time_ns);
            }
        }
        if let Some(metric_indexes) = deactivation_to_metrics.get(&matcher_index) {
            for &metric_index in metric_indexes {
                producers[metric_index]
                    .common_mut()
                    .on_deactivation_matched(matcher_index);
            }
        }
    }

    // 5. State transitions fan out through the reverse index.
    for (state_index, changes) in &state_changes {
        if let Some(metric_indexes) = state_to_metrics.get(state_index) {
            for &metric_index in metric_indexes {
                for change in changes {
                    producers[metric_index].on_state_changed(change);
                }
            }
        }
    }

    // 6. Condition changes propagate once, in topological order.
    for (condition_index, changed) in condition_changed.iter().enumerate() {
        if !*changed {
            continue;
        }
        if let Some(metric_indexes) = condition_to_metrics.get(&condition_index) {
            for &metric_index in metric_indexes {
                let sealed = producers[metric_index].flush_if_needed(event_time_ns);
                route_sealed(metric_index, sealed);
                producers[metric_index]
                    .on_condition_changed(condition_cache[condition_index], event_time_ns);
            }
        }
    }

    // 7. Per-dimension predicate transitions drive duration metrics.
    for (condition_index, dim_transitions) in &transitions {
        if let Some(metric_indexes) = what_to_durations.get(condition_index) {
            for &metric_index in metric_indexes {
                let sealed = producers[metric_index].flush_if_needed(event_time_ns);
                route_sealed(metric_index, sealed);
                for transition in dim_transitions {
                    producers[metric_index].on_what_transition(transition, event_time_ns);
                }
            }
        }
    }

    // 8. Matched events reach their metrics last, after conditions and
    // states settled for this timestamp.
    for (matcher_index, result) in results.iter().enumerate() {
        if *result != MatchingState::Matched {
            continue;
        }
        if let Some(metric_indexes) = matcher_to_metrics.get(&matcher_index) {
            for &metric_index in metric_indexes {
                let sealed = producers[metric_index].flush_if_needed(event_time_ns);
                route_sealed(metric_index, sealed);
                let ctx = MetricContext {
                    event,
                    conditions,
                    states,
                    stats,
                };
                producers[metric_index].on_matched_event(&ctx);
            }
        }
    }

    // 9. Collect pull requests for execution outside the lock.
    for producer in producers.iter_mut() {
        if let Some(atom) = producer.take_pending_pull() {
            pulls.push(PullRequest {
                key,
                metric_id: producer.id(),
                atom,
            });
        }
    }
}
