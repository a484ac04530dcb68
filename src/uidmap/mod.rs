//! Process-wide uid ↔ package map.
//!
//! All installed configs share one map. Each keeps its own high-water mark
//! into the append-only change log, so every config's report carries exactly
//! the changes since its previous dump plus a full snapshot.
//!
//! Locking: the package map and change log share one mutex; the isolated-uid
//! side map lives in its own lock domain. Listener callbacks always run with
//! no lock held, via weak handles promoted after release.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::ConfigKey;
use crate::report::{
    ChangeReportRecord, PackageSnapshot, StrOrHash, UidMapDelta, UidMapSnapshot,
};
use crate::stats::GuardrailStats;

mod aid;

pub use aid::{aid_name_for_uid, aid_uid};

/// Approximate in-memory cost of one change record.
pub const K_BYTES_CHANGE_RECORD: usize = 128;

/// Maximum tombstoned entries retained before the oldest is fully erased.
pub const K_MAX_DELETED_APPS: usize = 100;

/// Default change-log byte budget.
pub const DEFAULT_BYTES_LIMIT: usize = 100 * 1024;

/// Callbacks observing package lifecycle. Invoked without any uid-map lock
/// held; a listener may drop itself at any time.
pub trait PackageListener: Send + Sync {
    fn on_uid_map_received(&self, _timestamp_ns: i64) {}
    fn notify_app_upgrade(&self, _timestamp_ns: i64, _package: &str, _uid: i32, _version: i64) {}
    fn notify_app_removed(&self, _timestamp_ns: i64, _package: &str, _uid: i32) {}
}

/// Full description of one installed package, as delivered by the platform.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package: String,
    pub uid: i32,
    pub version: i64,
    pub version_string: String,
    pub installer: String,
    pub certificate_hash: Vec<u8>,
}

#[derive(Debug, Clone)]
struct AppData {
    version: i64,
    version_string: String,
    installer: String,
    certificate_hash: Vec<u8>,
    deleted: bool,
}

/// One append-only entry in the change log.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub deletion: bool,
    pub timestamp_ns: i64,
    pub package: String,
    pub uid: i32,
    pub version: i64,
    pub version_string: String,
    pub prev_version: i64,
    pub prev_version_string: String,
}

/// Snapshot emission switches, derived from the owning config's options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    pub include_version_strings: bool,
    pub include_installer: bool,
    /// 0 disables certificate hashes; else the first n bytes are emitted.
    pub truncated_certificate_hash_size: u8,
    pub hash_strings: bool,
}

#[derive(Default)]
struct Inner {
    map: BTreeMap<(i32, String), AppData>,
    changes: VecDeque<ChangeRecord>,
    deleted_apps: VecDeque<(i32, String)>,
    bytes_used: usize,
    last_update_per_config: HashMap<ConfigKey, i64>,
}

/// The process-wide map. Created at engine init, torn down at shutdown.
pub struct UidMap {
    inner: Mutex<Inner>,
    /// isolated uid → host uid, in its own lock domain.
    isolated: DashMap<i32, i32>,
    listeners: Mutex<Vec<Weak<dyn PackageListener>>>,
    max_bytes: usize,
    stats: Arc<GuardrailStats>,
}

impl UidMap {
    pub fn new(stats: Arc<GuardrailStats>) -> Self {
        Self::with_byte_limit(stats, DEFAULT_BYTES_LIMIT)
    }

    pub fn with_byte_limit(stats: Arc<GuardrailStats>, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            isolated: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            max_bytes,
            stats,
        }
    }

    pub fn register_listener(&self, listener: Weak<dyn PackageListener>) {
        self.listeners.lock().push(listener);
    }

    /// Promotes every live listener. Dead handles are pruned as a side
    /// effect. Never called with `inner` held.
    fn live_listeners(&self) -> Vec<Arc<dyn PackageListener>> {
        let mut guard = self.listeners.lock();
        guard.retain(|w| w.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn has_app(&self, uid: i32, package: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .map
            .get(&(uid, package.to_string()))
            .is_some_and(|d| !d.deleted)
    }

    pub fn app_version(&self, uid: i32, package: &str) -> i64 {
        let inner = self.inner.lock();
        match inner.map.get(&(uid, package.to_string())) {
            Some(d) if !d.deleted => d.version,
            _ => 0,
        }
    }

    /// Live uids hosting `package`.
    pub fn app_uids(&self, package: &str) -> BTreeSet<i32> {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .filter(|((_, name), data)| name == package && !data.deleted)
            .map(|((uid, _), _)| *uid)
            .collect()
    }

    /// Live package names installed at `uid`, optionally case-normalized.
    pub fn app_names_from_uid(&self, uid: i32, normalized: bool) -> BTreeSet<String> {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .filter(|((u, _), data)| *u == uid && !data.deleted)
            .map(|((_, name), _)| {
                if normalized {
                    name.to_lowercase()
                } else {
                    name.clone()
                }
            })
            .collect()
    }

    /// Atomic full replacement. Previously-deleted entries that reappear in
    /// the new listing are re-attached with their deleted mark so history
    /// survives. No change records are written; the next dump carries a
    /// fresh snapshot.
    pub fn update_full(&self, timestamp_ns: i64, packages: Vec<PackageInfo>) {
        {
            let mut inner = self.inner.lock();

            let tombstones: Vec<((i32, String), AppData)> = inner
                .map
                .iter()
                .filter(|(_, d)| d.deleted)
                .map(|(k, d)| (k.clone(), d.clone()))
                .collect();

            inner.map.clear();
            for info in packages {
                inner.map.insert(
                    (info.uid, info.package),
                    AppData {
                        version: info.version,
                        version_string: info.version_string,
                        installer: info.installer,
                        certificate_hash: info.certificate_hash,
                        deleted: false,
                    },
                );
            }
            for (key, data) in tombstones {
                if inner.map.contains_key(&key) {
                    inner.map.insert(key, data);
                }
            }

            self.ensure_bytes_below_limit(&mut inner);
            self.publish_stats(&inner);
        }

        for listener in self.live_listeners() {
            listener.on_uid_map_received(timestamp_ns);
        }
        info!(timestamp_ns, "uid map replaced");
    }

    /// Upsert for one package. An upgrade of an existing entry notifies
    /// listeners; a first install does not.
    #[allow(clippy::too_many_arguments)]
    pub fn update_app(
        &self,
        timestamp_ns: i64,
        package: &str,
        uid: i32,
        version: i64,
        version_string: &str,
        installer: &str,
        certificate_hash: Vec<u8>,
    ) {
        let is_upgrade;
        {
            let mut inner = self.inner.lock();
            let key = (uid, package.to_string());
            let mut prev_version = 0;
            let mut prev_version_string = String::new();
            match inner.map.get_mut(&key) {
                Some(data) => {
                    prev_version = data.version;
                    prev_version_string = data.version_string.clone();
                    data.version = version;
                    data.version_string = version_string.to_string();
                    data.installer = installer.to_string();
                    data.certificate_hash = certificate_hash;
                    data.deleted = false;
                    // Re-installing after deletion also counts: splitting a
                    // partial bucket again is harmless.
                    is_upgrade = true;
                }
                None => {
                    inner.map.insert(
                        key,
                        AppData {
                            version,
                            version_string: version_string.to_string(),
                            installer: installer.to_string(),
                            certificate_hash,
                            deleted: false,
                        },
                    );
                    is_upgrade = false;
                }
            }

            inner.changes.push_back(ChangeRecord {
                deletion: false,
                timestamp_ns,
                package: package.to_string(),
                uid,
                version,
                version_string: version_string.to_string(),
                prev_version,
                prev_version_string,
            });
            inner.bytes_used += K_BYTES_CHANGE_RECORD;
            self.ensure_bytes_below_limit(&mut inner);
            self.publish_stats(&inner);
        }

        if is_upgrade {
            for listener in self.live_listeners() {
                listener.notify_app_upgrade(timestamp_ns, package, uid, version);
            }
        }
    }

    /// Tombstones a package. Beyond [`K_MAX_DELETED_APPS`] tombstones the
    /// oldest one is fully erased.
    pub fn remove_app(&self, timestamp_ns: i64, package: &str, uid: i32) {
        {
            let mut inner = self.inner.lock();
            let key = (uid, package.to_string());
            let mut prev_version = 0;
            let mut prev_version_string = String::new();
            if let Some(data) = inner.map.get_mut(&key) {
                if !data.deleted {
                    prev_version = data.version;
                    prev_version_string = data.version_string.clone();
                    data.deleted = true;
                    inner.deleted_apps.push_back(key);
                }
            }
            if inner.deleted_apps.len() > K_MAX_DELETED_APPS {
                if let Some(oldest) = inner.deleted_apps.pop_front() {
                    inner.map.remove(&oldest);
                    self.stats.note_uid_map_tombstone_dropped();
                }
            }

            inner.changes.push_back(ChangeRecord {
                deletion: true,
                timestamp_ns,
                package: package.to_string(),
                uid,
                version: 0,
                version_string: String::new(),
                prev_version,
                prev_version_string,
            });
            inner.bytes_used += K_BYTES_CHANGE_RECORD;
            self.ensure_bytes_below_limit(&mut inner);
            self.publish_stats(&inner);
        }

        for listener in self.live_listeners() {
            listener.notify_app_removed(timestamp_ns, package, uid);
        }
    }

    fn ensure_bytes_below_limit(&self, inner: &mut Inner) {
        while inner.bytes_used > self.max_bytes {
            match inner.changes.pop_front() {
                Some(_) => {
                    inner.bytes_used -= K_BYTES_CHANGE_RECORD;
                    self.stats.note_uid_map_record_dropped(1);
                    debug!(bytes_used = inner.bytes_used, "evicted oldest change record");
                }
                None => break,
            }
        }
    }

    fn publish_stats(&self, inner: &Inner) {
        self.stats.set_uid_map_bytes(inner.bytes_used);
        self.stats.set_uid_map_changes(inner.changes.len());
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    pub fn change_count(&self) -> usize {
        self.inner.lock().changes.len()
    }

    // --- Isolated uids (separate lock domain) ---

    pub fn assign_isolated_uid(&self, isolated_uid: i32, host_uid: i32) {
        self.isolated.insert(isolated_uid, host_uid);
    }

    pub fn remove_isolated_uid(&self, isolated_uid: i32) {
        self.isolated.remove(&isolated_uid);
    }

    /// Resolves an isolated uid to its host, or returns the uid unchanged.
    pub fn host_uid_or_self(&self, uid: i32) -> i32 {
        self.isolated.get(&uid).map(|e| *e.value()).unwrap_or(uid)
    }

    // --- Report emission ---

    /// Emits the change records newer than `key`'s high-water mark plus a
    /// full snapshot, advances the mark, and prunes records every config has
    /// already seen.
    pub fn append_uid_map(
        &self,
        timestamp_ns: i64,
        key: ConfigKey,
        options: &SnapshotOptions,
        mut pool: Option<&mut BTreeSet<String>>,
    ) -> UidMapDelta {
        let mut inner = self.inner.lock();

        let mark = inner.last_update_per_config.get(&key).copied().unwrap_or(0);
        let changes: Vec<ChangeReportRecord> = inner
            .changes
            .iter()
            .filter(|r| r.timestamp_ns > mark)
            .map(|r| ChangeReportRecord {
                deletion: r.deletion,
                timestamp_ns: r.timestamp_ns,
                package: StrOrHash::from_string(
                    &r.package,
                    options.hash_strings,
                    pool.as_deref_mut(),
                ),
                uid: r.uid,
                new_version: r.version,
                prev_version: r.prev_version,
                new_version_string: StrOrHash::from_string(
                    &r.version_string,
                    options.hash_strings,
                    pool.as_deref_mut(),
                ),
                prev_version_string: StrOrHash::from_string(
                    &r.prev_version_string,
                    options.hash_strings,
                    pool.as_deref_mut(),
                ),
            })
            .collect();

        let (snapshot, installers) =
            Self::write_snapshot_locked(&inner, timestamp_ns, &BTreeSet::new(), options, pool);

        let prev_min = Self::minimum_mark(&inner);
        inner.last_update_per_config.insert(key, timestamp_ns);
        let new_min = Self::minimum_mark(&inner);
        if new_min > prev_min {
            let before = inner.changes.len();
            inner.changes.retain(|r| r.timestamp_ns >= new_min);
            let dropped = before - inner.changes.len();
            inner.bytes_used = inner
                .bytes_used
                .saturating_sub(dropped * K_BYTES_CHANGE_RECORD);
            if dropped > 0 {
                debug!(dropped, "pruned change records below high-water mark");
            }
        }
        self.publish_stats(&inner);

        UidMapDelta {
            changes,
            snapshot,
            installers,
        }
    }

    /// Snapshot without touching high-water marks, optionally restricted to
    /// `interesting_uids` (empty means every uid).
    pub fn snapshot(
        &self,
        timestamp_ns: i64,
        interesting_uids: &BTreeSet<i32>,
        options: &SnapshotOptions,
        pool: Option<&mut BTreeSet<String>>,
    ) -> (UidMapSnapshot, Vec<StrOrHash>) {
        let inner = self.inner.lock();
        Self::write_snapshot_locked(&inner, timestamp_ns, interesting_uids, options, pool)
    }

    fn write_snapshot_locked(
        inner: &Inner,
        timestamp_ns: i64,
        interesting_uids: &BTreeSet<i32>,
        options: &SnapshotOptions,
        mut pool: Option<&mut BTreeSet<String>>,
    ) -> (UidMapSnapshot, Vec<StrOrHash>) {
        let mut installer_indices: HashMap<&str, u32> = HashMap::new();
        let mut installer_names: Vec<String> = Vec::new();
        let mut packages = Vec::with_capacity(inner.map.len());

        for ((uid, name), data) in &inner.map {
            if !interesting_uids.is_empty() && !interesting_uids.contains(uid) {
                continue;
            }

            let installer_index = if options.include_installer {
                Some(*installer_indices.entry(&data.installer).or_insert_with(|| {
                    installer_names.push(data.installer.clone());
                    (installer_names.len() - 1) as u32
                }))
            } else {
                None
            };

            let dump_hash_len = usize::from(options.truncated_certificate_hash_size)
                .min(data.certificate_hash.len());
            packages.push(PackageSnapshot {
                name: StrOrHash::from_string(name, options.hash_strings, pool.as_deref_mut()),
                version: data.version,
                version_string: if options.include_version_strings {
                    StrOrHash::from_string(
                        &data.version_string,
                        options.hash_strings,
                        pool.as_deref_mut(),
                    )
                } else {
                    StrOrHash::Str(String::new())
                },
                uid: *uid,
                deleted: data.deleted,
                installer_index,
                truncated_cert_hash: (dump_hash_len > 0)
                    .then(|| data.certificate_hash[..dump_hash_len].to_vec()),
            });
        }

        let installers = installer_names
            .into_iter()
            .map(|name| StrOrHash::from_string(&name, options.hash_strings, pool.as_deref_mut()))
            .collect();

        (
            UidMapSnapshot {
                timestamp_ns,
                packages,
            },
            installers,
        )
    }

    fn minimum_mark(inner: &Inner) -> i64 {
        inner
            .last_update_per_config
            .values()
            .copied()
            .min()
            .unwrap_or(0)
    }

    /// Resets `key`'s high-water mark so its next dump emits every retained
    /// change record.
    pub fn on_config_updated(&self, key: ConfigKey) {
        self.inner.lock().last_update_per_config.insert(key, -1);
    }

    pub fn on_config_removed(&self, key: ConfigKey) {
        self.inner.lock().last_update_per_config.remove(&key);
    }

    /// Dumps live entries as `name, vVersion, versionString, installer
    /// (uid)[, certHex]` lines.
    pub fn print_uid_map(&self, out: &mut dyn Write, include_cert_hash: bool) -> std::io::Result<()> {
        let inner = self.inner.lock();
        for ((uid, name), data) in &inner.map {
            if data.deleted {
                continue;
            }
            if include_cert_hash {
                let hex: String = data
                    .certificate_hash
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect();
                writeln!(
                    out,
                    "{}, v{}, {}, {} ({}), {}",
                    name, data.version, data.version_string, data.installer, uid, hex
                )?;
            } else {
                writeln!(
                    out,
                    "{}, v{}, {}, {} ({})",
                    name, data.version, data.version_string, data.installer, uid
                )?;
            }
        }
        Ok(())
    }
}
