// src/core/store.rs - Durable, corruption-resilient config store for Gambit v0.3

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use colored::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reserved entry holding the integrity digest; never exposed through reads
/// and never writable through a transaction.
const CHECKSUM_KEY: &str = "__checksum";

const MAX_CORRUPTION_STRIKES: u32 = 3;
const CORRUPTION_COOLDOWN: Duration = Duration::from_secs(300);

/// Typed configuration value. Closed set, so readers pattern-match instead of
/// casting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrSet(BTreeSet<String>),
}

impl ConfigValue {
    /// Stable byte representation fed into the digest. Floats hash by bit
    /// pattern so the digest never depends on formatting.
    fn canonical(&self) -> String {
        match self {
            ConfigValue::Bool(b) => format!("b:{}", b),
            ConfigValue::Int(i) => format!("i:{}", i),
            ConfigValue::Float(f) => format!("f:{}", f.to_bits()),
            ConfigValue::Str(s) => format!("s:{}", s),
            ConfigValue::StrSet(set) => {
                let joined: Vec<&str> = set.iter().map(|s| s.as_str()).collect();
                format!("ss:{}", joined.join("\u{1f}"))
            }
        }
    }
}

type Entries = BTreeMap<String, ConfigValue>;

fn compute_checksum(entries: &Entries) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        if key == CHECKSUM_KEY {
            continue;
        }
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.canonical().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

struct StoreInner {
    path: PathBuf,
    backup_path: PathBuf,
    /// Live entries, checksum excluded. Write lock doubles as the
    /// single-writer commit gate.
    data: RwLock<Entries>,
    /// In-memory backup, refreshed on load and after every commit. Serves
    /// reads while a corruption episode is open.
    backup_cache: RwLock<Entries>,
    corrupted: AtomicBool,
    corruption_count: AtomicU32,
    last_corruption: Mutex<Option<Instant>>,
    next_txn_id: AtomicU64,
}

fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl StoreInner {
    /// Serializes the entries plus a fresh digest and swaps the file into
    /// place with a temp-file rename, so a crash mid-write never leaves a
    /// half-written store behind.
    fn persist(&self, entries: &Entries, target: &Path) -> Result<()> {
        let mut on_disk = entries.clone();
        on_disk.insert(
            CHECKSUM_KEY.to_string(),
            ConfigValue::Str(compute_checksum(entries)),
        );
        let json = serde_json::to_string_pretty(&on_disk)?;

        let tmp = target.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {:?}", tmp))?;
        fs::rename(&tmp, target).with_context(|| format!("installing {:?}", target))?;
        Ok(())
    }

    /// Reads and digest-checks one file. None means missing, unparsable, or
    /// failing verification.
    fn load_verified(path: &Path) -> Option<Entries> {
        let raw = fs::read_to_string(path).ok()?;
        let mut entries: Entries = serde_json::from_str(&raw).ok()?;
        let stored = match entries.remove(CHECKSUM_KEY) {
            Some(ConfigValue::Str(digest)) => digest,
            _ => return None,
        };
        if stored != compute_checksum(&entries) {
            return None;
        }
        Some(entries)
    }

    /// Opens a corruption episode. The strike counter resets once the
    /// cooldown window has passed since the previous episode.
    fn record_corruption(&self) -> u32 {
        let mut last = self
            .last_corruption
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(at) = *last {
            if at.elapsed() > CORRUPTION_COOLDOWN {
                self.corruption_count.store(0, Ordering::SeqCst);
            }
        }
        *last = Some(Instant::now());
        self.corrupted.store(true, Ordering::SeqCst);
        self.corruption_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Tiered recovery: disk snapshot, then the in-memory backup, then an
    /// empty store. After `MAX_CORRUPTION_STRIKES` episodes inside one
    /// cooldown window the backups are no longer trusted and the store
    /// resets outright. The corruption flag only clears once the replacement
    /// set is persisted and its digest re-verified.
    fn recover(&self) {
        let strikes = self.corruption_count.load(Ordering::SeqCst);
        let candidate = if strikes >= MAX_CORRUPTION_STRIKES {
            eprintln!(
                "{} store corrupted {} times; resetting to empty",
                "🔥".red(),
                strikes
            );
            Entries::new()
        } else if let Some(snapshot) = Self::load_verified(&self.backup_path) {
            println!("{} restoring config from disk snapshot", "♻️".cyan());
            snapshot
        } else {
            println!("{} disk snapshot unusable, restoring from memory", "♻️".cyan());
            read_guard(&self.backup_cache).clone()
        };

        let mut data = write_guard(&self.data);
        match self.persist(&candidate, &self.path) {
            Ok(()) => {
                *data = candidate.clone();
                drop(data);
                *write_guard(&self.backup_cache) = candidate.clone();
                if let Err(e) = self.persist(&candidate, &self.backup_path) {
                    eprintln!("{} backup refresh failed: {}", "⚠️".yellow(), e);
                }
                self.corrupted.store(false, Ordering::SeqCst);
                println!("{} config store recovered ({} entries)", "✅".green(), candidate.len());
            }
            Err(e) => {
                // Flag stays up; reads keep coming from the memory backup.
                eprintln!("{} recovery persist failed: {}", "🔥".red(), e);
            }
        }
    }
}

/// Transactional key/value store backed by a checksummed JSON file plus a
/// point-in-time snapshot. All mutation goes through [`Transaction`]; direct
/// writes do not exist, which is what keeps the digest and backups coherent.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    /// Opens (or creates) the store at `path`. The digest is verified on
    /// every open; a mismatch immediately runs tiered recovery.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating store dir {:?}", parent))?;
        }
        let backup_path = path.with_extension("backup.json");

        let inner = Arc::new(StoreInner {
            path: path.to_path_buf(),
            backup_path,
            data: RwLock::new(Entries::new()),
            backup_cache: RwLock::new(Entries::new()),
            corrupted: AtomicBool::new(false),
            corruption_count: AtomicU32::new(0),
            last_corruption: Mutex::new(None),
            next_txn_id: AtomicU64::new(1),
        });

        if !path.exists() {
            inner.persist(&Entries::new(), &inner.path)?;
            inner.persist(&Entries::new(), &inner.backup_path)?;
            return Ok(Self { inner });
        }

        match StoreInner::load_verified(path) {
            Some(entries) => {
                *write_guard(&inner.data) = entries.clone();
                *write_guard(&inner.backup_cache) = entries.clone();
                if let Err(e) = inner.persist(&entries, &inner.backup_path) {
                    eprintln!("{} backup refresh failed on load: {}", "⚠️".yellow(), e);
                }
            }
            None => {
                let strikes = inner.record_corruption();
                eprintln!(
                    "{} config checksum mismatch on load (strike {})",
                    "🔥".red(),
                    strikes
                );
                inner.recover();
            }
        }

        Ok(Self { inner })
    }

    /// Re-verifies the on-disk file against its digest. Returns true when
    /// healthy; on mismatch a corruption episode opens and recovery runs.
    pub fn verify_integrity(&self) -> bool {
        if StoreInner::load_verified(&self.inner.path).is_some() {
            return true;
        }
        let strikes = self.inner.record_corruption();
        eprintln!(
            "{} config checksum mismatch (strike {})",
            "🔥".red(),
            strikes
        );
        self.inner.recover();
        false
    }

    /// Allocates a transaction with a monotonically increasing id. The handle
    /// is owned by the caller and threaded through its own call chain; there
    /// is no ambient per-thread transaction.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction {
            id: self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst),
            puts: Entries::new(),
            removals: BTreeSet::new(),
            active: true,
            inner: self.inner.clone(),
        }
    }

    fn read_value(&self, key: &str) -> Option<ConfigValue> {
        if self.inner.corrupted.load(Ordering::SeqCst) {
            read_guard(&self.inner.backup_cache).get(key).cloned()
        } else {
            read_guard(&self.inner.data).get(key).cloned()
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.read_value(key) {
            Some(ConfigValue::Str(s)) => s,
            _ => default.to_string(),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.read_value(key) {
            Some(ConfigValue::Int(i)) => i,
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.read_value(key) {
            Some(ConfigValue::Bool(b)) => b,
            _ => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.read_value(key) {
            Some(ConfigValue::Float(f)) => f,
            _ => default,
        }
    }

    pub fn get_str_set(&self, key: &str) -> BTreeSet<String> {
        match self.read_value(key) {
            Some(ConfigValue::StrSet(set)) => set,
            _ => BTreeSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read_value(key).is_some()
    }

    pub fn is_corrupted(&self) -> bool {
        self.inner.corrupted.load(Ordering::SeqCst)
    }

    /// Flushes the snapshot one last time. The store stays usable afterwards;
    /// shutdown only guarantees the backup reflects the final state.
    pub fn shutdown(&self) {
        let entries = read_guard(&self.inner.data).clone();
        if let Err(e) = self.inner.persist(&entries, &self.inner.backup_path) {
            eprintln!("{} final backup flush failed: {}", "⚠️".yellow(), e);
        }
    }
}

/// Buffered multi-key update. Nothing touches the store until `commit`;
/// `rollback` (or drop) discards the buffer.
pub struct Transaction {
    id: u64,
    puts: Entries,
    removals: BTreeSet<String>,
    active: bool,
    inner: Arc<StoreInner>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn put(&mut self, key: &str, value: ConfigValue) {
        if key == CHECKSUM_KEY {
            eprintln!("{} ignoring write to reserved key {}", "⚠️".yellow(), key);
            return;
        }
        self.removals.remove(key);
        self.puts.insert(key.to_string(), value);
    }

    pub fn put_string(&mut self, key: &str, value: &str) {
        self.put(key, ConfigValue::Str(value.to_string()));
    }

    pub fn put_int(&mut self, key: &str, value: i64) {
        self.put(key, ConfigValue::Int(value));
    }

    pub fn put_bool(&mut self, key: &str, value: bool) {
        self.put(key, ConfigValue::Bool(value));
    }

    pub fn put_float(&mut self, key: &str, value: f64) {
        self.put(key, ConfigValue::Float(value));
    }

    pub fn put_str_set(&mut self, key: &str, value: BTreeSet<String>) {
        self.put(key, ConfigValue::StrSet(value));
    }

    /// Buffers a removal. Supersedes any earlier buffered put of the same key.
    pub fn remove(&mut self, key: &str) {
        self.puts.remove(key);
        self.removals.insert(key.to_string());
    }

    /// Applies removals then writes under the store's write lock, persists
    /// with a fresh digest, and refreshes both backups. Refused while a
    /// corruption episode is open; the caller retries after recovery.
    /// Double-commit and commit-after-rollback return false.
    pub fn commit(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;

        if self.inner.corrupted.load(Ordering::SeqCst) {
            eprintln!(
                "{} txn #{} refused: store is in a corruption episode",
                "⚠️".yellow(),
                self.id
            );
            return false;
        }

        let mut data = write_guard(&self.inner.data);
        let mut staged = data.clone();
        for key in &self.removals {
            staged.remove(key);
        }
        for (key, value) in &self.puts {
            staged.insert(key.clone(), value.clone());
        }

        match self.inner.persist(&staged, &self.inner.path) {
            Ok(()) => {
                *data = staged.clone();
                drop(data);
                *write_guard(&self.inner.backup_cache) = staged.clone();
                if let Err(e) = self.inner.persist(&staged, &self.inner.backup_path) {
                    eprintln!("{} backup refresh failed after commit: {}", "⚠️".yellow(), e);
                }
                true
            }
            Err(e) => {
                eprintln!("{} txn #{} persist failed: {}", "🔥".red(), self.id, e);
                false
            }
        }
    }

    /// Discards buffered changes. Safe any time before commit; repeated calls
    /// are no-ops.
    pub fn rollback(&mut self) {
        self.active = false;
        self.puts.clear();
        self.removals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn scratch_store(tag: &str) -> (ConfigStore, PathBuf) {
        let dir = std::env::temp_dir()
            .join("gambit_store_tests")
            .join(format!("{}_{}", tag, uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        (ConfigStore::open(&path).unwrap(), path)
    }

    #[test]
    fn committed_values_are_readable_and_durable() {
        let (store, path) = scratch_store("commit");

        let mut txn = store.begin_transaction();
        txn.put_string("profile", "arena");
        txn.put_int("retries", 4);
        txn.put_bool("learning", true);
        txn.put_float("threshold", 0.75);
        assert!(txn.commit());

        assert_eq!(store.get_string("profile", ""), "arena");
        assert_eq!(store.get_int("retries", 0), 4);
        assert!(store.get_bool("learning", false));
        assert!((store.get_float("threshold", 0.0) - 0.75).abs() < f64::EPSILON);

        // Survives a reopen with a valid digest.
        let reopened = ConfigStore::open(&path).unwrap();
        assert!(!reopened.is_corrupted());
        assert_eq!(reopened.get_string("profile", ""), "arena");
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let (store, _path) = scratch_store("invisible");

        let mut txn = store.begin_transaction();
        txn.put_string("pending", "yes");
        assert!(!store.contains("pending"));
        txn.rollback();
        assert!(!store.contains("pending"));
    }

    #[test]
    fn rollback_is_idempotent_and_blocks_commit() {
        let (store, _path) = scratch_store("rollback");

        let mut seed = store.begin_transaction();
        seed.put_int("kept", 1);
        assert!(seed.commit());

        let mut txn = store.begin_transaction();
        txn.put_int("kept", 99);
        txn.remove("kept");
        txn.rollback();
        txn.rollback();
        assert!(!txn.commit());

        assert_eq!(store.get_int("kept", 0), 1);
    }

    #[test]
    fn remove_supersedes_buffered_put() {
        let (store, _path) = scratch_store("supersede");

        let mut txn = store.begin_transaction();
        txn.put_string("ghost", "here");
        txn.remove("ghost");
        assert!(txn.commit());
        assert!(!store.contains("ghost"));

        // Put after remove reinstates the key.
        let mut txn = store.begin_transaction();
        txn.remove("ghost");
        txn.put_string("ghost", "back");
        assert!(txn.commit());
        assert_eq!(store.get_string("ghost", ""), "back");
    }

    #[test]
    fn transaction_ids_are_monotonic() {
        let (store, _path) = scratch_store("ids");
        let a = store.begin_transaction().id();
        let b = store.begin_transaction().id();
        assert!(b > a);
    }

    #[test]
    fn tampered_checksum_recovers_from_snapshot() {
        let (store, path) = scratch_store("tamper");

        let mut txn = store.begin_transaction();
        txn.put_string("profile", "arena");
        assert!(txn.commit());

        // Flip the persisted digest.
        let raw = fs::read_to_string(&path).unwrap();
        let mut entries: Entries = serde_json::from_str(&raw).unwrap();
        entries.insert(
            CHECKSUM_KEY.to_string(),
            ConfigValue::Str("deadbeef".to_string()),
        );
        fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert!(!reopened.is_corrupted());
        assert_eq!(reopened.get_string("profile", ""), "arena");

        // The recovered file validates again.
        assert!(StoreInner::load_verified(&path).is_some());
    }

    #[test]
    fn recovery_falls_back_to_memory_when_snapshot_is_gone() {
        let (store, path) = scratch_store("memfallback");

        let mut txn = store.begin_transaction();
        txn.put_int("lives", 3);
        assert!(txn.commit());

        fs::write(&path, "{ not json").unwrap();
        fs::remove_file(path.with_extension("backup.json")).unwrap();

        assert!(!store.verify_integrity());
        // Recovery completed from the in-memory backup.
        assert!(!store.is_corrupted());
        assert_eq!(store.get_int("lives", 0), 3);
        assert!(StoreInner::load_verified(&path).is_some());
    }

    #[test]
    fn reads_serve_from_memory_backup_while_corrupted() {
        let (store, _path) = scratch_store("episode");

        let mut txn = store.begin_transaction();
        txn.put_string("mode", "patrol");
        assert!(txn.commit());

        // Force an open episode without running recovery.
        store.inner.corrupted.store(true, Ordering::SeqCst);
        assert_eq!(store.get_string("mode", ""), "patrol");

        let mut txn = store.begin_transaction();
        txn.put_string("mode", "assault");
        assert!(!txn.commit());

        store.inner.corrupted.store(false, Ordering::SeqCst);
        assert_eq!(store.get_string("mode", ""), "patrol");
    }

    #[test]
    fn concurrent_disjoint_commits_both_land() {
        let (store, path) = scratch_store("concurrent");

        let mut handles = Vec::new();
        for i in 0..2i64 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let mut txn = store.begin_transaction();
                txn.put_int(&format!("worker_{}", i), i);
                assert!(txn.commit());
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get_int("worker_0", -1), 0);
        assert_eq!(store.get_int("worker_1", -1), 1);

        let on_disk = StoreInner::load_verified(&path).unwrap();
        assert_eq!(compute_checksum(&on_disk), {
            let live = read_guard(&store.inner.data).clone();
            compute_checksum(&live)
        });
    }

    #[test]
    fn reserved_key_is_not_writable() {
        let (store, _path) = scratch_store("reserved");
        let mut txn = store.begin_transaction();
        txn.put_string(CHECKSUM_KEY, "bogus");
        assert!(txn.commit());
        assert!(!store.contains(CHECKSUM_KEY));
    }
}
