use crate::clock::{Clock, SystemClock};
use crate::config::CacheSettings;
use crate::types::ObjectRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Key under which the full object listing is cached.
pub const ALL_OBJECTS_KEY: &str = "all_objects";
/// Key under which the folder subset of the listing is cached.
pub const ALL_FOLDERS_KEY: &str = "all_folders";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CachedValue {
    Object(ObjectRecord),
    Objects(Vec<ObjectRecord>),
    Flag(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub timestamp: DateTime<Utc>,
}

/// On-disk layout, read side.
#[derive(Deserialize)]
struct CacheFile {
    fingerprint: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    entries: HashMap<String, CacheEntry>,
}

/// On-disk layout, write side (borrows the live map).
#[derive(Serialize)]
struct CacheFileRef<'a> {
    fingerprint: &'a str,
    timestamp: DateTime<Utc>,
    entries: &'a HashMap<String, CacheEntry>,
}

/// Identity of the account/configuration a cache file was built under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Short blake3 digest of the credential file, or "default" when it
    /// cannot be read.
    pub fn from_credentials(path: &Path) -> Self {
        match fs::read(path) {
            Ok(contents) => {
                let hash = blake3::hash(&contents);
                Self(hash.to_hex().as_str()[..16].to_string())
            }
            Err(_) => Self("default".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Persistent key/value metadata cache with TTL expiry and debounced,
/// atomic flushes.
///
/// Load and save failures never reach the caller: the store falls back to
/// an in-memory map and logs the problem. Dropping the store forces a
/// flush of pending changes.
pub struct CacheStore {
    path: PathBuf,
    fingerprint: Fingerprint,
    settings: CacheSettings,
    clock: Box<dyn Clock>,
    entries: HashMap<String, CacheEntry>,
    dirty: bool,
    last_save: Option<DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

impl CacheStore {
    pub fn open(path: PathBuf, fingerprint: Fingerprint, settings: CacheSettings) -> Self {
        Self::open_with_clock(path, fingerprint, settings, Box::new(SystemClock))
    }

    pub fn open_with_clock(
        path: PathBuf,
        fingerprint: Fingerprint,
        settings: CacheSettings,
        clock: Box<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let mut store = Self {
            path,
            fingerprint,
            settings,
            clock,
            entries: HashMap::new(),
            dirty: false,
            last_save: None,
            last_sweep: now,
        };
        store.load();
        store
    }

    fn load(&mut self) {
        let contents = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no cache file, starting empty");
                return;
            }
            Err(e) => {
                error!(path = %self.path.display(), "failed to read cache: {e}");
                return;
            }
        };

        let file: CacheFile = match serde_json::from_slice(&contents) {
            Ok(f) => f,
            Err(e) => {
                error!(path = %self.path.display(), "failed to parse cache, starting empty: {e}");
                return;
            }
        };

        if file.fingerprint != self.fingerprint.as_str() {
            info!(
                stored = %file.fingerprint,
                active = %self.fingerprint.as_str(),
                "cache fingerprint mismatch, starting fresh"
            );
            self.reset_on_disk();
            return;
        }

        let now = self.clock.now();
        if elapsed(file.timestamp, now) > self.settings.ttl {
            info!("cache file older than TTL, starting fresh");
            self.reset_on_disk();
            return;
        }

        self.entries = file.entries;
        self.last_save = Some(file.timestamp);
        self.sweep(now);
        debug!(entries = self.entries.len(), "loaded metadata cache");
    }

    fn reset_on_disk(&mut self) {
        self.entries.clear();
        self.last_save = None;
        self.dirty = true;
        self.save(true);
    }

    /// Returns the value for `key` unless it is missing or older than the TTL.
    pub fn get(&mut self, key: &str) -> Option<&CachedValue> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => elapsed(entry.timestamp, now) > self.settings.ttl,
        };
        if expired {
            self.entries.remove(key);
            self.dirty = true;
            return None;
        }

        self.entries.get(key).map(|e| &e.value)
    }

    pub fn get_object(&mut self, key: &str) -> Option<ObjectRecord> {
        match self.get(key) {
            Some(CachedValue::Object(record)) => Some(record.clone()),
            _ => None,
        }
    }

    pub fn get_objects(&mut self, key: &str) -> Option<Vec<ObjectRecord>> {
        match self.get(key) {
            Some(CachedValue::Objects(records)) => Some(records.clone()),
            _ => None,
        }
    }

    /// Cached full listing, empty when absent or expired.
    pub fn get_all_objects(&mut self) -> Vec<ObjectRecord> {
        self.get_objects(ALL_OBJECTS_KEY).unwrap_or_default()
    }

    pub fn get_all_folders(&mut self) -> Vec<ObjectRecord> {
        self.get_objects(ALL_FOLDERS_KEY).unwrap_or_default()
    }

    pub fn cache_objects(&mut self, objects: Vec<ObjectRecord>) {
        self.set(ALL_OBJECTS_KEY, CachedValue::Objects(objects));
    }

    pub fn cache_folders(&mut self, folders: Vec<ObjectRecord>) {
        self.set(ALL_FOLDERS_KEY, CachedValue::Objects(folders));
    }

    pub fn set(&mut self, key: &str, value: CachedValue) {
        let timestamp = self.clock.now();
        self.entries
            .insert(key.to_string(), CacheEntry { value, timestamp });
        self.dirty = true;
        self.save(false);
    }

    /// Stores many values under a single timestamp and a single flush check.
    pub fn update<I>(&mut self, items: I)
    where
        I: IntoIterator<Item = (String, CachedValue)>,
    {
        let timestamp = self.clock.now();
        let mut changed = false;
        for (key, value) in items {
            self.entries.insert(key, CacheEntry { value, timestamp });
            changed = true;
        }
        if changed {
            self.dirty = true;
            self.save(false);
        }
    }

    /// Drops records from a cached list in place. The entry keeps its
    /// original timestamp, so pruning never extends its lifetime.
    /// Returns how many records were dropped.
    pub fn retain_objects<F>(&mut self, key: &str, mut keep: F) -> usize
    where
        F: FnMut(&ObjectRecord) -> bool,
    {
        if self.get(key).is_none() {
            return 0;
        }
        let dropped = match self.entries.get_mut(key) {
            Some(CacheEntry {
                value: CachedValue::Objects(records),
                ..
            }) => {
                let before = records.len();
                records.retain(|r| keep(r));
                before - records.len()
            }
            _ => 0,
        };
        if dropped > 0 {
            self.dirty = true;
            self.save(false);
        }
        dropped
    }

    pub fn remove<S: AsRef<str>>(&mut self, keys: &[S]) {
        let mut removed = false;
        for key in keys {
            removed |= self.entries.remove(key.as_ref()).is_some();
        }
        if removed {
            self.dirty = true;
            self.save(false);
        }
    }

    /// Empties the store and persists the empty state immediately.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
        self.save(true);
    }

    /// Writes pending changes now, ignoring the save interval.
    pub fn flush(&mut self) {
        if self.dirty {
            self.save(true);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn maybe_sweep(&mut self, now: DateTime<Utc>) {
        if elapsed(self.last_sweep, now) < self.settings.sweep_interval {
            return;
        }
        self.sweep(now);
    }

    fn sweep(&mut self, now: DateTime<Utc>) {
        let ttl = self.settings.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| elapsed(entry.timestamp, now) <= ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired cache entries");
            self.dirty = true;
            self.save(false);
        }
        self.last_sweep = now;
    }

    fn save(&mut self, force: bool) {
        if !self.dirty && !force {
            return;
        }

        let now = self.clock.now();
        if !force {
            if let Some(last) = self.last_save {
                if elapsed(last, now) < self.settings.save_interval {
                    return;
                }
            }
        }

        match self.write_atomic(now) {
            Ok(()) => {
                self.last_save = Some(now);
                self.dirty = false;
                debug!(entries = self.entries.len(), path = %self.path.display(), "saved cache");
            }
            Err(e) => {
                error!(path = %self.path.display(), "failed to save cache: {e}");
                let tmp = self.temp_path();
                if tmp.exists() {
                    if let Err(e) = fs::remove_file(&tmp) {
                        warn!(path = %tmp.display(), "failed to remove partial cache file: {e}");
                    }
                }
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn write_atomic(&self, now: DateTime<Utc>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let snapshot = CacheFileRef {
            fingerprint: self.fingerprint.as_str(),
            timestamp: now,
            entries: &self.entries,
        };

        let tmp = self.temp_path();
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp, &self.path)
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Time from `since` to `now`; zero if the clock went backwards.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{file, ManualClock};
    use tempfile::TempDir;

    fn settings() -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(3600),
            save_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(600),
        }
    }

    fn open(dir: &TempDir, fingerprint: &str, clock: &ManualClock) -> CacheStore {
        CacheStore::open_with_clock(
            dir.path().join("cache.json"),
            Fingerprint::new(fingerprint),
            settings(),
            Box::new(clock.clone()),
        )
    }

    fn read_file(path: &Path) -> serde_json::Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let mut cache = open(&dir, "acct", &clock);

        cache.set("a", CachedValue::Object(file("a", 10, "h")));
        cache.update(vec![
            ("b".to_string(), CachedValue::Flag(true)),
            ("c".to_string(), CachedValue::Flag(false)),
        ]);

        assert_eq!(cache.get_object("a").unwrap().id, "a");
        assert_eq!(cache.get("b"), Some(&CachedValue::Flag(true)));
        assert_eq!(cache.len(), 3);

        cache.remove(&["a", "b"]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c"), Some(&CachedValue::Flag(false)));
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let mut cache = open(&dir, "acct", &clock);

        cache.set("a", CachedValue::Flag(true));

        clock.advance(Duration::from_secs(3599));
        assert_eq!(cache.get("a"), Some(&CachedValue::Flag(true)));

        clock.advance(Duration::from_secs(2));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_retain_objects_keeps_entry_age() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let mut cache = open(&dir, "acct", &clock);
        cache.cache_objects(vec![file("a", 1, "h"), file("b", 1, "h")]);

        clock.advance(Duration::from_secs(3000));
        assert_eq!(cache.retain_objects(ALL_OBJECTS_KEY, |o| o.id != "a"), 1);
        let ids: Vec<String> = cache.get_all_objects().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);

        // Still expires one TTL after it was first stored.
        clock.advance(Duration::from_secs(601));
        assert!(cache.get_objects(ALL_OBJECTS_KEY).is_none());
        assert_eq!(cache.retain_objects(ALL_OBJECTS_KEY, |_| false), 0);
    }

    #[test]
    fn test_flush_is_debounced() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let mut cache = open(&dir, "acct", &clock);

        // First write persists immediately, nothing has been saved yet.
        cache.set("a", CachedValue::Flag(true));
        assert!(!cache.is_dirty());

        clock.advance(Duration::from_secs(10));
        cache.set("b", CachedValue::Flag(true));
        assert!(cache.is_dirty());
        let on_disk = read_file(cache.path());
        assert!(on_disk["entries"].get("b").is_none());

        clock.advance(Duration::from_secs(60));
        cache.set("c", CachedValue::Flag(true));
        assert!(!cache.is_dirty());
        let on_disk = read_file(cache.path());
        assert!(on_disk["entries"].get("b").is_some());
        assert!(on_disk["entries"].get("c").is_some());
    }

    #[test]
    fn test_drop_forces_flush() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        {
            let mut cache = open(&dir, "acct", &clock);
            cache.set("a", CachedValue::Flag(true));
            clock.advance(Duration::from_secs(1));
            cache.set("b", CachedValue::Flag(false));
            assert!(cache.is_dirty());
        }

        let mut reopened = open(&dir, "acct", &clock);
        assert_eq!(reopened.get("b"), Some(&CachedValue::Flag(false)));
    }

    #[test]
    fn test_fingerprint_mismatch_discards_entries() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        {
            let mut cache = open(&dir, "account-a", &clock);
            let objects = (0..10).map(|i| file(&format!("f{i}"), 10, "h")).collect();
            cache.cache_objects(objects);
            for i in 0..9 {
                cache.set(&format!("f{i}"), CachedValue::Flag(true));
            }
            assert_eq!(cache.len(), 10);
        }

        let mut cache = open(&dir, "account-b", &clock);
        assert!(cache.get_all_objects().is_empty());
        assert!(cache.is_empty());

        let on_disk = read_file(cache.path());
        assert_eq!(on_disk["fingerprint"], "account-b");
        assert_eq!(on_disk["entries"].as_object().unwrap().len(), 0);
    }

    #[test]
    fn test_stale_file_discarded_on_load() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        {
            let mut cache = open(&dir, "acct", &clock);
            cache.set("a", CachedValue::Flag(true));
        }

        clock.advance(Duration::from_secs(2 * 3600));
        let mut cache = open(&dir, "acct", &clock);
        assert!(cache.get("a").is_none());
        let on_disk = read_file(cache.path());
        assert_eq!(on_disk["entries"].as_object().unwrap().len(), 0);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{not json").unwrap();

        let clock = ManualClock::new();
        let mut cache = open(&dir, "acct", &clock);
        assert!(cache.is_empty());

        cache.set("a", CachedValue::Flag(true));
        assert_eq!(cache.get("a"), Some(&CachedValue::Flag(true)));
    }

    #[test]
    fn test_unwritable_location_keeps_memory_copy() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a directory").unwrap();

        let clock = ManualClock::new();
        let mut cache = CacheStore::open_with_clock(
            blocker.join("cache.json"),
            Fingerprint::new("acct"),
            settings(),
            Box::new(clock.clone()),
        );

        cache.set("a", CachedValue::Flag(true));
        assert!(cache.is_dirty());
        assert_eq!(cache.get("a"), Some(&CachedValue::Flag(true)));
    }

    #[test]
    fn test_clear_persists_immediately() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let mut cache = open(&dir, "acct", &clock);
        cache.set("a", CachedValue::Flag(true));
        clock.advance(Duration::from_secs(1));
        cache.set("b", CachedValue::Flag(true));

        cache.clear();
        assert!(!cache.is_dirty());
        let on_disk = read_file(cache.path());
        assert_eq!(on_disk["entries"].as_object().unwrap().len(), 0);
        assert!(!dir.path().join("cache.json.tmp").exists());
    }

    #[test]
    fn test_fingerprint_from_credentials() {
        let dir = TempDir::new().unwrap();
        let creds = dir.path().join("credentials.json");

        assert_eq!(Fingerprint::from_credentials(&creds).as_str(), "default");

        fs::write(&creds, b"{\"client_id\": \"one\"}").unwrap();
        let first = Fingerprint::from_credentials(&creds);
        assert_eq!(first.as_str().len(), 16);

        fs::write(&creds, b"{\"client_id\": \"two\"}").unwrap();
        assert_ne!(first, Fingerprint::from_credentials(&creds));
    }
}
