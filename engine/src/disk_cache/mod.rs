//! Disk cache of pre-rasterized vector animation frames.
//!
//! Every cache file has a bookkeeping entry holding its absolute expiry in
//! milliseconds. Entries are grouped by a `session/WxH/` prefix and each group
//! is capped at a maximum entry count, oldest expiry evicted first. Files
//! with no live bookkeeping entry are orphans and are swept by [`DiskFrameCache::gc`].
//!
//! A dedicated maintenance thread runs asynchronous cache builds, scheduled
//! GC passes and `clear()`, so they are serialized against each other.

mod bookkeeping;

pub use bookkeeping::{BookkeepingStore, JsonFileStore, MemoryStore};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::{ColorVariant, Descriptor, EngineError, RenderSize, SessionId};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheSettings;
use crate::decode::DecoderBackend;
use crate::{lock, log_and_continue};

const CACHE_FILE_EXTENSION: &str = "frames";
const BOOKKEEPING_FILE: &str = "bookkeeping.json";
/// Lower bound between scheduled GC passes
const MIN_GC_DELAY_MS: u64 = 1000;

/// Identity of one cache file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub session_id: SessionId,
    pub width: u32,
    pub height: u32,
    pub variant: ColorVariant,
    pub file_name: String,
}

impl CacheKey {
    pub fn for_descriptor(descriptor: &Descriptor, width: u32, height: u32) -> Self {
        Self {
            session_id: descriptor.key().session_id,
            width,
            height,
            variant: descriptor.key().color_variant,
            file_name: descriptor.file_name().to_string(),
        }
    }

    /// Eviction group: same session and resolution
    pub fn prefix(&self) -> String {
        format!("{}/{}x{}/", self.session_id, self.width, self.height)
    }

    pub fn bookkeeping_key(&self) -> String {
        format!("{}{}/{}", self.prefix(), self.variant.0, self.file_name)
    }
}

/// Cache file name for a bookkeeping key
fn file_name_for(bookkeeping_key: &str) -> String {
    let stem: String = bookkeeping_key
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect();
    format!("{}.{}", stem, CACHE_FILE_EXTENSION)
}

/// Summary of one GC pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    /// Expired entries removed with their files
    pub expired: usize,
    /// Unparsable bookkeeping entries dropped
    pub corrupt: usize,
    /// Cache files with no bookkeeping entry
    pub orphans: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.expired + self.corrupt + self.orphans
    }
}

/// Asynchronous cache build handed to the maintenance thread
pub struct BuildRequest {
    pub backend: Arc<dyn DecoderBackend>,
    pub source: PathBuf,
    pub size: RenderSize,
    pub variant: ColorVariant,
    pub cache_file: PathBuf,
    pub cancel: Arc<AtomicBool>,
    pub done: Box<dyn FnOnce(Result<(), EngineError>) + Send>,
}

enum MaintenanceTask {
    Build(BuildRequest),
    Clear(Sender<Result<(), EngineError>>),
    Shutdown,
}

struct CacheInner {
    root: PathBuf,
    store: Arc<dyn BookkeepingStore>,
    clock: Arc<dyn Clock>,
    gc_interval: Duration,
    /// Readers take it shared; `clear` takes it exclusively
    gate: RwLock<()>,
    /// Held across expiry refreshes and across a GC pass, so a refreshed
    /// entry is never judged by a stale scan
    bookkeeping: Mutex<()>,
    /// Active writers per cache file
    writers: Mutex<HashMap<PathBuf, usize>>,
    next_gc_ms: AtomicU64,
}

impl CacheInner {
    fn path_for(&self, bookkeeping_key: &str) -> PathBuf {
        self.root.join(file_name_for(bookkeeping_key))
    }

    fn is_being_written(&self, path: &Path) -> bool {
        lock!(self.writers).get(path).is_some_and(|n| *n > 0)
    }

    fn until_next_gc(&self) -> Duration {
        let now = self.clock.now_ms();
        let next = self.next_gc_ms.load(Ordering::Relaxed);
        Duration::from_millis(next.saturating_sub(now)).min(self.gc_interval)
    }

    fn schedule_gc(&self, soonest_expiry: Option<u64>) {
        let now = self.clock.now_ms();
        let periodic = now + self.gc_interval.as_millis() as u64;
        let next = soonest_expiry
            .map_or(periodic, |e| e.min(periodic))
            .max(now + MIN_GC_DELAY_MS);
        self.next_gc_ms.store(next, Ordering::Relaxed);
    }

    fn delete_file(&self, path: &Path) -> Result<(), EngineError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn limit_entry_count_locked(
        &self,
        prefix: &str,
        max_entries: usize,
        exempt: &str,
    ) -> Result<usize, EngineError> {
        let entries = self.store.scan_by_prefix(prefix)?;
        let excess = entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return Ok(0);
        }

        // Corrupt expiries sort first
        let mut candidates: Vec<(u64, String)> = entries
            .into_iter()
            .filter(|(key, _)| key != exempt && !self.is_being_written(&self.path_for(key)))
            .map(|(key, value)| (value.parse::<u64>().unwrap_or(0), key))
            .collect();
        candidates.sort();

        let mut deleted = 0;
        for (_, key) in candidates.into_iter().take(excess) {
            self.delete_file(&self.path_for(&key))?;
            self.store.remove(&key)?;
            deleted += 1;
        }

        if deleted > 0 {
            log::info!(
                "Evicted {} cache entr{} under {} (limit {})",
                deleted,
                if deleted == 1 { "y" } else { "ies" },
                prefix,
                max_entries
            );
        }
        Ok(deleted)
    }

    fn gc(&self) -> Result<GcReport, EngineError> {
        let _gate = self
            .gate
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let _bookkeeping = lock!(self.bookkeeping);
        let now = self.clock.now_ms();
        let mut report = GcReport::default();
        let mut live = HashSet::new();
        let mut soonest: Option<u64> = None;

        for (key, value) in self.store.scan_by_prefix("")? {
            let path = self.path_for(&key);
            match value.parse::<u64>() {
                Err(e) => {
                    log::warn!("Dropping corrupt cache entry {} ({:?}): {}", key, value, e);
                    self.store.remove(&key)?;
                    report.corrupt += 1;
                }
                Ok(expiry) if expiry <= now && !self.is_being_written(&path) => {
                    self.delete_file(&path)?;
                    self.store.remove(&key)?;
                    report.expired += 1;
                }
                Ok(expiry) => {
                    live.insert(path);
                    soonest = Some(soonest.map_or(expiry, |s| s.min(expiry)));
                }
            }
        }

        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let path = entry?.path();
                let is_cache_file = path
                    .extension()
                    .is_some_and(|ext| ext == CACHE_FILE_EXTENSION);
                if is_cache_file && !live.contains(&path) && !self.is_being_written(&path) {
                    self.delete_file(&path)?;
                    report.orphans += 1;
                }
            }
        }

        self.schedule_gc(soonest);

        if report.total() > 0 {
            log::info!(
                "Cache GC: {} expired, {} corrupt, {} orphaned",
                report.expired,
                report.corrupt,
                report.orphans
            );
        } else {
            log::debug!("Cache GC: nothing to delete");
        }
        Ok(report)
    }

    fn clear_all(&self) -> Result<(), EngineError> {
        let _gate = self
            .gate
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        self.store.clear()?;
        log::info!("Cleared frame cache at {}", self.root.display());
        Ok(())
    }
}

/// Marks a cache file as being written for as long as it lives
pub struct WriterGuard {
    inner: Arc<CacheInner>,
    path: PathBuf,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let mut writers = lock!(self.inner.writers);
        if let Some(count) = writers.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                writers.remove(&self.path);
            }
        }
    }
}

pub struct DiskFrameCache {
    inner: Arc<CacheInner>,
    tasks: Sender<MaintenanceTask>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl DiskFrameCache {
    /// Open the cache described by `settings`, persisting bookkeeping next to the files
    pub fn open(settings: &CacheSettings) -> anyhow::Result<Self> {
        let root = settings.resolve_directory()?;
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory: {}", root.display()))?;
        let store = JsonFileStore::open(root.join(BOOKKEEPING_FILE))
            .context("Failed to open cache bookkeeping")?;

        let cache = Self::with_parts(
            root,
            Arc::new(store),
            Arc::new(SystemClock),
            settings.gc_interval(),
        )?;
        log::info!(
            "Frame cache at {} ({} entries)",
            cache.root().display(),
            cache.entry_count()
        );
        Ok(cache)
    }

    pub fn with_parts(
        root: PathBuf,
        store: Arc<dyn BookkeepingStore>,
        clock: Arc<dyn Clock>,
        gc_interval: Duration,
    ) -> anyhow::Result<Self> {
        let now = clock.now_ms();
        let inner = Arc::new(CacheInner {
            root,
            store,
            clock,
            gc_interval,
            gate: RwLock::new(()),
            bookkeeping: Mutex::new(()),
            writers: Mutex::new(HashMap::new()),
            next_gc_ms: AtomicU64::new(now + gc_interval.as_millis() as u64),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("animd-cache".to_string())
            .spawn(move || maintenance_loop(thread_inner, rx))
            .context("Failed to spawn cache maintenance thread")?;

        Ok(Self {
            inner,
            tasks: tx,
            maintenance: Mutex::new(Some(handle)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn entry_count(&self) -> usize {
        self.inner
            .store
            .scan_by_prefix("")
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Deterministic path for `key`. With a non-zero `ttl` the entry's expiry
    /// is refreshed and its group trimmed to `max_entries`, sparing `key`.
    pub fn get_or_build_cache_file(
        &self,
        key: &CacheKey,
        ttl: Duration,
        max_entries: usize,
    ) -> Result<PathBuf, EngineError> {
        let _gate = self
            .inner
            .gate
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        fs::create_dir_all(&self.inner.root)?;

        let bookkeeping_key = key.bookkeeping_key();
        let path = self.inner.path_for(&bookkeeping_key);

        if !ttl.is_zero() {
            let _bookkeeping = lock!(self.inner.bookkeeping);
            let expiry = self.inner.clock.now_ms() + ttl.as_millis() as u64;
            self.inner.store.put(&bookkeeping_key, &expiry.to_string())?;
            self.inner
                .limit_entry_count_locked(&key.prefix(), max_entries, &bookkeeping_key)?;
        }

        Ok(path)
    }

    /// Delete the oldest entries under `prefix` beyond `max_entries`
    pub fn limit_entry_count(
        &self,
        prefix: &str,
        max_entries: usize,
        exempt: &str,
    ) -> Result<usize, EngineError> {
        let _gate = self
            .inner
            .gate
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.inner
            .limit_entry_count_locked(prefix, max_entries, exempt)
    }

    pub fn begin_write(&self, path: &Path) -> WriterGuard {
        *lock!(self.inner.writers)
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        WriterGuard {
            inner: Arc::clone(&self.inner),
            path: path.to_path_buf(),
        }
    }

    pub fn is_being_written(&self, path: &Path) -> bool {
        self.inner.is_being_written(path)
    }

    /// Build a cache file on the maintenance thread
    pub fn build_async(&self, request: BuildRequest) {
        if let Err(e) = self.tasks.send(MaintenanceTask::Build(request)) {
            if let MaintenanceTask::Build(request) = e.into_inner() {
                (request.done)(Err(EngineError::CacheBuild(
                    "cache maintenance thread is gone".to_string(),
                )));
            }
        }
    }

    /// Delete expired, corrupt and orphaned entries now
    pub fn gc(&self) -> Result<GcReport, EngineError> {
        self.inner.gc()
    }

    /// Wipe every file and bookkeeping entry, serialized on the maintenance thread
    pub fn clear(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tasks
            .send(MaintenanceTask::Clear(reply_tx))
            .map_err(|_| EngineError::InvalidState("cache maintenance thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::InvalidState("cache clear was abandoned".to_string()))?
    }

    pub fn shutdown(&self) {
        let _ = self.tasks.send(MaintenanceTask::Shutdown);
        if let Some(handle) = lock!(self.maintenance).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskFrameCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn maintenance_loop(inner: Arc<CacheInner>, rx: Receiver<MaintenanceTask>) {
    log::debug!("Cache maintenance thread started");
    loop {
        match rx.recv_timeout(inner.until_next_gc()) {
            Ok(MaintenanceTask::Build(request)) => run_build(&inner, request),
            Ok(MaintenanceTask::Clear(reply)) => {
                let _ = reply.send(inner.clear_all());
            }
            Ok(MaintenanceTask::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                log_and_continue!(inner.gc(), "run scheduled cache GC");
            }
        }
    }
    log::debug!("Cache maintenance thread stopped");
}

fn run_build(inner: &Arc<CacheInner>, request: BuildRequest) {
    let BuildRequest {
        backend,
        source,
        size,
        variant,
        cache_file,
        cancel,
        done,
    } = request;

    if cancel.load(Ordering::Acquire) {
        done(Err(EngineError::CacheBuild("canceled before start".to_string())));
        return;
    }

    *lock!(inner.writers).entry(cache_file.clone()).or_insert(0) += 1;
    let _writer = WriterGuard {
        inner: Arc::clone(inner),
        path: cache_file.clone(),
    };

    log::debug!("Building frame cache {}", cache_file.display());
    let result = backend
        .open_vector(&source, size, variant)
        .and_then(|mut vector| vector.build_cache(&cache_file, &cancel))
        .map_err(|e| EngineError::CacheBuild(e.to_string()));

    if result.is_err() {
        log_and_continue!(inner.delete_file(&cache_file), "remove partial cache file");
    }
    done(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        cache: DiskFrameCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new());
        let cache = DiskFrameCache::with_parts(
            dir.path().join("frames"),
            store.clone(),
            clock.clone(),
            Duration::from_secs(3600),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            clock,
            store,
            cache,
        }
    }

    fn key(file: &str) -> CacheKey {
        CacheKey {
            session_id: 1,
            width: 64,
            height: 64,
            variant: ColorVariant(0),
            file_name: file.to_string(),
        }
    }

    #[test]
    fn test_keys_and_paths_are_deterministic() {
        let k = key("sticker one.tgs");
        assert_eq!(k.prefix(), "1/64x64/");
        assert_eq!(k.bookkeeping_key(), "1/64x64/0/sticker one.tgs");
        assert_eq!(file_name_for(&k.bookkeeping_key()), "1_64x64_0_sticker_one.tgs.frames");
    }

    #[test]
    fn test_ttl_expiry_and_gc() {
        let f = fixture();
        let path = f
            .cache
            .get_or_build_cache_file(&key("a.tgs"), Duration::from_millis(2000), 10)
            .unwrap();
        fs::write(&path, b"frames").unwrap();

        f.clock.set(1000);
        assert_eq!(f.cache.gc().unwrap().total(), 0);
        assert!(path.exists());
        assert_eq!(f.store.len(), 1);

        f.clock.set(2500);
        let report = f.cache.gc().unwrap();
        assert_eq!(report.expired, 1);
        assert!(!path.exists());
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_gc_is_idempotent() {
        let f = fixture();
        for name in ["a.tgs", "b.tgs", "c.tgs"] {
            let path = f
                .cache
                .get_or_build_cache_file(&key(name), Duration::from_millis(100), 10)
                .unwrap();
            fs::write(path, b"x").unwrap();
        }
        f.store.put("1/64x64/0/bad.tgs", "not-a-number").unwrap();
        fs::write(f.cache.root().join("stray.frames"), b"x").unwrap();

        f.clock.set(500);
        let first = f.cache.gc().unwrap();
        assert_eq!(first.expired, 3);
        assert_eq!(first.corrupt, 1);
        assert_eq!(first.orphans, 1);

        let second = f.cache.gc().unwrap();
        assert_eq!(second, GcReport::default());
    }

    #[test]
    fn test_zero_ttl_skips_bookkeeping() {
        let f = fixture();
        f.cache
            .get_or_build_cache_file(&key("a.tgs"), Duration::ZERO, 10)
            .unwrap();
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_limit_entry_count_evicts_oldest() {
        let f = fixture();
        for (i, name) in ["a.tgs", "b.tgs", "c.tgs", "d.tgs"].iter().enumerate() {
            f.clock.set(i as u64 * 10);
            let path = f
                .cache
                .get_or_build_cache_file(&key(name), Duration::from_secs(60), 100)
                .unwrap();
            fs::write(path, b"x").unwrap();
        }

        let exempt = key("a.tgs").bookkeeping_key();
        let deleted = f.cache.limit_entry_count("1/64x64/", 2, &exempt).unwrap();
        assert_eq!(deleted, 2);

        let remaining: Vec<String> = f
            .store
            .scan_by_prefix("")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        // "a" is the oldest but exempt, so "b" and "c" go
        assert_eq!(remaining, vec!["1/64x64/0/a.tgs", "1/64x64/0/d.tgs"]);
    }

    #[test]
    fn test_limit_entry_count_spares_active_writers() {
        let f = fixture();
        let mut paths = Vec::new();
        for (i, name) in ["a.tgs", "b.tgs", "c.tgs"].iter().enumerate() {
            f.clock.set(i as u64);
            paths.push(
                f.cache
                    .get_or_build_cache_file(&key(name), Duration::from_secs(60), 100)
                    .unwrap(),
            );
        }

        let writing = f.cache.begin_write(&paths[0]);
        assert!(f.cache.is_being_written(&paths[0]));
        let deleted = f.cache.limit_entry_count("1/64x64/", 1, "").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(f.cache.entry_count(), 1);

        drop(writing);
        assert!(!f.cache.is_being_written(&paths[0]));
    }

    #[test]
    fn test_limit_never_deletes_more_than_excess() {
        let f = fixture();
        for name in ["a.tgs", "b.tgs"] {
            f.cache
                .get_or_build_cache_file(&key(name), Duration::from_secs(60), 100)
                .unwrap();
        }
        assert_eq!(f.cache.limit_entry_count("1/64x64/", 5, "").unwrap(), 0);
        assert_eq!(f.cache.entry_count(), 2);
    }

    #[test]
    fn test_max_entries_applied_on_write() {
        let f = fixture();
        for (i, name) in ["a.tgs", "b.tgs", "c.tgs"].iter().enumerate() {
            f.clock.set(i as u64);
            f.cache
                .get_or_build_cache_file(&key(name), Duration::from_secs(60), 2)
                .unwrap();
        }
        assert_eq!(f.cache.entry_count(), 2);
        assert_eq!(f.store.scan_by_prefix("1/64x64/0/c.tgs").unwrap().len(), 1);
    }

    #[test]
    fn test_refresh_racing_gc_keeps_entry_and_file() {
        let f = fixture();
        let k = key("raced.tgs");
        for round in 0..200u64 {
            let base = round * 1000;
            f.clock.set(base);
            let path = f
                .cache
                .get_or_build_cache_file(&k, Duration::from_millis(10), 10)
                .unwrap();
            fs::write(&path, b"x").unwrap();
            f.clock.set(base + 500);

            thread::scope(|s| {
                s.spawn(|| f.cache.gc().unwrap());
                s.spawn(|| {
                    let path = f
                        .cache
                        .get_or_build_cache_file(&k, Duration::from_secs(60), 10)
                        .unwrap();
                    let _writer = f.cache.begin_write(&path);
                    fs::write(&path, b"x").unwrap();
                });
            });

            // Whichever side won, the refreshed entry and its file both survive
            assert_eq!(f.cache.entry_count(), 1, "round {}", round);
            assert!(path.exists(), "round {}", round);
            assert_eq!(f.cache.gc().unwrap().orphans, 0, "round {}", round);
        }
    }

    #[test]
    fn test_clear_wipes_everything() {
        let f = fixture();
        let path = f
            .cache
            .get_or_build_cache_file(&key("a.tgs"), Duration::from_secs(60), 10)
            .unwrap();
        fs::write(&path, b"x").unwrap();

        f.cache.clear().unwrap();
        assert!(!path.exists());
        assert!(f.cache.root().exists());
        assert_eq!(f.cache.entry_count(), 0);
    }
}
