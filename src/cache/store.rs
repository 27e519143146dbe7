//! Process-wide store of per-clip cache state.
//!
//! One [`CacheEntry`] per [`CacheKey`], created lazily on first touch and
//! removed only by the TTL sweep. All mutable per-clip state sits behind the
//! entry's own lock, so different clips never contend with each other.

use crate::cache::clock::Clock;
use crate::cache::flight::FlightSlot;
use crate::metrics;
use axum::http::HeaderValue;
use dashmap::DashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle time after which an entry is evicted.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// File name prefix of downloaded sources inside the cache directory.
pub const TEMP_FILE_PREFIX: &str = "clip-";

/// Identity of one logical clip: a device plus an event on that device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(device_id: &str, event_id: &str) -> Self {
        Self(format!("{device_id}:{event_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully downloaded local copy of a clip's source media.
#[derive(Debug, Clone)]
pub struct CachedSource {
    pub path: PathBuf,
    /// `Content-Type` the upstream sent for the source, if any
    pub content_type: Option<HeaderValue>,
}

/// Last known verdict on a clip's upstream HLS playlist.
#[derive(Debug, Default)]
pub struct VodState {
    pub usable: Option<bool>,
    pub last_checked_at: Option<Instant>,
    pub playlist_fetched_at: Option<Instant>,
    /// Raw manifest body, before rewriting
    pub playlist_text: Option<Arc<str>>,
}

/// Mutable per-clip state, guarded by [`CacheEntry::state`].
#[derive(Debug)]
pub struct EntryState {
    pub last_access_at: Instant,
    pub source: Option<CachedSource>,
    pub source_flight: FlightSlot<CachedSource>,
    pub vod: VodState,
    pub vod_flight: FlightSlot<Arc<str>>,
    readers: usize,
    evicted: bool,
}

impl EntryState {
    fn is_busy(&self) -> bool {
        self.source_flight.is_active() || self.vod_flight.is_active()
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    created_at: Instant,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    fn new(key: CacheKey, now: Instant) -> Self {
        Self {
            key,
            created_at: now,
            state: Mutex::new(EntryState {
                last_access_at: now,
                source: None,
                source_flight: FlightSlot::new(),
                vod: VodState::default(),
                vod_flight: FlightSlot::new(),
                readers: 0,
                evicted: false,
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Lock the entry state. Never hold the guard across an `.await`.
    pub fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_access_at(&self) -> Instant {
        self.state().last_access_at
    }

    /// Pin the cached source file for reading.
    ///
    /// The file outlives an eviction that happens while leases are held; the
    /// last lease to be released deletes it.
    pub fn acquire_reader(self: &Arc<Self>) -> ReaderLease {
        self.state().readers += 1;
        ReaderLease {
            entry: Arc::clone(self),
        }
    }

    /// Drop the cached source if it still points at `path` (e.g. the file
    /// vanished), so the next request downloads it again.
    pub fn forget_source(&self, path: &Path) {
        let mut state = self.state();
        if state.source.as_ref().is_some_and(|s| s.path == path) {
            warn!("Forgetting missing cached file {:?} for {}", path, self.key);
            state.source = None;
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        let state = self.state();
        if state.is_busy() {
            debug!("Cache entry {} busy, eviction deferred", self.key);
            return false;
        }
        now.saturating_duration_since(state.last_access_at) >= ttl
    }

    /// Mark evicted and delete the backing file, unless readers still hold it.
    fn release_storage(&self) {
        let mut state = self.state();
        state.evicted = true;
        if state.readers > 0 {
            debug!(
                "Cache entry {} evicted with {} active readers, file kept until released",
                self.key, state.readers
            );
            return;
        }
        if let Some(source) = state.source.take() {
            discard_file(&source.path);
        }
    }
}

/// Keeps a cached file alive while a response body reads from it.
#[derive(Debug)]
pub struct ReaderLease {
    entry: Arc<CacheEntry>,
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        let mut state = self.entry.state();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0
            && state.evicted
            && let Some(source) = state.source.take()
        {
            discard_file(&source.path);
        }
    }
}

/// Get-or-create store of [`CacheEntry`] values with TTL eviction.
#[derive(Debug)]
pub struct CacheStore {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get or create the entry for `key` and refresh its last access time.
    pub fn touch(&self, key: CacheKey) -> Arc<CacheEntry> {
        let now = self.clock.now();
        // Access time is written under the map shard lock, so a concurrent
        // sweep either sees the fresh time or removes the entry before we
        // create a new one.
        let mut created = false;
        let entry = {
            let slot = self.entries.entry(key.clone()).or_insert_with(|| {
                debug!("Creating cache entry {}", key);
                created = true;
                Arc::new(CacheEntry::new(key, now))
            });
            slot.state().last_access_at = now;
            Arc::clone(slot.value())
        };

        // Shard lock released above; len() locks every shard
        if created {
            metrics::set_cached_clips(self.entries.len());
        }
        entry
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every idle entry untouched for at least the TTL.
    ///
    /// Entries with a download or playlist fetch in flight are skipped and
    /// looked at again on the next sweep. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut evicted = 0;
        for key in keys {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&key, |_, entry| entry.is_expired(now, self.ttl))
            {
                info!("Evicting idle cache entry {}", key);
                entry.release_storage();
                metrics::record_eviction();
                evicted += 1;
            }
        }

        metrics::set_cached_clips(self.entries.len());
        evicted
    }

    /// Remove `key` regardless of age.
    pub fn evict(&self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.release_storage();
                metrics::record_eviction();
                metrics::set_cached_clips(self.entries.len());
                true
            }
            None => false,
        }
    }

    /// Evict everything; used on shutdown.
    pub fn clear(&self) {
        let keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.evict(&key);
        }
    }

    /// Run [`CacheStore::sweep`] every `period` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep();
                        if evicted > 0 {
                            debug!("Cache sweep evicted {} entries", evicted);
                        }
                    }
                }
            }

            debug!("Cache sweeper stopped");
        })
    }
}

/// Best-effort delete of a cached file. Failures are logged, never returned.
pub fn discard_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Deleted cached file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete cached file {:?}: {}", path, e),
    }
}

/// Delete leftover source files from a previous run. Returns how many were removed.
pub async fn purge_stale_files(dir: &Path) -> usize {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Cannot scan cache directory {:?}: {}", dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(item)) = reader.next_entry().await {
        let is_ours = item
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TEMP_FILE_PREFIX));
        if !is_ours {
            continue;
        }
        match tokio::fs::remove_file(item.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to delete stale file {:?}: {}", item.path(), e),
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::error::ClipRelayError;

    const TTL: Duration = Duration::from_secs(120);

    fn store() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CacheStore::new(TTL, clock.clone()), clock)
    }

    fn key() -> CacheKey {
        CacheKey::new("front-door", "1700000000.1-abc")
    }

    /// Attach a real temp file as the entry's cached source.
    fn attach_file(entry: &CacheEntry) -> PathBuf {
        let path = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile()
            .unwrap()
            .into_temp_path()
            .keep()
            .unwrap();
        entry.state().source = Some(CachedSource {
            path: path.clone(),
            content_type: None,
        });
        path
    }

    #[test]
    fn key_combines_device_and_event() {
        assert_eq!(key().as_str(), "front-door:1700000000.1-abc");
    }

    #[test]
    fn touch_creates_once() {
        let (store, _) = store();
        let a = store.touch(key());
        let b = store.touch(key());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn touch_refreshes_last_access() {
        let (store, clock) = store();
        let entry = store.touch(key());
        let created = entry.last_access_at();

        clock.advance(Duration::from_secs(30));
        store.touch(key());
        assert_eq!(entry.last_access_at() - created, Duration::from_secs(30));
        assert_eq!(entry.created_at(), created);
    }

    #[test]
    fn untouched_entry_is_evicted_and_file_deleted() {
        let (store, clock) = store();
        let entry = store.touch(key());
        let path = attach_file(&entry);

        clock.advance(TTL);
        assert_eq!(store.sweep(), 1);
        assert!(store.get(&key()).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn entry_touched_before_deadline_survives() {
        let (store, clock) = store();
        let entry = store.touch(key());
        let path = attach_file(&entry);

        // Touch just before expiry, then sweep just after the original deadline
        clock.advance(TTL - Duration::from_secs(1));
        store.touch(key());
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep(), 0);
        assert!(store.get(&key()).is_some());
        assert!(path.exists());

        // A full TTL after the last touch it goes
        clock.advance(TTL);
        assert_eq!(store.sweep(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn busy_entry_is_not_evicted() {
        let (store, clock) = store();
        let entry = store.touch(key());

        let (flight, _) = entry.state().source_flight.join_or_start(|_| async {
            Err(ClipRelayError::Internal("never settled".to_string()))
        });

        clock.advance(TTL * 2);
        assert_eq!(store.sweep(), 0, "in-flight download pins the entry");

        let _ = flight.clone().wait().await;
        entry.state().source_flight.settle(flight.id());
        assert_eq!(store.sweep(), 1);
    }

    #[test]
    fn eviction_with_reader_defers_file_delete() {
        let (store, clock) = store();
        let entry = store.touch(key());
        let path = attach_file(&entry);

        let lease = entry.acquire_reader();
        clock.advance(TTL);
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
        assert!(path.exists(), "file kept while a reader holds it");

        drop(lease);
        assert!(!path.exists(), "last reader deletes the evicted file");
    }

    #[test]
    fn reader_release_without_eviction_keeps_file() {
        let (store, _) = store();
        let entry = store.touch(key());
        let path = attach_file(&entry);

        drop(entry.acquire_reader());
        assert!(path.exists());
        store.clear();
        assert!(!path.exists());
    }

    #[test]
    fn forget_source_only_matches_same_path() {
        let (store, _) = store();
        let entry = store.touch(key());
        let path = attach_file(&entry);

        entry.forget_source(Path::new("/nonexistent/other.mp4"));
        assert!(entry.state().source.is_some());
        entry.forget_source(&path);
        assert!(entry.state().source.is_none());
        discard_file(&path);
    }

    #[test]
    fn discard_missing_file_is_silent() {
        discard_file(Path::new("/nonexistent/clip-missing.mp4"));
    }

    #[tokio::test]
    async fn purge_removes_only_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip-old.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();

        assert_eq!(purge_stale_files(dir.path()).await, 1);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (store, _) = store();
        let token = CancellationToken::new();
        let handle = Arc::new(store).spawn_sweeper(Duration::from_millis(5), token.clone());
        token.cancel();
        handle.await.unwrap();
    }
}
