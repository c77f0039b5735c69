//! Bounded, shared cache of resident projects.
//!
//! Every resident project is handed out as a [`ProjectHandle`]: all callers
//! asking for the same id get the same instance. The index itself sits
//! behind one async mutex that is never held across I/O. A miss reserves a
//! `Loading` slot, drops the lock and reads on the blocking pool; eviction
//! reserves a `Flushing` slot the same way. Anyone who finds a slot in one of
//! those states waits for it to settle instead of starting a second read or
//! write. If the owner of such a slot is cancelled, the next caller reclaims
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::history::{HistoryError, HistoryPolicy};
use crate::model::{ModelError, Project, ProjectId, ProjectType, StabilityState, StringValue};
use crate::store::{ProjectStore, StoreError};

/// Shared handle to a resident project. Edits take the write lock.
pub type ProjectHandle = Arc<RwLock<Project>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("project '{0}' is not resident")]
    NotResident(ProjectId),
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error("failed to flush {} project(s): {}", .0.len(), join_ids(.0))]
    FlushFailed(Vec<ProjectId>),
}

fn join_ids(ids: &[ProjectId]) -> String {
    ids.iter().map(ProjectId::as_str).collect::<Vec<_>>().join(", ")
}

fn task_err(e: tokio::task::JoinError) -> CacheError {
    CacheError::Task(e.to_string())
}

/// What to do when the store has no project under the requested id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadIntent {
    /// Fail with `NotFound`.
    Existing,
    /// Start an empty project. It begins dirty so the next flush persists it.
    CreateIfMissing {
        project_type: ProjectType,
        base_language: String,
    },
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub resident: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// The sender half of a `Loading`/`Flushing` slot lives with whoever owns the
/// I/O. It is dropped once the slot has been updated, which wakes waiters.
/// A closed channel on a slot still in that state means the owner went away.
enum Slot {
    Loading(watch::Receiver<()>),
    Resident {
        handle: ProjectHandle,
    },
    Flushing {
        handle: ProjectHandle,
        done: watch::Receiver<()>,
    },
}

impl Slot {
    fn pending(&self) -> Option<&watch::Receiver<()>> {
        match self {
            Slot::Loading(rx) | Slot::Flushing { done: rx, .. } => Some(rx),
            Slot::Resident { .. } => None,
        }
    }

    fn is_abandoned(&self) -> bool {
        self.pending().is_some_and(|rx| rx.has_changed().is_err())
    }

    fn handle(&self) -> Option<&ProjectHandle> {
        match self {
            Slot::Resident { handle, .. } | Slot::Flushing { handle, .. } => Some(handle),
            Slot::Loading(_) => None,
        }
    }
}

/// Slots in recency order. Only hits and inserts promote; bookkeeping goes
/// through `peek`.
struct Index {
    slots: LruCache<ProjectId, Slot>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            slots: LruCache::unbounded(),
        }
    }
}

impl Index {
    fn resident_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resident { .. }))
            .count()
    }

    /// Swap a `Flushing` slot back to `Resident` without touching its
    /// recency.
    fn restore_resident(&mut self, id: &ProjectId) {
        if let Some(slot) = self.slots.peek_mut(id) {
            let handle = match slot {
                Slot::Flushing { handle, .. } => Arc::clone(handle),
                _ => return,
            };
            *slot = Slot::Resident { handle };
        }
    }

    fn reclaim_abandoned(&mut self) {
        let abandoned: Vec<ProjectId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_abandoned())
            .map(|(id, _)| id.clone())
            .collect();
        for id in abandoned {
            if matches!(self.slots.peek(&id), Some(Slot::Flushing { .. })) {
                warn!(project = %id, "eviction abandoned, project stays resident");
                self.restore_resident(&id);
            } else {
                warn!(project = %id, "load abandoned, slot released");
                self.slots.pop(&id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectCache
// ---------------------------------------------------------------------------

pub struct ProjectCache {
    store: Arc<ProjectStore>,
    policy: HistoryPolicy,
    capacity: usize,
    index: Mutex<Index>,
    counters: Counters,
}

impl ProjectCache {
    /// `capacity` is raised to at least 1.
    pub fn new(store: ProjectStore, capacity: usize, policy: HistoryPolicy) -> Self {
        Self {
            store: Arc::new(store),
            policy,
            capacity: capacity.max(1),
            index: Mutex::new(Index::default()),
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ProjectStore::from_config(&config.storage),
            config.cache.project_cache,
            HistoryPolicy::from_config(&config.history),
        )
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn policy(&self) -> &HistoryPolicy {
        &self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn lock(&self) -> MutexGuard<'_, Index> {
        let mut index = self.index.lock().await;
        index.reclaim_abandoned();
        index
    }

    /// Lock the index once `id` is neither loading nor flushing.
    async fn lock_settled(&self, id: &ProjectId) -> MutexGuard<'_, Index> {
        loop {
            let index = self.lock().await;
            let pending = index.slots.peek(id).and_then(Slot::pending).cloned();
            match pending {
                None => return index,
                Some(mut rx) => {
                    drop(index);
                    debug!(project = %id, "waiting for pending load or eviction");
                    // Completion is signalled by the sender being dropped.
                    let _ = rx.changed().await;
                }
            }
        }
    }

    /// Return the shared instance of `id`, loading it on a miss.
    ///
    /// A newly loaded project may push the cache over capacity, in which
    /// case the least recently used other project that nobody holds is
    /// flushed and dropped. Store errors are returned as-is and nothing is
    /// cached for a failed load.
    pub async fn get(&self, id: &ProjectId, intent: LoadIntent) -> Result<ProjectHandle, CacheError> {
        let mut index = self.lock_settled(id).await;
        if let Some(Slot::Resident { handle }) = index.slots.get_mut(id) {
            let handle = Arc::clone(handle);
            Counters::bump(&self.counters.hits);
            debug!(project = %id, "cache hit");

            // An earlier eviction may have been blocked by handles in use.
            let over = index.resident_count() > self.capacity;
            drop(index);
            if over {
                self.evict_over_capacity(id).await;
            }
            return Ok(handle);
        }

        let (loading, rx) = watch::channel(());
        index.slots.put(id.clone(), Slot::Loading(rx));
        drop(index);
        Counters::bump(&self.counters.misses);

        let loaded = self.load(id, &intent).await;

        let mut index = self.lock().await;
        let handle = match loaded {
            Ok(project) => {
                let handle = Arc::new(RwLock::new(project));
                index.slots.put(
                    id.clone(),
                    Slot::Resident {
                        handle: Arc::clone(&handle),
                    },
                );
                handle
            }
            Err(e) => {
                index.slots.pop(id);
                drop(index);
                drop(loading);
                return Err(e);
            }
        };
        drop(index);
        drop(loading);

        self.evict_over_capacity(id).await;
        Ok(handle)
    }

    async fn load(&self, id: &ProjectId, intent: &LoadIntent) -> Result<Project, CacheError> {
        let store = Arc::clone(&self.store);
        let key = id.clone();
        let read = tokio::task::spawn_blocking(move || store.read(&key))
            .await
            .map_err(task_err)?;

        match (read, intent) {
            (Ok(project), _) => {
                Counters::bump(&self.counters.loads);
                info!(project = %id, languages = project.languages().count(), "project loaded");
                Ok(project)
            }
            (
                Err(StoreError::NotFound(_)),
                LoadIntent::CreateIfMissing {
                    project_type,
                    base_language,
                },
            ) => {
                let mut project = Project::new(id.clone(), *project_type, base_language)?;
                project.mark_dirty();
                info!(project = %id, project_type = %project_type, "project created");
                Ok(project)
            }
            (Err(e), _) => Err(e.into()),
        }
    }

    /// Evict least recently used projects until the resident count fits.
    /// `keep` and projects whose handle is held elsewhere are never chosen.
    async fn evict_over_capacity(&self, keep: &ProjectId) {
        loop {
            let (victim, handle, flushing) = {
                let mut index = self.lock().await;
                let resident = index.resident_count();
                if resident <= self.capacity {
                    return;
                }
                // Least recently used first.
                let candidate = index.slots.iter().rev().find_map(|(id, slot)| match slot {
                    Slot::Resident { handle } if id != keep && Arc::strong_count(handle) == 1 => {
                        Some((id.clone(), Arc::clone(handle)))
                    }
                    _ => None,
                });
                let Some((victim, handle)) = candidate else {
                    warn!(resident, capacity = self.capacity,
                        "cache over capacity, every other project is in use");
                    return;
                };
                let (flushing, rx) = watch::channel(());
                if let Some(slot) = index.slots.peek_mut(&victim) {
                    *slot = Slot::Flushing {
                        handle: Arc::clone(&handle),
                        done: rx,
                    };
                }
                (victim, handle, flushing)
            };

            let written = self.write_back(&victim, handle).await;

            let mut index = self.lock().await;
            match written {
                Ok(_) => {
                    index.slots.pop(&victim);
                    Counters::bump(&self.counters.evictions);
                    info!(project = %victim, "project evicted");
                    drop(index);
                    drop(flushing);
                }
                Err(e) => {
                    index.restore_resident(&victim);
                    Counters::bump(&self.counters.flush_failures);
                    error!(project = %victim, error = %e,
                        "flush before eviction failed, project stays resident and dirty");
                    drop(index);
                    drop(flushing);
                    return;
                }
            }
        }
    }

    /// Persist the project if it is dirty. The write lock is held across the
    /// store write, so the flag is cleared only for the state that was
    /// written.
    async fn write_back(&self, id: &ProjectId, handle: ProjectHandle) -> Result<bool, CacheError> {
        let mut project = handle.write_owned().await;
        if !project.is_dirty() {
            return Ok(false);
        }
        let store = Arc::clone(&self.store);
        let key = id.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            store.write(&key, &project)?;
            project.clear_dirty();
            Ok(())
        })
        .await
        .map_err(task_err)??;
        Counters::bump(&self.counters.flushes);
        debug!(project = %id, "project flushed");
        Ok(true)
    }

    /// Flag a resident project as modified. Idempotent.
    pub async fn mark_dirty(&self, id: &ProjectId) -> Result<(), CacheError> {
        let handle = {
            let index = self.lock_settled(id).await;
            match index.slots.peek(id).and_then(Slot::handle) {
                Some(handle) => Arc::clone(handle),
                None => return Err(CacheError::NotResident(id.clone())),
            }
        };
        handle.write().await.mark_dirty();
        Ok(())
    }

    /// Write the project if it is resident and dirty. Returns whether a
    /// write happened.
    pub async fn flush(&self, id: &ProjectId) -> Result<bool, CacheError> {
        let handle = {
            let index = self.lock().await;
            match index.slots.peek(id).and_then(Slot::handle) {
                Some(handle) => Arc::clone(handle),
                None => return Ok(false),
            }
        };
        self.write_back(id, handle).await.inspect_err(|_| {
            Counters::bump(&self.counters.flush_failures);
        })
    }

    /// Flush every resident project. Failures do not stop the others; they
    /// are collected into [`CacheError::FlushFailed`]. Returns the number of
    /// projects written.
    pub async fn flush_all(&self) -> Result<usize, CacheError> {
        let mut handles: Vec<(ProjectId, ProjectHandle)> = {
            let index = self.lock().await;
            index
                .slots
                .iter()
                .filter_map(|(id, slot)| slot.handle().map(|h| (id.clone(), Arc::clone(h))))
                .collect()
        };
        handles.sort_by(|a, b| a.0.cmp(&b.0));

        let mut written = 0;
        let mut failed = Vec::new();
        for (id, handle) in handles {
            match self.write_back(&id, handle).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    Counters::bump(&self.counters.flush_failures);
                    error!(project = %id, error = %e, "flush failed");
                    failed.push(id);
                }
            }
        }

        if failed.is_empty() {
            info!(written, "all projects flushed");
            Ok(written)
        } else {
            Err(CacheError::FlushFailed(failed))
        }
    }

    /// Load (if needed) and record one edit. The project is left dirty.
    pub async fn record_change(
        &self,
        id: &ProjectId,
        language: &str,
        key: &str,
        value: StringValue,
        author: &str,
        now: DateTime<Utc>,
    ) -> Result<StabilityState, CacheError> {
        let handle = self.get(id, LoadIntent::Existing).await?;
        let mut project = handle.write().await;
        Ok(project.record_change(&self.policy, language, key, value, author, now)?)
    }

    /// Drop the resident instance without flushing and delete the project
    /// from the store. Returns whether the store had it.
    pub async fn delete(&self, id: &ProjectId) -> Result<bool, CacheError> {
        {
            let mut index = self.lock_settled(id).await;
            if index.slots.pop(id).is_some() {
                debug!(project = %id, "resident instance dropped");
            }
        }
        let store = Arc::clone(&self.store);
        let key = id.clone();
        let removed = tokio::task::spawn_blocking(move || store.delete(&key))
            .await
            .map_err(task_err)??;
        Ok(removed)
    }

    /// Ids of resident projects, sorted.
    pub async fn resident(&self) -> Vec<ProjectId> {
        let index = self.lock().await;
        let mut ids: Vec<ProjectId> = index
            .slots
            .iter()
            .filter(|(_, slot)| slot.handle().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.resident().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let resident = self.lock().await.resident_count();
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            resident,
            capacity: self.capacity,
        }
    }
}

impl Drop for ProjectCache {
    fn drop(&mut self) {
        let unflushed = self
            .index
            .get_mut()
            .slots
            .iter()
            .filter_map(|(_, slot)| slot.handle())
            .filter(|handle| handle.try_read().map(|p| p.is_dirty()).unwrap_or(true))
            .count();
        if unflushed > 0 {
            warn!(unflushed, "project cache dropped with unflushed projects");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::layout::Layout;

    fn cache(capacity: usize) -> (ProjectCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = ProjectStore::new(dir.path(), Layout::OneFile, Codec::Xml);
        (
            ProjectCache::new(store, capacity, HistoryPolicy::default()),
            dir,
        )
    }

    fn create() -> LoadIntent {
        LoadIntent::CreateIfMissing {
            project_type: ProjectType::NewGrf,
            base_language: "en_GB".into(),
        }
    }

    #[tokio::test]
    async fn test_capacity_is_at_least_one() {
        let (cache, _dir) = cache(0);
        assert_eq!(cache.capacity(), 1);
    }

    #[tokio::test]
    async fn test_second_get_is_a_hit_on_the_same_instance() {
        let (cache, _dir) = cache(2);
        let id = ProjectId::new("a").unwrap();
        let first = cache.get(&id, create()).await.unwrap();
        let second = cache.get(&id, LoadIntent::Existing).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_created_project_starts_dirty() {
        let (cache, _dir) = cache(1);
        let id = ProjectId::new("fresh").unwrap();
        let handle = cache.get(&id, create()).await.unwrap();
        assert!(handle.read().await.is_dirty());
        assert!(cache.flush(&id).await.unwrap());
        assert!(!handle.read().await.is_dirty());
        assert!(!cache.flush(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_dirty_requires_residency() {
        let (cache, _dir) = cache(1);
        let id = ProjectId::new("ghost").unwrap();
        assert!(matches!(
            cache.mark_dirty(&id).await,
            Err(CacheError::NotResident(_))
        ));
        assert!(!cache.flush(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_load_is_reclaimed() {
        let (cache, _dir) = cache(1);
        let id = ProjectId::new("a").unwrap();
        {
            let mut index = cache.index.lock().await;
            let (tx, rx) = watch::channel(());
            index.slots.put(id.clone(), Slot::Loading(rx));
            drop(tx);
        }
        let handle = cache.get(&id, create()).await.unwrap();
        assert_eq!(handle.read().await.id(), &id);
    }

    fn resident_handle(id: &ProjectId, name: &str) -> ProjectHandle {
        let mut project = Project::new(id.clone(), ProjectType::NewGrf, "en_GB").unwrap();
        project.name = name.into();
        Arc::new(RwLock::new(project))
    }

    #[tokio::test]
    async fn test_get_waits_for_flushing_slot_then_reloads() {
        let (cache, _dir) = cache(1);
        let cache = Arc::new(cache);
        let id = ProjectId::new("a").unwrap();
        let stale = resident_handle(&id, "in memory");
        let (flushing, rx) = watch::channel(());
        cache.index.lock().await.slots.put(
            id.clone(),
            Slot::Flushing {
                handle: Arc::clone(&stale),
                done: rx,
            },
        );

        let task = {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            tokio::spawn(async move { cache.get(&id, LoadIntent::Existing).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (0, 0));

        // Complete the eviction: data on disk, slot gone, waiters woken.
        let mut flushed = stale.read().await.clone();
        flushed.name = "flushed".into();
        cache.store().write(&id, &flushed).unwrap();
        cache.index.lock().await.slots.pop(&id);
        drop(flushing);

        let handle = task.await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&handle, &stale));
        assert_eq!(handle.read().await.name, "flushed");
        let stats = cache.stats().await;
        assert_eq!((stats.misses, stats.loads), (1, 1));
    }

    #[tokio::test]
    async fn test_abandoned_flush_returns_project_to_resident() {
        let (cache, _dir) = cache(1);
        let id = ProjectId::new("a").unwrap();
        let held = resident_handle(&id, "unsaved");
        {
            let mut index = cache.index.lock().await;
            let (tx, rx) = watch::channel(());
            index.slots.put(
                id.clone(),
                Slot::Flushing {
                    handle: Arc::clone(&held),
                    done: rx,
                },
            );
            drop(tx);
        }

        // Nothing is in the store, so only the restored slot can answer.
        let handle = cache.get(&id, LoadIntent::Existing).await.unwrap();
        assert!(Arc::ptr_eq(&handle, &held));
        assert!(matches!(
            cache.index.lock().await.slots.peek(&id),
            Some(Slot::Resident { .. })
        ));
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.loads), (1, 0));
    }

    #[test]
    fn test_flush_failed_lists_ids() {
        let err = CacheError::FlushFailed(vec![
            ProjectId::new("a").unwrap(),
            ProjectId::new("b").unwrap(),
        ]);
        assert_eq!(err.to_string(), "failed to flush 2 project(s): a, b");
    }
}
