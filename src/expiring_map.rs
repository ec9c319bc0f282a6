//! ExpiringMap: a two-generation cache over `HashTable`.
//!
//! Entries are written to the `current` generation. Each rotation demotes
//! `current` to `backup` and discards the old `backup`, so an entry that is
//! not touched (put, or read with refresh) survives between one and two
//! windows. There are no per-entry timers and no scans; eviction is a swap.
//!
//! Locking: one mutex covers both generations and is taken by every
//! operation, including the rotation itself. Rotation registration lives
//! behind a second mutex that the rotation task never takes, so cancelling
//! (which waits for an in-flight rotation) cannot deadlock against it.

use crate::error::{InsertError, RotationError};
use crate::hash_table::{HashTable, MIN_CAPACITY};
use crate::hasher::BytesHashBuilder;
use crate::scheduler::{default_scheduler, Scheduler, Task, TaskId};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::mem;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which generation currently holds a key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Generation {
    Current,
    Backup,
}

struct Generations<K, V, S> {
    current: HashTable<K, V, S>,
    backup: HashTable<K, V, S>,
}

struct Inner<K, V, S> {
    generations: Mutex<Generations<K, V, S>>,
    minimum_capacity: u32,
    hasher: S,
}

impl<K, V, S> Inner<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    fn empty_table(&self) -> HashTable<K, V, S> {
        HashTable::with_capacity_and_hasher(self.minimum_capacity, self.hasher.clone())
    }

    fn rotate(&self) {
        let fresh = self.empty_table();
        let evicted = {
            let mut g = self.generations.lock();
            let demoted = mem::replace(&mut g.current, fresh);
            mem::replace(&mut g.backup, demoted)
        };
        // Evicted values are dropped after the lock is released.
        debug!(evicted = evicted.len(), "rotated generations");
    }
}

struct Rotation {
    scheduler: Arc<dyn Scheduler>,
    task: TaskId,
    window_ms: u32,
}

pub struct ExpiringMap<K, V, S = BytesHashBuilder> {
    inner: Arc<Inner<K, V, S>>,
    rotation: Mutex<Option<Rotation>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(MIN_CAPACITY, BytesHashBuilder)
    }

    pub fn with_capacity(minimum_capacity: u32) -> Self {
        Self::with_capacity_and_hasher(minimum_capacity, BytesHashBuilder)
    }
}

impl<K, V> Default for ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ExpiringMap<K, V, S> {
    /// Rotation window in milliseconds; 0 when rotation is disabled.
    pub fn window_ms(&self) -> u32 {
        self.rotation.lock().as_ref().map_or(0, |r| r.window_ms)
    }

    pub fn is_rotating(&self) -> bool {
        self.rotation.lock().is_some()
    }

    /// Deregisters the rotation task, waiting for an in-flight rotation to
    /// finish. Idempotent.
    pub fn cancel_rotation(&self) {
        let mut rotation = self.rotation.lock();
        Self::cancel_locked(&mut rotation);
    }

    fn cancel_locked(rotation: &mut Option<Rotation>) {
        if let Some(r) = rotation.take() {
            r.scheduler.cancel(r.task);
            info!(window_ms = r.window_ms, "rotation disabled");
        }
    }

    /// Entries across both generations.
    pub fn len(&self) -> usize {
        let g = self.inner.generations.lock();
        g.current.len() + g.backup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

impl<K, V, S> ExpiringMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(MIN_CAPACITY, hasher)
    }

    /// Both generations share `minimum_capacity` and a clone of `hasher`.
    pub fn with_capacity_and_hasher(minimum_capacity: u32, hasher: S) -> Self {
        let current = HashTable::with_capacity_and_hasher(minimum_capacity, hasher.clone());
        let backup = HashTable::with_capacity_and_hasher(minimum_capacity, hasher.clone());
        Self {
            inner: Arc::new(Inner {
                minimum_capacity: current.minimum_capacity(),
                generations: Mutex::new(Generations { current, backup }),
                hasher,
            }),
            rotation: Mutex::new(None),
        }
    }

    /// Demotes `current` to `backup` and discards the old `backup`. This is
    /// what the scheduled task runs every window.
    pub fn rotate(&self) {
        self.inner.rotate();
    }

    /// Stores `value` in the current generation, dropping any stale copy in
    /// the backup. Returns `Ok(true)` when the key was not already current.
    pub fn put(&self, key: K, value: V) -> Result<bool, InsertError> {
        // Displaced values are dropped once the guard is gone.
        let (_stale, _replaced, res) = {
            let mut guard = self.inner.generations.lock();
            let g = &mut *guard;
            let stale = g.backup.remove_entry(&key);
            match g.current.get_mut(&key) {
                Some(slot) => (stale, Some(mem::replace(slot, value)), Ok(false)),
                None => (stale, None, g.current.insert(key, value)),
            }
        };
        res
    }

    /// Removes `q` from both generations; returns whether anything was removed.
    pub fn remove<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let (in_current, in_backup) = {
            let mut g = self.inner.generations.lock();
            (g.current.remove_entry(q), g.backup.remove_entry(q))
        };
        in_current.is_some() || in_backup.is_some()
    }

    /// Drops every entry in both generations.
    pub fn clear(&self) {
        let (current, backup) = (self.inner.empty_table(), self.inner.empty_table());
        let _evicted = {
            let mut g = self.inner.generations.lock();
            (
                mem::replace(&mut g.current, current),
                mem::replace(&mut g.backup, backup),
            )
        };
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let g = self.inner.generations.lock();
        g.current.contains_key(q) || g.backup.contains_key(q)
    }

    pub fn generation_of<Q>(&self, q: &Q) -> Option<Generation>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let g = self.inner.generations.lock();
        if g.current.contains_key(q) {
            Some(Generation::Current)
        } else if g.backup.contains_key(q) {
            Some(Generation::Backup)
        } else {
            None
        }
    }

    /// Looks in `current`, then `backup`. A backup hit with `refresh` set is
    /// moved into `current`, renewing its lifetime. A backup hit without
    /// `refresh` stays where it is and is evicted at the next rotation.
    pub fn get<Q>(&self, q: &Q, refresh: bool) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let mut guard = self.inner.generations.lock();
        let g = &mut *guard;
        if let Some(v) = g.current.get(q) {
            return Some(v.clone());
        }
        if !refresh || g.current.ensure_allocated().is_err() {
            return g.backup.get(q).cloned();
        }
        let (key, value) = g.backup.remove_entry(q)?;
        let out = value.clone();
        if let Err(e) = g.current.insert(key, value) {
            warn!(error = %e, "refreshed entry dropped");
        }
        Some(out)
    }

    pub fn get_or_default<Q>(&self, q: &Q, default: V, refresh: bool) -> V
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        self.get(q, refresh).unwrap_or(default)
    }
}

impl<K, V, S> ExpiringMap<K, V, S>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Cancels any existing rotation, then, if `window_ms > 0`, registers a
    /// task that rotates every `window_ms` on `scheduler` (or on the
    /// process-wide default when `None`).
    ///
    /// With no scheduler available rotation stays disabled and
    /// `RotationError::MissingScheduler` is returned.
    pub fn configure(
        &self,
        window_ms: u32,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<(), RotationError> {
        let mut rotation = self.rotation.lock();
        Self::cancel_locked(&mut rotation);
        if window_ms == 0 {
            return Ok(());
        }
        let scheduler = scheduler
            .or_else(default_scheduler)
            .ok_or(RotationError::MissingScheduler)?;

        let weak = Arc::downgrade(&self.inner);
        let task: Task = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.rotate();
            }
        });
        let id = scheduler.schedule_repeating(Duration::from_millis(window_ms.into()), task)?;
        *rotation = Some(Rotation {
            scheduler,
            task: id,
            window_ms,
        });
        info!(window_ms, "rotation enabled");
        Ok(())
    }
}

impl<K, V, S> Drop for ExpiringMap<K, V, S> {
    fn drop(&mut self) {
        Self::cancel_locked(self.rotation.get_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScheduleError;

    /// Scheduler that only runs tasks when told to.
    #[derive(Default)]
    struct ManualScheduler {
        tasks: Mutex<Vec<(TaskId, Duration, Task)>>,
        next: Mutex<u64>,
        cancelled: Mutex<Vec<TaskId>>,
    }

    impl ManualScheduler {
        fn fire(&self) {
            let tasks: Vec<Task> = self.tasks.lock().iter().map(|(_, _, t)| t.clone()).collect();
            for t in tasks {
                t();
            }
        }

        fn periods(&self) -> Vec<Duration> {
            self.tasks.lock().iter().map(|(_, p, _)| *p).collect()
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule_repeating(
            &self,
            period: Duration,
            task: Task,
        ) -> Result<TaskId, ScheduleError> {
            let mut next = self.next.lock();
            let id = TaskId::new(*next);
            *next += 1;
            self.tasks.lock().push((id, period, task));
            Ok(id)
        }

        fn cancel(&self, id: TaskId) {
            self.tasks.lock().retain(|(t, _, _)| *t != id);
            self.cancelled.lock().push(id);
        }
    }

    fn map() -> ExpiringMap<String, i32> {
        ExpiringMap::new()
    }

    #[test]
    fn put_then_get_hits_current() {
        let m = map();
        assert_eq!(m.put("a".to_string(), 1), Ok(true));
        assert_eq!(m.get("a", false), Some(1));
        assert_eq!(m.generation_of("a"), Some(Generation::Current));
        assert_eq!(m.len(), 1);
    }

    /// Lifetime: one rotation demotes, a refreshing read promotes back,
    /// two untouched rotations evict.
    #[test]
    fn rotation_demotes_refresh_promotes_and_second_rotation_evicts() {
        let m = map();
        m.put("a".to_string(), 1).unwrap();
        m.rotate();
        assert_eq!(m.generation_of("a"), Some(Generation::Backup));
        assert_eq!(m.get("a", true), Some(1));
        assert_eq!(m.generation_of("a"), Some(Generation::Current));

        m.rotate();
        m.rotate();
        assert_eq!(m.get("a", false), None);
        assert!(!m.contains_key("a"));
        assert!(m.is_empty());
    }

    /// A read without refresh leaves the entry in backup, to be evicted next.
    #[test]
    fn get_without_refresh_does_not_extend_lifetime() {
        let m = map();
        m.put("a".to_string(), 1).unwrap();
        m.rotate();
        assert_eq!(m.get("a", false), Some(1));
        assert_eq!(m.generation_of("a"), Some(Generation::Backup));
        m.rotate();
        assert_eq!(m.get("a", false), None);
    }

    /// put drops a stale backup copy so it can never resurface.
    #[test]
    fn put_replaces_stale_backup_copy() {
        let m = map();
        m.put("a".to_string(), 1).unwrap();
        m.rotate();
        assert_eq!(m.put("a".to_string(), 2), Ok(true));
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("a", true), Some(2));
        m.rotate();
        assert_eq!(m.get("a", false), Some(2));
    }

    #[test]
    fn get_or_default_substitutes_on_miss() {
        let m = map();
        assert_eq!(m.get_or_default("x", 7, true), 7);
        m.put("x".to_string(), 3).unwrap();
        m.rotate();
        assert_eq!(m.get_or_default("x", 7, true), 3);
        assert_eq!(m.generation_of("x"), Some(Generation::Current));
    }

    #[test]
    fn remove_and_clear_cover_both_generations() {
        let m = map();
        m.put("old".to_string(), 1).unwrap();
        m.rotate();
        m.put("new".to_string(), 2).unwrap();
        assert!(m.remove("old"));
        assert!(!m.remove("old"));
        assert!(m.contains_key("new"));

        m.put("old".to_string(), 1).unwrap();
        m.rotate();
        m.put("newer".to_string(), 3).unwrap();
        assert_eq!(m.len(), 3);
        m.clear();
        assert!(m.is_empty());
        assert!(!m.contains_key("new"));
    }

    #[test]
    fn configure_registers_and_scheduled_task_rotates() {
        let s = Arc::new(ManualScheduler::default());
        let m = map();
        m.configure(100, Some(s.clone())).unwrap();
        assert!(m.is_rotating());
        assert_eq!(m.window_ms(), 100);
        assert_eq!(s.periods(), [Duration::from_millis(100)]);

        m.put("a".to_string(), 1).unwrap();
        s.fire();
        assert_eq!(m.generation_of("a"), Some(Generation::Backup));
        s.fire();
        assert_eq!(m.generation_of("a"), None);
    }

    #[test]
    fn reconfigure_cancels_previous_registration() {
        let s = Arc::new(ManualScheduler::default());
        let m = map();
        m.configure(100, Some(s.clone())).unwrap();
        m.configure(250, Some(s.clone())).unwrap();
        assert_eq!(s.periods(), [Duration::from_millis(250)]);
        assert_eq!(s.cancelled.lock().len(), 1);
        assert_eq!(m.window_ms(), 250);
    }

    #[test]
    fn zero_window_disables_rotation() {
        let s = Arc::new(ManualScheduler::default());
        let m = map();
        m.configure(100, Some(s.clone())).unwrap();
        m.configure(0, Some(s.clone())).unwrap();
        assert!(!m.is_rotating());
        assert_eq!(m.window_ms(), 0);
        assert!(s.periods().is_empty());
    }

    #[test]
    fn cancel_rotation_is_idempotent() {
        let s = Arc::new(ManualScheduler::default());
        let m = map();
        m.configure(50, Some(s.clone())).unwrap();
        m.cancel_rotation();
        m.cancel_rotation();
        assert_eq!(s.cancelled.lock().len(), 1);
        assert!(!m.is_rotating());
    }

    #[test]
    fn drop_deregisters_rotation() {
        let s = Arc::new(ManualScheduler::default());
        {
            let m = map();
            m.configure(50, Some(s.clone())).unwrap();
        }
        assert!(s.periods().is_empty());
        assert_eq!(s.cancelled.lock().len(), 1);
    }

    /// A task that outlives its map (no cancel) finds nothing to rotate.
    #[test]
    fn orphaned_task_is_harmless() {
        let s = Arc::new(ManualScheduler::default());
        let m = map();
        m.configure(50, Some(s.clone())).unwrap();
        let orphan: Vec<Task> = s.tasks.lock().iter().map(|(_, _, t)| t.clone()).collect();
        drop(m);
        for t in orphan {
            t();
        }
    }

    /// Records whether the generation lock was held when it was dropped.
    struct DropSpy {
        locked: Arc<dyn Fn() -> bool + Send + Sync>,
        seen: Arc<Mutex<Vec<bool>>>,
    }

    impl Drop for DropSpy {
        fn drop(&mut self) {
            let held = (self.locked)();
            self.seen.lock().push(held);
        }
    }

    #[test]
    fn values_drop_outside_generation_lock() {
        let m: Arc<ExpiringMap<String, DropSpy>> = Arc::new(ExpiringMap::new());
        let weak = Arc::downgrade(&m);
        let locked: Arc<dyn Fn() -> bool + Send + Sync> =
            Arc::new(move || weak.upgrade().is_some_and(|m| m.inner.generations.is_locked()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let spy = || DropSpy {
            locked: locked.clone(),
            seen: seen.clone(),
        };

        m.put("a".into(), spy()).unwrap();
        m.put("a".into(), spy()).unwrap(); // overwrite in current
        m.rotate();
        m.put("a".into(), spy()).unwrap(); // stale backup copy
        m.put("b".into(), spy()).unwrap();
        assert!(m.remove("b"));
        m.put("c".into(), spy()).unwrap();
        m.rotate();
        m.rotate(); // evicts a and c
        m.put("d".into(), spy()).unwrap();
        m.clear();

        let seen = seen.lock();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|held| !held), "dropped under lock: {seen:?}");
    }

    #[test]
    fn generations_share_minimum_capacity() {
        let m: ExpiringMap<u32, u32> = ExpiringMap::with_capacity(100);
        for i in 0..10 {
            m.put(i, i).unwrap();
        }
        m.rotate();
        let g = m.inner.generations.lock();
        assert_eq!(g.current.capacity(), 128);
        assert_eq!(g.backup.capacity(), 128);
        assert_eq!(g.backup.len(), 10);
    }
}
