//! A sequence-stamped reader/writer lock for index slots.
//!
//! Readers first try an optimistic pass: grab a stamp, do their reads, and
//! validate that no writer ran in between. Writers hold the inner write
//! lock for mutual exclusion and bump the stamp to odd on entry and back to
//! even on exit, so an optimistic reader that overlaps any part of a write
//! sees either an odd stamp or a changed one and falls back to the real
//! read lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{fence, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StampedLock {
    stamp: AtomicU64,
    lock: RwLock<()>,
}

impl StampedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin an optimistic read. Returns `None` while a writer is active.
    pub fn optimistic(&self) -> Option<u64> {
        let stamp = self.stamp.load(Ordering::Acquire);
        (stamp & 1 == 0).then_some(stamp)
    }

    /// True if no writer ran since the matching [`Self::optimistic`] call;
    /// the caller's reads are then consistent.
    pub fn validate(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        self.stamp.load(Ordering::Relaxed) == stamp
    }

    /// Pessimistic read lock; blocks out writers.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Exclusive write lock. The stamp stays odd for the guard's lifetime.
    pub fn write(&self) -> StampedWriteGuard<'_> {
        let guard = self.lock.write();
        self.stamp.fetch_add(1, Ordering::Release);
        StampedWriteGuard { stamp: &self.stamp, _guard: guard }
    }
}

pub struct StampedWriteGuard<'a> {
    stamp: &'a AtomicU64,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for StampedWriteGuard<'_> {
    fn drop(&mut self) {
        self.stamp.fetch_add(1, Ordering::Release);
    }
}
