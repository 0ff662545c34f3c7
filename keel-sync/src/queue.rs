//! Shared work queue for one wave.
//!
//! Workers pull jobs; deletion can cancel jobs that have not started yet.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use keel_core::UnitId;

#[derive(Debug)]
struct Inner<T> {
    pending: VecDeque<(UnitId, T)>,
    in_flight: BTreeSet<UnitId>,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                in_flight: BTreeSet::new(),
            }),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `job` unless `id` is already queued or running.
    pub fn push(&self, id: UnitId, job: T) -> bool {
        let mut inner = self.lock();
        if inner.in_flight.contains(&id) || inner.pending.iter().any(|(q, _)| q == &id) {
            return false;
        }
        inner.pending.push_back((id, job));
        true
    }

    /// Take the next job and mark it in flight.
    pub fn pop(&self) -> Option<(UnitId, T)> {
        let mut inner = self.lock();
        let (id, job) = inner.pending.pop_front()?;
        inner.in_flight.insert(id.clone());
        Some((id, job))
    }

    pub fn finish(&self, id: &UnitId) {
        self.lock().in_flight.remove(id);
    }

    /// Drop queued jobs for any of `ids`. Returns the ids that were dropped.
    /// In-flight jobs are left to complete.
    pub fn cancel(&self, ids: &BTreeSet<UnitId>) -> Vec<UnitId> {
        let mut inner = self.lock();
        let mut cancelled = Vec::new();
        inner.pending.retain(|(id, _)| {
            if ids.contains(id) {
                cancelled.push(id.clone());
                false
            } else {
                true
            }
        });
        cancelled
    }

    pub fn is_in_flight(&self, id: &UnitId) -> bool {
        self.lock().in_flight.contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}
