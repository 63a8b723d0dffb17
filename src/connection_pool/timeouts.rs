// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;

// Smallest step used to resolve two entries landing on the same instant.
const COLLISION_STEP: Duration = Duration::from_nanos(1);

/// Idle connections ordered by the instant they become eligible for eviction.
///
/// Inserts and targeted removals run concurrently under the read lock; popping
/// the earliest entry takes the write lock so that a popped entry and the
/// deadline stored on its value are observed together.
pub(crate) struct TimeoutIndex<V> {
    entries: RwLock<SkipMap<Instant, Arc<V>>>,
}

impl<V> TimeoutIndex<V>
where
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        TimeoutIndex {
            entries: RwLock::new(SkipMap::new()),
        }
    }

    /// Insert `value` at `deadline`, advancing past occupied instants. The
    /// final deadline is handed to `record` before the read lock is dropped
    /// and is returned.
    pub(crate) fn insert<F>(
        &self,
        mut deadline: Instant,
        value: &Arc<V>,
        record: F,
    ) -> Instant
    where
        F: FnOnce(Instant),
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        loop {
            let entry = entries.get_or_insert(deadline, Arc::clone(value));
            if Arc::ptr_eq(entry.value(), value) {
                break;
            }
            deadline += COLLISION_STEP;
        }
        record(deadline);
        deadline
    }

    /// Remove the entry at `deadline` if `matches` accepts its value.
    pub(crate) fn remove<F>(&self, deadline: Instant, matches: F) -> bool
    where
        F: Fn(&V) -> bool,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let removed = match entries.get(&deadline) {
            Some(entry) if matches(entry.value()) => entry.remove(),
            _ => false,
        };
        removed
    }

    /// Pop the earliest entry if its deadline is at or before `now`.
    pub(crate) fn pop_expired(&self, now: Instant) -> Option<(Instant, Arc<V>)> {
        let entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let front = entries.front()?;
        if *front.key() > now {
            return None;
        }
        let popped = (*front.key(), Arc::clone(front.value()));
        front.remove();
        Some(popped)
    }

    /// Pop the earliest entry regardless of its deadline.
    pub(crate) fn pop_nearest(&self) -> Option<(Instant, Arc<V>)> {
        let entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .pop_front()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear()
    }
}
