//! In-memory queue of jobs whose due time has arrived (or is about to).
//!
//! Entries are a transient projection of job records; the store remains the
//! single source of truth and the queue is rebuilt from polling after a
//! restart. Ordering is deterministic: the `Immediate` band first, then
//! earliest scheduled time, then higher priority, then insertion order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::schema::Priority;

/// Lightweight projection of a job record awaiting a free worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub(crate) id: i64,
    pub(crate) priority: Priority,
    pub(crate) scheduled_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedEntry {
    entry: ReadyEntry,
    seq: u64,
}

impl Ord for QueuedEntry {
    // `BinaryHeap` is a max-heap, so "greater" means "popped first".
    fn cmp(&self, other: &Self) -> Ordering {
        let immediate = |e: &QueuedEntry| e.entry.priority == Priority::Immediate;
        immediate(self)
            .cmp(&immediate(other))
            .then_with(|| other.entry.scheduled_at.cmp(&self.entry.scheduled_at))
            .then_with(|| self.entry.priority.cmp(&other.entry.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<QueuedEntry>,
    queued_ids: HashSet<i64>,
    next_seq: u64,
}

/// Shared, non-blocking ready queue. Emptiness is a normal, frequent
/// condition; only intra-process synchronization is needed since the store's
/// locking primitive is the authority across processes.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    inner: Mutex<Inner>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an entry. Returns `false` if the job is already queued; the
    /// polling scheduler re-lists due jobs every tick, so duplicates are
    /// expected and dropped here.
    pub(crate) fn push(&self, entry: ReadyEntry) -> bool {
        let mut inner = self.locked();
        if !inner.queued_ids.insert(entry.id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedEntry { entry, seq });
        true
    }

    /// Pop the highest-ranked entry if its scheduled time has arrived,
    /// otherwise return `None` without side effect.
    pub(crate) fn pop_ready(&self, now: DateTime<Utc>) -> Option<ReadyEntry> {
        let mut inner = self.locked();
        let due = inner
            .heap
            .peek()
            .is_some_and(|queued| queued.entry.scheduled_at <= now);
        if !due {
            return None;
        }
        let queued = inner.heap.pop()?;
        inner.queued_ids.remove(&queued.entry.id);
        Some(queued.entry)
    }

    /// The highest-ranked entry, due or not.
    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<ReadyEntry> {
        self.locked().heap.peek().map(|queued| queued.entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.locked().heap.len()
    }
}
