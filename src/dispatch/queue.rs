//! Delayed-dispatch queue state.
//!
//! Two lanes of time-ordered entries: the sync lane, which can be held
//! back by barriers, and the barrier-exempt lane. Entries are ordered by
//! due time with a monotonic sequence as the FIFO tiebreak for equal
//! delays. Removal by token is tombstone-based: removed tokens are
//! skipped when they surface at the top of a lane.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use super::Job;

pub(super) struct Entry {
    pub(super) due: Instant,
    pub(super) seq: u64,
    pub(super) token: u64,
    pub(super) job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and we want the earliest entry
    // on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of asking the queue what to do next.
pub(super) enum Selection {
    /// Run this entry now.
    Run(Entry),
    /// Nothing due yet; sleep until this instant.
    WaitUntil(Instant),
    /// Nothing eligible at all; sleep until woken.
    Idle,
}

#[derive(Default)]
pub(super) struct QueueState {
    sync_lane: BinaryHeap<Entry>,
    exempt_lane: BinaryHeap<Entry>,
    /// Tokens of entries currently sitting in a lane.
    pending: HashSet<u64>,
    /// Tokens removed before firing; skipped at pop time.
    removed: HashSet<u64>,
    /// Active sync barriers; while non-empty the sync lane is gated.
    barriers: HashSet<u64>,
    next_seq: u64,
    pub(super) closed: bool,
}

impl QueueState {
    pub(super) fn push(&mut self, due: Instant, token: u64, exempt: bool, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(token);
        let entry = Entry {
            due,
            seq,
            token,
            job,
        };
        if exempt {
            self.exempt_lane.push(entry);
        } else {
            self.sync_lane.push(entry);
        }
    }

    /// Removes a not-yet-fired entry by token. Returns whether the
    /// token was pending.
    pub(super) fn remove(&mut self, token: u64) -> bool {
        if self.pending.remove(&token) {
            self.removed.insert(token);
            true
        } else {
            false
        }
    }

    pub(super) fn push_barrier(&mut self, token: u64) {
        self.barriers.insert(token);
    }

    pub(super) fn remove_barrier(&mut self, token: u64) -> bool {
        self.barriers.remove(&token)
    }

    pub(super) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Picks the next action for the dispatcher thread.
    pub(super) fn select(&mut self, now: Instant) -> Selection {
        Self::prune(&mut self.exempt_lane, &mut self.removed);
        Self::prune(&mut self.sync_lane, &mut self.removed);

        let sync_gated = !self.barriers.is_empty();
        let sync_key = if sync_gated {
            None
        } else {
            self.sync_lane.peek().map(|e| (e.due, e.seq))
        };
        let exempt_key = self.exempt_lane.peek().map(|e| (e.due, e.seq));

        let from_exempt = match (exempt_key, sync_key) {
            (None, None) => return Selection::Idle,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(e), Some(s)) => e <= s,
        };
        let lane = if from_exempt {
            &mut self.exempt_lane
        } else {
            &mut self.sync_lane
        };
        match lane.peek() {
            Some(top) if top.due <= now => match lane.pop() {
                Some(entry) => {
                    self.pending.remove(&entry.token);
                    Selection::Run(entry)
                }
                None => Selection::Idle,
            },
            Some(top) => Selection::WaitUntil(top.due),
            None => Selection::Idle,
        }
    }

    fn prune(lane: &mut BinaryHeap<Entry>, removed: &mut HashSet<u64>) {
        while let Some(top) = lane.peek() {
            if removed.remove(&top.token) {
                lane.pop();
            } else {
                break;
            }
        }
    }
}
