// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    time::Instant,
};

use tracing::{debug, info};

use super::events::{CollapseTable, EventKind, Outcome};

/// One pending filesystem event awaiting its deadline.
///
/// Only `kind` mutates after creation: to the merged kind when a newer
/// event collapses into this one, or to `EventKind::None` when the
/// delay is cancelled.
#[derive(Debug, Clone)]
pub struct Delay {
    pub kind: EventKind,
    /// Path relative to the origin's source root.
    pub path: PathBuf,
    /// Destination path for move events.
    pub path2: Option<PathBuf>,
    pub deadline: Instant,
    // Insertion counter, assigned by the queue. Doubles as the
    // priority and as the address for in-place kind rewrites.
    seq: u64,
}

impl Delay {
    pub fn new(kind: EventKind, path: PathBuf, path2: Option<PathBuf>, deadline: Instant) -> Delay {
        Delay { kind, path, path2, deadline, seq: 0 }
    }
}

/// Per-origin schedule of pending events.
///
/// Dual structure: a sequence ordered by insertion (head is
/// next-to-fire) and a path index used for coalescing. The index maps
/// each path to the seq of the *oldest* live delay on it; stacked
/// newer delays on the same path are findable only by scanning the
/// sequence.
#[derive(Debug, Default)]
pub struct DelayQueue {
    queue: VecDeque<Delay>,
    index: HashMap<PathBuf, u64>,
    next_seq: u64,
    live: usize,
}

impl DelayQueue {
    pub fn new() -> DelayQueue {
        DelayQueue::default()
    }

    /// Number of live (non-tombstoned) delays.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.index.clear();
        self.live = 0;
    }

    /// Accept one event, coalescing against any pending delay on the
    /// same path according to `table`.
    pub fn insert(
        &mut self,
        kind: EventKind,
        deadline: Instant,
        path: PathBuf,
        path2: Option<PathBuf>,
        table: &CollapseTable,
    ) {
        assert!(kind != EventKind::None, "tombstones cannot be enqueued");

        let Some(old_seq) = self.index.get(&path).copied() else {
            debug!(kind = %kind, path = %path.display(), "delaying new event");
            self.push(kind, deadline, path, path2, true);
            return;
        };

        let pos = self
            .position(old_seq)
            .expect("index entries always point at a queued delay");
        let old_kind = self.queue[pos].kind;

        if kind.is_move() || old_kind.is_move() {
            // Moves keep their pairing; both events stay queued and the
            // index keeps pointing at the older one.
            info!(
                old = %old_kind, new = %kind, path = %path.display(),
                "stacking move event on busy path"
            );
            self.push(kind, deadline, path, path2, false);
            return;
        }

        match table.lookup(old_kind, kind) {
            Outcome::Cancel => {
                debug!(
                    old = %old_kind, new = %kind, path = %path.display(),
                    "events void each other, dropping both"
                );
                self.queue[pos].kind = EventKind::None;
                self.index.remove(&path);
                self.live -= 1;
            }
            Outcome::Stack => {
                debug!(
                    old = %old_kind, new = %kind, path = %path.display(),
                    "stacking event on busy path"
                );
                self.push(kind, deadline, path, path2, false);
            }
            Outcome::Replace(merged) => {
                debug!(
                    old = %old_kind, new = %kind, merged = %merged,
                    path = %path.display(),
                    "collapsing event into pending delay"
                );
                self.queue[pos].kind = merged;
            }
        }
    }

    /// The next delay to fire, if any.
    pub fn head(&self) -> Option<&Delay> {
        self.queue.iter().find(|d| d.kind != EventKind::None)
    }

    /// Remove and return the next delay to fire, discarding any
    /// leading tombstones.
    pub fn pop_head(&mut self) -> Option<Delay> {
        while let Some(delay) = self.queue.pop_front() {
            if delay.kind == EventKind::None {
                continue;
            }
            if self.index.get(&delay.path) == Some(&delay.seq) {
                self.index.remove(&delay.path);
            }
            self.live -= 1;
            return Some(delay);
        }
        None
    }

    /// Live delays in firing order, for status reporting.
    pub fn iter(&self) -> impl Iterator<Item = &Delay> {
        self.queue.iter().filter(|d| d.kind != EventKind::None)
    }

    fn push(
        &mut self,
        kind: EventKind,
        deadline: Instant,
        path: PathBuf,
        path2: Option<PathBuf>,
        index: bool,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if index {
            self.index.insert(path.clone(), seq);
        }
        self.queue.push_back(Delay { kind, path, path2, deadline, seq });
        self.live += 1;
    }

    // The queue is ordered by seq, so an indexed delay is found by
    // binary search.
    fn position(&self, seq: u64) -> Option<usize> {
        self.queue.binary_search_by_key(&seq, |d| d.seq).ok()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.live, self.queue.iter().filter(|d| d.kind != EventKind::None).count());
        for window in self.queue.as_slices().0.windows(2) {
            assert!(window[0].seq < window[1].seq, "queue out of insertion order");
        }
        for (path, seq) in self.index.iter() {
            let pos = self.position(*seq).expect("index entry points at a queued delay");
            assert_eq!(&self.queue[pos].path, path);
            assert!(self.queue[pos].kind != EventKind::None, "index entry points at tombstone");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn base() -> Instant {
        Instant::now()
    }

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    fn insert(q: &mut DelayQueue, kind: EventKind, at: Instant, path: &str) {
        q.insert(kind, at, p(path), None, &CollapseTable::default());
        q.assert_consistent();
    }

    #[test]
    fn create_then_delete_cancels() {
        let now = base();
        let mut q = DelayQueue::new();
        insert(&mut q, EventKind::Create, now, "a/x");
        insert(&mut q, EventKind::Delete, now, "a/x");
        assert!(q.is_empty());
        assert!(q.head().is_none());
        assert!(q.pop_head().is_none());
    }

    #[test]
    fn create_then_modify_stays_create_with_old_deadline() {
        let now = base();
        let later = now + Duration::from_secs(3);
        let mut q = DelayQueue::new();
        insert(&mut q, EventKind::Create, now, "a/x");
        insert(&mut q, EventKind::Modify, later, "a/x");
        assert_eq!(q.len(), 1);
        let head = q.head().unwrap();
        assert_eq!(head.kind, EventKind::Create);
        assert_eq!(head.deadline, now);
    }

    #[test]
    fn delete_then_create_becomes_modify() {
        let now = base();
        let mut q = DelayQueue::new();
        insert(&mut q, EventKind::Delete, now, "a/x");
        insert(&mut q, EventKind::Create, now, "a/x");
        assert_eq!(q.len(), 1);
        assert_eq!(q.head().unwrap().kind, EventKind::Modify);
    }

    #[test]
    fn collapse_is_involutive() {
        // collapsing X then Y then Y' gives the same queue as starting
        // from the merged kind and applying Y'
        let now = base();

        let mut chained = DelayQueue::new();
        insert(&mut chained, EventKind::Delete, now, "a/x");
        insert(&mut chained, EventKind::Create, now, "a/x"); // -> Modify
        insert(&mut chained, EventKind::Attrib, now, "a/x");

        let mut direct = DelayQueue::new();
        insert(&mut direct, EventKind::Modify, now, "a/x");
        insert(&mut direct, EventKind::Attrib, now, "a/x");

        assert_eq!(chained.len(), direct.len());
        assert_eq!(chained.head().unwrap().kind, direct.head().unwrap().kind);
    }

    #[test]
    fn distinct_paths_do_not_interact() {
        let now = base();
        let mut q = DelayQueue::new();
        insert(&mut q, EventKind::Create, now, "a/x");
        insert(&mut q, EventKind::Delete, now, "a/y");
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_head().unwrap().path, p("a/x"));
        assert_eq!(q.pop_head().unwrap().path, p("a/y"));
    }

    #[test]
    fn moves_stack_instead_of_collapsing() {
        let now = base();
        let mut q = DelayQueue::new();
        q.insert(
            EventKind::MoveFrom,
            now,
            p("a/x"),
            None,
            &CollapseTable::default(),
        );
        insert(&mut q, EventKind::Modify, now, "a/x");
        assert_eq!(q.len(), 2, "modify after a move must not collapse");

        let first = q.pop_head().unwrap();
        assert_eq!(first.kind, EventKind::MoveFrom);
        let second = q.pop_head().unwrap();
        assert_eq!(second.kind, EventKind::Modify);
    }

    #[test]
    fn cancelled_delay_never_surfaces_again() {
        let now = base();
        let mut q = DelayQueue::new();
        insert(&mut q, EventKind::Create, now, "a/x");
        insert(&mut q, EventKind::Modify, now, "a/y");
        insert(&mut q, EventKind::Delete, now, "a/x"); // cancels a/x
        // a/x was older than a/y but is gone; only a/y remains
        assert_eq!(q.head().unwrap().path, p("a/y"));
        let popped = q.pop_head().unwrap();
        assert_eq!(popped.path, p("a/y"));
        assert!(q.pop_head().is_none());
    }

    #[test]
    fn pops_come_out_in_insertion_order() {
        let now = base();
        let mut q = DelayQueue::new();
        for (i, path) in ["a", "b", "c", "d"].iter().enumerate() {
            insert(&mut q, EventKind::Modify, now + Duration::from_millis(i as u64), path);
        }
        let mut order = Vec::new();
        while let Some(d) = q.pop_head() {
            order.push(d.path);
        }
        assert_eq!(order, vec![p("a"), p("b"), p("c"), p("d")]);
    }

    #[test]
    fn fresh_event_after_cancel_starts_over() {
        let now = base();
        let mut q = DelayQueue::new();
        insert(&mut q, EventKind::Create, now, "a/x");
        insert(&mut q, EventKind::Delete, now, "a/x"); // cancel
        insert(&mut q, EventKind::Create, now, "a/x");
        assert_eq!(q.len(), 1);
        assert_eq!(q.head().unwrap().kind, EventKind::Create);
    }
}
