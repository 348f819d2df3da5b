/*
Wakeup scheduling for the network model.

The simulator kernel proper (clock domains, the global event loop) lives in
sim::top; the network components only ever ask for "wake me at tick T" and
"is anything pending".  EventQueue deduplicates registrations, so a node
asking twice for the same tick is woken once.

DelayedQueue is the companion utility for state mutations that must land a
fixed number of cycles in the future (for example the timed release of a
prepush-filter registration): push the payload with its due tick, drain
everything due at each wakeup.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

pub type Cycle = u64;

/// Identifies a wakeup consumer inside one network instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Router(usize),
    Ni(usize),
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<(Cycle, NodeId)>>,
    scheduled: HashSet<(Cycle, NodeId)>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wakeup for `node` at absolute tick `at`.  Idempotent: a
    /// (tick, node) pair already in the queue is not duplicated.
    pub fn schedule_at(&mut self, node: NodeId, at: Cycle) {
        if self.scheduled.insert((at, node)) {
            self.heap.push(Reverse((at, node)));
        }
    }

    pub fn schedule_in(&mut self, node: NodeId, now: Cycle, delta: Cycle) {
        self.schedule_at(node, now + delta);
    }

    pub fn is_scheduled(&self, node: NodeId, at: Cycle) -> bool {
        self.scheduled.contains(&(at, node))
    }

    pub fn next_tick(&self) -> Option<Cycle> {
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove and return every node due at or before `now`, in tick order.
    /// Wakeups scheduled strictly in the past are delivered too; components
    /// treat them as "due now".
    pub fn take_due(&mut self, now: Cycle) -> Vec<NodeId> {
        let mut due = Vec::new();
        while let Some(Reverse((t, node))) = self.heap.peek().copied() {
            if t > now {
                break;
            }
            self.heap.pop();
            self.scheduled.remove(&(t, node));
            due.push(node);
        }
        due
    }
}

/// Time-ordered queue of pending mutations, drained at each wakeup.
#[derive(Debug)]
pub struct DelayedQueue<T> {
    seq: u64,
    heap: BinaryHeap<Reverse<(Cycle, u64)>>,
    entries: Vec<Option<(Cycle, u64, T)>>,
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self {
            seq: 0,
            heap: BinaryHeap::new(),
            entries: Vec::new(),
        }
    }
}

impl<T> DelayedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_at(&mut self, due: Cycle, payload: T) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse((due, seq)));
        self.entries.push(Some((due, seq, payload)));
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn next_due(&self) -> Option<Cycle> {
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove every payload due at or before `now`, oldest first.
    pub fn drain_due(&mut self, now: Cycle) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(Reverse((due, seq))) = self.heap.peek().copied() {
            if due > now {
                break;
            }
            self.heap.pop();
            let slot = self
                .entries
                .iter_mut()
                .find(|e| matches!(e, Some((d, s, _)) if *d == due && *s == seq))
                .expect("delayed entry missing for heap key");
            let (_, _, payload) = slot.take().expect("delayed entry already drained");
            out.push(payload);
        }
        if self.heap.is_empty() {
            self.entries.clear();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_idempotent_per_tick() {
        let mut q = EventQueue::new();
        q.schedule_at(NodeId::Router(0), 5);
        q.schedule_at(NodeId::Router(0), 5);
        q.schedule_in(NodeId::Router(0), 5, 1);
        assert!(q.is_scheduled(NodeId::Router(0), 5));
        assert!(q.is_scheduled(NodeId::Router(0), 6));
        assert_eq!(q.take_due(5), vec![NodeId::Router(0)]);
        assert!(!q.is_scheduled(NodeId::Router(0), 5));
        assert_eq!(q.take_due(6), vec![NodeId::Router(0)]);
        assert!(q.is_empty());
    }

    #[test]
    fn take_due_returns_in_tick_order() {
        let mut q = EventQueue::new();
        q.schedule_at(NodeId::Ni(1), 9);
        q.schedule_at(NodeId::Router(2), 3);
        q.schedule_at(NodeId::Router(1), 7);
        let due = q.take_due(10);
        assert_eq!(
            due,
            vec![NodeId::Router(2), NodeId::Router(1), NodeId::Ni(1)]
        );
    }

    #[test]
    fn future_events_stay_queued() {
        let mut q = EventQueue::new();
        q.schedule_at(NodeId::Router(0), 4);
        assert!(q.take_due(3).is_empty());
        assert_eq!(q.next_tick(), Some(4));
    }

    #[test]
    fn delayed_queue_drains_in_time_order() {
        let mut d = DelayedQueue::new();
        d.push_at(8, "late");
        d.push_at(2, "early");
        d.push_at(8, "late2");
        assert_eq!(d.drain_due(1), Vec::<&str>::new());
        assert_eq!(d.drain_due(2), vec!["early"]);
        // same-tick entries come back in push order
        assert_eq!(d.drain_due(9), vec!["late", "late2"]);
        assert!(d.is_empty());
    }
}
