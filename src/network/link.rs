use std::collections::VecDeque;

use crate::eventq::{Cycle, NodeId};
use crate::network::flit::{Credit, Flit};

/// Fixed-latency point-to-point channel.  The link itself is passive; a
/// sender pushes an item stamped with its arrival tick and schedules the
/// consuming node for that tick, and the consumer drains whatever has
/// arrived by the current tick.
#[derive(Debug)]
pub struct TimedLink<T> {
    pub id: usize,
    pub latency: Cycle,
    /// Node woken to drain this link.
    pub dest_node: NodeId,
    queue: VecDeque<(Cycle, T)>,
}

pub type NetworkLink = TimedLink<Flit>;
pub type CreditLink = TimedLink<Credit>;

impl<T> TimedLink<T> {
    pub fn new(id: usize, latency: Cycle, dest_node: NodeId) -> Self {
        assert!(latency >= 1, "link latency must be at least one cycle");
        Self {
            id,
            latency,
            dest_node,
            queue: VecDeque::new(),
        }
    }

    /// Returns the arrival tick; the caller schedules `dest_node` for it.
    pub fn push(&mut self, item: T, now: Cycle) -> Cycle {
        let arrival = now + self.latency;
        if let Some(&(last, _)) = self.queue.back() {
            assert!(last <= arrival, "link arrivals must stay monotonic");
        }
        self.queue.push_back((arrival, item));
        arrival
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        self.queue.front().map_or(false, |&(at, _)| at <= now)
    }

    pub fn peek(&self, now: Cycle) -> Option<&T> {
        self.queue.front().filter(|&&(at, _)| at <= now).map(|(_, item)| item)
    }

    pub fn consume(&mut self, now: Cycle) -> T {
        let (at, item) = self.queue.pop_front().expect("consume on empty link");
        assert!(at <= now, "consume before arrival tick");
        item
    }

    pub fn next_arrival(&self) -> Option<Cycle> {
        self.queue.front().map(|&(at, _)| at)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Everything in flight, regardless of arrival tick.
    pub fn iter_queued(&self) -> impl Iterator<Item = &T> {
        self.queue.iter().map(|(_, item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_respects_latency_and_order() {
        let mut link: TimedLink<u32> = TimedLink::new(0, 2, NodeId::Router(1));
        assert_eq!(link.push(10, 5), 7);
        assert_eq!(link.push(11, 6), 8);
        assert!(!link.is_ready(6));
        assert!(link.is_ready(7));
        assert_eq!(link.consume(7), 10);
        assert!(!link.is_ready(7));
        assert_eq!(link.consume(8), 11);
        assert!(link.is_empty());
    }

    #[test]
    #[should_panic(expected = "consume before arrival")]
    fn early_consume_is_a_bug() {
        let mut link: TimedLink<u32> = TimedLink::new(0, 3, NodeId::Ni(0));
        link.push(1, 0);
        link.consume(2);
    }
}
