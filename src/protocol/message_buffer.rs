use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use log::debug;

use crate::eventq::Cycle;
use crate::protocol::message::{read_msg, write_msg, MsgRef};

struct QueuedMsg {
    ready: Cycle,
    seq: u64,
    msg: MsgRef,
}

impl PartialEq for QueuedMsg {
    fn eq(&self, other: &Self) -> bool {
        self.ready == other.ready && self.seq == other.seq
    }
}

impl Eq for QueuedMsg {}

impl PartialOrd for QueuedMsg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMsg {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest-ready, oldest
        // message surfaces first.
        (other.ready, other.seq).cmp(&(self.ready, self.seq))
    }
}

/// Priority-ordered protocol message queue at the network boundary.
///
/// Messages become visible `delay` cycles after enqueue and are delivered in
/// (ready tick, enqueue order).  A receiver that cannot currently process the
/// head may `stall` it per line address and `reanalyze` the stalled set later,
/// and duplicate outstanding read requests to one line are coalesced instead
/// of queued twice.
pub struct MessageBuffer {
    heap: BinaryHeap<QueuedMsg>,
    stalled: HashMap<u64, Vec<MsgRef>>,
    seq: u64,
    /// 0 means unbounded.
    capacity: usize,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            stalled: HashMap::new(),
            seq: 0,
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn slots_used(&self) -> usize {
        self.heap.len() + self.stalled.values().map(Vec::len).sum::<usize>()
    }

    pub fn are_n_slots_available(&self, n: usize, _now: Cycle) -> bool {
        self.capacity == 0 || self.slots_used() + n <= self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty() && self.stalled.is_empty()
    }

    /// Callers guarantee capacity via `are_n_slots_available`; violating that
    /// is a protocol bug, not a runtime condition.
    pub fn enqueue(&mut self, msg: MsgRef, now: Cycle, delay: Cycle) {
        assert!(
            self.are_n_slots_available(1, now),
            "message buffer overrun ({} slots)",
            self.capacity
        );
        write_msg(&msg).enqueue_time = now;
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(QueuedMsg {
            ready: now + delay,
            seq,
            msg,
        });
    }

    /// Enqueue a read request, coalescing it into an already-queued read for
    /// the same line instead of duplicating it.  Returns true if coalesced.
    pub fn enqueue_read_coalescing(&mut self, msg: MsgRef, now: Cycle, delay: Cycle) -> bool {
        let (addr, requestor) = {
            let m = read_msg(&msg);
            assert!(m.is_read_request(), "coalescing is defined for reads only");
            (m.line_addr, m.requestor)
        };
        for queued in self.heap.iter() {
            let mut q = write_msg(&queued.msg);
            if q.is_read_request() && q.line_addr == addr {
                q.demand_dest.add(requestor);
                debug!(
                    "coalesced read for {:#x} from {} into outstanding request",
                    addr, requestor
                );
                return true;
            }
        }
        self.enqueue(msg, now, delay);
        false
    }

    /// Earliest tick at which the head becomes deliverable.
    pub fn next_ready_at(&self) -> Option<Cycle> {
        self.heap.peek().map(|q| q.ready)
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        self.heap.peek().map_or(false, |q| q.ready <= now)
    }

    pub fn peek(&self, now: Cycle) -> Option<&MsgRef> {
        self.heap
            .peek()
            .filter(|q| q.ready <= now)
            .map(|q| &q.msg)
    }

    pub fn dequeue(&mut self, now: Cycle) -> MsgRef {
        let head = self.heap.pop().expect("dequeue from empty message buffer");
        assert!(head.ready <= now, "dequeue of a not-yet-ready message");
        head.msg
    }

    /// Move the head message into the per-address stall pool.
    pub fn stall(&mut self, now: Cycle) {
        let msg = self.dequeue(now);
        let addr = read_msg(&msg).line_addr;
        self.stalled.entry(addr).or_default().push(msg);
    }

    pub fn stalled_count(&self, addr: u64) -> usize {
        self.stalled.get(&addr).map_or(0, Vec::len)
    }

    /// Requeue every message stalled on `addr`, ready immediately and ahead
    /// of same-tick arrivals in their original stall order.
    pub fn reanalyze(&mut self, addr: u64, now: Cycle) {
        let Some(msgs) = self.stalled.remove(&addr) else {
            return;
        };
        for msg in msgs {
            let seq = self.seq;
            self.seq += 1;
            self.heap.push(QueuedMsg {
                ready: now,
                seq,
                msg,
            });
        }
    }

    /// Remove queued (not stalled) messages matching the predicate.  Used by
    /// the interface-level prepush filter to purge requests a just-arrived
    /// prepush makes redundant.
    pub fn purge_matching<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&crate::protocol::message::Message) -> bool,
    {
        let drained = std::mem::take(&mut self.heap);
        let mut removed = 0;
        for queued in drained.into_iter() {
            if pred(&read_msg(&queued.msg)) {
                removed += 1;
            } else {
                self.heap.push(queued);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{msg_ref, Message, MsgKind};
    use crate::protocol::net_dest::{MachineId, NetDest};

    fn read_req(addr: u64, who: u32) -> MsgRef {
        let requestor = MachineId::core(who);
        let mut m = Message::new(
            MsgKind::ReadRequest,
            addr,
            requestor,
            NetDest::single(MachineId::llc(0)),
            8,
            0,
        );
        m.demand_dest = NetDest::single(requestor);
        msg_ref(m)
    }

    #[test]
    fn delivers_in_ready_then_fifo_order() {
        let mut buf = MessageBuffer::unbounded();
        buf.enqueue(read_req(0x100, 0), 0, 3);
        buf.enqueue(read_req(0x140, 1), 0, 1);
        assert!(!buf.is_ready(0));
        assert!(buf.is_ready(1));
        assert_eq!(read_msg(&buf.dequeue(1)).line_addr, 0x140);
        assert!(!buf.is_ready(2));
        assert_eq!(read_msg(&buf.dequeue(3)).line_addr, 0x100);
    }

    #[test]
    fn capacity_accounting_includes_stalled() {
        let mut buf = MessageBuffer::new(2);
        buf.enqueue(read_req(0x100, 0), 0, 0);
        buf.stall(0);
        assert!(buf.are_n_slots_available(1, 0));
        buf.enqueue(read_req(0x140, 1), 0, 0);
        assert!(!buf.are_n_slots_available(1, 0));
    }

    #[test]
    fn stall_and_reanalyze_restores_order() {
        let mut buf = MessageBuffer::unbounded();
        buf.enqueue(read_req(0x100, 0), 0, 0);
        buf.enqueue(read_req(0x100, 1), 0, 0);
        buf.stall(0);
        buf.stall(0);
        assert!(!buf.is_empty());
        assert_eq!(buf.stalled_count(0x100), 2);
        assert!(!buf.is_ready(5));

        buf.reanalyze(0x100, 5);
        assert_eq!(read_msg(&buf.dequeue(5)).requestor, MachineId::core(0));
        assert_eq!(read_msg(&buf.dequeue(5)).requestor, MachineId::core(1));
    }

    #[test]
    fn duplicate_reads_coalesce() {
        let mut buf = MessageBuffer::unbounded();
        assert!(!buf.enqueue_read_coalescing(read_req(0x200, 0), 0, 0));
        assert!(buf.enqueue_read_coalescing(read_req(0x200, 1), 0, 0));
        assert_eq!(buf.len(), 1);
        let merged = buf.dequeue(0);
        let m = read_msg(&merged);
        assert!(m.demand_dest.contains(MachineId::core(0)));
        assert!(m.demand_dest.contains(MachineId::core(1)));
    }

    #[test]
    fn purge_removes_matching_only() {
        let mut buf = MessageBuffer::unbounded();
        buf.enqueue(read_req(0x200, 0), 0, 0);
        buf.enqueue(read_req(0x240, 1), 0, 0);
        let removed = buf.purge_matching(|m| m.line_addr == 0x200);
        assert_eq!(removed, 1);
        assert_eq!(buf.len(), 1);
        assert_eq!(read_msg(&buf.dequeue(0)).line_addr, 0x240);
    }
}
