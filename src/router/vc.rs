use std::collections::{HashMap, VecDeque};

use smallvec::SmallVec;

use crate::eventq::Cycle;
use crate::network::flit::{Flit, RoutePartition, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcState {
    Idle,
    Active,
}

/// One buffered lane of an input port.
///
/// A VC is Active exactly while it holds a fragment of one in-flight packet;
/// activation captures the packet id from the head flit and idling clears
/// every per-packet field, including all multicast bookkeeping.
///
/// Multicast packets are delivered to several outports from the same buffer.
/// `remaining` holds outports whose head flit has not been granted yet,
/// `active` the ones mid-packet, and `sent[p]` counts flits granted to
/// outport `p`, so the flit needed by `p` is packet index `sent[p]`.  The
/// serve pointer walks packet indices round-robin so ports progressing at
/// different rates each get their flit peeked in turn.
#[derive(Debug)]
pub struct VirtualChannel {
    pub id: usize,
    state: VcState,
    buffer: VecDeque<Flit>,
    /// Head-flit arrival tick while Active, `Cycle::MAX` while Idle.  Used by
    /// the ordering check in switch allocation.
    pub enqueue_time: Cycle,
    packet_id: Option<u64>,
    pub output_port: Option<usize>,
    pub output_vc: Option<usize>,
    /// Set when the prepush filter decided to drop the buffered packet.
    pub to_be_filtered: bool,

    multicast: bool,
    packet_size: usize,
    outports: SmallVec<[usize; 4]>,
    remaining: SmallVec<[usize; 4]>,
    active: SmallVec<[usize; 4]>,
    /// Outports leading to destinations that demanded the line; never pruned.
    demand_outports: SmallVec<[usize; 4]>,
    outport_vcs: HashMap<usize, usize>,
    routes: HashMap<usize, RoutePartition>,
    sent: HashMap<usize, usize>,
    serve_ptr: usize,
    /// Packet indices below this were canonically removed from the buffer.
    popped: usize,
}

impl VirtualChannel {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: VcState::Idle,
            buffer: VecDeque::new(),
            enqueue_time: Cycle::MAX,
            packet_id: None,
            output_port: None,
            output_vc: None,
            to_be_filtered: false,
            multicast: false,
            packet_size: 0,
            outports: SmallVec::new(),
            remaining: SmallVec::new(),
            active: SmallVec::new(),
            demand_outports: SmallVec::new(),
            outport_vcs: HashMap::new(),
            routes: HashMap::new(),
            sent: HashMap::new(),
            serve_ptr: 0,
            popped: 0,
        }
    }

    pub fn state(&self) -> VcState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == VcState::Idle
    }

    pub fn is_active(&self) -> bool {
        self.state == VcState::Active
    }

    pub fn packet_id(&self) -> Option<u64> {
        self.packet_id
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    /// Caller guarantees capacity via the credit protocol.
    pub fn insert_flit(&mut self, flit: Flit) {
        self.buffer.push_back(flit);
    }

    pub fn set_active(&mut self, now: Cycle) {
        assert_eq!(self.state, VcState::Idle, "vc {} double-activated", self.id);
        let head = self
            .buffer
            .front()
            .expect("activation with an empty buffer");
        assert!(head.is_head(), "vc {} activated on a non-head flit", self.id);
        self.packet_id = Some(head.packet_id);
        self.enqueue_time = now;
        self.state = VcState::Active;
    }

    pub fn set_idle(&mut self) {
        assert_eq!(self.state, VcState::Active, "vc {} idled while idle", self.id);
        assert!(
            self.buffer.is_empty(),
            "vc {} idled with {} flits buffered",
            self.id,
            self.buffer.len()
        );
        self.state = VcState::Idle;
        self.enqueue_time = Cycle::MAX;
        self.packet_id = None;
        self.output_port = None;
        self.output_vc = None;
        self.to_be_filtered = false;
        self.multicast = false;
        self.packet_size = 0;
        self.outports.clear();
        self.remaining.clear();
        self.active.clear();
        self.demand_outports.clear();
        self.outport_vcs.clear();
        self.routes.clear();
        self.sent.clear();
        self.serve_ptr = 0;
        self.popped = 0;
    }

    pub fn peek_front(&self) -> Option<&Flit> {
        self.buffer.front()
    }

    pub fn pop_front(&mut self) -> Flit {
        self.buffer.pop_front().expect("pop from empty vc")
    }

    /// True iff every flit of the occupying packet is buffered and none has
    /// been removed yet.
    pub fn holds_full_packet(&self) -> bool {
        self.popped == 0 && self.buffer.back().map_or(false, Flit::is_tail)
    }

    /// Drop path: drain the complete buffered packet at once.
    pub fn take_all_flits(&mut self) -> Vec<Flit> {
        assert!(self.holds_full_packet(), "vc {} drop of a partial packet", self.id);
        self.buffer.drain(..).collect()
    }

    pub fn need_stage(&self, stage: Stage, time: Cycle) -> bool {
        if !self.is_active() || self.enqueue_time > time {
            return false;
        }
        let flit = if self.multicast {
            self.flit_at(self.serve_ptr)
        } else {
            self.buffer.front()
        };
        flit.map_or(false, |f| f.is_stage(stage, time))
    }

    // Multicast bookkeeping.

    pub fn set_multicast_outports(
        &mut self,
        outports: &[usize],
        demand_outports: &[usize],
        routes: HashMap<usize, RoutePartition>,
        packet_size: usize,
    ) {
        assert!(!self.multicast, "vc {} multicast outports set twice", self.id);
        assert!(
            self.outports.is_empty()
                && self.remaining.is_empty()
                && self.active.is_empty()
                && self.demand_outports.is_empty()
                && self.routes.is_empty()
                && self.sent.is_empty(),
            "vc {} has stale multicast state",
            self.id
        );
        assert!(!outports.is_empty());
        assert!(packet_size >= 1);
        self.multicast = true;
        self.packet_size = packet_size;
        self.outports.extend_from_slice(outports);
        self.remaining.extend_from_slice(outports);
        self.demand_outports.extend_from_slice(demand_outports);
        self.routes = routes;
        for &p in outports {
            self.sent.insert(p, 0);
        }
    }

    pub fn remaining_outports(&self) -> &[usize] {
        &self.remaining
    }

    pub fn active_outports(&self) -> &[usize] {
        &self.active
    }

    pub fn is_demand_outport(&self, outport: usize) -> bool {
        self.demand_outports.contains(&outport)
    }

    pub fn add_demand_outport(&mut self, outport: usize) {
        if !self.demand_outports.contains(&outport) {
            self.demand_outports.push(outport);
        }
    }

    /// Prune or complete one head-pending branch.  Also forgets any demand
    /// marking for the port.
    pub fn remove_from_multicast_remaining(&mut self, outport: usize) {
        let pos = self
            .remaining
            .iter()
            .position(|&p| p == outport)
            .expect("outport not in remaining set");
        self.remaining.remove(pos);
        self.demand_outports.retain(|&mut p| p != outport);
    }

    pub fn route_for(&self, outport: usize) -> &RoutePartition {
        &self.routes[&outport]
    }

    pub fn outvc_for(&self, outport: usize) -> Option<usize> {
        self.outport_vcs.get(&outport).copied()
    }

    pub fn set_outvc_for(&mut self, outport: usize, outvc: usize) {
        let prev = self.outport_vcs.insert(outport, outvc);
        assert!(prev.is_none(), "outvc for port {} allocated twice", outport);
    }

    pub fn serve_index(&self) -> usize {
        self.serve_ptr
    }

    pub fn advance_multicast_serve(&mut self) {
        assert!(self.multicast);
        self.serve_ptr = (self.serve_ptr + 1) % self.packet_size;
    }

    /// Buffered flit with packet index `idx`, if it has arrived and has not
    /// been canonically removed.
    pub fn flit_at(&self, idx: usize) -> Option<&Flit> {
        idx.checked_sub(self.popped)
            .and_then(|off| self.buffer.get(off))
    }

    /// Outports that need packet index `idx` next: head-pending ports for the
    /// head flit, mid-packet ports whose sent count equals `idx`.
    pub fn eligible_outports(&self, idx: usize) -> SmallVec<[usize; 4]> {
        let mut out = SmallVec::new();
        if idx == 0 {
            out.extend_from_slice(&self.remaining);
        }
        for &p in &self.active {
            if self.sent[&p] == idx {
                out.push(p);
            }
        }
        out
    }

    /// True iff no other outport still needs packet index `idx`, meaning the
    /// canonical flit can leave the buffer instead of being replicated.
    pub fn multicast_last_consumer(&self, outport: usize, idx: usize) -> bool {
        self.remaining.iter().all(|&p| p == outport)
            && self
                .active
                .iter()
                .all(|&p| p == outport || self.sent[&p] > idx)
    }

    /// Canonical removal of packet index `idx`; only ever legal at the front
    /// of the buffer.
    pub fn take_flit_at(&mut self, idx: usize) -> Flit {
        assert_eq!(idx, self.popped, "canonical pop must be in packet order");
        self.popped += 1;
        self.buffer.pop_front().expect("pop from empty vc")
    }

    pub fn note_multicast_grant(&mut self, outport: usize, idx: usize, flit: &Flit) {
        if flit.is_head() {
            self.remove_from_multicast_remaining(outport);
            if !flit.is_tail() {
                self.active.push(outport);
            }
        } else if flit.is_tail() {
            let pos = self
                .active
                .iter()
                .position(|&p| p == outport)
                .expect("tail grant for inactive outport");
            self.active.remove(pos);
        }
        *self.sent.get_mut(&outport).expect("grant for unknown outport") = idx + 1;
    }

    pub fn multicast_done(&self) -> bool {
        self.remaining.is_empty() && self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::flit::{FlitKind, RouteInfo, RouteKind};
    use crate::protocol::{msg_ref, MachineId, Message, MsgKind, NetDest};

    fn mk_flit(id: usize, kind: FlitKind, size: usize) -> Flit {
        let dests = NetDest::single(MachineId::core(1));
        let msg = msg_ref(Message::new(
            MsgKind::Prepush,
            0x40,
            MachineId::llc(0),
            dests,
            64,
            2,
        ));
        let route = RouteInfo {
            vnet: 2,
            dests,
            src_ni: 0,
            src_router: 0,
            hops: 0,
            kind: RouteKind::Multicast {
                dest_nis: SmallVec::new(),
                dest_routers: SmallVec::new(),
            },
        };
        Flit::new(id, kind, 0, size, 42, route, msg, 5)
    }

    fn routes_for(ports: &[usize]) -> HashMap<usize, RoutePartition> {
        ports
            .iter()
            .map(|&p| (p, RoutePartition::default()))
            .collect()
    }

    #[test]
    fn activation_captures_packet_and_idle_clears() {
        let mut vc = VirtualChannel::new(0);
        vc.insert_flit(mk_flit(0, FlitKind::HeadTail, 1));
        vc.set_active(5);
        assert!(vc.is_active());
        assert_eq!(vc.packet_id(), Some(42));
        assert_eq!(vc.enqueue_time, 5);

        vc.pop_front();
        vc.set_idle();
        assert!(vc.is_idle());
        assert_eq!(vc.packet_id(), None);
        assert_eq!(vc.enqueue_time, Cycle::MAX);
    }

    #[test]
    #[should_panic(expected = "double-activated")]
    fn double_activation_is_a_bug() {
        let mut vc = VirtualChannel::new(0);
        vc.insert_flit(mk_flit(0, FlitKind::Head, 2));
        vc.set_active(1);
        vc.set_active(2);
    }

    #[test]
    fn multicast_head_grants_move_ports_to_active() {
        let mut vc = VirtualChannel::new(1);
        vc.insert_flit(mk_flit(0, FlitKind::Head, 3));
        vc.set_active(0);
        vc.set_multicast_outports(&[2, 5, 7], &[5], routes_for(&[2, 5, 7]), 3);

        assert_eq!(vc.eligible_outports(0).as_slice(), &[2, 5, 7]);
        assert!(!vc.multicast_last_consumer(2, 0));

        let head = vc.flit_at(0).unwrap().clone();
        vc.note_multicast_grant(2, 0, &head);
        vc.note_multicast_grant(7, 0, &head);
        assert_eq!(vc.remaining_outports(), &[5]);
        assert_eq!(vc.active_outports(), &[2, 7]);
        assert!(vc.is_demand_outport(5));

        // port 5 is now the sole consumer of the head flit
        assert!(vc.multicast_last_consumer(5, 0));
        vc.note_multicast_grant(5, 0, &head);
        let popped = vc.take_flit_at(0);
        assert_eq!(popped.id, 0);
        assert!(!vc.multicast_done());
    }

    #[test]
    fn tail_grants_retire_ports_and_finish() {
        let mut vc = VirtualChannel::new(1);
        vc.insert_flit(mk_flit(0, FlitKind::Head, 2));
        vc.set_active(0);
        vc.set_multicast_outports(&[1, 3], &[], routes_for(&[1, 3]), 2);
        vc.insert_flit(mk_flit(1, FlitKind::Tail, 2));

        let head = vc.flit_at(0).unwrap().clone();
        vc.note_multicast_grant(1, 0, &head);
        vc.note_multicast_grant(3, 0, &head);
        vc.take_flit_at(0);

        // both ports now need the tail (index 1)
        assert_eq!(vc.eligible_outports(1).as_slice(), &[1, 3]);
        let tail = vc.flit_at(1).unwrap().clone();
        assert!(!vc.multicast_last_consumer(1, 1));
        vc.note_multicast_grant(1, 1, &tail);
        assert!(vc.multicast_last_consumer(3, 1));
        vc.note_multicast_grant(3, 1, &tail);
        vc.take_flit_at(1);
        assert!(vc.multicast_done());
        vc.set_idle();
    }

    #[test]
    fn serve_pointer_wraps_over_packet_size() {
        let mut vc = VirtualChannel::new(0);
        vc.insert_flit(mk_flit(0, FlitKind::Head, 3));
        vc.set_active(0);
        vc.set_multicast_outports(&[1], &[], routes_for(&[1]), 3);
        assert_eq!(vc.serve_index(), 0);
        vc.advance_multicast_serve();
        vc.advance_multicast_serve();
        assert_eq!(vc.serve_index(), 2);
        vc.advance_multicast_serve();
        assert_eq!(vc.serve_index(), 0);
    }

    #[test]
    fn pruning_removes_demand_marking_too() {
        let mut vc = VirtualChannel::new(0);
        vc.insert_flit(mk_flit(0, FlitKind::HeadTail, 1));
        vc.set_active(0);
        vc.set_multicast_outports(&[2, 4], &[4], routes_for(&[2, 4]), 1);
        vc.remove_from_multicast_remaining(4);
        assert_eq!(vc.remaining_outports(), &[2]);
        assert!(!vc.is_demand_outport(4));
    }

    #[test]
    fn full_packet_drop_drains_buffer() {
        let mut vc = VirtualChannel::new(0);
        vc.insert_flit(mk_flit(0, FlitKind::Head, 2));
        vc.set_active(0);
        assert!(!vc.holds_full_packet());
        vc.insert_flit(mk_flit(1, FlitKind::Tail, 2));
        assert!(vc.holds_full_packet());
        let flits = vc.take_all_flits();
        assert_eq!(flits.len(), 2);
        vc.set_idle();
    }
}
