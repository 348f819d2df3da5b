use std::fmt;

use smallvec::SmallVec;

use crate::eventq::Cycle;
use crate::protocol::{read_msg, MsgRef, NetDest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlitKind {
    Head,
    Body,
    Tail,
    /// Single-flit packet; head and tail at once.
    HeadTail,
}

impl fmt::Display for FlitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlitKind::Head => "H",
            FlitKind::Body => "B",
            FlitKind::Tail => "T",
            FlitKind::HeadTail => "HT",
        };
        write!(f, "{}", s)
    }
}

/// Router pipeline position of a buffered flit.  A flit only participates in
/// switch allocation once tagged `SwitchAlloc` with a stage time at or before
/// the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SwitchAlloc,
    SwitchTraversal,
    LinkTraversal,
}

/// Unicast and multicast routes are mutually exclusive shapes, so the split
/// lives in the type instead of parallel sometimes-empty fields.
#[derive(Debug, Clone)]
pub enum RouteKind {
    Unicast {
        dest_ni: usize,
        dest_router: usize,
    },
    Multicast {
        dest_nis: SmallVec<[usize; 4]>,
        dest_routers: SmallVec<[usize; 4]>,
    },
}

#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub vnet: usize,
    /// Machine-level destination set; for a replica, the partition reachable
    /// through the outport it was granted.
    pub dests: NetDest,
    pub src_ni: usize,
    pub src_router: usize,
    pub hops: u32,
    pub kind: RouteKind,
}

/// Slice of a multicast route reachable through one output port.
#[derive(Debug, Clone, Default)]
pub struct RoutePartition {
    pub dests: NetDest,
    pub dest_nis: SmallVec<[usize; 4]>,
    pub dest_routers: SmallVec<[usize; 4]>,
}

impl RouteInfo {
    pub fn is_multicast(&self) -> bool {
        matches!(self.kind, RouteKind::Multicast { .. })
    }

    pub fn dest_router(&self) -> usize {
        match self.kind {
            RouteKind::Unicast { dest_router, .. } => dest_router,
            RouteKind::Multicast { .. } => panic!("unicast route expected"),
        }
    }

    pub fn dest_ni(&self) -> usize {
        match self.kind {
            RouteKind::Unicast { dest_ni, .. } => dest_ni,
            RouteKind::Multicast { .. } => panic!("unicast route expected"),
        }
    }
}

/// Atomic transport unit.  A packet is one HeadTail flit or a
/// Head/Body*/Tail sequence, all stamped with the same packet id; multicast
/// replicas made at grant time keep the id and the shared message handle.
///
/// `prepush`, `read_request` and `line_addr` mirror the carried message so
/// the allocator's filter checks avoid taking the message lock every cycle.
#[derive(Debug, Clone)]
pub struct Flit {
    pub id: usize,
    pub kind: FlitKind,
    pub vnet: usize,
    /// VC index at the current input, rewritten on each hop.
    pub vc: usize,
    /// Number of flits in the packet.
    pub size: usize,
    pub packet_id: u64,
    pub route: RouteInfo,
    pub msg: MsgRef,
    pub prepush: bool,
    pub read_request: bool,
    pub line_addr: u64,
    pub enqueue_time: Cycle,
    pub dequeue_time: Cycle,
    stage: Stage,
    stage_time: Cycle,
    pub is_replica: bool,
}

impl Flit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        kind: FlitKind,
        vc: usize,
        size: usize,
        packet_id: u64,
        route: RouteInfo,
        msg: MsgRef,
        now: Cycle,
    ) -> Self {
        let (prepush, read_request, line_addr) = {
            let m = read_msg(&msg);
            (m.is_prepush(), m.is_read_request(), m.line_addr)
        };
        Self {
            id,
            kind,
            vnet: route.vnet,
            vc,
            size,
            packet_id,
            route,
            msg,
            prepush,
            read_request,
            line_addr,
            enqueue_time: now,
            dequeue_time: 0,
            stage: Stage::SwitchAlloc,
            stage_time: now,
            is_replica: false,
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self.kind, FlitKind::Head | FlitKind::HeadTail)
    }

    pub fn is_tail(&self) -> bool {
        matches!(self.kind, FlitKind::Tail | FlitKind::HeadTail)
    }

    pub fn advance_stage(&mut self, stage: Stage, time: Cycle) {
        self.stage = stage;
        self.stage_time = time;
    }

    pub fn is_stage(&self, stage: Stage, time: Cycle) -> bool {
        self.stage == stage && self.stage_time <= time
    }

    /// Narrow the route to the partition reachable through one outport.
    pub fn retarget(&mut self, part: &RoutePartition) {
        self.route.dests = part.dests;
        self.route.kind = RouteKind::Multicast {
            dest_nis: part.dest_nis.clone(),
            dest_routers: part.dest_routers.clone(),
        };
    }

    /// Copy for one outport of a multicast fan-out.  Shares the message
    /// handle and packet id; only the reachable destination partition and the
    /// downstream router set differ.
    pub fn replica_for(&self, part: &RoutePartition) -> Flit {
        let mut replica = self.clone();
        replica.retarget(part);
        replica.is_replica = true;
        replica
    }
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pkt{}.{}[{}] vnet{} vc{} -> {}",
            self.packet_id, self.id, self.kind, self.vnet, self.vc, self.route.dests
        )
    }
}

/// Credit returned upstream when a flit leaves an input buffer.  The free
/// signal additionally marks the whole VC reusable.
#[derive(Debug, Clone, Copy)]
pub struct Credit {
    pub vc: usize,
    pub is_free_signal: bool,
}
