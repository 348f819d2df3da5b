use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::eventq::Cycle;
use crate::protocol::net_dest::{MachineId, NetDest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Demand read (GetS-class).
    ReadRequest,
    /// Demand write/upgrade.
    WriteRequest,
    /// Speculative push of a cache line toward likely requesters.
    Prepush,
    /// Invalidation of sharers.
    Invalidation,
    /// Data or ack response.
    Response,
}

/// Protocol-level message carried through the network.  The coherence state
/// machines that produce and consume these live outside the crate; the
/// network only reads the fields below and widens `demand_dest` when a
/// buffered prepush absorbs a racing demand request.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MsgKind,
    pub line_addr: u64,
    pub requestor: MachineId,
    pub dest: NetDest,
    /// Subset of `dest` that has actually demanded the line.  For prepushes,
    /// receivers treat non-demand deliveries as droppable; for read requests
    /// it accumulates coalesced requestors awaiting the same line.
    pub demand_dest: NetDest,
    pub size_bytes: u32,
    pub enqueue_time: Cycle,
    /// Virtual network the message travels on.
    pub vnet: usize,
}

impl Message {
    pub fn new(
        kind: MsgKind,
        line_addr: u64,
        requestor: MachineId,
        dest: NetDest,
        size_bytes: u32,
        vnet: usize,
    ) -> Self {
        Self {
            kind,
            line_addr,
            requestor,
            dest,
            demand_dest: NetDest::new(),
            size_bytes,
            enqueue_time: 0,
            vnet,
        }
    }

    pub fn is_read_request(&self) -> bool {
        self.kind == MsgKind::ReadRequest
    }

    pub fn is_prepush(&self) -> bool {
        self.kind == MsgKind::Prepush
    }

    pub fn is_invalidation(&self) -> bool {
        self.kind == MsgKind::Invalidation
    }
}

/// Shared-ownership handle.  Multicast flit replicas hold clones of the same
/// handle; per-destination copies are made with `clone_message`.
pub type MsgRef = Arc<RwLock<Message>>;

pub fn msg_ref(msg: Message) -> MsgRef {
    Arc::new(RwLock::new(msg))
}

pub fn read_msg(msg: &MsgRef) -> RwLockReadGuard<'_, Message> {
    msg.read().expect("message lock poisoned")
}

pub fn write_msg(msg: &MsgRef) -> RwLockWriteGuard<'_, Message> {
    msg.write().expect("message lock poisoned")
}

/// Deep copy: an independent message whose destination is narrowed to one
/// receiver, used when a multicast fans out into unicast clones.
pub fn clone_message(msg: &MsgRef, dest: MachineId) -> MsgRef {
    let src = read_msg(msg);
    let mut copy = src.clone();
    copy.dest = NetDest::single(dest);
    copy.demand_dest = src.demand_dest.intersect(&copy.dest);
    msg_ref(copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_message_narrows_destination() {
        let mut dest = NetDest::new();
        dest.add(MachineId::core(1));
        dest.add(MachineId::core(2));
        let m = msg_ref(Message::new(
            MsgKind::Prepush,
            0x40,
            MachineId::llc(0),
            dest,
            64,
            2,
        ));
        write_msg(&m).demand_dest.add(MachineId::core(2));

        let narrowed = clone_message(&m, MachineId::core(2));
        let guard = read_msg(&narrowed);
        assert_eq!(guard.dest, NetDest::single(MachineId::core(2)));
        assert!(guard.demand_dest.contains(MachineId::core(2)));

        let narrowed1 = clone_message(&m, MachineId::core(1));
        assert!(read_msg(&narrowed1).demand_dest.is_empty());
    }

    #[test]
    fn shared_handle_sees_widened_demand() {
        let m = msg_ref(Message::new(
            MsgKind::Prepush,
            0x80,
            MachineId::llc(0),
            NetDest::single(MachineId::core(3)),
            64,
            2,
        ));
        let alias = MsgRef::clone(&m);
        write_msg(&m).demand_dest.add(MachineId::core(3));
        assert!(read_msg(&alias).demand_dest.contains(MachineId::core(3)));
    }
}
