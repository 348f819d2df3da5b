use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::debug;
use crate::eventq::{Cycle, NodeId};
use crate::network::config::{NetworkConfig, NUM_VNETS, VNET_REQUEST};
use crate::network::flit::{Credit, Flit, FlitKind, RouteInfo, RouteKind, Stage};
use crate::network::topology::{NiWiring, Topology};
use crate::network::NetCtx;
use crate::protocol::{
    clone_message, msg_ref, read_msg, write_msg, MachineKind, MachineId, Message, MessageBuffer,
    MsgRef, NetDest,
};
use crate::router::arbiter::RoundRobinCursor;
use crate::router::prepush_filter::PrepushFilter;
use crate::sim::log::Logger;
use crate::sim::stats::NiStats;

struct OutVc {
    active: bool,
    credits: u32,
    /// Flits already assigned to this VC, waiting on link and credit.
    queue: VecDeque<Flit>,
}

/// Boundary between one machine's protocol queues and its mesh router.
///
/// The injection side flitisizes at most one packet per cycle and streams
/// buffered flits onto the local link as credits allow; the ejection side
/// reassembles packets and hands completed messages to the machine.  Two
/// interface-level prepush filters live here: an LLC prunes prepush
/// destinations it has recently pushed to before spending network bandwidth
/// on them, and a core suppresses its own read requests for lines that a
/// prepush has already delivered (or is about to).
pub struct NetworkInterface {
    pub id: usize,
    machine: MachineId,
    router_id: usize,
    config: Arc<NetworkConfig>,
    topo: Arc<Topology>,
    logger: Arc<Logger>,

    pub inject_link: usize,
    pub inject_credit_link: usize,
    pub eject_link: usize,
    pub eject_credit_link: usize,

    inject_bufs: Vec<MessageBuffer>,
    eject_bufs: Vec<MessageBuffer>,

    out_vcs: Vec<OutVc>,
    rr_vnet: RoundRobinCursor,
    rr_vc: Vec<RoundRobinCursor>,
    rr_send: RoundRobinCursor,
    /// Unicast clones awaiting injection when a multi-destination message
    /// must fan out (multicast disabled).
    fanout_backlog: VecDeque<MsgRef>,

    in_filter: PrepushFilter,
    out_filter: PrepushFilter,

    vc_fail_streak: Vec<u64>,
    packet_seq: u64,
    pub stats: NiStats,
}

impl NetworkInterface {
    pub fn new(
        id: usize,
        config: &Arc<NetworkConfig>,
        topo: &Arc<Topology>,
        wiring: &NiWiring,
        logger: &Arc<Logger>,
    ) -> Self {
        let machine = topo.machine_of_ni(id);
        let total_vcs = config.total_vcs();
        let out_vcs = (0..total_vcs)
            .map(|_| OutVc {
                active: false,
                credits: config.vc_buffer_depth,
                queue: VecDeque::new(),
            })
            .collect();
        Self {
            id,
            machine,
            router_id: topo.router_of_ni(id),
            config: Arc::clone(config),
            topo: Arc::clone(topo),
            logger: Arc::clone(logger),
            inject_link: wiring.inject.flit_link,
            inject_credit_link: wiring.inject.credit_link,
            eject_link: wiring.eject.flit_link,
            eject_credit_link: wiring.eject.credit_link,
            inject_bufs: (0..NUM_VNETS).map(|_| MessageBuffer::unbounded()).collect(),
            eject_bufs: (0..NUM_VNETS).map(|_| MessageBuffer::unbounded()).collect(),
            out_vcs,
            rr_vnet: RoundRobinCursor::new(NUM_VNETS),
            rr_vc: (0..NUM_VNETS)
                .map(|_| RoundRobinCursor::new(config.vcs_per_vnet))
                .collect(),
            rr_send: RoundRobinCursor::new(total_vcs),
            fanout_backlog: VecDeque::new(),
            in_filter: PrepushFilter::new(),
            out_filter: PrepushFilter::new(),
            vc_fail_streak: vec![0; NUM_VNETS],
            packet_seq: 0,
            stats: NiStats {
                id,
                ..NiStats::default()
            },
        }
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    /// Queue a message from the attached machine.  Read requests coalesce
    /// onto an already-queued read for the same line instead of occupying a
    /// second slot.
    pub fn enqueue_message(&mut self, msg: Message, delay: Cycle, ctx: &mut NetCtx) {
        let vnet = msg.vnet;
        assert!(vnet < NUM_VNETS, "message on unknown vnet {}", vnet);
        let now = ctx.now;
        let mref = msg_ref(msg);
        let is_read = read_msg(&mref).is_read_request();
        if is_read {
            self.inject_bufs[vnet].enqueue_read_coalescing(mref, now, delay);
        } else {
            self.inject_bufs[vnet].enqueue(mref, now, delay);
        }
        ctx.sched.schedule_at(NodeId::Ni(self.id), now + delay.max(1));
    }

    /// Completed message for the attached machine, if one is ready.
    pub fn take_delivery(&mut self, vnet: usize, now: Cycle) -> Option<MsgRef> {
        if self.eject_bufs[vnet].is_ready(now) {
            Some(self.eject_bufs[vnet].dequeue(now))
        } else {
            None
        }
    }

    pub fn pending_deliveries(&self, vnet: usize) -> usize {
        self.eject_bufs[vnet].len()
    }

    pub fn is_quiescent(&self) -> bool {
        self.fanout_backlog.is_empty()
            && self.inject_bufs.iter().all(|b| b.is_empty())
            && self.out_vcs.iter().all(|v| v.queue.is_empty())
    }

    pub fn wakeup(&mut self, ctx: &mut NetCtx) {
        self.in_filter.clear_prepushes(ctx.now);
        self.out_filter.clear_prepushes(ctx.now);
        self.drain_credits(ctx);
        self.eject(ctx);
        self.inject(ctx);
        self.send_pending_flit(ctx);
        self.check_for_wakeup(ctx);
    }

    fn drain_credits(&mut self, ctx: &mut NetCtx) {
        let now = ctx.now;
        let link = &mut ctx.credit_links[self.inject_credit_link];
        while link.is_ready(now) {
            let credit = link.consume(now);
            let ov = &mut self.out_vcs[credit.vc];
            ov.credits += 1;
            assert!(
                ov.credits <= self.config.vc_buffer_depth,
                "ni {} vc {} over-credited",
                self.id,
                credit.vc
            );
            if credit.is_free_signal {
                assert!(ov.active, "free signal for inactive ni vc {}", credit.vc);
                assert!(ov.queue.is_empty(), "vc freed with flits still queued");
                ov.active = false;
            }
        }
    }

    fn eject(&mut self, ctx: &mut NetCtx) {
        let now = ctx.now;
        if !ctx.flit_links[self.eject_link].is_ready(now) {
            return;
        }
        let flit = ctx.flit_links[self.eject_link].consume(now);
        self.stats.flits_ejected += 1;
        let tail = flit.is_tail();
        ctx.send_credit(
            self.eject_credit_link,
            Credit {
                vc: flit.vc,
                is_free_signal: tail,
            },
        );
        if !tail {
            return;
        }
        self.stats.total_hops += flit.route.hops as u64;
        self.stats.latency.record(now.saturating_sub(flit.enqueue_time));
        self.deliver(flit, now);
    }

    fn deliver(&mut self, flit: Flit, now: Cycle) {
        let vnet = flit.vnet;
        let (demanded, line) = {
            let m = read_msg(&flit.msg);
            (m.demand_dest.contains(self.machine), m.line_addr)
        };
        if flit.prepush && self.machine.kind == MachineKind::Core {
            // a second speculative copy of a line we already hold is useless
            if !demanded && self.in_filter.has_entry(line) {
                self.stats.prepushes_declined += 1;
                debug!(
                    self.logger,
                    now,
                    "ni {} ({}): declined duplicate prepush {:#x}",
                    self.id,
                    self.machine,
                    line
                );
                return;
            }
            self.in_filter
                .register_prepush(line, NetDest::single(self.machine), None);
            self.in_filter.clear_prepush_at(
                line,
                NetDest::single(self.machine),
                now + self.config.prepush_clear_delay,
            );
            let purged = self.inject_bufs[VNET_REQUEST]
                .purge_matching(|m| m.is_read_request() && m.line_addr == line);
            if purged > 0 {
                self.stats.reads_purged += purged as u64;
                debug!(
                    self.logger,
                    now,
                    "ni {} ({}): prepush {:#x} purged {} queued read(s)",
                    self.id,
                    self.machine,
                    line,
                    purged
                );
            }
        }
        let delivered = clone_message(&flit.msg, self.machine);
        self.eject_bufs[vnet].enqueue(delivered, now, 1);
        self.stats.messages_ejected += 1;
        debug!(
            self.logger,
            now,
            "ni {} ({}): delivered {} (latency {})",
            self.id,
            self.machine,
            flit,
            now.saturating_sub(flit.enqueue_time)
        );
    }

    /// At most one packet is flitisized per cycle; the fan-out backlog takes
    /// priority over fresh protocol messages.
    fn inject(&mut self, ctx: &mut NetCtx) {
        let now = ctx.now;
        if !self.fanout_backlog.is_empty() {
            let vnet = read_msg(&self.fanout_backlog[0]).vnet;
            match self.calculate_vc(vnet) {
                Some(vc) => {
                    let msg = self.fanout_backlog.pop_front().expect("nonempty backlog");
                    self.vc_fail_streak[vnet] = 0;
                    self.flitisize(msg, vc, now);
                }
                None => self.note_vc_failure(vnet, now),
            }
            return;
        }

        let mut chosen = None;
        for vnet in self.rr_vnet.scan() {
            if self.inject_bufs[vnet].is_ready(now) {
                chosen = Some(vnet);
                break;
            }
        }
        let Some(vnet) = chosen else { return };
        self.rr_vnet.advance_past(vnet);

        let (is_read, is_prepush, line, dest, demand) = {
            let head = self.inject_bufs[vnet].peek(now).expect("ready head vanished");
            let m = read_msg(head);
            (m.is_read_request(), m.is_prepush(), m.line_addr, m.dest, m.demand_dest)
        };

        if is_read
            && self.machine.kind == MachineKind::Core
            && self.config.prepush_filter
            && self.in_filter.has_entry(line)
        {
            let _ = self.inject_bufs[vnet].dequeue(now);
            self.stats.reads_suppressed += 1;
            debug!(
                self.logger,
                now,
                "ni {} ({}): suppressed read {:#x}, line already prepushed here",
                self.id,
                self.machine,
                line
            );
            return;
        }

        let mut dest = dest;
        if is_prepush && self.machine.kind == MachineKind::Llc && self.config.prepush_filter {
            if let Some(cumulative) = self.out_filter.cumulative(line) {
                // demand destinations are pushed again even if covered
                let mut prune = dest.intersect(&cumulative);
                prune.subtract(&demand);
                if !prune.is_empty() {
                    dest.subtract(&prune);
                    self.stats.prepushes_pruned_at_inject += prune.count() as u64;
                    debug!(
                        self.logger,
                        now,
                        "ni {} ({}): pruned prepush {:#x} dests {} already covered",
                        self.id,
                        self.machine,
                        line,
                        prune
                    );
                    if dest.is_empty() {
                        let _ = self.inject_bufs[vnet].dequeue(now);
                        return;
                    }
                    write_msg(self.inject_bufs[vnet].peek(now).expect("ready head vanished"))
                        .dest = dest;
                }
            }
        }

        if dest.count() > 1 && !self.config.multicast {
            let msg = self.inject_bufs[vnet].dequeue(now);
            for machine in dest.iter() {
                self.fanout_backlog.push_back(clone_message(&msg, machine));
            }
            return;
        }

        match self.calculate_vc(vnet) {
            Some(vc) => {
                let msg = self.inject_bufs[vnet].dequeue(now);
                self.vc_fail_streak[vnet] = 0;
                self.flitisize(msg, vc, now);
            }
            None => self.note_vc_failure(vnet, now),
        }
    }

    fn calculate_vc(&mut self, vnet: usize) -> Option<usize> {
        let base = vnet * self.config.vcs_per_vnet;
        let mut pick = None;
        for off in self.rr_vc[vnet].scan() {
            if !self.out_vcs[base + off].active {
                pick = Some(off);
                break;
            }
        }
        let off = pick?;
        self.rr_vc[vnet].advance_past(off);
        self.out_vcs[base + off].active = true;
        Some(base + off)
    }

    fn note_vc_failure(&mut self, vnet: usize, now: Cycle) {
        self.vc_fail_streak[vnet] += 1;
        self.stats.vc_alloc_failures += 1;
        if self.vc_fail_streak[vnet] > self.config.deadlock_threshold {
            panic!("{}", self.deadlock_dump(vnet, now));
        }
    }

    fn flitisize(&mut self, msg: MsgRef, vc: usize, now: Cycle) {
        let route = {
            let m = read_msg(&msg);
            if m.is_prepush() && self.machine.kind == MachineKind::Llc && self.config.prepush_filter
            {
                self.out_filter.register_prepush(m.line_addr, m.dest, None);
                self.out_filter.clear_prepush_at(
                    m.line_addr,
                    m.dest,
                    now + self.config.prepush_clear_delay,
                );
            }
            self.compute_route(&m)
        };
        let num_flits = self.config.flits_per_message(read_msg(&msg).size_bytes);
        let packet_id = ((self.id as u64) << 40) | self.packet_seq;
        self.packet_seq += 1;
        for i in 0..num_flits {
            let kind = if num_flits == 1 {
                FlitKind::HeadTail
            } else if i == 0 {
                FlitKind::Head
            } else if i == num_flits - 1 {
                FlitKind::Tail
            } else {
                FlitKind::Body
            };
            let flit = Flit::new(
                i,
                kind,
                vc,
                num_flits,
                packet_id,
                route.clone(),
                Arc::clone(&msg),
                now,
            );
            self.out_vcs[vc].queue.push_back(flit);
        }
        self.stats.messages_injected += 1;
        self.stats.flits_injected += num_flits as u64;
        debug!(
            self.logger,
            now,
            "ni {} ({}): flitisized packet {:#x} into {} flit(s) on vc {}",
            self.id,
            self.machine,
            packet_id,
            num_flits,
            vc
        );
    }

    fn compute_route(&self, msg: &Message) -> RouteInfo {
        let dests = msg.dest;
        assert!(!dests.is_empty(), "message with no destination");
        let kind = if dests.count() == 1 {
            let machine = dests.iter().next().expect("nonempty dest");
            let dest_ni = self.topo.ni_of_machine(machine);
            RouteKind::Unicast {
                dest_ni,
                dest_router: self.topo.router_of_ni(dest_ni),
            }
        } else {
            let mut dest_nis: SmallVec<[usize; 4]> =
                dests.iter().map(|m| self.topo.ni_of_machine(m)).collect();
            dest_nis.sort_unstable();
            let dest_routers = dest_nis.iter().map(|&ni| self.topo.router_of_ni(ni)).collect();
            RouteKind::Multicast {
                dest_nis,
                dest_routers,
            }
        };
        RouteInfo {
            vnet: msg.vnet,
            dests,
            src_ni: self.id,
            src_router: self.router_id,
            hops: 0,
            kind,
        }
    }

    /// One flit per cycle onto the local link, round-robin over VCs that
    /// have both a buffered flit and a credit.
    fn send_pending_flit(&mut self, ctx: &mut NetCtx) {
        let mut pick = None;
        for vc in self.rr_send.scan() {
            let ov = &self.out_vcs[vc];
            if !ov.queue.is_empty() && ov.credits > 0 {
                pick = Some(vc);
                break;
            }
        }
        let Some(vc) = pick else { return };
        self.rr_send.advance_past(vc);
        let ov = &mut self.out_vcs[vc];
        ov.credits -= 1;
        let mut flit = ov.queue.pop_front().expect("picked vc with empty queue");
        flit.advance_stage(Stage::LinkTraversal, ctx.now);
        ctx.send_flit(self.inject_link, flit);
    }

    fn check_for_wakeup(&self, ctx: &mut NetCtx) {
        let me = NodeId::Ni(self.id);
        let next = ctx.now + 1;
        let pending_send = self.out_vcs.iter().any(|v| !v.queue.is_empty());
        let pending_inject =
            !self.fanout_backlog.is_empty() || self.inject_bufs.iter().any(|b| b.is_ready(next));
        if pending_send || pending_inject {
            ctx.sched.schedule_at(me, next);
        }
        for buf in &self.inject_bufs {
            if let Some(at) = buf.next_ready_at() {
                ctx.sched.schedule_at(me, at.max(next));
            }
        }
        if let Some(at) = ctx.flit_links[self.eject_link].next_arrival() {
            ctx.sched.schedule_at(me, at.max(next));
        }
        for filter in [&self.in_filter, &self.out_filter] {
            if let Some(at) = filter.next_clear_due() {
                ctx.sched.schedule_at(me, at.max(next));
            }
        }
    }

    fn deadlock_dump(&self, vnet: usize, now: Cycle) -> String {
        let mut s = format!(
            "ni {} ({}): vnet {} starved of output vcs for {} consecutive cycles (cycle {})\n",
            self.id, self.machine, vnet, self.vc_fail_streak[vnet], now
        );
        for v in 0..NUM_VNETS {
            let _ = writeln!(
                s,
                "  vnet {}: {} queued, next ready {:?}",
                v,
                self.inject_bufs[v].len(),
                self.inject_bufs[v].next_ready_at()
            );
        }
        let _ = writeln!(s, "  fanout backlog: {}", self.fanout_backlog.len());
        for (vc, ov) in self.out_vcs.iter().enumerate() {
            if ov.active || !ov.queue.is_empty() {
                let _ = writeln!(
                    s,
                    "  outvc {}: active={} credits={} pending={}",
                    vc,
                    ov.active,
                    ov.credits,
                    ov.queue.len()
                );
            }
        }
        s
    }
}
