use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::debug;
use crate::eventq::{Cycle, NodeId};
use crate::network::config::{NetworkConfig, SwitchHold};
use crate::network::flit::{Flit, Stage};
use crate::network::NetCtx;
use crate::protocol::{read_msg, write_msg, MachineId};
use crate::router::arbiter::RoundRobinCursor;
use crate::router::crossbar::CrossbarSwitch;
use crate::router::input_unit::InputUnit;
use crate::router::output_unit::OutputUnit;
use crate::router::prepush_filter::PrepushFilter;
use crate::router::vc::VirtualChannel;
use crate::sim::log::Logger;

#[derive(Debug, Clone, Copy)]
struct Grant {
    inport: usize,
    invc: usize,
    /// None when the winning VC is marked for a filter drop; the packet
    /// consumes the grant slot but never touches the crossbar.
    outvc: Option<usize>,
    fresh_outvc: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SwitchStats {
    pub sa_cycles: u64,
    pub grants: u64,
    pub replicas: u64,
    pub marked_for_drop: u64,
    pub dropped_requests: u64,
    pub dropped_prepushes: u64,
    pub dropped_flits: u64,
    pub demand_broadened: u64,
}

/// Two-stage switch allocation plus the prepush-filtering passes.
///
/// Each wakeup runs, in order: expired filter clears, the filtering pre-pass
/// that marks redundant demand reads, SA-I input arbitration (one winning VC
/// per input port), SA-II output arbitration (one grant per output port,
/// with late output-VC allocation), the grant pass that moves flits into the
/// crossbar, and the out-of-band drop pass for marked VCs that did not win a
/// grant.  Nothing here blocks; losing VCs simply retry next cycle.
pub struct SwitchAllocator {
    router_id: usize,
    num_inports: usize,
    num_outports: usize,
    config: Arc<NetworkConfig>,
    logger: Arc<Logger>,
    /// SA-I scan position per inport; advances only past granted VCs.
    rr_invc: Vec<RoundRobinCursor>,
    /// SA-II scan position per outport.
    rr_inport: Vec<RoundRobinCursor>,
    /// Drop-pass scan position per inport, deliberately separate from
    /// `rr_invc` so dropping never perturbs arbitration fairness.
    filter_rr_invc: Vec<RoundRobinCursor>,
    /// Multi-cycle switch holds, per outport.
    held_by: Vec<Option<(usize, usize)>>,
    pub stats: SwitchStats,
}

impl SwitchAllocator {
    pub fn new(
        router_id: usize,
        num_inports: usize,
        num_outports: usize,
        config: Arc<NetworkConfig>,
        logger: Arc<Logger>,
    ) -> Self {
        let total_vcs = config.total_vcs();
        Self {
            router_id,
            num_inports,
            num_outports,
            config,
            logger,
            rr_invc: (0..num_inports).map(|_| RoundRobinCursor::new(total_vcs)).collect(),
            rr_inport: (0..num_outports)
                .map(|_| RoundRobinCursor::new(num_inports))
                .collect(),
            filter_rr_invc: (0..num_inports)
                .map(|_| RoundRobinCursor::new(total_vcs))
                .collect(),
            held_by: vec![None; num_outports],
            stats: SwitchStats::default(),
        }
    }

    pub fn wakeup(
        &mut self,
        ctx: &mut NetCtx,
        input_units: &mut [InputUnit],
        output_units: &mut [OutputUnit],
        filters: &mut [PrepushFilter],
        crossbar: &mut CrossbarSwitch,
    ) {
        self.stats.sa_cycles += 1;
        for f in filters.iter_mut() {
            f.clear_prepushes(ctx.now);
        }
        if self.config.prepush_filter {
            self.check_prepush_filtering(ctx.now, input_units, filters);
        }
        let requests = self.arbitrate_inports(ctx.now, input_units, output_units, filters);
        let grants = self.arbitrate_outports(&requests, input_units, output_units);
        let granted = self.grant_switch(&grants, ctx, input_units, output_units, filters, crossbar);
        self.execute_prepush_filtering(&granted, ctx, input_units);
        self.check_for_wakeup(ctx, input_units, filters, crossbar);
    }

    /// Mark head-of-line demand reads that a registered prepush makes
    /// redundant, and widen the demand set of the covering prepush if it is
    /// still buffered at this router.
    ///
    /// The read is checked against the filter of the port it arrived on: a
    /// prepush covering this requestor left through that same port pair, so
    /// its registration is visible exactly where the answering read enters.
    fn check_prepush_filtering(
        &mut self,
        now: Cycle,
        input_units: &mut [InputUnit],
        filters: &[PrepushFilter],
    ) {
        let mut drops: Vec<(usize, usize, u64, MachineId)> = Vec::new();
        for (inport, iu) in input_units.iter().enumerate() {
            for (invc, vc) in iu.vcs.iter().enumerate() {
                if !vc.is_active() || vc.to_be_filtered || vc.is_multicast() {
                    continue;
                }
                let Some(head) = vc.peek_front() else { continue };
                if !head.read_request || !head.is_head() {
                    continue;
                }
                let requestor = read_msg(&head.msg).requestor;
                if filters[inport].query_to_drop_request(head.line_addr, requestor) {
                    drops.push((inport, invc, head.line_addr, requestor));
                }
            }
        }

        for (inport, invc, addr, requestor) in drops {
            input_units[inport].vcs[invc].to_be_filtered = true;
            self.stats.marked_for_drop += 1;
            debug!(
                self.logger,
                now,
                "router {}: read {:#x} from {} (inport {} vc {}) covered by prepush, will drop",
                self.router_id,
                addr,
                requestor,
                inport,
                invc
            );

            let Some((pi, pv)) = filters[inport].inport_and_invc(addr) else {
                continue;
            };
            let prepush_vc = &mut input_units[pi].vcs[pv];
            if !prepush_vc.is_active() {
                continue;
            }
            let Some(front) = prepush_vc.peek_front() else { continue };
            if !front.prepush || front.line_addr != addr {
                continue;
            }
            if !read_msg(&front.msg).dest.contains(requestor) {
                continue;
            }
            write_msg(&front.msg).demand_dest.add(requestor);
            self.stats.demand_broadened += 1;
            debug!(
                self.logger,
                now,
                "router {}: broadened buffered prepush {:#x} to demand-serve {}",
                self.router_id,
                addr,
                requestor
            );
            if prepush_vc.is_multicast() {
                let serving: Vec<usize> = prepush_vc
                    .remaining_outports()
                    .iter()
                    .chain(prepush_vc.active_outports())
                    .copied()
                    .filter(|&p| prepush_vc.route_for(p).dests.contains(requestor))
                    .collect();
                for p in serving {
                    prepush_vc.add_demand_outport(p);
                }
            }
        }
    }

    /// SA-I: each input port offers at most one VC.  Multicast VCs may
    /// request several outports for their serving flit in the same cycle.
    fn arbitrate_inports(
        &mut self,
        now: Cycle,
        input_units: &mut [InputUnit],
        output_units: &[OutputUnit],
        filters: &[PrepushFilter],
    ) -> Vec<Vec<Option<usize>>> {
        let mut requests = vec![vec![None; self.num_inports]; self.num_outports];
        let mut serve_skips: Vec<(usize, usize)> = Vec::new();

        for (inport, iu) in input_units.iter().enumerate() {
            'vcs: for invc in self.rr_invc[inport].scan() {
                let vc = &iu.vcs[invc];
                if !vc.need_stage(Stage::SwitchAlloc, now) {
                    continue;
                }
                if vc.to_be_filtered {
                    // a drop needs no credit, only the complete packet and a
                    // grant slot for consistent bookkeeping
                    if !vc.holds_full_packet() {
                        continue;
                    }
                    let Some(outport) = vc.output_port else { continue };
                    requests[outport][inport] = Some(invc);
                    break 'vcs;
                }
                if vc.is_multicast() {
                    let idx = vc.serve_index();
                    let flit = vc.flit_at(idx).expect("serving flit vanished");
                    let eligible = vc.eligible_outports(idx);
                    if eligible.is_empty() {
                        serve_skips.push((inport, invc));
                        continue;
                    }
                    let mut any = false;
                    for &outport in &eligible {
                        if let Some(holder) = self.held_by[outport] {
                            if holder != (inport, invc) {
                                continue;
                            }
                        }
                        let outvc = vc.outvc_for(outport);
                        if self.send_allowed(now, iu, vc, flit, outport, outvc, output_units, filters)
                        {
                            requests[outport][inport] = Some(invc);
                            any = true;
                        }
                    }
                    if any {
                        break 'vcs;
                    }
                } else {
                    let outport = vc.output_port.expect("active unicast vc without a route");
                    if let Some(holder) = self.held_by[outport] {
                        if holder != (inport, invc) {
                            continue;
                        }
                    }
                    let flit = vc.peek_front().expect("active vc with empty buffer");
                    if self.send_allowed(
                        now,
                        iu,
                        vc,
                        flit,
                        outport,
                        vc.output_vc,
                        output_units,
                        filters,
                    ) {
                        requests[outport][inport] = Some(invc);
                        break 'vcs;
                    }
                }
            }
        }

        for (inport, invc) in serve_skips {
            input_units[inport].vcs[invc].advance_multicast_serve();
        }
        requests
    }

    /// Credit availability plus the protocol ordering rules.
    #[allow(clippy::too_many_arguments)]
    fn send_allowed(
        &self,
        now: Cycle,
        iu: &InputUnit,
        vc: &VirtualChannel,
        flit: &Flit,
        outport: usize,
        outvc: Option<usize>,
        output_units: &[OutputUnit],
        filters: &[PrepushFilter],
    ) -> bool {
        let vnet = flit.vnet;
        let has_credit = match outvc {
            Some(v) => output_units[outport].has_credit(v),
            // a fresh VC always starts with a full buffer behind it
            None => {
                debug_assert!(flit.is_head());
                output_units[outport].has_free_vc(vnet)
            }
        };
        if !has_credit {
            return false;
        }

        // an earlier ready flit in the ordering domain headed for the same
        // outport must go first
        if self.config.is_ordered_vnet(vnet) {
            for v2 in self.config.ordering_vc_range(vnet) {
                if v2 == vc.id {
                    continue;
                }
                let other = &iu.vcs[v2];
                if !other.is_active()
                    || other.enqueue_time >= vc.enqueue_time
                    || !other.need_stage(Stage::SwitchAlloc, now)
                {
                    continue;
                }
                let targets_outport = if other.is_multicast() {
                    other.remaining_outports().contains(&outport)
                        || other.active_outports().contains(&outport)
                } else {
                    other.output_port == Some(outport)
                };
                if targets_outport {
                    return false;
                }
            }
        }

        // invalidations trail any registered prepush for the same line
        if self.config.ordered_prepush_inv
            && read_msg(&flit.msg).is_invalidation()
            && filters[outport].has_entry(flit.line_addr)
        {
            return false;
        }
        true
    }

    /// SA-II: one grant per outport.  A held outport admits only its holder;
    /// output VC allocation happens here for head flits that won.
    fn arbitrate_outports(
        &mut self,
        requests: &[Vec<Option<usize>>],
        input_units: &[InputUnit],
        output_units: &mut [OutputUnit],
    ) -> Vec<Option<Grant>> {
        let mut grants: Vec<Option<Grant>> = vec![None; self.num_outports];
        for outport in 0..self.num_outports {
            let winner = if let Some((hi, hv)) = self.held_by[outport] {
                (requests[outport][hi] == Some(hv)).then_some((hi, hv))
            } else {
                let mut found = None;
                for i in self.rr_inport[outport].scan() {
                    if let Some(v) = requests[outport][i] {
                        found = Some((i, v));
                        break;
                    }
                }
                found
            };
            let Some((inport, invc)) = winner else { continue };
            self.rr_inport[outport].advance_past(inport);

            let vc = &input_units[inport].vcs[invc];
            let (outvc, fresh) = if vc.to_be_filtered {
                (None, false)
            } else {
                let existing = if vc.is_multicast() {
                    vc.outvc_for(outport)
                } else {
                    vc.output_vc
                };
                match existing {
                    Some(v) => (Some(v), false),
                    None => {
                        let vnet = self.config.vnet_of_vc(invc);
                        let v = output_units[outport]
                            .select_free_vc(vnet)
                            .expect("free output vc promised by send_allowed");
                        (Some(v), true)
                    }
                }
            };
            grants[outport] = Some(Grant {
                inport,
                invc,
                outvc,
                fresh_outvc: fresh,
            });
        }
        grants
    }

    /// Move each granted flit into the crossbar, or finish a co-located
    /// drop.  Returns the set of VCs serviced this cycle.
    fn grant_switch(
        &mut self,
        grants: &[Option<Grant>],
        ctx: &mut NetCtx,
        input_units: &mut [InputUnit],
        output_units: &mut [OutputUnit],
        filters: &mut [PrepushFilter],
        crossbar: &mut CrossbarSwitch,
    ) -> HashSet<(usize, usize)> {
        let now = ctx.now;
        let mut granted: HashSet<(usize, usize)> = HashSet::new();
        let mut served_multicast: HashSet<(usize, usize)> = HashSet::new();

        for (outport, slot) in grants.iter().enumerate() {
            let Some(g) = *slot else { continue };
            if granted.insert((g.inport, g.invc)) {
                self.rr_invc[g.inport].advance_past(g.invc);
            }
            let iu = &mut input_units[g.inport];

            if iu.vcs[g.invc].to_be_filtered {
                debug_assert!(g.outvc.is_none());
                self.drop_filtered_packet(ctx, iu, g.invc);
                continue;
            }
            let outvc = g.outvc.expect("granted flit without an output vc");

            let (mut flit, last_consumer) = {
                let vc = &mut iu.vcs[g.invc];
                if vc.is_multicast() {
                    let idx = vc.serve_index();
                    let last = vc.multicast_last_consumer(outport, idx);
                    let part = vc.route_for(outport).clone();
                    let flit = if last {
                        let mut f = vc.take_flit_at(idx);
                        f.retarget(&part);
                        f
                    } else {
                        self.stats.replicas += 1;
                        vc.flit_at(idx).expect("serving flit vanished").replica_for(&part)
                    };
                    vc.note_multicast_grant(outport, idx, &flit);
                    if g.fresh_outvc {
                        vc.set_outvc_for(outport, outvc);
                    }
                    served_multicast.insert((g.inport, g.invc));
                    (flit, last)
                } else {
                    if g.fresh_outvc {
                        vc.output_vc = Some(outvc);
                    }
                    (vc.pop_front(), true)
                }
            };

            flit.vc = outvc;
            flit.advance_stage(Stage::SwitchTraversal, now + 1);
            flit.dequeue_time = now;
            output_units[outport].decrement_credit(outvc);
            self.stats.grants += 1;
            debug!(
                self.logger,
                now,
                "router {}: outport {} granted to inport {} vc {}: {}",
                self.router_id,
                outport,
                g.inport,
                g.invc,
                flit
            );

            if flit.prepush && self.config.prepush_filter {
                if flit.is_head() {
                    filters[outport].clear_buffered_location(flit.line_addr, g.inport, g.invc);
                }
                if flit.is_tail() {
                    filters[outport].clear_prepush_at(
                        flit.line_addr,
                        flit.route.dests,
                        now + self.config.prepush_clear_delay,
                    );
                }
            }

            let is_multicast = iu.vcs[g.invc].is_multicast();
            let hold = match self.config.hold_switch {
                SwitchHold::All => !flit.is_tail(),
                SwitchHold::MulticastOnly => is_multicast && !flit.is_tail(),
                SwitchHold::None => false,
            };
            self.held_by[outport] = hold.then_some((g.inport, g.invc));

            if last_consumer {
                let free = flit.is_tail();
                iu.send_credit(g.invc, free, ctx);
                if free {
                    let vc = &mut iu.vcs[g.invc];
                    if vc.is_multicast() {
                        assert!(vc.multicast_done(), "tail left a multicast vc unfinished");
                    }
                    vc.set_idle();
                }
            }
            crossbar.accept(g.inport, outport, flit, now + 1);
        }

        for (inport, invc) in served_multicast {
            let vc = &mut input_units[inport].vcs[invc];
            // served VCs that completed were already idled
            if vc.is_active() && vc.is_multicast() {
                vc.advance_multicast_serve();
            }
        }
        granted
    }

    fn drop_filtered_packet(&mut self, ctx: &mut NetCtx, iu: &mut InputUnit, invc: usize) {
        let flits = iu.vcs[invc].take_all_flits();
        let n = flits.len();
        let head = &flits[0];
        if head.read_request {
            self.stats.dropped_requests += 1;
        }
        if head.prepush {
            self.stats.dropped_prepushes += 1;
        }
        self.stats.dropped_flits += n as u64;
        debug!(
            self.logger,
            ctx.now,
            "router {}: filtered {} ({} flits), crediting upstream",
            self.router_id,
            head,
            n
        );
        for k in 0..n {
            iu.send_credit(invc, k == n - 1, ctx);
        }
        iu.vcs[invc].set_idle();
    }

    /// Drop marked packets that did not happen to win a grant slot.  One VC
    /// per inport per cycle, on a scan position of its own.
    fn execute_prepush_filtering(
        &mut self,
        granted: &HashSet<(usize, usize)>,
        ctx: &mut NetCtx,
        input_units: &mut [InputUnit],
    ) {
        if !self.config.prepush_filter {
            return;
        }
        for inport in 0..self.num_inports {
            let iu = &mut input_units[inport];
            let mut pick = None;
            for invc in self.filter_rr_invc[inport].scan() {
                let vc = &iu.vcs[invc];
                if vc.to_be_filtered
                    && vc.holds_full_packet()
                    && !granted.contains(&(inport, invc))
                {
                    pick = Some(invc);
                    break;
                }
            }
            if let Some(invc) = pick {
                self.drop_filtered_packet(ctx, iu, invc);
                self.filter_rr_invc[inport].advance_past(invc);
            }
        }
    }

    /// Idempotently reschedule for the next cycle iff some VC will need
    /// allocation, some filter clear is pending, or the crossbar holds a
    /// flit in flight.
    fn check_for_wakeup(
        &self,
        ctx: &mut NetCtx,
        input_units: &[InputUnit],
        filters: &[PrepushFilter],
        crossbar: &CrossbarSwitch,
    ) {
        let next = ctx.now + 1;
        let needs_sa = input_units
            .iter()
            .any(|iu| iu.vcs.iter().any(|vc| vc.need_stage(Stage::SwitchAlloc, next)));
        if needs_sa {
            ctx.sched.schedule_at(NodeId::Router(self.router_id), next);
        }
        for f in filters {
            if let Some(due) = f.next_clear_due() {
                ctx.sched
                    .schedule_at(NodeId::Router(self.router_id), due.max(next));
            }
        }
        if let Some(due) = crossbar.next_due() {
            ctx.sched
                .schedule_at(NodeId::Router(self.router_id), due.max(next));
        }
    }

    #[cfg(test)]
    pub fn held_port(&self, outport: usize) -> Option<(usize, usize)> {
        self.held_by[outport]
    }
}
