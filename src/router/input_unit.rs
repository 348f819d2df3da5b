use std::collections::HashMap;
use std::sync::Arc;

use crate::debug;
use crate::eventq::{Cycle, NodeId};
use crate::network::config::NetworkConfig;
use crate::network::flit::{Credit, Flit, RoutePartition, Stage};
use crate::network::topology::Topology;
use crate::network::NetCtx;
use crate::protocol::read_msg;
use crate::router::prepush_filter::PrepushFilter;
use crate::router::vc::VirtualChannel;
use crate::sim::log::Logger;

/// Upstream-facing side of one input port: drains the incoming link into the
/// addressed VC, computes routes for head flits and registers prepushes with
/// the outport filters, and returns credits as the allocator frees buffer
/// slots.
pub struct InputUnit {
    pub id: usize,
    router_id: usize,
    pub in_link: usize,
    pub credit_link: usize,
    pub vcs: Vec<VirtualChannel>,
    config: Arc<NetworkConfig>,
    logger: Arc<Logger>,
    pub buffer_writes: u64,
    pub buffer_reads: u64,
}

impl InputUnit {
    pub fn new(
        id: usize,
        router_id: usize,
        in_link: usize,
        credit_link: usize,
        config: Arc<NetworkConfig>,
        logger: Arc<Logger>,
    ) -> Self {
        assert!(config.router_pipe_stages >= 1);
        let vcs = (0..config.total_vcs()).map(VirtualChannel::new).collect();
        Self {
            id,
            router_id,
            in_link,
            credit_link,
            vcs,
            config,
            logger,
            buffer_writes: 0,
            buffer_reads: 0,
        }
    }

    /// One flit per cycle comes off the link.  Head flits activate their VC
    /// and get routed; continuation flits only ever join an active VC.
    pub fn wakeup(&mut self, ctx: &mut NetCtx, topo: &Topology, filters: &mut [PrepushFilter]) {
        let now = ctx.now;
        if !ctx.flit_links[self.in_link].is_ready(now) {
            return;
        }
        let mut flit = ctx.flit_links[self.in_link].consume(now);
        flit.route.hops += 1;
        self.buffer_writes += 1;

        let sa_ready = now + self.config.router_pipe_stages as Cycle - 1;
        flit.advance_stage(Stage::SwitchAlloc, sa_ready);
        debug!(
            self.logger,
            now,
            "router {} inport {}: buffering flit {}",
            self.router_id,
            self.id,
            flit
        );

        let vc_id = flit.vc;
        if flit.is_head() {
            if flit.route.is_multicast() {
                assert!(
                    self.config.multicast,
                    "multicast flit arrived with multicast disabled"
                );
                let parts = topo.multicast_route_compute(self.router_id, &flit.route.dests);
                self.grant_multicast_outports(vc_id, flit, parts, filters, now);
            } else {
                let outport = topo.route_compute(self.router_id, &flit.route);
                let register = flit.prepush && self.config.prepush_filter;
                let (addr, dests) = (flit.line_addr, flit.route.dests);
                let vc = &mut self.vcs[vc_id];
                vc.insert_flit(flit);
                vc.set_active(now);
                vc.output_port = Some(outport);
                if register {
                    filters[outport].register_prepush(addr, dests, Some((self.id, vc_id)));
                }
            }
        } else {
            let vc = &mut self.vcs[vc_id];
            assert!(
                vc.is_active(),
                "continuation flit into idle vc {} at router {} inport {}",
                vc_id,
                self.router_id,
                self.id
            );
            vc.insert_flit(flit);
        }

        if sa_ready > now {
            ctx.sched.schedule_at(NodeId::Router(self.router_id), sa_ready);
        }
        // link bandwidth is one flit per cycle; come back for the rest
        if let Some(at) = ctx.flit_links[self.in_link].next_arrival() {
            ctx.sched
                .schedule_at(NodeId::Router(self.router_id), at.max(now + 1));
        }
    }

    /// Set up multicast delivery for a freshly arrived head flit.  Branches
    /// whose whole destination partition is already covered by a registered
    /// prepush are pruned, unless one of their destinations demanded the
    /// line; if every branch is pruned the packet is left for the filter
    /// drop path.
    fn grant_multicast_outports(
        &mut self,
        vc_id: usize,
        flit: Flit,
        parts: HashMap<usize, RoutePartition>,
        filters: &mut [PrepushFilter],
        now: Cycle,
    ) {
        let addr = flit.line_addr;
        let is_prepush = flit.prepush;
        let size = flit.size;
        let demand = read_msg(&flit.msg).demand_dest;

        let mut sorted: Vec<(usize, RoutePartition)> = parts.into_iter().collect();
        sorted.sort_by_key(|(p, _)| *p);

        let mut outports = Vec::new();
        let mut demand_ports = Vec::new();
        let mut kept = HashMap::new();
        let mut registrations = Vec::new();
        for (port, part) in sorted {
            let demanded = !part.dests.intersect(&demand).is_empty();
            if is_prepush
                && self.config.prepush_filter
                && !demanded
                && filters[port].covers(addr, &part.dests)
            {
                debug!(
                    self.logger,
                    now,
                    "router {} inport {}: pruned prepush branch to port {} ({})",
                    self.router_id,
                    self.id,
                    port,
                    part.dests
                );
                continue;
            }
            if demanded {
                demand_ports.push(port);
            }
            if is_prepush && self.config.prepush_filter {
                registrations.push((port, part.dests));
            }
            outports.push(port);
            kept.insert(port, part);
        }

        let vc = &mut self.vcs[vc_id];
        vc.insert_flit(flit);
        vc.set_active(now);
        if outports.is_empty() {
            vc.to_be_filtered = true;
            debug!(
                self.logger,
                now,
                "router {} inport {}: prepush {:#x} fully redundant, will drop",
                self.router_id,
                self.id,
                addr
            );
            return;
        }
        vc.set_multicast_outports(&outports, &demand_ports, kept, size);
        for (port, dests) in registrations {
            filters[port].register_prepush(addr, dests, Some((self.id, vc_id)));
        }
    }

    /// Return one buffer slot upstream; the free signal additionally hands
    /// the whole VC back.
    pub fn send_credit(&mut self, vc: usize, is_free_signal: bool, ctx: &mut NetCtx) {
        self.buffer_reads += 1;
        ctx.send_credit(
            self.credit_link,
            Credit {
                vc,
                is_free_signal,
            },
        );
    }
}
