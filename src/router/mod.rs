/*
One mesh router: per-inport VC buffers, per-outport credit trackers and
prepush filters, a two-stage switch allocator and the crossbar between them.

A wakeup runs the pipeline back to front within a single tick: buffer
incoming flits, drain incoming credits, allocate the switch, then move the
flits the crossbar accepted on earlier ticks out onto the links.  Everything
downstream of allocation is timed through DelayedQueue entries, so a wakeup
with nothing due is a no-op and the router stays silent until an event
reschedules it.
*/

pub mod arbiter;
pub mod crossbar;
pub mod input_unit;
pub mod output_unit;
pub mod prepush_filter;
pub mod switch_allocator;
pub mod vc;

use std::sync::Arc;

use crate::network::config::NetworkConfig;
use crate::network::topology::{RouterWiring, Topology};
use crate::network::NetCtx;
use crate::sim::log::Logger;
use crate::sim::stats::RouterStats;

use crossbar::CrossbarSwitch;
use input_unit::InputUnit;
use output_unit::OutputUnit;
use prepush_filter::PrepushFilter;
use switch_allocator::SwitchAllocator;

pub struct Router {
    pub id: usize,
    topo: Arc<Topology>,
    pub input_units: Vec<InputUnit>,
    pub output_units: Vec<OutputUnit>,
    /// One filter per outport, indexed like `output_units`.
    pub filters: Vec<PrepushFilter>,
    pub allocator: SwitchAllocator,
    pub crossbar: CrossbarSwitch,
}

impl Router {
    pub fn new(
        id: usize,
        config: &Arc<NetworkConfig>,
        topo: &Arc<Topology>,
        wiring: &RouterWiring,
        logger: &Arc<Logger>,
    ) -> Self {
        let num_ports = wiring.inports.len();
        assert_eq!(num_ports, wiring.outports.len());
        let input_units = wiring
            .inports
            .iter()
            .enumerate()
            .map(|(port, conn)| {
                InputUnit::new(
                    port,
                    id,
                    conn.flit_link,
                    conn.credit_link,
                    Arc::clone(config),
                    Arc::clone(logger),
                )
            })
            .collect();
        let output_units = wiring
            .outports
            .iter()
            .enumerate()
            .map(|(port, conn)| {
                OutputUnit::new(
                    port,
                    crate::network::config::NUM_VNETS,
                    config.vcs_per_vnet,
                    config.vc_buffer_depth,
                    conn.flit_link,
                    conn.credit_link,
                )
            })
            .collect();
        Self {
            id,
            topo: Arc::clone(topo),
            input_units,
            output_units,
            filters: (0..num_ports).map(|_| PrepushFilter::new()).collect(),
            allocator: SwitchAllocator::new(
                id,
                num_ports,
                num_ports,
                Arc::clone(config),
                Arc::clone(logger),
            ),
            crossbar: CrossbarSwitch::new(num_ports),
        }
    }

    pub fn wakeup(&mut self, ctx: &mut NetCtx) {
        let Router {
            input_units,
            output_units,
            filters,
            allocator,
            crossbar,
            topo,
            ..
        } = self;
        for iu in input_units.iter_mut() {
            iu.wakeup(ctx, topo, filters);
        }
        for ou in output_units.iter_mut() {
            ou.wakeup(ctx);
        }
        allocator.wakeup(ctx, input_units, output_units, filters, crossbar);
        crossbar.wakeup(ctx, output_units);
    }

    pub fn num_ports(&self) -> usize {
        self.input_units.len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            id: self.id,
            buffer_writes: self.input_units.iter().map(|iu| iu.buffer_writes).sum(),
            buffer_reads: self.input_units.iter().map(|iu| iu.buffer_reads).sum(),
            crossbar_activity: self.crossbar.crossbar_activity,
            flits_sent: self.output_units.iter().map(|ou| ou.flits_sent).sum(),
            switch: self.allocator.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventq::{Cycle, EventQueue, NodeId};
    use crate::network::config::{VNET_FORWARD, VNET_REQUEST};
    use crate::network::flit::{Flit, FlitKind, RouteInfo, RouteKind, Stage};
    use crate::network::link::{CreditLink, NetworkLink, TimedLink};
    use crate::protocol::{msg_ref, MachineId, Message, MsgKind, MsgRef, NetDest};

    struct Harness {
        router: Router,
        flit_links: Vec<NetworkLink>,
        credit_links: Vec<CreditLink>,
        sched: EventQueue,
        now: Cycle,
    }

    impl Harness {
        fn new(rows: usize, cols: usize, router_id: usize, cfg: NetworkConfig) -> Self {
            let config = Arc::new(NetworkConfig { rows, cols, ..cfg });
            let topo = Arc::new(Topology::mesh(rows, cols));
            let wiring = topo.wiring(config.link_latency);
            let logger = Arc::new(Logger::silent());
            let router = Router::new(router_id, &config, &topo, &wiring.routers[router_id], &logger);
            let flit_links = wiring
                .flit_links
                .iter()
                .enumerate()
                .map(|(i, d)| TimedLink::new(i, d.latency, d.dest_node))
                .collect();
            let credit_links = wiring
                .credit_links
                .iter()
                .enumerate()
                .map(|(i, d)| TimedLink::new(i, d.latency, d.dest_node))
                .collect();
            Harness {
                router,
                flit_links,
                credit_links,
                sched: EventQueue::new(),
                now: 0,
            }
        }

        fn inject(&mut self, inport: usize, flit: Flit, at: Cycle) {
            let link = self.router.input_units[inport].in_link;
            let arrival = self.flit_links[link].push(flit, at);
            self.sched.schedule_at(NodeId::Router(self.router.id), arrival);
        }

        /// Run the router for every due tick up to and including `until`.
        fn run_until(&mut self, until: Cycle) {
            while self.now <= until {
                let due = self.sched.take_due(self.now);
                if due.contains(&NodeId::Router(self.router.id)) {
                    let mut ctx = NetCtx {
                        now: self.now,
                        flit_links: &mut self.flit_links,
                        credit_links: &mut self.credit_links,
                        sched: &mut self.sched,
                    };
                    self.router.wakeup(&mut ctx);
                }
                self.now += 1;
            }
        }

        fn upstream_credits(&self, inport: usize) -> Vec<(usize, bool)> {
            let link = self.router.input_units[inport].credit_link;
            self.credit_links[link]
                .iter_queued()
                .map(|c| (c.vc, c.is_free_signal))
                .collect()
        }

        fn out_flits(&self, outport: usize) -> Vec<&Flit> {
            let link = self.router.output_units[outport].out_link;
            self.flit_links[link].iter_queued().collect()
        }
    }

    fn unicast_flit(
        id: usize,
        kind: FlitKind,
        vc: usize,
        size: usize,
        packet_id: u64,
        msg: &MsgRef,
        dest_ni: usize,
        dest_router: usize,
        vnet: usize,
    ) -> Flit {
        let dests = {
            let m = crate::protocol::read_msg(msg);
            m.dest
        };
        let route = RouteInfo {
            vnet,
            dests,
            src_ni: 0,
            src_router: 0,
            hops: 0,
            kind: RouteKind::Unicast {
                dest_ni,
                dest_router,
            },
        };
        Flit::new(id, kind, vc, size, packet_id, route, Arc::clone(msg), 0)
    }

    #[test]
    fn unicast_packet_crosses_the_switch() {
        let mut h = Harness::new(1, 2, 0, NetworkConfig::default());
        // core0 -> core1, single-flit packet through the East port (2)
        let msg = msg_ref(Message::new(
            MsgKind::WriteRequest,
            0x40,
            MachineId::core(0),
            NetDest::single(MachineId::core(1)),
            8,
            VNET_REQUEST,
        ));
        let flit = unicast_flit(0, FlitKind::HeadTail, 0, 1, 7, &msg, 1, 1, VNET_REQUEST);
        h.inject(0, flit, 4);
        h.run_until(6);

        // buffered at 5, granted at 5, traversed at 6, on the link at 6
        let east = h.out_flits(2);
        assert_eq!(east.len(), 1);
        assert!(east[0].is_stage(Stage::LinkTraversal, 6));
        assert_eq!(east[0].route.hops, 1);

        // the VC went idle and upstream got its buffer back with a free signal
        assert!(h.router.input_units[0].vcs[0].is_idle());
        assert_eq!(h.upstream_credits(0), vec![(0, true)]);
        assert_eq!(h.router.allocator.stats.grants, 1);
        assert_eq!(h.router.output_units[2].flits_sent, 1);
    }

    #[test]
    fn covered_read_is_dropped_with_credit_and_no_forwarding() {
        let mut h = Harness::new(1, 2, 0, NetworkConfig::default());
        // an earlier prepush to core0 left through the local core port, so
        // its registration sits on the same port the answering read enters
        h.router.filters[0].register_prepush(0x1000, NetDest::single(MachineId::core(0)), None);

        // core0's read for the same line, headed East to llc1
        let msg = msg_ref(Message::new(
            MsgKind::ReadRequest,
            0x1000,
            MachineId::core(0),
            NetDest::single(MachineId::llc(1)),
            8,
            VNET_REQUEST,
        ));
        let ni_llc1 = 3;
        let flit = unicast_flit(0, FlitKind::HeadTail, 0, 1, 9, &msg, ni_llc1, 1, VNET_REQUEST);
        h.inject(0, flit, 4);
        h.run_until(7);

        assert!(h.out_flits(2).is_empty(), "dropped read must not be forwarded");
        assert!(h.router.crossbar.is_empty());
        assert!(h.router.input_units[0].vcs[0].is_idle());
        assert_eq!(h.upstream_credits(0), vec![(0, true)]);
        assert_eq!(h.router.allocator.stats.marked_for_drop, 1);
        assert_eq!(h.router.allocator.stats.dropped_requests, 1);
        assert_eq!(h.router.allocator.stats.dropped_flits, 1);
        assert_eq!(h.router.allocator.stats.grants, 0);
    }

    #[test]
    fn multicast_branch_waits_out_a_held_port() {
        // router 1 of a 1x3 mesh: ports LocalCore=0, LocalLlc=1, West=2, East=3
        let mut h = Harness::new(1, 3, 1, NetworkConfig::default());
        let east = 3;

        // two-flit unicast core1 -> core2 keeps East held across two cycles
        let umsg = msg_ref(Message::new(
            MsgKind::WriteRequest,
            0x80,
            MachineId::core(1),
            NetDest::single(MachineId::core(2)),
            32,
            VNET_REQUEST,
        ));
        let head = unicast_flit(0, FlitKind::Head, 0, 2, 1, &umsg, 2, 2, VNET_REQUEST);
        let tail = unicast_flit(1, FlitKind::Tail, 0, 2, 1, &umsg, 2, 2, VNET_REQUEST);

        // single-flit multicast prepush from llc0 arriving on West:
        // branches to LocalCore (core1) and East (core2, llc2)
        let mut dests = NetDest::new();
        dests.add(MachineId::core(1));
        dests.add(MachineId::core(2));
        dests.add(MachineId::llc(2));
        let pmsg = msg_ref(Message::new(
            MsgKind::Prepush,
            0x2000,
            MachineId::llc(0),
            dests,
            8,
            VNET_FORWARD,
        ));
        let pvc = NetworkConfig::default().vcs_per_vnet * VNET_FORWARD;
        let proute = RouteInfo {
            vnet: VNET_FORWARD,
            dests,
            src_ni: 3,
            src_router: 0,
            hops: 0,
            kind: RouteKind::Multicast {
                dest_nis: [1, 2, 5].into_iter().collect(),
                dest_routers: [1, 2].into_iter().collect(),
            },
        };
        let pflit = Flit::new(10, FlitKind::HeadTail, pvc, 1, 2, proute, Arc::clone(&pmsg), 0);

        h.inject(0, head, 4);
        h.inject(2, pflit, 4);
        h.inject(0, tail, 5);

        // cycle 5: unicast head wins East (and holds it), multicast serves
        // its LocalCore branch with a replica
        h.run_until(5);
        {
            let mvc = &h.router.input_units[2].vcs[pvc];
            assert!(mvc.is_active());
            assert_eq!(mvc.remaining_outports(), &[east]);
            assert_eq!(h.router.allocator.held_port(east), Some((0, 0)));
        }

        // cycle 6: the replica reaches the local link and the unicast tail
        // releases the hold
        h.run_until(6);
        let local = h.out_flits(0);
        assert_eq!(local.len(), 1);
        assert!(local[0].is_replica);
        assert_eq!(local[0].route.dests, NetDest::single(MachineId::core(1)));

        // cycle 7 lets the East branch through as the canonical copy
        h.run_until(8);
        assert_eq!(h.router.allocator.held_port(east), None);
        assert!(h.router.input_units[2].vcs[pvc].is_idle());
        let east_flits = h.out_flits(east);
        assert_eq!(east_flits.len(), 3);
        let last = east_flits.last().unwrap();
        assert!(!last.is_replica, "final branch takes the canonical flit");
        let mut east_dests = NetDest::new();
        east_dests.add(MachineId::core(2));
        east_dests.add(MachineId::llc(2));
        assert_eq!(last.route.dests, east_dests);
        assert_eq!(h.router.allocator.stats.replicas, 1);

        // upstream West saw exactly one credit, on the canonical pop
        assert_eq!(h.upstream_credits(2), vec![(pvc, true)]);
    }

    #[test]
    fn ordered_vnet_preserves_arrival_order() {
        let cfg = NetworkConfig {
            ordered_vnets: vec![VNET_REQUEST],
            ..NetworkConfig::default()
        };
        let mut h = Harness::new(1, 2, 0, cfg);
        let east = 2;

        // a two-flit write from the llc port keeps East busy long enough for
        // both reads below to be buffered before either can win it
        let hmsg = msg_ref(Message::new(
            MsgKind::WriteRequest,
            0x80,
            MachineId::llc(0),
            NetDest::single(MachineId::core(1)),
            32,
            VNET_REQUEST,
        ));
        h.inject(1, unicast_flit(0, FlitKind::Head, 0, 2, 1, &hmsg, 1, 1, VNET_REQUEST), 3);
        h.inject(1, unicast_flit(1, FlitKind::Tail, 0, 2, 1, &hmsg, 1, 1, VNET_REQUEST), 4);

        // the older read lands in vc 1, the younger in vc 0, so a plain
        // round-robin scan would serve them backwards
        let older = msg_ref(Message::new(
            MsgKind::ReadRequest,
            0x100,
            MachineId::core(0),
            NetDest::single(MachineId::llc(1)),
            8,
            VNET_REQUEST,
        ));
        let younger = msg_ref(Message::new(
            MsgKind::ReadRequest,
            0x200,
            MachineId::core(0),
            NetDest::single(MachineId::llc(1)),
            8,
            VNET_REQUEST,
        ));
        h.inject(0, unicast_flit(0, FlitKind::HeadTail, 1, 1, 2, &older, 3, 1, VNET_REQUEST), 4);
        h.inject(0, unicast_flit(0, FlitKind::HeadTail, 0, 1, 3, &younger, 3, 1, VNET_REQUEST), 5);

        // cycle 6: East is free again and the older read wins it even though
        // vc 0 is scanned first
        h.run_until(6);
        assert!(h.router.input_units[0].vcs[1].is_idle(), "older read granted");
        assert!(h.router.input_units[0].vcs[0].is_active(), "younger read waits");

        h.run_until(8);
        let east_flits = h.out_flits(east);
        assert_eq!(east_flits.len(), 4);
        assert_eq!(east_flits[2].line_addr, 0x100);
        assert_eq!(east_flits[3].line_addr, 0x200);
        assert_eq!(h.router.allocator.stats.grants, 4);
    }

    #[test]
    fn invalidation_trails_registered_prepush() {
        let cfg = NetworkConfig {
            ordered_prepush_inv: true,
            ..NetworkConfig::default()
        };
        let mut h = Harness::new(1, 2, 0, cfg);
        let east = 2;
        h.router.filters[east].register_prepush(0x3000, NetDest::single(MachineId::core(1)), None);

        let msg = msg_ref(Message::new(
            MsgKind::Invalidation,
            0x3000,
            MachineId::llc(0),
            NetDest::single(MachineId::core(1)),
            8,
            VNET_FORWARD,
        ));
        let vc = NetworkConfig::default().vcs_per_vnet * VNET_FORWARD;
        let flit = unicast_flit(0, FlitKind::HeadTail, vc, 1, 3, &msg, 1, 1, VNET_FORWARD);
        h.inject(0, flit, 4);
        h.run_until(8);

        // stalled behind the filter entry
        assert!(h.out_flits(east).is_empty());
        assert!(h.router.input_units[0].vcs[vc].is_active());

        // once the registration clears, the invalidation moves
        h.router.filters[east].clear_prepush_at(
            0x3000,
            NetDest::single(MachineId::core(1)),
            9,
        );
        h.sched.schedule_at(NodeId::Router(0), 9);
        h.run_until(10);
        assert_eq!(h.out_flits(east).len(), 1);
        assert!(h.router.input_units[0].vcs[vc].is_idle());
    }
}
