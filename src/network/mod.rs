/*
The flit-level network: mesh topology, links, routers and the per-machine
network interfaces, glued together by one event queue.

All links live in two flat arenas indexed by link id; components hold ids
rather than references, and every wakeup borrows the arenas through a NetCtx.
Sending on a link stamps the arrival tick and schedules the receiving node,
so the whole network advances strictly through the event queue with no
polling loop of its own.
*/

pub mod config;
pub mod flit;
pub mod link;
pub mod ni;
pub mod topology;

use std::sync::Arc;

use crate::eventq::{Cycle, EventQueue, NodeId};
use crate::network::config::NetworkConfig;
use crate::network::flit::{Credit, Flit};
use crate::network::link::{CreditLink, NetworkLink, TimedLink};
use crate::network::ni::NetworkInterface;
use crate::network::topology::Topology;
use crate::protocol::{MachineId, Message, MsgRef};
use crate::router::Router;
use crate::sim::log::Logger;
use crate::sim::stats::NetworkStats;

/// Per-wakeup view of the shared link arenas and the scheduler.
pub struct NetCtx<'a> {
    pub now: Cycle,
    pub flit_links: &'a mut [NetworkLink],
    pub credit_links: &'a mut [CreditLink],
    pub sched: &'a mut EventQueue,
}

impl NetCtx<'_> {
    pub fn send_flit(&mut self, link: usize, flit: Flit) {
        let link = &mut self.flit_links[link];
        let arrival = link.push(flit, self.now);
        self.sched.schedule_at(link.dest_node, arrival);
    }

    pub fn send_credit(&mut self, link: usize, credit: Credit) {
        let link = &mut self.credit_links[link];
        let arrival = link.push(credit, self.now);
        self.sched.schedule_at(link.dest_node, arrival);
    }
}

pub struct Network {
    pub config: Arc<NetworkConfig>,
    pub topo: Arc<Topology>,
    routers: Vec<Router>,
    nis: Vec<NetworkInterface>,
    flit_links: Vec<NetworkLink>,
    credit_links: Vec<CreditLink>,
    sched: EventQueue,
}

impl Network {
    pub fn new(config: &Arc<NetworkConfig>, logger: &Arc<Logger>) -> Self {
        let topo = Arc::new(Topology::mesh(config.rows, config.cols));
        let wiring = topo.wiring(config.link_latency);
        let routers = (0..topo.num_routers())
            .map(|r| Router::new(r, config, &topo, &wiring.routers[r], logger))
            .collect();
        let nis = (0..topo.num_nis())
            .map(|n| NetworkInterface::new(n, config, &topo, &wiring.nis[n], logger))
            .collect();
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
        Self {
            config: Arc::clone(config),
            topo,
            routers,
            nis,
            flit_links,
            credit_links,
            sched: EventQueue::new(),
        }
    }

    /// Hand a protocol message to `from`'s network interface.  It becomes
    /// eligible for injection after `delay` cycles.
    pub fn inject(&mut self, from: MachineId, msg: Message, delay: Cycle, now: Cycle) {
        let ni = self.topo.ni_of_machine(from);
        let Network {
            nis,
            flit_links,
            credit_links,
            sched,
            ..
        } = self;
        let mut ctx = NetCtx {
            now,
            flit_links: flit_links.as_mut_slice(),
            credit_links: credit_links.as_mut_slice(),
            sched,
        };
        nis[ni].enqueue_message(msg, delay, &mut ctx);
    }

    pub fn take_delivery(&mut self, at: MachineId, vnet: usize, now: Cycle) -> Option<MsgRef> {
        let ni = self.topo.ni_of_machine(at);
        self.nis[ni].take_delivery(vnet, now)
    }

    /// Run every node due at `now`.  Routers come before interfaces at the
    /// same tick; nothing a wakeup does can schedule work for the current
    /// tick, so one pass is complete.
    pub fn tick(&mut self, now: Cycle) {
        let due = self.sched.take_due(now);
        if due.is_empty() {
            return;
        }
        let Network {
            routers,
            nis,
            flit_links,
            credit_links,
            sched,
            ..
        } = self;
        let mut ctx = NetCtx {
            now,
            flit_links: flit_links.as_mut_slice(),
            credit_links: credit_links.as_mut_slice(),
            sched,
        };
        for node in due {
            match node {
                NodeId::Router(r) => routers[r].wakeup(&mut ctx),
                NodeId::Ni(n) => nis[n].wakeup(&mut ctx),
            }
        }
    }

    pub fn next_event(&self) -> Option<Cycle> {
        self.sched.next_tick()
    }

    /// True once nothing is scheduled and no interface holds undelivered
    /// work.  Ejection queues may still hold completed messages.
    pub fn is_quiescent(&self) -> bool {
        self.sched.is_empty() && self.nis.iter().all(|ni| ni.is_quiescent())
    }

    pub fn stats(&self, cycles: Cycle) -> NetworkStats {
        let mut stats = NetworkStats {
            cycles,
            ..NetworkStats::default()
        };
        for router in &self.routers {
            stats.routers.push(router.stats());
        }
        for ni in &self.nis {
            let s = ni.stats.clone();
            stats.messages_delivered += s.messages_ejected;
            stats.flits_delivered += s.flits_ejected;
            stats.total_hops += s.total_hops;
            stats.packet_latency.accumulate(&s.latency);
            stats.nis.push(s);
        }
        stats
    }
}
