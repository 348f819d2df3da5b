/*
Synthetic workloads.  The default coherence pattern has cores issue demand
reads and writes for a shared pool of cache lines, each line homed on an LLC
slice by address interleaving.  The LLC side answers reads with data
responses, or with a prepush multicast to the line's sharers when prepush is
enabled, and invalidates sharers on a write.

The driver is the protocol endpoint on both sides of the network; it keeps
the sharer list per line and a small FIFO private cache per core so that
traffic exhibits the re-reference and invalidation behavior the prepush
filter exists for.  There are no invalidation acks and no ordering between
the response and forward vnets; a stale private-cache entry only changes
which requests get issued, never correctness of delivery.

The remaining patterns are the classic one-way core-to-core loads (uniform
random, transpose, neighbor, hotspot) for measuring raw network behavior
without a protocol in the loop.
*/

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::debug;
use crate::eventq::Cycle;
use crate::network::config::{vnet_for, VNET_FORWARD, VNET_REQUEST, VNET_RESPONSE};
use crate::network::Network;
use crate::protocol::{read_msg, MachineId, Message, MsgKind, MsgRef, NetDest};
use crate::sim::log::Logger;
use crate::sim::stats::LatencyHistogram;
use crate::traffic::config::{TrafficConfig, TrafficPattern};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStats {
    pub reads_issued: u64,
    pub writes_issued: u64,
    /// One-way payloads injected by the non-coherence patterns.
    pub payloads_issued: u64,
    pub responses_received: u64,
    pub prepushes_received: u64,
    /// Prepush deliveries that completed an outstanding demand read.
    pub demand_prepushes: u64,
    pub invalidations_received: u64,
    /// Issue opportunities dropped because no line was eligible, or because
    /// the pattern mapped a core onto itself.
    pub issue_skips: u64,
    /// Issue to completion for demand requests; injection to delivery for
    /// one-way payloads.  In cycles.
    pub request_latency: LatencyHistogram,
}

#[derive(Debug, Default)]
struct CoreState {
    issued: u64,
    /// Lines with a request in flight, with issue tick.
    outstanding: Vec<(u64, Cycle)>,
    /// Private cache contents, FIFO replacement.
    held: VecDeque<u64>,
}

impl CoreState {
    fn holds(&self, line: u64) -> bool {
        self.held.contains(&line)
    }

    fn fill(&mut self, line: u64, capacity: usize) {
        if !self.holds(line) {
            self.held.push_back(line);
            if self.held.len() > capacity.max(1) {
                self.held.pop_front();
            }
        }
    }

    fn evict(&mut self, line: u64) {
        self.held.retain(|&l| l != line);
    }

    /// Retire the in-flight request for `line`, if any, returning its issue
    /// tick.  Deliveries the core never asked for return None.
    fn complete(&mut self, line: u64) -> Option<Cycle> {
        let pos = self.outstanding.iter().position(|(l, _)| *l == line)?;
        Some(self.outstanding.swap_remove(pos).1)
    }
}

#[derive(Debug, Default)]
struct LineState {
    sharers: NetDest,
}

pub struct TrafficDriver {
    config: TrafficConfig,
    logger: Arc<Logger>,
    rng: StdRng,
    num_cores: usize,
    num_llcs: usize,
    cols: usize,
    cores: Vec<CoreState>,
    lines: Vec<LineState>,
    /// In-flight one-way payloads, issue tick by line value.
    payload_sent: HashMap<u64, Cycle>,
    pub stats: TrafficStats,
}

impl TrafficDriver {
    pub fn new(config: TrafficConfig, net: &Network, logger: &Arc<Logger>) -> Self {
        let num_cores = net.topo.num_routers();
        let num_llcs = net.topo.num_routers();
        if config.pattern == TrafficPattern::Transpose {
            assert_eq!(
                net.topo.rows, net.topo.cols,
                "transpose traffic needs a square mesh"
            );
        }
        let num_lines = config.num_lines.max(1) as usize;
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            logger: Arc::clone(logger),
            num_cores,
            num_llcs,
            cols: net.topo.cols,
            cores: (0..num_cores).map(|_| CoreState::default()).collect(),
            lines: (0..num_lines).map(|_| LineState::default()).collect(),
            payload_sent: HashMap::new(),
            stats: TrafficStats::default(),
        }
    }

    pub fn done(&self) -> bool {
        self.cores
            .iter()
            .all(|c| c.issued >= self.config.requests_per_core && c.outstanding.is_empty())
            && self.payload_sent.is_empty()
    }

    /// One driver cycle: absorb deliveries on both sides of the network,
    /// then let each core try to issue.  Runs after the network's own tick.
    pub fn tick(&mut self, net: &mut Network, now: Cycle) {
        self.drain_cores(net, now);
        self.drain_llcs(net, now);
        self.issue(net, now);
    }

    fn home(&self, line: u64) -> MachineId {
        let idx = (line / self.config.line_bytes.max(1)) as usize;
        MachineId::llc((idx % self.num_llcs) as u32)
    }

    fn line_index(&self, line: u64) -> usize {
        let idx = (line / self.config.line_bytes.max(1)) as usize;
        assert!(idx < self.lines.len(), "line {:#x} outside working set", line);
        idx
    }

    fn drain_cores(&mut self, net: &mut Network, now: Cycle) {
        let capacity = self.config.cache_lines;
        for c in 0..self.num_cores {
            let machine = MachineId::core(c as u32);
            while let Some(msg) = net.take_delivery(machine, VNET_RESPONSE, now) {
                let line = read_msg(&msg).line_addr;
                self.stats.responses_received += 1;
                if let Some(at) = self.cores[c].complete(line) {
                    self.stats.request_latency.record(now - at);
                    self.cores[c].fill(line, capacity);
                } else if let Some(at) = self.payload_sent.remove(&line) {
                    self.stats.request_latency.record(now - at);
                }
            }
            while let Some(msg) = net.take_delivery(machine, VNET_FORWARD, now) {
                let (kind, line) = {
                    let m = read_msg(&msg);
                    (m.kind, m.line_addr)
                };
                match kind {
                    MsgKind::Prepush => {
                        self.stats.prepushes_received += 1;
                        if let Some(at) = self.cores[c].complete(line) {
                            self.stats.demand_prepushes += 1;
                            self.stats.request_latency.record(now - at);
                        }
                        self.cores[c].fill(line, capacity);
                    }
                    MsgKind::Invalidation => {
                        self.stats.invalidations_received += 1;
                        self.cores[c].evict(line);
                    }
                    other => panic!("core {} got {:?} on the forward vnet", c, other),
                }
            }
        }
    }

    fn drain_llcs(&mut self, net: &mut Network, now: Cycle) {
        for l in 0..self.num_llcs {
            let machine = MachineId::llc(l as u32);
            while let Some(msg) = net.take_delivery(machine, VNET_REQUEST, now) {
                self.serve(l, &msg, net, now);
            }
        }
    }

    /// LLC slice protocol action for one demand request.
    fn serve(&mut self, llc: usize, msg: &MsgRef, net: &mut Network, now: Cycle) {
        let (kind, line, requestor, demand) = {
            let m = read_msg(msg);
            // reads coalesced in the interface carry all requestors in
            // demand_dest; an un-coalesced one carries only `requestor`
            let demand = if m.demand_dest.is_empty() {
                NetDest::single(m.requestor)
            } else {
                m.demand_dest
            };
            (m.kind, m.line_addr, m.requestor, demand)
        };
        let home = MachineId::llc(llc as u32);
        let idx = self.line_index(line);
        let delay = self.config.response_delay.max(1);

        match kind {
            MsgKind::ReadRequest => {
                let sharers = self.lines[idx].sharers;
                if self.config.prepush && !sharers.is_empty() {
                    let mut dest = sharers;
                    dest.union_with(&demand);
                    debug!(
                        self.logger,
                        now,
                        "llc {} prepushes line {:#x} to {} (demand {})",
                        llc,
                        line,
                        dest,
                        demand
                    );
                    let mut push = Message::new(
                        MsgKind::Prepush,
                        line,
                        home,
                        dest,
                        self.config.data_bytes,
                        VNET_FORWARD,
                    );
                    push.demand_dest = demand;
                    net.inject(home, push, delay, now);
                } else {
                    for member in demand.iter() {
                        let resp = Message::new(
                            MsgKind::Response,
                            line,
                            home,
                            NetDest::single(member),
                            self.config.data_bytes,
                            VNET_RESPONSE,
                        );
                        net.inject(home, resp, delay, now);
                    }
                }
                self.lines[idx].sharers.union_with(&demand);
            }
            MsgKind::WriteRequest => {
                let mut stale = self.lines[idx].sharers;
                stale.remove(requestor);
                if !stale.is_empty() {
                    debug!(
                        self.logger,
                        now,
                        "llc {} invalidates {} for line {:#x}",
                        llc,
                        stale,
                        line
                    );
                    let inv = Message::new(
                        MsgKind::Invalidation,
                        line,
                        home,
                        stale,
                        self.config.control_bytes,
                        VNET_FORWARD,
                    );
                    net.inject(home, inv, delay, now);
                }
                self.lines[idx].sharers = NetDest::single(requestor);
                let ack = Message::new(
                    MsgKind::Response,
                    line,
                    home,
                    NetDest::single(requestor),
                    self.config.control_bytes,
                    VNET_RESPONSE,
                );
                net.inject(home, ack, delay, now);
            }
            other => panic!("llc {} got {:?} on the request vnet", llc, other),
        }
    }

    fn issue(&mut self, net: &mut Network, now: Cycle) {
        if self.config.pattern != TrafficPattern::Coherence {
            self.issue_payloads(net, now);
            return;
        }
        let line_bytes = self.config.line_bytes.max(1);
        let num_lines = self.config.num_lines.max(1);
        for c in 0..self.num_cores {
            if self.cores[c].issued >= self.config.requests_per_core {
                continue;
            }
            if self.cores[c].outstanding.len() >= self.config.max_inflight_per_core {
                continue;
            }
            if self.rng.gen::<f64>() >= self.config.injection_rate {
                continue;
            }
            let is_write = self.rng.gen::<f64>() < self.config.write_fraction;

            // a few draws to find a line without a request in flight; reads
            // additionally skip lines the private cache still holds
            let mut chosen = None;
            for _ in 0..4 {
                let line = self.rng.gen_range(0..num_lines) * line_bytes;
                let busy = self.cores[c].outstanding.iter().any(|(l, _)| *l == line);
                if busy || (!is_write && self.cores[c].holds(line)) {
                    continue;
                }
                chosen = Some(line);
                break;
            }
            let Some(line) = chosen else {
                self.stats.issue_skips += 1;
                continue;
            };

            let machine = MachineId::core(c as u32);
            let kind = if is_write {
                MsgKind::WriteRequest
            } else {
                MsgKind::ReadRequest
            };
            let mut msg = Message::new(
                kind,
                line,
                machine,
                NetDest::single(self.home(line)),
                self.config.control_bytes,
                vnet_for(kind),
            );
            if kind == MsgKind::ReadRequest {
                // reads carry their requestor in demand_dest so interface
                // coalescing accumulates instead of replacing
                msg.demand_dest = NetDest::single(machine);
            }
            debug!(
                self.logger,
                now,
                "core {} issues {:?} for line {:#x} (home {})",
                c,
                kind,
                line,
                self.home(line)
            );
            net.inject(machine, msg, 1, now);
            self.cores[c].outstanding.push((line, now));
            self.cores[c].issued += 1;
            if is_write {
                self.stats.writes_issued += 1;
            } else {
                self.stats.reads_issued += 1;
            }
        }
    }

    /// One-way data payloads between cores, destination picked per pattern.
    /// Each payload carries a line value of its own so delivery can be
    /// matched back to its issue tick.
    fn issue_payloads(&mut self, net: &mut Network, now: Cycle) {
        let line_bytes = self.config.line_bytes.max(1);
        for c in 0..self.num_cores {
            if self.cores[c].issued >= self.config.requests_per_core {
                continue;
            }
            if self.rng.gen::<f64>() >= self.config.injection_rate {
                continue;
            }
            self.cores[c].issued += 1;
            let Some(dest) = self.payload_dest(c) else {
                // the pattern mapped this core onto itself; the slot is spent
                self.stats.issue_skips += 1;
                continue;
            };
            let line = self.stats.payloads_issued * line_bytes;
            let machine = MachineId::core(c as u32);
            let msg = Message::new(
                MsgKind::Response,
                line,
                machine,
                NetDest::single(MachineId::core(dest as u32)),
                self.config.data_bytes,
                VNET_RESPONSE,
            );
            debug!(
                self.logger,
                now,
                "core {} sends payload {:#x} to core {}",
                c,
                line,
                dest
            );
            net.inject(machine, msg, 1, now);
            self.payload_sent.insert(line, now);
            self.stats.payloads_issued += 1;
        }
    }

    fn payload_dest(&mut self, core: usize) -> Option<usize> {
        let n = self.num_cores;
        let dest = match self.config.pattern {
            TrafficPattern::Coherence => unreachable!("coherence issues demand requests"),
            TrafficPattern::UniformRandom => {
                if n < 2 {
                    return None;
                }
                let d = self.rng.gen_range(0..n - 1);
                if d >= core {
                    d + 1
                } else {
                    d
                }
            }
            TrafficPattern::Transpose => {
                let (x, y) = (core % self.cols, core / self.cols);
                x * self.cols + y
            }
            TrafficPattern::Neighbor => (core + 1) % n,
            TrafficPattern::Hotspot => self.config.hotspot_core % n,
        };
        (dest != core).then_some(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::NetworkConfig;

    fn setup(traffic: TrafficConfig) -> (Network, TrafficDriver) {
        let config = Arc::new(NetworkConfig {
            rows: 2,
            cols: 2,
            ..NetworkConfig::default()
        });
        let logger = Arc::new(Logger::silent());
        let net = Network::new(&config, &logger);
        let driver = TrafficDriver::new(traffic, &net, &logger);
        (net, driver)
    }

    fn run(net: &mut Network, driver: &mut TrafficDriver, from: Cycle, to: Cycle) {
        for now in from..to {
            net.tick(now);
            driver.tick(net, now);
        }
    }

    fn demand(kind: MsgKind, line: u64, from: MachineId, to: MachineId, bytes: u32) -> Message {
        Message::new(kind, line, from, NetDest::single(to), bytes, vnet_for(kind))
    }

    #[test]
    fn llc_responds_prepushes_and_invalidates() {
        // idle cores; every request below is hand-fed
        let (mut net, mut driver) = setup(TrafficConfig {
            requests_per_core: 0,
            response_delay: 2,
            prepush: true,
            ..TrafficConfig::default()
        });
        let line = 0;
        let home = MachineId::llc(0);

        // no sharers yet: plain data response
        net.inject(
            MachineId::core(3),
            demand(MsgKind::ReadRequest, line, MachineId::core(3), home, 8),
            1,
            0,
        );
        run(&mut net, &mut driver, 0, 40);
        assert_eq!(driver.stats.responses_received, 1);
        assert_eq!(driver.stats.prepushes_received, 0);
        assert!(driver.cores[3].holds(line));

        // second reader: the line now has a sharer, so the LLC multicasts a
        // prepush to both
        net.inject(
            MachineId::core(1),
            demand(MsgKind::ReadRequest, line, MachineId::core(1), home, 8),
            1,
            40,
        );
        run(&mut net, &mut driver, 40, 80);
        assert_eq!(driver.stats.prepushes_received, 2);
        assert!(driver.cores[1].holds(line));

        // a writer invalidates the two sharers and gets an ack
        net.inject(
            MachineId::core(2),
            demand(MsgKind::WriteRequest, line, MachineId::core(2), home, 8),
            1,
            80,
        );
        run(&mut net, &mut driver, 80, 120);
        assert_eq!(driver.stats.invalidations_received, 2);
        assert_eq!(driver.stats.responses_received, 2);
        assert!(!driver.cores[3].holds(line));
        assert!(!driver.cores[1].holds(line));
        assert!(net.is_quiescent());
    }

    #[test]
    fn seeded_run_drains_completely() {
        let (mut net, mut driver) = setup(TrafficConfig {
            requests_per_core: 25,
            injection_rate: 1.0,
            max_inflight_per_core: 4,
            num_lines: 16,
            line_bytes: 64,
            cache_lines: 8,
            write_fraction: 0.25,
            prepush: true,
            response_delay: 2,
            control_bytes: 8,
            data_bytes: 40,
            seed: 7,
            ..TrafficConfig::default()
        });

        let mut finished = None;
        for now in 0..50_000 {
            net.tick(now);
            driver.tick(&mut net, now);
            if driver.done() && net.is_quiescent() {
                finished = Some(now);
                break;
            }
        }
        let end = finished.expect("workload should drain");

        let issued = driver.stats.reads_issued + driver.stats.writes_issued;
        assert_eq!(issued, 4 * 25);
        // every write is acked, every read answered by a response or by a
        // prepush that carried its demand
        let completions = driver.stats.responses_received + driver.stats.demand_prepushes;
        assert!(completions >= issued);
        assert_eq!(driver.stats.request_latency.count, issued);

        let stats = net.stats(end);
        assert!(stats.messages_delivered > 0);
        // every ejected packet is either delivered or declined as a
        // duplicate prepush
        let declined: u64 = stats.nis.iter().map(|n| n.prepushes_declined).sum();
        assert_eq!(stats.packet_latency.count, stats.messages_delivered + declined);
    }

    fn run_to_drain(net: &mut Network, driver: &mut TrafficDriver, horizon: Cycle) -> Cycle {
        for now in 0..horizon {
            net.tick(now);
            driver.tick(net, now);
            if driver.done() && net.is_quiescent() {
                return now;
            }
        }
        panic!("pattern run did not drain within {} cycles", horizon);
    }

    #[test]
    fn transpose_payloads_land_on_the_mirror_core() {
        let (mut net, mut driver) = setup(TrafficConfig {
            pattern: TrafficPattern::Transpose,
            requests_per_core: 5,
            injection_rate: 1.0,
            seed: 3,
            ..TrafficConfig::default()
        });
        run_to_drain(&mut net, &mut driver, 5_000);

        // on the 2x2 mesh cores 1 and 2 mirror each other while 0 and 3 sit
        // on the diagonal and only burn their issue slots
        assert_eq!(driver.stats.payloads_issued, 10);
        assert_eq!(driver.stats.issue_skips, 10);
        assert_eq!(driver.stats.responses_received, 10);
        assert_eq!(driver.stats.request_latency.count, 10);
        assert_eq!(driver.stats.reads_issued + driver.stats.writes_issued, 0);
    }

    #[test]
    fn uniform_random_payloads_all_arrive() {
        let (mut net, mut driver) = setup(TrafficConfig {
            pattern: TrafficPattern::UniformRandom,
            requests_per_core: 10,
            injection_rate: 0.5,
            seed: 11,
            ..TrafficConfig::default()
        });
        let end = run_to_drain(&mut net, &mut driver, 20_000);

        assert_eq!(driver.stats.payloads_issued, 40);
        assert_eq!(driver.stats.issue_skips, 0);
        assert_eq!(driver.stats.responses_received, 40);
        assert_eq!(driver.stats.request_latency.count, 40);
        // payloads never target their own core, so every one crossed a link
        assert!(net.stats(end).total_hops >= 40);
    }
}
