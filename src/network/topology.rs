/*
Mesh construction and routing.

The network is a rows x cols mesh with two local interfaces per router: one
for the core at that tile and one for the shared-cache (LLC) slice.  Port
indices are symmetric between the input and output side of a router: port 0
is the core interface, port 1 the LLC interface, and the remaining ports the
present compass neighbors in West, East, North, South order.

Routing is deterministic XY (column first, then row), so unicast routes need
only a per-router next-hop table and multicast routes partition the
destination set by first hop.
*/

use std::collections::HashMap;

use crate::eventq::{Cycle, NodeId};
use crate::network::flit::{RouteInfo, RoutePartition};
use crate::protocol::{MachineId, MachineKind, NetDest};

pub const CORE_PORT: usize = 0;
pub const LLC_PORT: usize = 1;

/// Blueprint for one timed link; the network instantiates the real links.
#[derive(Debug, Clone, Copy)]
pub struct LinkDesc {
    pub latency: Cycle,
    pub dest_node: NodeId,
}

/// Flit link feeding a port and the credit link running opposite to it.
#[derive(Debug, Clone, Copy)]
pub struct PortConn {
    pub flit_link: usize,
    pub credit_link: usize,
}

#[derive(Debug)]
pub struct RouterWiring {
    /// Per inport: incoming flit link, outgoing credit link to the upstream
    /// sender.
    pub inports: Vec<PortConn>,
    /// Per outport: outgoing flit link, incoming credit link from the
    /// downstream receiver.
    pub outports: Vec<PortConn>,
}

#[derive(Debug)]
pub struct NiWiring {
    /// Injection side: flit link into the router, credit link back from it.
    pub inject: PortConn,
    /// Ejection side: flit link from the router, credit link back to it.
    pub eject: PortConn,
}

#[derive(Debug)]
pub struct Wiring {
    pub flit_links: Vec<LinkDesc>,
    pub credit_links: Vec<LinkDesc>,
    pub routers: Vec<RouterWiring>,
    pub nis: Vec<NiWiring>,
}

#[derive(Debug)]
pub struct Topology {
    pub rows: usize,
    pub cols: usize,
    /// dest router -> outport, `usize::MAX` on the diagonal.
    next_hop: Vec<Vec<usize>>,
    port_names: Vec<Vec<String>>,
    ni_router: Vec<usize>,
    ni_machine: Vec<MachineId>,
    machine_ni: HashMap<MachineId, usize>,
}

impl Topology {
    pub fn mesh(rows: usize, cols: usize) -> Self {
        assert!(rows >= 1 && cols >= 1);
        let num_routers = rows * cols;

        let mut ni_router = Vec::with_capacity(2 * num_routers);
        let mut ni_machine = Vec::with_capacity(2 * num_routers);
        let mut machine_ni = HashMap::new();
        for r in 0..num_routers {
            ni_router.push(r);
            ni_machine.push(MachineId::core(r as u32));
            machine_ni.insert(MachineId::core(r as u32), r);
        }
        for r in 0..num_routers {
            ni_router.push(r);
            ni_machine.push(MachineId::llc(r as u32));
            machine_ni.insert(MachineId::llc(r as u32), num_routers + r);
        }

        let mut port_names = Vec::with_capacity(num_routers);
        for r in 0..num_routers {
            let (x, y) = (r % cols, r / cols);
            let mut names = vec!["LocalCore".to_string(), "LocalLlc".to_string()];
            if x > 0 {
                names.push("West".to_string());
            }
            if x < cols - 1 {
                names.push("East".to_string());
            }
            if y > 0 {
                names.push("North".to_string());
            }
            if y < rows - 1 {
                names.push("South".to_string());
            }
            port_names.push(names);
        }

        let mut topo = Self {
            rows,
            cols,
            next_hop: Vec::new(),
            port_names,
            ni_router,
            ni_machine,
            machine_ni,
        };

        // XY routing: resolve the column offset before the row offset.
        let mut next_hop = Vec::with_capacity(num_routers);
        for r in 0..num_routers {
            let (x, y) = (r % cols, r / cols);
            let mut hops = vec![usize::MAX; num_routers];
            for (d, hop) in hops.iter_mut().enumerate() {
                if d == r {
                    continue;
                }
                let (dx, dy) = (d % cols, d / cols);
                let dir = if dx < x {
                    "West"
                } else if dx > x {
                    "East"
                } else if dy < y {
                    "North"
                } else {
                    "South"
                };
                *hop = topo.port_index(r, dir);
            }
            next_hop.push(hops);
        }
        topo.next_hop = next_hop;
        topo
    }

    fn port_index(&self, router: usize, name: &str) -> usize {
        self.port_names[router]
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("router {} has no {} port", router, name))
    }

    pub fn num_routers(&self) -> usize {
        self.rows * self.cols
    }

    pub fn num_nis(&self) -> usize {
        self.ni_router.len()
    }

    pub fn num_ports(&self, router: usize) -> usize {
        self.port_names[router].len()
    }

    pub fn port_name(&self, router: usize, port: usize) -> &str {
        &self.port_names[router][port]
    }

    pub fn router_of_ni(&self, ni: usize) -> usize {
        self.ni_router[ni]
    }

    pub fn machine_of_ni(&self, ni: usize) -> MachineId {
        self.ni_machine[ni]
    }

    pub fn ni_of_machine(&self, machine: MachineId) -> usize {
        self.machine_ni[&machine]
    }

    pub fn machines(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.ni_machine.iter().copied()
    }

    fn local_port_of_ni(&self, ni: usize) -> usize {
        match self.ni_machine[ni].kind {
            MachineKind::Core => CORE_PORT,
            MachineKind::Llc => LLC_PORT,
        }
    }

    /// Outport for a unicast flit at `router`.
    pub fn route_compute(&self, router: usize, route: &RouteInfo) -> usize {
        let dest_router = route.dest_router();
        if dest_router == router {
            self.local_port_of_ni(route.dest_ni())
        } else {
            self.next_hop[router][dest_router]
        }
    }

    /// Split a multicast destination set by the outport each member leaves
    /// `router` through.
    pub fn multicast_route_compute(
        &self,
        router: usize,
        dests: &NetDest,
    ) -> HashMap<usize, RoutePartition> {
        let mut parts: HashMap<usize, RoutePartition> = HashMap::new();
        for machine in dests.iter() {
            let ni = self.ni_of_machine(machine);
            let dest_router = self.router_of_ni(ni);
            let outport = if dest_router == router {
                self.local_port_of_ni(ni)
            } else {
                self.next_hop[router][dest_router]
            };
            let part = parts.entry(outport).or_default();
            part.dests.add(machine);
            if !part.dest_nis.contains(&ni) {
                part.dest_nis.push(ni);
            }
            if !part.dest_routers.contains(&dest_router) {
                part.dest_routers.push(dest_router);
            }
        }
        parts
    }

    /// Lay out every link in the network.  Neighbor ports get `link_latency`
    /// links in both directions; local NI ports get single-cycle links.
    pub fn wiring(&self, link_latency: Cycle) -> Wiring {
        let num_routers = self.num_routers();
        let mut flit_links = Vec::new();
        let mut credit_links = Vec::new();
        let mut routers: Vec<RouterWiring> = (0..num_routers)
            .map(|r| RouterWiring {
                inports: vec![
                    PortConn {
                        flit_link: usize::MAX,
                        credit_link: usize::MAX,
                    };
                    self.num_ports(r)
                ],
                outports: vec![
                    PortConn {
                        flit_link: usize::MAX,
                        credit_link: usize::MAX,
                    };
                    self.num_ports(r)
                ],
            })
            .collect();
        let mut nis = Vec::with_capacity(self.num_nis());

        let mut add_flit = |links: &mut Vec<LinkDesc>, latency, dest| {
            links.push(LinkDesc {
                latency,
                dest_node: dest,
            });
            links.len() - 1
        };

        // NI local channels.
        for ni in 0..self.num_nis() {
            let router = self.router_of_ni(ni);
            let port = self.local_port_of_ni(ni);

            let inj_flit = add_flit(&mut flit_links, 1, NodeId::Router(router));
            let inj_credit = add_flit(&mut credit_links, 1, NodeId::Ni(ni));
            routers[router].inports[port] = PortConn {
                flit_link: inj_flit,
                credit_link: inj_credit,
            };

            let ej_flit = add_flit(&mut flit_links, 1, NodeId::Ni(ni));
            let ej_credit = add_flit(&mut credit_links, 1, NodeId::Router(router));
            routers[router].outports[port] = PortConn {
                flit_link: ej_flit,
                credit_link: ej_credit,
            };

            nis.push(NiWiring {
                inject: PortConn {
                    flit_link: inj_flit,
                    credit_link: inj_credit,
                },
                eject: PortConn {
                    flit_link: ej_flit,
                    credit_link: ej_credit,
                },
            });
        }

        // Mesh channels, one per direction per neighboring pair.
        for a in 0..num_routers {
            let (x, y) = (a % self.cols, a / self.cols);
            let mut neighbors = Vec::new();
            if x < self.cols - 1 {
                neighbors.push((a + 1, "East", "West"));
            }
            if y < self.rows - 1 {
                neighbors.push((a + self.cols, "South", "North"));
            }
            for (b, a_to_b, b_to_a) in neighbors {
                let pa = self.port_index(a, a_to_b);
                let pb = self.port_index(b, b_to_a);

                let ab_flit = add_flit(&mut flit_links, link_latency, NodeId::Router(b));
                let ab_credit = add_flit(&mut credit_links, link_latency, NodeId::Router(a));
                routers[a].outports[pa] = PortConn {
                    flit_link: ab_flit,
                    credit_link: ab_credit,
                };
                routers[b].inports[pb] = PortConn {
                    flit_link: ab_flit,
                    credit_link: ab_credit,
                };

                let ba_flit = add_flit(&mut flit_links, link_latency, NodeId::Router(a));
                let ba_credit = add_flit(&mut credit_links, link_latency, NodeId::Router(b));
                routers[b].outports[pb] = PortConn {
                    flit_link: ba_flit,
                    credit_link: ba_credit,
                };
                routers[a].inports[pa] = PortConn {
                    flit_link: ba_flit,
                    credit_link: ba_credit,
                };
            }
        }

        Wiring {
            flit_links,
            credit_links,
            routers,
            nis,
        }
    }
}
