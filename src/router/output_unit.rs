use log::debug;

use crate::network::flit::{Flit, Stage};
use crate::network::NetCtx;

#[derive(Debug)]
struct OutVcState {
    active: bool,
    credits: u32,
}

/// Downstream-facing side of one output port: tracks which downstream VCs
/// are claimed and how many buffer slots each has left, and pushes granted
/// flits onto the outgoing link.
#[derive(Debug)]
pub struct OutputUnit {
    pub id: usize,
    vcs_per_vnet: usize,
    buffer_depth: u32,
    /// Outgoing flit link and the credit link coming back from downstream.
    pub out_link: usize,
    pub credit_link: usize,
    states: Vec<OutVcState>,
    pub flits_sent: u64,
}

impl OutputUnit {
    pub fn new(
        id: usize,
        num_vnets: usize,
        vcs_per_vnet: usize,
        buffer_depth: u32,
        out_link: usize,
        credit_link: usize,
    ) -> Self {
        let states = (0..num_vnets * vcs_per_vnet)
            .map(|_| OutVcState {
                active: false,
                credits: buffer_depth,
            })
            .collect();
        Self {
            id,
            vcs_per_vnet,
            buffer_depth,
            out_link,
            credit_link,
            states,
            flits_sent: 0,
        }
    }

    /// Drain credits that have arrived from downstream.  A free signal also
    /// releases the VC for reallocation.
    pub fn wakeup(&mut self, ctx: &mut NetCtx) {
        while ctx.credit_links[self.credit_link].is_ready(ctx.now) {
            let credit = ctx.credit_links[self.credit_link].consume(ctx.now);
            let state = &mut self.states[credit.vc];
            state.credits += 1;
            assert!(
                state.credits <= self.buffer_depth,
                "outport {} vc {} over-credited",
                self.id,
                credit.vc
            );
            if credit.is_free_signal {
                assert!(state.active, "free signal for an idle output vc");
                state.active = false;
            }
        }
    }

    pub fn has_credit(&self, vc: usize) -> bool {
        self.states[vc].credits > 0
    }

    pub fn decrement_credit(&mut self, vc: usize) {
        let state = &mut self.states[vc];
        assert!(state.credits > 0, "outport {} vc {} sent without credit", self.id, vc);
        state.credits -= 1;
    }

    pub fn has_free_vc(&self, vnet: usize) -> bool {
        self.vnet_range(vnet).any(|v| !self.states[v].active)
    }

    /// Claim a free VC in `vnet` for a new packet.
    pub fn select_free_vc(&mut self, vnet: usize) -> Option<usize> {
        let vc = self.vnet_range(vnet).find(|&v| !self.states[v].active)?;
        self.states[vc].active = true;
        debug!("outport {}: allocated outvc {}", self.id, vc);
        Some(vc)
    }

    fn vnet_range(&self, vnet: usize) -> std::ops::Range<usize> {
        vnet * self.vcs_per_vnet..(vnet + 1) * self.vcs_per_vnet
    }

    #[cfg(test)]
    pub fn is_vc_active(&self, vc: usize) -> bool {
        self.states[vc].active
    }

    pub fn send_flit(&mut self, mut flit: Flit, ctx: &mut NetCtx) {
        flit.advance_stage(Stage::LinkTraversal, ctx.now);
        self.flits_sent += 1;
        ctx.send_flit(self.out_link, flit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventq::{EventQueue, NodeId};
    use crate::network::flit::Credit;
    use crate::network::link::TimedLink;

    fn ctx_parts() -> (Vec<TimedLink<Flit>>, Vec<TimedLink<Credit>>, EventQueue) {
        let flit_links = vec![TimedLink::new(0, 1, NodeId::Router(1))];
        let credit_links = vec![TimedLink::new(0, 1, NodeId::Router(0))];
        (flit_links, credit_links, EventQueue::new())
    }

    #[test]
    fn vc_allocation_respects_vnet_partitions() {
        let (_, _, _) = ctx_parts();
        let mut ou = OutputUnit::new(0, 2, 2, 4, 0, 0);
        assert!(ou.has_free_vc(1));
        assert_eq!(ou.select_free_vc(1), Some(2));
        assert_eq!(ou.select_free_vc(1), Some(3));
        assert!(!ou.has_free_vc(1));
        assert_eq!(ou.select_free_vc(1), None);
        assert!(ou.has_free_vc(0));
    }

    #[test]
    fn credits_flow_back_and_free_signal_releases() {
        let (mut flit_links, mut credit_links, mut sched) = ctx_parts();
        let mut ou = OutputUnit::new(0, 1, 2, 1, 0, 0);
        let vc = ou.select_free_vc(0).unwrap();
        ou.decrement_credit(vc);
        assert!(!ou.has_credit(vc));

        credit_links[0].push(
            Credit {
                vc,
                is_free_signal: true,
            },
            0,
        );
        let mut ctx = NetCtx {
            now: 1,
            flit_links: &mut flit_links,
            credit_links: &mut credit_links,
            sched: &mut sched,
        };
        ou.wakeup(&mut ctx);
        assert!(ou.has_credit(vc));
        assert!(!ou.is_vc_active(vc));
    }
}
