use crate::eventq::{Cycle, DelayedQueue};
use crate::network::flit::Flit;
use crate::network::NetCtx;
use crate::router::output_unit::OutputUnit;

/// Switch-traversal stage.  Granted flits park in a per-inport buffer for
/// their traversal tick, then move to the output unit and onto the link.
/// Fan-out conflicts cannot happen here: the allocator admits at most one
/// flit per outport per cycle.
#[derive(Debug)]
pub struct CrossbarSwitch {
    inport_buffers: Vec<DelayedQueue<(usize, Flit)>>,
    pub crossbar_activity: u64,
}

impl CrossbarSwitch {
    pub fn new(num_inports: usize) -> Self {
        Self {
            inport_buffers: (0..num_inports).map(|_| DelayedQueue::new()).collect(),
            crossbar_activity: 0,
        }
    }

    pub fn accept(&mut self, inport: usize, outport: usize, flit: Flit, traverse_at: Cycle) {
        self.inport_buffers[inport].push_at(traverse_at, (outport, flit));
    }

    pub fn wakeup(&mut self, ctx: &mut NetCtx, output_units: &mut [OutputUnit]) {
        let mut moved = 0;
        for buf in &mut self.inport_buffers {
            for (outport, flit) in buf.drain_due(ctx.now) {
                moved += 1;
                output_units[outport].send_flit(flit, ctx);
            }
        }
        self.crossbar_activity += moved;
    }

    pub fn next_due(&self) -> Option<Cycle> {
        self.inport_buffers.iter().filter_map(DelayedQueue::next_due).min()
    }

    pub fn is_empty(&self) -> bool {
        self.inport_buffers.iter().all(DelayedQueue::is_empty)
    }
}
