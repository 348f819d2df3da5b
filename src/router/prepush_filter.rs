use std::collections::HashMap;

use log::debug;

use crate::eventq::{Cycle, DelayedQueue};
use crate::protocol::{MachineId, NetDest};

#[derive(Debug, Default)]
struct FilterEntry {
    /// Union of every in-flight prepush destination set for this address.
    cumulative: NetDest,
    /// Ref count per exact destination set.  Overlapping sets from distinct
    /// prepushes keep separate buckets; the cumulative set is rebuilt from
    /// the surviving buckets on each clear.
    buckets: HashMap<NetDest, u32>,
    /// Input (port, vc) where a registered prepush is still buffered, for
    /// demand-destination broadening.  Tracks the latest registration.
    buffered_at: Option<(usize, usize)>,
}

/// Address-keyed record of prepushes headed through one port.
///
/// A registration stays visible for a grace period after the prepush is sent
/// (the deferred clear), so demand requests racing right behind it are still
/// recognized as satisfied.
#[derive(Debug, Default)]
pub struct PrepushFilter {
    entries: HashMap<u64, FilterEntry>,
    pending_clears: DelayedQueue<(u64, NetDest)>,
}

impl PrepushFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_prepush(
        &mut self,
        addr: u64,
        dest: NetDest,
        buffered_at: Option<(usize, usize)>,
    ) {
        let entry = self.entries.entry(addr).or_default();
        entry.cumulative.union_with(&dest);
        *entry.buckets.entry(dest).or_insert(0) += 1;
        if buffered_at.is_some() {
            entry.buffered_at = buffered_at;
        }
        debug!(
            "prepush filter: registered {:#x} -> {} (cumulative {})",
            addr, dest, entry.cumulative
        );
    }

    /// True iff a registered prepush already covers this requestor, meaning
    /// the demand request is redundant and can be dropped.
    pub fn query_to_drop_request(&self, addr: u64, requestor: MachineId) -> bool {
        self.entries
            .get(&addr)
            .map_or(false, |e| e.cumulative.contains(requestor))
    }

    pub fn has_entry(&self, addr: u64) -> bool {
        self.entries.contains_key(&addr)
    }

    /// True iff every destination in `dest` is already covered for `addr`.
    pub fn covers(&self, addr: u64, dest: &NetDest) -> bool {
        self.entries
            .get(&addr)
            .map_or(false, |e| e.cumulative.covers(dest))
    }

    pub fn cumulative(&self, addr: u64) -> Option<NetDest> {
        self.entries.get(&addr).map(|e| e.cumulative)
    }

    /// Buffered location of a registered prepush, if it is still parked in an
    /// input VC.  Callers revalidate against the VC before acting on it.
    pub fn inport_and_invc(&self, addr: u64) -> Option<(usize, usize)> {
        self.entries.get(&addr).and_then(|e| e.buffered_at)
    }

    /// Forget the buffered location once the prepush starts leaving its VC.
    pub fn clear_buffered_location(&mut self, addr: u64, inport: usize, invc: usize) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if entry.buffered_at == Some((inport, invc)) {
                entry.buffered_at = None;
            }
        }
    }

    /// Schedule removal of one registration at `due`.
    pub fn clear_prepush_at(&mut self, addr: u64, dest: NetDest, due: Cycle) {
        self.pending_clears.push_at(due, (addr, dest));
    }

    pub fn next_clear_due(&self) -> Option<Cycle> {
        self.pending_clears.next_due()
    }

    /// Apply every clear that has come due.  A bucket reaching zero is
    /// dropped and the cumulative set rebuilt from the survivors, so
    /// overlapping in-flight sets keep their shared destinations covered.
    pub fn clear_prepushes(&mut self, now: Cycle) {
        for (addr, dest) in self.pending_clears.drain_due(now) {
            let entry = self
                .entries
                .get_mut(&addr)
                .expect("clear for unregistered prepush address");
            let count = entry
                .buckets
                .get_mut(&dest)
                .expect("clear for unregistered destination set");
            *count -= 1;
            if *count == 0 {
                entry.buckets.remove(&dest);
            }
            let mut rebuilt = NetDest::new();
            for d in entry.buckets.keys() {
                rebuilt.union_with(d);
            }
            entry.cumulative = rebuilt;
            debug!(
                "prepush filter: cleared {:#x} / {} (cumulative now {})",
                addr, dest, entry.cumulative
            );
            if entry.cumulative.is_empty() {
                self.entries.remove(&addr);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
