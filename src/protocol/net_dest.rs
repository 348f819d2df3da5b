use std::fmt;

/// Machine classes attached to the network.  Core nodes run the private
/// caches, Llc nodes the shared-cache slices that originate prepushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineKind {
    Core,
    Llc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId {
    pub kind: MachineKind,
    pub num: u32,
}

impl MachineId {
    pub fn core(num: u32) -> Self {
        Self {
            kind: MachineKind::Core,
            num,
        }
    }

    pub fn llc(num: u32) -> Self {
        Self {
            kind: MachineKind::Llc,
            num,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MachineKind::Core => write!(f, "core{}", self.num),
            MachineKind::Llc => write!(f, "llc{}", self.num),
        }
    }
}

/// Set-valued destination specifier: one bit per machine, covering multicast
/// fan-out sets and coherence sharer sets.  Fixed at 128 machines per kind,
/// which is far beyond the mesh sizes this model is built for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NetDest {
    cores: u128,
    llcs: u128,
}

impl NetDest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(machine: MachineId) -> Self {
        let mut d = Self::default();
        d.add(machine);
        d
    }

    fn word_mut(&mut self, kind: MachineKind) -> &mut u128 {
        match kind {
            MachineKind::Core => &mut self.cores,
            MachineKind::Llc => &mut self.llcs,
        }
    }

    fn word(&self, kind: MachineKind) -> u128 {
        match kind {
            MachineKind::Core => self.cores,
            MachineKind::Llc => self.llcs,
        }
    }

    pub fn add(&mut self, machine: MachineId) {
        assert!(machine.num < 128, "machine id {} out of range", machine.num);
        *self.word_mut(machine.kind) |= 1u128 << machine.num;
    }

    pub fn remove(&mut self, machine: MachineId) {
        assert!(machine.num < 128, "machine id {} out of range", machine.num);
        *self.word_mut(machine.kind) &= !(1u128 << machine.num);
    }

    pub fn contains(&self, machine: MachineId) -> bool {
        machine.num < 128 && self.word(machine.kind) & (1u128 << machine.num) != 0
    }

    pub fn union_with(&mut self, other: &NetDest) {
        self.cores |= other.cores;
        self.llcs |= other.llcs;
    }

    pub fn subtract(&mut self, other: &NetDest) {
        self.cores &= !other.cores;
        self.llcs &= !other.llcs;
    }

    pub fn intersect(&self, other: &NetDest) -> NetDest {
        NetDest {
            cores: self.cores & other.cores,
            llcs: self.llcs & other.llcs,
        }
    }

    /// True if every machine in `other` is also in `self`.
    pub fn covers(&self, other: &NetDest) -> bool {
        other.cores & !self.cores == 0 && other.llcs & !self.llcs == 0
    }

    pub fn is_empty(&self) -> bool {
        self.cores == 0 && self.llcs == 0
    }

    pub fn count(&self) -> usize {
        (self.cores.count_ones() + self.llcs.count_ones()) as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        let cores = BitIter(self.cores).map(MachineId::core);
        let llcs = BitIter(self.llcs).map(MachineId::llc);
        cores.chain(llcs)
    }
}

impl fmt::Display for NetDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, m) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "}}")
    }
}

struct BitIter(u128);

impl Iterator for BitIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(bit)
    }
}
