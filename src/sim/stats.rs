use serde::Serialize;

use crate::eventq::Cycle;
use crate::router::switch_allocator::SwitchStats;

/// Power-of-two end-to-end latency buckets; the last one is open-ended.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyHistogram {
    pub buckets: [u64; 8],
    pub count: u64,
    pub total: u64,
    pub max: Cycle,
}

impl LatencyHistogram {
    pub fn record(&mut self, latency: Cycle) {
        let idx = match latency {
            0..=3 => 0,
            4..=7 => 1,
            8..=15 => 2,
            16..=31 => 3,
            32..=63 => 4,
            64..=127 => 5,
            128..=255 => 6,
            _ => 7,
        };
        self.buckets[idx] = self.buckets[idx].saturating_add(1);
        self.count += 1;
        self.total = self.total.saturating_add(latency);
        self.max = self.max.max(latency);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total as f64 / self.count as f64
    }

    pub fn accumulate(&mut self, other: &LatencyHistogram) {
        for (dst, src) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *dst = dst.saturating_add(*src);
        }
        self.count += other.count;
        self.total = self.total.saturating_add(other.total);
        self.max = self.max.max(other.max);
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RouterStats {
    pub id: usize,
    pub buffer_writes: u64,
    pub buffer_reads: u64,
    pub crossbar_activity: u64,
    pub flits_sent: u64,
    pub switch: SwitchStats,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct NiStats {
    pub id: usize,
    pub messages_injected: u64,
    pub messages_ejected: u64,
    pub flits_injected: u64,
    pub flits_ejected: u64,
    /// Prepush branches never injected because the outgoing filter already
    /// covered every destination.
    pub prepushes_pruned_at_inject: u64,
    /// Reads never injected because a prepush for the line was already on
    /// its way to this machine.
    pub reads_suppressed: u64,
    /// Queued reads purged when the prepushed line arrived first.
    pub reads_purged: u64,
    /// Non-demand prepush deliveries the receiving core declined.
    pub prepushes_declined: u64,
    pub vc_alloc_failures: u64,
    pub total_hops: u64,
    pub latency: LatencyHistogram,
}

#[derive(Debug, Default, Serialize)]
pub struct NetworkStats {
    pub cycles: Cycle,
    pub messages_delivered: u64,
    pub flits_delivered: u64,
    pub total_hops: u64,
    pub packet_latency: LatencyHistogram,
    pub routers: Vec<RouterStats>,
    pub nis: Vec<NiStats>,
}

impl NetworkStats {
    pub fn total_flits_sent(&self) -> u64 {
        self.routers.iter().map(|r| r.flits_sent).sum()
    }

    pub fn total_dropped_requests(&self) -> u64 {
        self.routers.iter().map(|r| r.switch.dropped_requests).sum()
    }

    pub fn total_dropped_prepushes(&self) -> u64 {
        self.routers.iter().map(|r| r.switch.dropped_prepushes).sum()
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("cycles simulated:    {}\n", self.cycles));
        s.push_str(&format!("messages delivered:  {}\n", self.messages_delivered));
        s.push_str(&format!("flits delivered:     {}\n", self.flits_delivered));
        s.push_str(&format!(
            "avg packet latency:  {:.2} (max {})\n",
            self.packet_latency.mean(),
            self.packet_latency.max
        ));
        let hops = if self.messages_delivered == 0 {
            0.0
        } else {
            self.total_hops as f64 / self.messages_delivered as f64
        };
        s.push_str(&format!("avg hops:            {:.2}\n", hops));
        s.push_str(&format!(
            "filtered reads:      {}\n",
            self.total_dropped_requests()
        ));
        s.push_str(&format!(
            "filtered prepushes:  {}\n",
            self.total_dropped_prepushes()
        ));
        let suppressed: u64 = self.nis.iter().map(|n| n.reads_suppressed).sum();
        let purged: u64 = self.nis.iter().map(|n| n.reads_purged).sum();
        let declined: u64 = self.nis.iter().map(|n| n.prepushes_declined).sum();
        s.push_str(&format!("suppressed reads:    {}\n", suppressed));
        s.push_str(&format!("purged reads:        {}\n", purged));
        s.push_str(&format!("declined prepushes:  {}\n", declined));
        s
    }
}
