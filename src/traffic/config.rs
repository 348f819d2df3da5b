use std::str::FromStr;

use serde::Deserialize;

use crate::sim::config::Config;

/// Destination selection for the driver.  `Coherence` runs the demand
/// read/write protocol against the LLC slices; the rest are one-way payload
/// patterns between cores.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrafficPattern {
    #[default]
    Coherence,
    /// Each payload picks a fresh random destination core.
    UniformRandom,
    /// Core (x, y) sends to core (y, x); needs a square mesh.
    Transpose,
    /// Core i sends to core i + 1, wrapping at the last core.
    Neighbor,
    /// Every core sends to `hotspot_core`.
    Hotspot,
}

impl FromStr for TrafficPattern {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "coherence" => Ok(Self::Coherence),
            "uniform_random" => Ok(Self::UniformRandom),
            "transpose" => Ok(Self::Transpose),
            "neighbor" => Ok(Self::Neighbor),
            "hotspot" => Ok(Self::Hotspot),
            _ => Err(format!(
                "unsupported traffic pattern '{}', expected one of: \
                 coherence, uniform_random, transpose, neighbor, hotspot",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub pattern: TrafficPattern,
    /// Demand requests each core issues before the run winds down.
    pub requests_per_core: u64,
    /// Per-core probability of issuing on any given cycle.
    pub injection_rate: f64,
    pub max_inflight_per_core: usize,
    /// Working set in cache lines, interleaved across LLC slices.
    pub num_lines: u64,
    pub line_bytes: u64,
    /// Lines a core keeps before it starts re-requesting evicted ones.
    pub cache_lines: usize,
    /// Fraction of demand traffic that is writes; writes invalidate sharers.
    pub write_fraction: f64,
    /// LLC pushes a requested line to all of its sharers instead of
    /// answering the requestor alone.
    pub prepush: bool,
    /// LLC service latency in cycles.
    pub response_delay: u64,
    pub control_bytes: u32,
    pub data_bytes: u32,
    /// Destination core for the hotspot pattern.
    pub hotspot_core: usize,
    pub seed: u64,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            pattern: TrafficPattern::Coherence,
            requests_per_core: 1000,
            injection_rate: 0.1,
            max_inflight_per_core: 8,
            num_lines: 4096,
            line_bytes: 64,
            cache_lines: 256,
            write_fraction: 0.2,
            prepush: true,
            response_delay: 4,
            control_bytes: 8,
            data_bytes: 72,
            hotspot_core: 0,
            seed: 0,
        }
    }
}
