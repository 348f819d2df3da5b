use std::str::FromStr;

use serde::Deserialize;

use crate::protocol::MsgKind;
use crate::sim::config::Config;

/// Coherence traffic classes are pinned to virtual networks: demand requests,
/// forwards (prepushes and invalidations), responses.
pub const NUM_VNETS: usize = 3;
pub const VNET_REQUEST: usize = 0;
pub const VNET_FORWARD: usize = 1;
pub const VNET_RESPONSE: usize = 2;

pub fn vnet_for(kind: MsgKind) -> usize {
    match kind {
        MsgKind::ReadRequest | MsgKind::WriteRequest => VNET_REQUEST,
        MsgKind::Prepush | MsgKind::Invalidation => VNET_FORWARD,
        MsgKind::Response => VNET_RESPONSE,
    }
}

/// How long an input port may keep a granted output port without
/// re-arbitrating.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchHold {
    /// Virtual cut-through: any packet holds its outport until the tail.
    #[default]
    All,
    /// Only multicast transfers hold, bounding unicast monopolization.
    MulticastOnly,
    None,
}

impl FromStr for SwitchHold {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "all" => Ok(Self::All),
            "multicast_only" => Ok(Self::MulticastOnly),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unsupported switch hold mode '{}', expected one of: all, multicast_only, none",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub rows: usize,
    pub cols: usize,
    pub vcs_per_vnet: usize,
    pub vc_buffer_depth: u32,
    pub flit_width_bytes: u32,
    pub link_latency: u64,
    pub router_pipe_stages: u32,
    pub multicast: bool,
    pub prepush_filter: bool,
    /// Cycles a filter registration outlives the prepush being sent.
    pub prepush_clear_delay: u64,
    /// Vnets kept point-to-point ordered individually.
    pub ordered_vnets: Vec<usize>,
    /// Treat all coherence vnets as one ordering domain.
    pub ordered_coherence_vnets: bool,
    /// Force invalidations to trail registered prepushes per address.
    pub ordered_prepush_inv: bool,
    pub hold_switch: SwitchHold,
    /// Consecutive failed VC allocations before declaring deadlock.
    pub deadlock_threshold: u64,
}

impl Config for NetworkConfig {}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 4,
            vcs_per_vnet: 4,
            vc_buffer_depth: 4,
            flit_width_bytes: 16,
            link_latency: 1,
            router_pipe_stages: 1,
            multicast: true,
            prepush_filter: true,
            prepush_clear_delay: 4,
            ordered_vnets: Vec::new(),
            ordered_coherence_vnets: false,
            ordered_prepush_inv: false,
            hold_switch: SwitchHold::All,
            deadlock_threshold: 50000,
        }
    }
}

impl NetworkConfig {
    pub fn total_vcs(&self) -> usize {
        NUM_VNETS * self.vcs_per_vnet
    }

    pub fn vnet_of_vc(&self, vc: usize) -> usize {
        vc / self.vcs_per_vnet
    }

    pub fn flits_per_message(&self, size_bytes: u32) -> usize {
        (size_bytes as usize).div_ceil(self.flit_width_bytes as usize).max(1)
    }

    /// True if `vnet` sits in an ordering domain, either individually or via
    /// the unified coherence domain.
    pub fn is_ordered_vnet(&self, vnet: usize) -> bool {
        self.ordered_coherence_vnets || self.ordered_vnets.contains(&vnet)
    }

    /// VC range `send_allowed` must scan for earlier same-outport flits.
    /// Under the unified coherence domain every vnet shares one range.
    pub fn ordering_vc_range(&self, vnet: usize) -> std::ops::Range<usize> {
        if self.ordered_coherence_vnets {
            0..self.total_vcs()
        } else {
            vnet * self.vcs_per_vnet..(vnet + 1) * self.vcs_per_vnet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flit_count_rounds_up() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.flits_per_message(8), 1);
        assert_eq!(cfg.flits_per_message(16), 1);
        assert_eq!(cfg.flits_per_message(17), 2);
        assert_eq!(cfg.flits_per_message(64), 4);
    }

    #[test]
    fn ordering_ranges() {
        let mut cfg = NetworkConfig::default();
        cfg.ordered_vnets = vec![VNET_FORWARD];
        assert!(cfg.is_ordered_vnet(VNET_FORWARD));
        assert!(!cfg.is_ordered_vnet(VNET_REQUEST));
        assert_eq!(cfg.ordering_vc_range(VNET_FORWARD), 4..8);

        cfg.ordered_coherence_vnets = true;
        assert!(cfg.is_ordered_vnet(VNET_RESPONSE));
        assert_eq!(cfg.ordering_vc_range(VNET_RESPONSE), 0..12);
    }

    #[test]
    fn deserializes_from_toml_section() {
        let doc: toml::Value = toml::from_str(
            r#"
            [network]
            rows = 2
            cols = 2
            hold_switch = "multicast_only"
            ordered_prepush_inv = true
            "#,
        )
        .unwrap();
        let cfg = NetworkConfig::from_section(doc.get("network"));
        assert_eq!(cfg.rows, 2);
        assert_eq!(cfg.hold_switch, SwitchHold::MulticastOnly);
        assert!(cfg.ordered_prepush_inv);
        // untouched fields keep their defaults
        assert_eq!(cfg.vcs_per_vnet, 4);
    }
}
