//! Policy surface: thresholds, timers and predicates consulted by every
//! other part of the engine (RFC 6550 §18.6 leaves these to implementations)

use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use rpl_packet::DodagConf;

use crate::error::{Result, RplError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Suppress DIOs until address registration with a parent completes
    #[serde(default)]
    pub parent_confirmation_requested: bool,
    /// DAO retransmissions before declaring failure
    #[serde(default)]
    pub dao_retry_count: u8,
    /// Base DAO-ACK timeout in ms; inflated by the neighbour cache
    /// retransmission timer when that is known
    #[serde(default = "default_dao_ack_wait_ms")]
    pub initial_dao_ack_wait_ms: u16,
    /// Neighbours whose last DIO is older than Imax times this 8.8
    /// fixed-point factor are considered stale
    #[serde(default = "default_dio_validity")]
    pub dio_validity_period_fp8: u16,
    /// Multicast DIOs that must carry the config option after a change
    #[serde(default)]
    pub multicast_config_min_advertisement_count: u8,
    #[serde(default = "default_mrhof_parent_set_size")]
    pub mrhof_parent_set_size: u8,
    /// Minimum refresh period for DAO targets, seconds; 0 follows the
    /// DODAG configuration
    #[serde(default)]
    pub minimum_dao_target_refresh_s: u16,
    /// Address registration refresh interval, minutes; 0 uses the address
    /// lifetime
    #[serde(default)]
    pub address_registration_timeout_min: u16,
    /// Link ETX at or below this forwards unconditionally (8.8)
    #[serde(default = "default_etx_full_forward")]
    pub etx_full_forward_fp8: u16,
    /// Link ETX at or above this drops unconditionally (8.8)
    #[serde(default = "default_etx_full_drop")]
    pub etx_full_drop_fp8: u16,
    #[serde(default = "default_parent_selection_period")]
    pub parent_selection_period_s: u16,
    #[serde(default = "default_etx_hysteresis")]
    pub etx_hysteresis_fp8: u16,
    /// Parent selection delay after an ETX change
    #[serde(default = "default_etx_change_delay")]
    pub etx_change_parent_selection_delay_s: u16,
    /// Parent selection delay after new DIO information
    #[serde(default = "default_dio_parent_selection_delay")]
    pub dio_parent_selection_delay_s: u16,
    /// Extra rank OF0 may take to accommodate backup parents, in
    /// MinHopRankIncrease units
    #[serde(default)]
    pub of0_stretch_of_rank: u16,
    /// OF0 rank factor (1..=4)
    #[serde(default = "default_of0_rank_factor")]
    pub of0_rank_factor: u8,
    #[serde(default)]
    pub of0_dodag_preference_supersedes_grounded: bool,
    #[serde(default = "default_of0_max_backup_successors")]
    pub of0_max_backup_successors: u8,
    #[serde(default = "default_mrhof_max_link_metric")]
    pub mrhof_max_link_metric_fp8: u16,
    #[serde(default = "default_mrhof_parent_switch_threshold")]
    pub mrhof_parent_switch_threshold_fp8: u16,
    #[serde(default = "default_mrhof_max_rank_stretch")]
    pub mrhof_max_rank_stretch_for_extra_parents: u16,
    #[serde(default = "default_repair_initial_dis_delay")]
    pub repair_initial_dis_delay_s: u16,
    #[serde(default = "default_repair_maximum_dis_interval")]
    pub repair_maximum_dis_interval_s: u16,
    #[serde(default = "default_repair_dis_count")]
    pub repair_dis_count: u8,
    #[serde(default = "default_repair_poison_count")]
    pub repair_poison_count: u8,
    /// Tunnel to the root regardless of final destination
    #[serde(default)]
    pub force_tunnel_to_br: bool,
    /// Candidate neighbour table bound per instance; 0 = unbounded
    #[serde(default)]
    pub max_candidate_neighbours: u16,
}

fn default_dao_ack_wait_ms() -> u16 {
    2000
}
fn default_dio_validity() -> u16 {
    0x0180 // 1.5 in 8.8 fixed point
}
fn default_mrhof_parent_set_size() -> u8 {
    3
}
fn default_etx_full_forward() -> u16 {
    0x280
}
fn default_etx_full_drop() -> u16 {
    0x800
}
fn default_parent_selection_period() -> u16 {
    600
}
fn default_etx_hysteresis() -> u16 {
    0x0080
}
fn default_etx_change_delay() -> u16 {
    30
}
fn default_dio_parent_selection_delay() -> u16 {
    15
}
fn default_of0_rank_factor() -> u8 {
    1
}
fn default_of0_max_backup_successors() -> u8 {
    1
}
fn default_mrhof_max_link_metric() -> u16 {
    512
}
fn default_mrhof_parent_switch_threshold() -> u16 {
    192
}
fn default_mrhof_max_rank_stretch() -> u16 {
    64
}
fn default_repair_initial_dis_delay() -> u16 {
    10
}
fn default_repair_maximum_dis_interval() -> u16 {
    3600
}
fn default_repair_dis_count() -> u8 {
    6
}
fn default_repair_poison_count() -> u8 {
    2
}

impl Default for Policy {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

/// Verdict of the stochastic link gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPolicy {
    Forward,
    Drop,
}

// Scale 100% up to get more random resolution
const MAX_DROP_COMPARE: u32 = 100 * 256;

impl Policy {
    /// Validate cross-field constraints; used after deserializing a whole
    /// config in one go.
    pub fn validate(&self) -> Result<()> {
        if self.etx_full_forward_fp8 > self.etx_full_drop_fp8 {
            return Err(RplError::BadParameter("etx_full_forward > etx_full_drop"));
        }
        if !(1..=4).contains(&self.of0_rank_factor) {
            return Err(RplError::BadParameter("of0_rank_factor out of 1..=4"));
        }
        if self.mrhof_parent_set_size == 0 {
            return Err(RplError::BadParameter("mrhof_parent_set_size is zero"));
        }
        Ok(())
    }

    pub fn set_etx_thresholds(&mut self, full_forward: u16, full_drop: u16) -> Result<()> {
        if full_forward > full_drop {
            return Err(RplError::BadParameter("etx_full_forward > etx_full_drop"));
        }
        self.etx_full_forward_fp8 = full_forward;
        self.etx_full_drop_fp8 = full_drop;
        Ok(())
    }

    pub fn set_of0_rank_factor(&mut self, factor: u8) -> Result<()> {
        if !(1..=4).contains(&factor) {
            return Err(RplError::BadParameter("of0_rank_factor out of 1..=4"));
        }
        self.of0_rank_factor = factor;
        Ok(())
    }

    pub fn set_mrhof_parent_set_size(&mut self, size: u8) -> Result<()> {
        if size == 0 {
            return Err(RplError::BadParameter("mrhof_parent_set_size is zero"));
        }
        self.mrhof_parent_set_size = size;
        Ok(())
    }

    /// Application hook for selective joining. See RFC 6550 §18.6.
    pub fn join_instance(&self, _instance_id: u8, _dodag_id: &std::net::Ipv6Addr) -> bool {
        true
    }

    pub fn join_dodag(&self, _g_mop_prf: u8, _instance_id: u8, _dodag_id: &std::net::Ipv6Addr) -> bool {
        true
    }

    /// Sanity checks on an incoming DODAG configuration. Authentication is
    /// unsupported and MinHopRankIncrease 0 would break DAGRank.
    pub fn join_config(&self, conf: &DodagConf) -> bool {
        if conf.min_hop_rank_increase == 0 {
            return false;
        }
        if conf.authentication {
            return false;
        }
        true
    }

    pub fn request_dao_acks(&self, _mop: u8) -> bool {
        true
    }

    /// Trigger a DAO refresh after a number of SRH errors proportional to
    /// the network size.
    pub fn dao_trigger_after_srh_error(&self, errors_since_last_trigger: u16, targets: usize) -> bool {
        errors_since_last_trigger as usize > 2 * targets
    }

    /// Initial DAO-ACK wait in 100 ms ticks. A known neighbour-cache
    /// retransmission timer above 2 s overrides the configured base.
    pub fn initial_dao_ack_wait_ticks(&self, retrans_timer_ms: Option<u32>) -> u16 {
        if let Some(retrans) = retrans_timer_ms {
            if retrans > 2000 {
                let ticks = retrans / 100;
                if ticks > 0x7FFF {
                    return 0xFFFF;
                }
                return (ticks * 2) as u16;
            }
        }
        self.initial_dao_ack_wait_ms / 100
    }

    /// Stochastic ETX gate for SRH next hops (§4.6.6).
    pub fn link_forward_policy(&self, link_etx: u16, rng: &mut SmallRng) -> ForwardPolicy {
        if link_etx >= self.etx_full_drop_fp8 {
            return ForwardPolicy::Drop;
        }
        if link_etx <= self.etx_full_forward_fp8 {
            return ForwardPolicy::Forward;
        }
        let span = (self.etx_full_drop_fp8 - self.etx_full_forward_fp8) as u32;
        let drop_prob = MAX_DROP_COMPARE * (link_etx - self.etx_full_forward_fp8) as u32 / span;
        if rng.random_range(0..=25599u32) < drop_prob {
            ForwardPolicy::Drop
        } else {
            ForwardPolicy::Forward
        }
    }

    /// Weight the root's view of a first-hop transit by link state.
    pub fn modify_downward_cost_to_root_neighbour(
        &self,
        cost: u16,
        link_etx: u16,
        probably_reachable: bool,
    ) -> u16 {
        const ETX_SRH_THRESHOLD: u16 = 0x400;
        if link_etx == 0xFFFF {
            return cost.saturating_add(256);
        }
        if link_etx > ETX_SRH_THRESHOLD {
            return cost.saturating_add(8);
        }
        if !probably_reachable {
            return cost.saturating_add(4);
        }
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_defaults() {
        let p = Policy::default();
        assert_eq!(p.initial_dao_ack_wait_ms, 2000);
        assert_eq!(p.dio_validity_period_fp8, 0x0180);
        assert_eq!(p.mrhof_parent_set_size, 3);
        assert_eq!(p.etx_full_forward_fp8, 0x280);
        assert_eq!(p.etx_full_drop_fp8, 0x800);
        assert_eq!(p.parent_selection_period_s, 600);
        assert_eq!(p.mrhof_max_link_metric_fp8, 512);
        assert_eq!(p.mrhof_parent_switch_threshold_fp8, 192);
        assert_eq!(p.repair_poison_count, 2);
        p.validate().unwrap();
    }

    #[test]
    fn test_etx_threshold_order_enforced() {
        let mut p = Policy::default();
        assert_eq!(
            p.set_etx_thresholds(0x800, 0x280),
            Err(RplError::BadParameter("etx_full_forward > etx_full_drop"))
        );
        p.set_etx_thresholds(0x200, 0x600).unwrap();
        assert_eq!(p.etx_full_forward_fp8, 0x200);
    }

    #[test]
    fn test_join_config() {
        let p = Policy::default();
        let mut conf = DodagConf::default();
        assert!(p.join_config(&conf));
        conf.min_hop_rank_increase = 0;
        assert!(!p.join_config(&conf));
        conf.min_hop_rank_increase = 256;
        conf.authentication = true;
        assert!(!p.join_config(&conf));
    }

    #[test]
    fn test_dao_ack_wait() {
        let p = Policy::default();
        // No cache info: configured base in ticks
        assert_eq!(p.initial_dao_ack_wait_ticks(None), 20);
        // Retrans timer below the threshold: still the base
        assert_eq!(p.initial_dao_ack_wait_ticks(Some(1500)), 20);
        // 4000 ms: 2 * 4000 / 100 = 80 ticks
        assert_eq!(p.initial_dao_ack_wait_ticks(Some(4000)), 80);
        // Saturates
        assert_eq!(p.initial_dao_ack_wait_ticks(Some(0xFFFF_FF00)), 0xFFFF);
    }

    #[test]
    fn test_link_gate_extremes() {
        let p = Policy::default();
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(p.link_forward_policy(0x100, &mut rng), ForwardPolicy::Forward);
        assert_eq!(p.link_forward_policy(0x280, &mut rng), ForwardPolicy::Forward);
        assert_eq!(p.link_forward_policy(0x800, &mut rng), ForwardPolicy::Drop);
        assert_eq!(p.link_forward_policy(0xFFFF, &mut rng), ForwardPolicy::Drop);
    }

    #[test]
    fn test_link_gate_probability() {
        // ETX 0x540 between 0x280 and 0x800: drop probability
        // 25600 * 0x2C0 / 0x580 = 12800 of 25600, one half
        let p = Policy::default();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut drops = 0u32;
        let n = 20_000;
        for _ in 0..n {
            if p.link_forward_policy(0x540, &mut rng) == ForwardPolicy::Drop {
                drops += 1;
            }
        }
        let ratio = drops as f64 / n as f64;
        assert!((0.47..0.53).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn test_srh_error_dao_trigger() {
        let p = Policy::default();
        assert!(!p.dao_trigger_after_srh_error(6, 3));
        assert!(p.dao_trigger_after_srh_error(7, 3));
    }

    #[test]
    fn test_downward_cost_weighting() {
        let p = Policy::default();
        assert_eq!(p.modify_downward_cost_to_root_neighbour(10, 0xFFFF, true), 266);
        assert_eq!(p.modify_downward_cost_to_root_neighbour(10, 0x500, true), 18);
        assert_eq!(p.modify_downward_cost_to_root_neighbour(10, 0x200, false), 14);
        assert_eq!(p.modify_downward_cost_to_root_neighbour(10, 0x200, true), 10);
    }
}
