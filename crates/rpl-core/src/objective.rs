//! Objective function plug-in points
//!
//! The capability set (parent selection, path cost, neighbour acceptance,
//! better-candidate probe) is resolved by Objective Code Point. Joining a
//! DODAG with an unknown OCP is tolerated: the node becomes a leaf and uses
//! OF0 for parent-cost computation.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::instance::Instance;
use crate::neighbour::{Neighbour, VersionRef};
use crate::platform::Platform;
use crate::policy::Policy;
use crate::rank::RANK_INFINITE;
use crate::{mrhof, of0};

pub const RPL_OCP_OF0: u16 = 0;
pub const RPL_OCP_MRHOF: u16 = 1;

/// The registered objective functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Objective {
    #[default]
    Of0,
    Mrhof,
}

/// ETX snapshot taken through the platform before parent selection, so the
/// whole selection pass sees one consistent view of link quality.
pub struct LinkCosts {
    map: HashMap<(i8, Ipv6Addr), u16>,
}

impl LinkCosts {
    pub fn snapshot(instance: &Instance, platform: &dyn Platform) -> Self {
        let mut map = HashMap::new();
        for n in &instance.candidates {
            map.entry((n.interface_id, n.ll_address))
                .or_insert_with(|| platform.link_etx(n.interface_id, &n.ll_address));
        }
        LinkCosts { map }
    }

    /// Build from explicit entries (tests).
    pub fn from_entries(entries: impl IntoIterator<Item = ((i8, Ipv6Addr), u16)>) -> Self {
        LinkCosts { map: entries.into_iter().collect() }
    }

    pub fn etx(&self, n: &Neighbour) -> u16 {
        self.map
            .get(&(n.interface_id, n.ll_address))
            .copied()
            .unwrap_or(crate::platform::etx::UNKNOWN)
    }
}

/// Result of a parent selection pass; the core applies it to the instance
/// (current version, rank, DAO path control) afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionOutcome {
    pub version: Option<VersionRef>,
    pub rank: u16,
}

impl SelectionOutcome {
    pub fn none() -> Self {
        SelectionOutcome { version: None, rank: RANK_INFINITE }
    }
}

impl Objective {
    /// OCP resolution; a pure lookup.
    pub fn lookup(ocp: u16) -> Option<Objective> {
        match ocp {
            RPL_OCP_OF0 => Some(Objective::Of0),
            RPL_OCP_MRHOF => Some(Objective::Mrhof),
            _ => None,
        }
    }

    pub fn ocp(self) -> u16 {
        match self {
            Objective::Of0 => RPL_OCP_OF0,
            Objective::Mrhof => RPL_OCP_MRHOF,
        }
    }

    /// Path cost through a neighbour given its link ETX. Infinite when the
    /// neighbour's version no longer resolves.
    pub fn path_cost(self, instance: &Instance, neighbour: &Neighbour, etx: u16, policy: &Policy) -> u16 {
        match self {
            Objective::Of0 => of0::path_cost(instance, neighbour, etx, policy),
            Objective::Mrhof => mrhof::path_cost(neighbour, etx),
        }
    }

    pub fn neighbour_acceptable(self, policy: &Policy, etx: u16) -> bool {
        match self {
            Objective::Of0 => of0::neighbour_acceptable(etx),
            Objective::Mrhof => mrhof::neighbour_acceptable(policy, etx),
        }
    }

    /// Could someone with this rank and link be a significantly better
    /// candidate than `existing`? Used to gate admission when the
    /// candidate table is full.
    pub fn possible_better_candidate(
        self,
        instance: &Instance,
        policy: &Policy,
        existing: &Neighbour,
        existing_etx: u16,
        candidate_rank: u16,
        candidate_etx: u16,
    ) -> bool {
        let existing_cost = self.path_cost(instance, existing, existing_etx, policy);
        match self {
            Objective::Of0 => {
                let mhri = existing
                    .version
                    .as_ref()
                    .and_then(|v| instance.resolve(v))
                    .map(|(d, _)| d.min_hop_rank_increase())
                    .unwrap_or(256);
                let increase = of0::rank_increase(candidate_etx, mhri, policy);
                crate::rank::add(candidate_rank, increase) < existing_cost
            }
            Objective::Mrhof => {
                let cost = crate::rank::add(candidate_rank, mrhof::link_metric(candidate_etx));
                crate::rank::add(cost, policy.mrhof_parent_switch_threshold_fp8) <= existing_cost
            }
        }
    }

    /// Run the parent selection algorithm. Reorders the candidate list so
    /// the parent set sits at the front in preference order, with
    /// `dodag_parent` and `dodag_pref` filled in. Must not delete
    /// candidates. The caller snapshots `was_dodag_parent` beforehand and
    /// applies the returned version/rank afterwards.
    pub fn run_parent_selection(
        self,
        instance: &mut Instance,
        policy: &Policy,
        costs: &LinkCosts,
    ) -> SelectionOutcome {
        match self {
            Objective::Of0 => of0::parent_selection(instance, policy, costs),
            Objective::Mrhof => mrhof::parent_selection(instance, policy, costs),
        }
    }
}
