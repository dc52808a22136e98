//! Non-storing root: the DAO transit graph and source-route computation
//!
//! The root learns (target, transit) edges from DAOs and, on demand,
//! walks a shortest-path-from-root ordering of the graph to produce the
//! intermediate hop list for a destination. The last computed path is
//! cached until the graph changes or an SRH error invalidates it.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, warn};

use rpl_packet::messages::TransitOption;

use crate::domain::{Ctx, Domain};
use crate::downward::{DaoTarget, RootInfo, RootTransit, TargetInfo};
use crate::error::{Result, RplError};
use crate::event::RplEvent;
use crate::instance::Instance;
use crate::platform::{IPV6_ROUTE_DEFAULT_METRIC, Platform, RouteInfo, RouteSource};

/// Resolved predecessor of a transit edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitParent {
    /// Not resolved since the last graph change
    #[default]
    Unresolved,
    /// The transit address is one of the root's own addresses
    Root,
    /// The transit address matched this target
    Target(Ipv6Net),
    /// No target covers the transit address
    Unmatched,
}

const UNREACHABLE_COST: u32 = u32::MAX;

/// One cached source route: query key plus the intermediate hops in path
/// order (first hop first, final destination excluded).
#[derive(Debug, Clone, Default)]
pub struct SourceRouteCache {
    /// Transit parents and costs are valid
    pub(crate) paths_valid: bool,
    pub(crate) target: Option<Ipv6Net>,
    pub(crate) final_dest: Option<Ipv6Addr>,
    pub(crate) hops: Vec<Ipv6Addr>,
}

impl SourceRouteCache {
    pub fn invalidate(&mut self) {
        self.target = None;
        self.final_dest = None;
        self.hops.clear();
    }

    fn matches(&self, target: &Ipv6Net, final_dest: &Ipv6Addr) -> bool {
        self.target.as_ref() == Some(target) && self.final_dest.as_ref() == Some(final_dest)
    }
}

pub(crate) fn invalidate_paths(inst: &mut Instance) {
    inst.sr_cache.paths_valid = false;
}

/// Fold one (target, transit) DAO edge into the root graph. Returns true
/// when the graph changed.
pub(crate) fn dao_update_target(
    inst: &mut Instance,
    platform: &mut dyn Platform,
    prefix: &Ipv6Net,
    transit: &TransitOption,
    lifetime_s: u32,
    rx_interface: i8,
    downstream_interface: Option<i8>,
) -> bool {
    // Non-storing transits must name the parent
    let Some(parent_address) = transit.parent_address else {
        debug!(target = %prefix, "Transit without parent address ignored");
        return false;
    };
    let interface_id = downstream_interface.unwrap_or(rx_interface);

    let t_idx = inst.targets.iter().position(|t| t.prefix == *prefix);

    if lifetime_s == 0 {
        // No-Path: remove this edge, and the target once bare
        let Some(t_idx) = t_idx else { return false };
        let Some(info) = inst.targets[t_idx].root_info_mut() else { return false };
        let before = info.transits.len();
        info.transits.retain(|t| t.transit != parent_address);
        let changed = info.transits.len() != before;
        if inst.targets[t_idx].root_info().unwrap().transits.is_empty() {
            debug!(target = %prefix, "No-Path DAO removed last transit");
            let target = inst.targets.remove(t_idx);
            let info = RouteInfo::Target { prefix: target.prefix };
            platform.route_delete_by_info(target.interface_id, RouteSource::RplDaoSr, &info);
        }
        return changed;
    }

    let t_idx = match t_idx {
        Some(i) => i,
        None => {
            inst.targets.push(DaoTarget {
                prefix: *prefix,
                path_sequence: transit.path_sequence,
                path_control: transit.path_control,
                interface_id,
                lifetime: lifetime_s,
                descriptor: None,
                external: transit.external,
                published: false,
                own: false,
                need_seq_inc: false,
                connected: false,
                hold_count: 0,
                info: TargetInfo::Root(RootInfo::default()),
            });
            inst.targets.len() - 1
        }
    };

    {
        let target = &mut inst.targets[t_idx];
        target.lifetime = lifetime_s;
        target.path_sequence = transit.path_sequence;
        target.external = transit.external;
        target.interface_id = interface_id;
        if !matches!(target.info, TargetInfo::Root(_)) {
            // State left over from before we were root: rebuild
            target.info = TargetInfo::Root(RootInfo::default());
        }
        let info = target.root_info_mut().unwrap();
        match info.transits.iter_mut().find(|t| t.transit == parent_address) {
            Some(t) => {
                t.path_control = transit.path_control;
                t.lifetime = lifetime_s;
                t.parent = TransitParent::Unresolved;
            }
            None => info.transits.push(RootTransit {
                transit: parent_address,
                path_control: transit.path_control,
                lifetime: lifetime_s,
                cost: UNREACHABLE_COST,
                parent: TransitParent::Unresolved,
            }),
        }
    }

    platform.route_add(
        *prefix,
        interface_id,
        None,
        RouteSource::RplDaoSr,
        RouteInfo::Target { prefix: *prefix },
        inst.id,
        lifetime_s,
        IPV6_ROUTE_DEFAULT_METRIC,
    );
    true
}

/// Age transit lifetimes; drop expired edges and targets.
pub(crate) fn age_transits(inst: &mut Instance, platform: &mut dyn Platform, seconds: u32) {
    let mut removed: Vec<(Ipv6Net, i8)> = Vec::new();
    let mut changed = false;
    inst.targets.retain_mut(|target| {
        let TargetInfo::Root(info) = &mut target.info else { return true };
        let before = info.transits.len();
        info.transits.retain_mut(|t| {
            if t.lifetime == 0xFFFF_FFFF {
                return true;
            }
            if t.lifetime > seconds {
                t.lifetime -= seconds;
                true
            } else {
                false
            }
        });
        changed |= info.transits.len() != before;
        if info.transits.is_empty() {
            removed.push((target.prefix, target.interface_id));
            false
        } else {
            true
        }
    });
    for (prefix, interface_id) in removed {
        debug!(instance = inst.id, target = %prefix, "Root target expired");
        let info = RouteInfo::Target { prefix };
        platform.route_delete_by_info(interface_id, RouteSource::RplDaoSr, &info);
    }
    if changed {
        inst.sr_cache.invalidate();
        invalidate_paths(inst);
    }
}

/// Resolve transit parents and relax path costs from the root. After this
/// runs, every target's transit list has its cheapest usable edge first
/// and the `connected` flags are current.
pub(crate) fn compute_paths(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform) {
    let downstream = ctx.non_storing_downstream_interface.unwrap_or(-1);

    // Resolve each transit's predecessor
    let prefixes: Vec<Ipv6Net> = inst
        .targets
        .iter()
        .filter(|t| matches!(t.info, TargetInfo::Root(_)))
        .map(|t| t.prefix)
        .collect();
    for idx in 0..inst.targets.len() {
        let transits: Vec<Ipv6Addr> = match inst.targets[idx].root_info() {
            Some(info) => info.transits.iter().map(|t| t.transit).collect(),
            None => continue,
        };
        let own_prefix = inst.targets[idx].prefix;
        for (e_idx, addr) in transits.into_iter().enumerate() {
            let parent = if platform.is_local_address(downstream, &addr) {
                TransitParent::Root
            } else {
                match prefixes.iter().find(|p| p.contains(&addr)) {
                    // A transit naming the target itself can never connect
                    Some(p) if *p == own_prefix => TransitParent::Unmatched,
                    Some(p) => TransitParent::Target(*p),
                    None => TransitParent::Unmatched,
                }
            };
            let edge_cost = match parent {
                TransitParent::Root => {
                    // Root transit: the actual first hop is the target itself
                    let next_hop = own_prefix.addr();
                    let etx = platform.link_etx(downstream, &next_hop);
                    let reachable = platform
                        .neighbour_reachable(downstream, &next_hop)
                        .unwrap_or(true);
                    ctx.policy.modify_downward_cost_to_root_neighbour(1, etx, reachable) as u32
                }
                _ => 1,
            };
            if let Some(info) = inst.targets[idx].root_info_mut() {
                info.transits[e_idx].parent = parent;
                info.transits[e_idx].cost = edge_cost;
            }
        }
    }

    // Relax total costs; the graph is at most |targets| deep
    for target in inst.targets.iter_mut() {
        if let Some(info) = target.root_info_mut() {
            info.cost = UNREACHABLE_COST;
        }
    }
    let rounds = inst.targets.len();
    for _ in 0..rounds {
        let mut moved = false;
        for idx in 0..inst.targets.len() {
            let Some(info) = inst.targets[idx].root_info() else { continue };
            let mut best = UNREACHABLE_COST;
            for t in &info.transits {
                let parent_cost = match t.parent {
                    TransitParent::Root => 0,
                    TransitParent::Target(p) => inst
                        .targets
                        .iter()
                        .find(|x| x.prefix == p)
                        .and_then(|x| x.root_info())
                        .map(|x| x.cost)
                        .unwrap_or(UNREACHABLE_COST),
                    _ => UNREACHABLE_COST,
                };
                best = best.min(parent_cost.saturating_add(t.cost));
            }
            let info = inst.targets[idx].root_info_mut().unwrap();
            if best < info.cost {
                info.cost = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    // Order transit lists cheapest-first and settle connected flags
    for idx in 0..inst.targets.len() {
        let Some(info) = inst.targets[idx].root_info() else { continue };
        let cost_of = |t: &RootTransit| -> u32 {
            match t.parent {
                TransitParent::Root => t.cost,
                TransitParent::Target(p) => inst
                    .targets
                    .iter()
                    .find(|x| x.prefix == p)
                    .and_then(|x| x.root_info())
                    .map(|x| x.cost.saturating_add(t.cost))
                    .unwrap_or(UNREACHABLE_COST),
                _ => UNREACHABLE_COST,
            }
        };
        let mut keyed: Vec<(u32, RootTransit)> =
            info.transits.iter().map(|t| (cost_of(t), t.clone())).collect();
        keyed.sort_by_key(|(c, _)| *c);

        let was_connected = inst.targets[idx].connected;
        let connected = inst.targets[idx].root_info().unwrap().cost != UNREACHABLE_COST;
        let prefix = inst.targets[idx].prefix;
        let info = inst.targets[idx].root_info_mut().unwrap();
        info.transits = keyed.into_iter().map(|(_, t)| t).collect();
        inst.targets[idx].connected = connected;
        if was_connected && !connected {
            warn!(instance = inst.id, target = %prefix, "Target disconnected");
            platform.event(RplEvent::TargetDisconnected { instance_id: inst.id, target: prefix });
        }
    }

    inst.sr_cache.paths_valid = true;
}

/// Compute (or fetch from cache) the source route for `final_dest` whose
/// matching DAO target is `target`. Returns the intermediate hops in path
/// order; an empty list means the destination is one hop away.
pub(crate) fn compute_source_route(
    inst: &mut Instance,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
    final_dest: &Ipv6Addr,
    target: &Ipv6Net,
) -> Result<Vec<Ipv6Addr>> {
    if !inst.sr_cache.paths_valid {
        compute_paths(inst, ctx, platform);
    }
    if inst.sr_cache.matches(target, final_dest) {
        return Ok(inst.sr_cache.hops.clone());
    }

    let t_idx = inst
        .targets
        .iter()
        .position(|t| t.prefix == *target)
        .ok_or(RplError::NotFound)?;
    if !inst.targets[t_idx].connected {
        return Err(RplError::Unreachable);
    }

    // Work backwards from the target, following the cheapest transit each
    // time; the walk terminates at a root edge.
    let mut hops_rev: Vec<Ipv6Addr> = Vec::new();
    let mut cursor = t_idx;
    loop {
        let (transit_addr, parent) = {
            let Some(info) = inst.targets[cursor].root_info() else {
                return Err(RplError::Unreachable);
            };
            let Some(transit) = info.transits.first() else {
                return Err(RplError::Unreachable);
            };
            (transit.transit, transit.parent)
        };
        match parent {
            TransitParent::Root => break,
            TransitParent::Target(parent_prefix) => {
                // A transit already on the path is a loop
                if hops_rev.contains(&transit_addr) || final_dest == &transit_addr {
                    ctx.stats.route_loops += 1;
                    warn!(instance = inst.id, target = %target, "Source route loop");
                    inst.targets[cursor].connected = false;
                    platform.event(RplEvent::RouteLoop { instance_id: inst.id });
                    return Err(RplError::RouteLoop);
                }
                hops_rev.push(transit_addr);
                let next = inst
                    .targets
                    .iter()
                    .position(|t| t.prefix == parent_prefix)
                    .ok_or(RplError::Unreachable)?;
                if !inst.targets[next].connected {
                    warn!(instance = inst.id, parent = %parent_prefix, "Parent disconnected");
                    return Err(RplError::Unreachable);
                }
                if next == cursor {
                    return Err(RplError::RouteLoop);
                }
                cursor = next;
            }
            _ => return Err(RplError::Unreachable),
        }
    }

    hops_rev.reverse();
    inst.sr_cache.target = Some(*target);
    inst.sr_cache.final_dest = Some(*final_dest);
    inst.sr_cache.hops = hops_rev.clone();
    Ok(hops_rev)
}

impl Domain {
    /// The transport reports a source-routing failure towards a target
    /// through a transit. The edge is dropped and, past the policy
    /// threshold, the DTSN is bumped to force DAO refreshes.
    pub fn source_route_error(
        &mut self,
        platform: &mut dyn Platform,
        instance_id: u8,
        addr: Option<&Ipv6Addr>,
        target_addr: &Ipv6Addr,
        transit_addr: &Ipv6Addr,
    ) -> Result<()> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let now = self.now;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];

        inst.sr_cache.invalidate();
        invalidate_paths(inst);
        inst.srh_error_count = inst.srh_error_count.saturating_add(1);

        let inst_id = inst.id;
        if let Some(target) = inst
            .targets
            .iter_mut()
            .find(|t| t.prefix.contains(target_addr))
        {
            let prefix = target.prefix;
            let interface_id = target.interface_id;
            let now_empty = match target.root_info_mut() {
                Some(info) => {
                    info.transits.retain(|t| t.transit != *transit_addr);
                    info.transits.is_empty()
                }
                None => false,
            };
            if now_empty {
                target.connected = false;
                warn!(instance = inst_id, target = %prefix, "Target lost all transits");
                platform.event(RplEvent::TargetDisconnected { instance_id: inst_id, target: prefix });
                let route_info = RouteInfo::Target { prefix };
                platform.route_delete_by_info(interface_id, RouteSource::RplDaoSr, &route_info);
            }
        }

        if ctx
            .policy
            .dao_trigger_after_srh_error(inst.srh_error_count, inst.targets.len())
        {
            debug!(instance = inst.id, "SRH errors exceed threshold, bumping DTSN");
            inst.increment_dtsn(now, ctx.rng);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_invalidate() {
        let mut cache = SourceRouteCache::default();
        let target: Ipv6Net = "2001:db8::5/128".parse().unwrap();
        let dest: Ipv6Addr = "2001:db8::5".parse().unwrap();
        cache.target = Some(target);
        cache.final_dest = Some(dest);
        cache.hops = vec!["2001:db8::2".parse().unwrap()];
        assert!(cache.matches(&target, &dest));
        cache.invalidate();
        assert!(!cache.matches(&target, &dest));
        assert!(cache.hops.is_empty());
    }
}
