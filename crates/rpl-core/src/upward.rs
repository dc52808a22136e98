//! Upward topology management: DIO/DIS ingestion, parent selection, DIO
//! transmission and the repair state machine
//!
//! Everything here works on one instance; the Domain methods at the bottom
//! route incoming messages to it.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, info, warn};

use rpl_packet::messages::{
    DioMessage, DisMessage, Mop, PrefixOption, RA_PRF_HIGH, RA_PRF_LOW, RA_PRF_MASK, RA_PRF_MEDIUM,
    RouteOption, SOLINFO_PRED_DODAGID, SOLINFO_PRED_INSTANCEID, SOLINFO_PRED_VERSION,
};

use crate::dodag::{Dodag, DioRoute};
use crate::domain::{Ctx, Domain};
use crate::downward;
use crate::error::{Result, RplError};
use crate::event::RplEvent;
use crate::instance::Instance;
use crate::neighbour::{Neighbour, VersionRef};
use crate::objective::{LinkCosts, Objective};
use crate::platform::{IPV6_ROUTE_DEFAULT_METRIC, Platform, RouteInfo, RouteSource, route_pref_to_metric};
use crate::rank::{self, RANK_INFINITE, RplCmp};
use crate::trickle::TrickleParams;

/// `Imax` (ticks) scaled by an 8.8 fixed-point factor.
pub(crate) fn imax_time(imax_ticks: u32, fixed_point: u16) -> u32 {
    imax_ticks.saturating_mul(fixed_point as u32) / 0x100
}

/// Remaining seconds of a lifetime that started at `timestamp` (ticks).
fn aged_lifetime(lifetime: u32, timestamp: u32, now: u32) -> u32 {
    if lifetime == 0xFFFF_FFFF {
        return lifetime;
    }
    let age_s = now.wrapping_sub(timestamp) / 10;
    lifetime.saturating_sub(age_s)
}

fn neighbour_route_info(n: &Neighbour) -> RouteInfo {
    RouteInfo::Neighbour { ll_address: n.ll_address, interface_id: n.interface_id }
}

fn default_net() -> Ipv6Net {
    Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 0).unwrap()
}

/// Remove every system route we installed through a parent.
fn remove_system_routes_through_parent(n: &Neighbour, platform: &mut dyn Platform) {
    let info = neighbour_route_info(n);
    platform.route_delete_by_info(n.interface_id, RouteSource::RplInstance, &info);
    platform.route_delete_by_info(n.interface_id, RouteSource::RplDio, &info);
    platform.route_delete_by_info(n.interface_id, RouteSource::RplRoot, &info);
}

/// Install the ROUTE_RPL_DIO route for one RIO through one parent.
fn update_system_dio_route(instance_id: u8, parent: &Neighbour, route: &DioRoute, platform: &mut dyn Platform) {
    let pref: i8 = match route.flags & RA_PRF_MASK {
        RA_PRF_LOW => -1,
        RA_PRF_MEDIUM => 0,
        RA_PRF_HIGH => 1,
        _ => return, // reserved preference: ignore the route
    };
    let metric = route_pref_to_metric(pref).saturating_add(parent.dodag_pref);
    platform.route_add(
        route.prefix,
        parent.interface_id,
        Some(parent.ll_address),
        RouteSource::RplDio,
        neighbour_route_info(parent),
        instance_id,
        route.lifetime,
        metric,
    );
}

/// Install the implicit routes through a parent: the per-instance default
/// route, the /128 to the DODAGID, and (when RIO routes are not processed)
/// a default route via the DODAGID.
fn update_implicit_system_routes(
    instance_id: u8,
    dodag: &Dodag,
    parent: &Neighbour,
    ctx: &Ctx<'_>,
    platform: &mut dyn Platform,
) {
    let lifetime = dodag.default_lifetime_seconds();
    let metric = IPV6_ROUTE_DEFAULT_METRIC.saturating_add(parent.dodag_pref);
    let info = neighbour_route_info(parent);

    platform.route_add(
        default_net(),
        parent.interface_id,
        Some(parent.ll_address),
        RouteSource::RplInstance,
        info.clone(),
        instance_id,
        lifetime,
        metric,
    );
    platform.route_add(
        Ipv6Net::new(dodag.id, 128).unwrap(),
        parent.interface_id,
        Some(parent.ll_address),
        RouteSource::RplRoot,
        info.clone(),
        instance_id,
        lifetime,
        metric,
    );
    if !ctx.process_routes {
        platform.route_add(
            default_net(),
            parent.interface_id,
            Some(parent.ll_address),
            RouteSource::RplRoot,
            info,
            instance_id,
            lifetime,
            metric,
        );
    }
}

/// Reinstall all routes that go through one parent.
fn update_system_routes_through_parent(
    inst: &Instance,
    parent_idx: usize,
    ctx: &Ctx<'_>,
    platform: &mut dyn Platform,
) {
    let parent = &inst.candidates[parent_idx];
    let Some(vref) = parent.version else { return };
    let Some(dodag) = inst.dodag(&vref.dodag_id) else { return };
    if inst.current.map(|c| c.dodag_id) != Some(dodag.id) {
        return;
    }

    update_implicit_system_routes(inst.id, dodag, parent, ctx, platform);

    if ctx.process_routes {
        for route in &dodag.routes {
            update_system_dio_route(inst.id, parent, route, platform);
        }
    }
}

/// Remove a neighbour and everything hanging off it.
pub(crate) fn delete_neighbour(
    inst: &mut Instance,
    idx: usize,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
) {
    if inst.wait_response == Some(inst.candidates[idx].ll_address) {
        inst.wait_response = None;
    }
    downward::neighbour_gone(inst, idx);
    let n = inst.candidates.remove(idx);
    if n.dodag_parent {
        remove_system_routes_through_parent(&n, platform);
        inst.neighbours_changed = true;
        inst.trigger_parent_selection(ctx.policy.dio_parent_selection_delay_s, None, ctx.rng);
    }
    debug!(instance = inst.id, neighbour = %n.ll_address, "Neighbour deleted");
}

/// Delete one DODAG version and every neighbour still referencing it.
pub(crate) fn delete_dodag_version(
    inst: &mut Instance,
    dodag_id: &Ipv6Addr,
    number: u8,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
) {
    let vref = VersionRef { dodag_id: *dodag_id, number };
    if inst.current == Some(vref) {
        // Don't go through set_current_version: that would poison
        // immediately. Give parent selection a chance to find another
        // version first.
        inst.current = None;
        inst.trigger_parent_selection(5, None, ctx.rng);
    }
    while let Some(idx) = inst.candidates.iter().position(|n| n.version == Some(vref)) {
        delete_neighbour(inst, idx, ctx, platform);
    }
    if let Some(dodag) = inst.dodag_mut(dodag_id) {
        dodag.remove_version(number);
    }
}

pub(crate) fn delete_dodag(
    inst: &mut Instance,
    dodag_id: &Ipv6Addr,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
) {
    let numbers: Vec<u8> = inst
        .dodag(dodag_id)
        .map(|d| d.versions.iter().map(|v| v.number).collect())
        .unwrap_or_default();
    for number in numbers {
        delete_dodag_version(inst, dodag_id, number, ctx, platform);
    }
    if let Some(pos) = inst.dodags.iter().position(|d| d.id == *dodag_id) {
        let dodag = inst.dodags.remove(pos);
        for p in &dodag.prefixes {
            platform.prefix_update(-1, p.prefix, p.flags, 0, 0);
        }
    }
}

/// Worst candidate in an instance: a purge candidate. Parents are never
/// worse than non-parents.
pub(crate) fn choose_worst_neighbour(
    inst: &Instance,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
) -> Option<usize> {
    let mut worst: Option<usize> = None;
    let mut worst_acceptable = false;
    let mut worst_old = false;

    // Parents are first, so walk backwards to meet non-parents first
    for idx in (0..inst.candidates.len()).rev() {
        let n = &inst.candidates[idx];
        let etx = platform.link_etx(n.interface_id, &n.ll_address);
        let acceptable = inst.objective.neighbour_acceptable(ctx.policy, etx);
        let resolved = n.version.as_ref().and_then(|v| inst.resolve(v));
        let old = match (&n.version, resolved) {
            (Some(vref), Some(_)) => {
                let imax = inst
                    .dodag(&vref.dodag_id)
                    .map(|d| d.trickle_params.imax)
                    .unwrap_or(0);
                let age = ctx.now.wrapping_sub(n.dio_timestamp);
                age > imax_time(imax, ctx.policy.dio_validity_period_fp8)
            }
            _ => true,
        };

        let Some(worst_idx) = worst else {
            worst = Some(idx);
            worst_acceptable = acceptable;
            worst_old = old;
            continue;
        };
        let w = &inst.candidates[worst_idx];

        // Crossing from non-parents to parents: stop
        if n.dodag_parent && !w.dodag_parent {
            break;
        }
        // Prefer to keep neighbours with a live DODAG version
        let n_has_version = resolved.is_some();
        let w_has_version = w.version.as_ref().and_then(|v| inst.resolve(v)).is_some();
        if n_has_version != w_has_version {
            if w_has_version {
                worst = Some(idx);
                worst_acceptable = acceptable;
                worst_old = old;
            }
            continue;
        }
        // Prefer to purge OF-unacceptable neighbours
        if acceptable != worst_acceptable {
            if !acceptable {
                worst = Some(idx);
                worst_acceptable = acceptable;
                worst_old = old;
            }
            continue;
        }
        // Prefer to purge stale neighbours
        if old != worst_old {
            if old {
                worst = Some(idx);
                worst_acceptable = acceptable;
                worst_old = old;
            }
            continue;
        }
        // Tiebreak by path cost
        if n_has_version {
            let w_etx = platform.link_etx(w.interface_id, &w.ll_address);
            let n_cost = inst.objective.path_cost(inst, n, etx, ctx.policy);
            let w_cost = inst.objective.path_cost(inst, w, w_etx, ctx.policy);
            if n_cost > w_cost {
                worst = Some(idx);
                worst_acceptable = acceptable;
                worst_old = old;
            }
        }
    }

    worst
}

/// Enter or leave local repair, with its events and DIS bookkeeping.
pub(crate) fn set_local_repair(
    inst: &mut Instance,
    repair: bool,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
) {
    if inst.local_repair == repair {
        return;
    }
    inst.local_repair = repair;

    if repair {
        info!(instance = inst.id, "Local repair started");
        platform.event(RplEvent::LocalRepairStart { instance_id: inst.id });
        ctx.stats.local_repairs += 1;
        inst.repair_dis_timer = ctx.policy.repair_initial_dis_delay_s;
        inst.repair_dis_count = 0;
    } else {
        inst.repair_dis_timer = 0;
    }

    // When repair ends, flush higher-rank neighbours (potential sub-DODAG)
    if !repair && inst.current.is_some() {
        loop {
            let Some(idx) = inst.candidates.iter().position(|n| {
                n.version == inst.current
                    && inst
                        .current_dodag()
                        .map(|d| {
                            rank::compare(n.rank, inst.current_rank, d.min_hop_rank_increase())
                                .is_greater()
                        })
                        .unwrap_or(false)
            }) else {
                break;
            };
            delete_neighbour(inst, idx, ctx, platform);
        }
    }
}

/// The repair DIS back-off: doubled each round from the initial delay,
/// capped, at most `repair_dis_count` transmissions.
fn repair_dis_timer_tick(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform, seconds: u32) {
    let seconds = seconds.min(u16::MAX as u32) as u16;
    if inst.repair_dis_timer > seconds {
        inst.repair_dis_timer -= seconds;
        return;
    }
    if inst.repair_dis_timer == 0 {
        return;
    }
    debug!(instance = inst.id, "Timed repair DIS");
    inst.repair_dis_timer = 0;
    inst.repair_dis_count += 1;
    platform.send_dis(None, None, DisMessage::for_instance(inst.id));

    if inst.repair_dis_count < ctx.policy.repair_dis_count {
        let max = ctx.policy.repair_maximum_dis_interval_s;
        let mut t = ctx.policy.repair_initial_dis_delay_s;
        for _ in 0..inst.repair_dis_count {
            if t < 0x8000 && t < max {
                t <<= 1;
            } else {
                t = max;
                break;
            }
        }
        inst.repair_dis_timer = t.min(max);
    } else {
        platform.event(RplEvent::LocalRepairNoMoreDis { instance_id: inst.id });
    }
}

/// Run parent selection on an instance (RFC 6550 §8.2).
pub(crate) fn run_parent_selection(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform) {
    inst.parent_selection_timer = ctx.policy.parent_selection_period_s;

    if let Some(dodag) = inst.current_dodag() {
        if dodag.root || dodag.was_root {
            return;
        }
    }

    // Drop candidates not heard from within the route lifetime, unless
    // they are currently parents
    loop {
        let Some(idx) = inst.candidates.iter().position(|n| {
            if n.dodag_parent {
                return false;
            }
            let lifetime = n
                .version
                .as_ref()
                .and_then(|v| inst.dodag(&v.dodag_id))
                .map(|d| d.default_lifetime_seconds())
                .unwrap_or(0);
            aged_lifetime(lifetime, n.dio_timestamp, ctx.now) == 0
        }) else {
            break;
        };
        debug!(instance = inst.id, neighbour = %inst.candidates[idx].ll_address, "Candidate timeout");
        delete_neighbour(inst, idx, ctx, platform);
    }

    let original_version = inst.current;
    let original_rank = inst.current_rank;

    for n in &mut inst.candidates {
        n.old_dao_path_control = n.dao_path_control;
        n.dao_path_control = 0;
        n.was_dodag_parent = n.dodag_parent;
        n.dodag_parent = false;
        n.considered = true;
    }

    let original_preferred = inst.preferred_parent().map(|n| n.ll_address);

    let costs = LinkCosts::snapshot(inst, platform);
    let objective = inst.objective;
    let outcome = objective.run_parent_selection(inst, ctx.policy, &costs);
    inst.set_current_version(outcome.version, outcome.rank, ctx.force_leaf, ctx.rng);
    downward::convert_dodag_preferences_to_dao_path_control(inst);

    // Apply route changes for the new parent set
    let mut parent_set_change = false;
    for idx in 0..inst.candidates.len() {
        let (was, is_parent) = {
            let n = &inst.candidates[idx];
            (n.was_dodag_parent, n.dodag_parent)
        };
        if was != is_parent {
            parent_set_change = true;
            let n = &inst.candidates[idx];
            info!(instance = inst.id, neighbour = %n.ll_address, added = is_parent, "Parent set change");
            if !is_parent {
                remove_system_routes_through_parent(&inst.candidates[idx], platform);
            }
        }
        if is_parent {
            // Re-run even for unchanged parents: preference values move
            update_system_routes_through_parent(inst, idx, ctx, platform);
        }
        inst.candidates[idx].was_dodag_parent = false;
    }

    let preferred = inst.preferred_parent().map(|n| (n.ll_address, n.interface_id, n.dio_timestamp));

    if preferred.is_none() {
        inst.poison(ctx.policy.repair_poison_count, ctx.rng);
    }

    if original_preferred != preferred.map(|p| p.0) {
        ctx.stats.parent_changes += 1;
        if let Some((addr, ..)) = preferred {
            info!(instance = inst.id, parent = %addr, "New preferred parent");
            platform.event(RplEvent::ParentChanged { instance_id: inst.id });
        }
    }

    match (&preferred, original_preferred) {
        (Some((_, _, dio_timestamp)), _) => {
            // Found a parent: repair (if any) is over
            set_local_repair(inst, false, ctx, platform);

            // If the parent's last DIO is old, solicit a fresh one
            if let Some(dodag) = inst.current_dodag() {
                let accepted =
                    imax_time(dodag.trickle_params.imax, ctx.policy.dio_validity_period_fp8);
                let since = ctx.now.wrapping_sub(*dio_timestamp);
                if accepted < since {
                    let (addr, interface_id, _) = preferred.unwrap();
                    platform.send_dis(
                        Some(interface_id),
                        Some(addr),
                        DisMessage::for_instance(inst.id),
                    );
                }
            }
        }
        (None, Some(_)) => {
            // Only start repair when we just lost a parent
            set_local_repair(inst, true, ctx, platform);
        }
        (None, None) => {
            // Didn't have a parent, still don't: leave the repair flag be
        }
    }

    if inst.mop() != Mop::NoDownward {
        downward::process_dao_parent_changes(inst, ctx, platform);
    }

    // Anyone who's not a parent can be pruned now (eg bad link cost)
    loop {
        let Some(idx) = inst.candidates.iter().position(|n| {
            !n.dodag_parent && {
                let etx = platform.link_etx(n.interface_id, &n.ll_address);
                !inst.objective.neighbour_acceptable(ctx.policy, etx)
            }
        }) else {
            break;
        };
        debug!(instance = inst.id, neighbour = %inst.candidates[idx].ll_address, "Candidate not acceptable");
        delete_neighbour(inst, idx, ctx, platform);
    }

    // Superseded versions nobody references any more can go. The newest
    // stays regardless, so poison DIOs always have something to cite.
    let mut stale: Vec<(Ipv6Addr, u8)> = Vec::new();
    for dodag in &inst.dodags {
        for version in dodag.versions.iter().skip(1) {
            let vref = VersionRef { dodag_id: dodag.id, number: version.number };
            if Some(vref) == inst.current || inst.last_advertised == Some(vref) {
                continue;
            }
            if !inst.candidates.iter().any(|n| n.version == Some(vref)) {
                stale.push((dodag.id, version.number));
            }
        }
    }
    for (dodag_id, number) in stale {
        debug!(instance = inst.id, dodag = %dodag_id, version = number, "Retiring DODAG version");
        if let Some(dodag) = inst.dodag_mut(&dodag_id) {
            dodag.remove_version(number);
        }
    }

    // Changing DODAG version is an inconsistency
    if original_version != inst.current {
        if let (Some((_, interface_id, _)), Some(dodag)) = (&preferred, inst.current_dodag()) {
            for p in &dodag.prefixes {
                platform.prefix_update(*interface_id, p.prefix, p.flags, p.lifetime, p.preferred_lifetime);
            }
        }
        inst.inconsistency(ctx.rng);
        return;
    }

    // RFC 6550 §8.3 "consistent" check: any change resets the Trickle
    // consistency counter and stops counting this interval
    let rank_unchanged = inst
        .current_dodag()
        .map(|d| rank::compare(original_rank, inst.current_rank, d.min_hop_rank_increase()) == RplCmp::Equal)
        .unwrap_or(false);
    if parent_set_change || original_preferred != preferred.map(|p| p.0) || !rank_unchanged {
        inst.dio_not_consistent = true;
        inst.dio_timer.c = 0;
    }
}

/// Transmit a DIO now: multicast when `dst` is `None`, else unicast.
pub(crate) fn dio_trigger(
    inst: &mut Instance,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
    dst: Option<(i8, Ipv6Addr)>,
) {
    // Pick the version to advertise; poison may use an arbitrary one
    let vref = match inst.current {
        Some(v) => v,
        None if inst.poison_count > 0 => {
            let Some(v) = inst.dodags.first().and_then(|d| {
                d.newest_version()
                    .map(|v| VersionRef { dodag_id: d.id, number: v.number })
            }) else {
                return;
            };
            v
        }
        None => return,
    };
    let Some((dodag, _)) = inst.resolve(&vref) else { return };
    let dodag_id = dodag.id;

    let mut advertised_rank = inst.current_rank;
    if inst.poison_count > 0 {
        inst.poison_count -= 1;
        advertised_rank = RANK_INFINITE;
        debug!(instance = inst.id, "Poison DIO, rank infinite");
    }

    let inst_id = inst.id;
    let inst_dtsn = inst.dtsn;

    // Config goes in every unicast, and in multicasts only while the
    // minimum advertisement count after a change is unmet
    let dodag = inst.dodag_mut(&dodag_id).unwrap();
    let conf = if dst.is_some() {
        Some(dodag.conf)
    } else if dodag.new_config_advert_count < ctx.policy.multicast_config_min_advertisement_count {
        if dodag.new_config_advert_count < 0xFE {
            dodag.new_config_advert_count += 1;
        }
        Some(dodag.conf)
    } else {
        None
    };

    let prefixes: Vec<PrefixOption> = dodag
        .prefixes
        .iter_mut()
        .map(|p| {
            if p.lifetime == 0 && p.hold_count > 0 {
                p.hold_count -= 1;
            }
            PrefixOption {
                prefix: p.prefix.addr(),
                prefix_len: p.prefix.prefix_len(),
                flags: p.flags,
                valid_lifetime: p.lifetime,
                preferred_lifetime: p.preferred_lifetime,
            }
        })
        .collect();
    let routes: Vec<RouteOption> = dodag
        .routes
        .iter_mut()
        .map(|r| {
            if r.lifetime == 0 && r.hold_count > 0 {
                r.hold_count -= 1;
            }
            RouteOption {
                prefix: r.prefix.addr(),
                prefix_len: r.prefix.prefix_len(),
                flags: r.flags,
                lifetime: r.lifetime,
            }
        })
        .collect();

    let dio = DioMessage {
        instance_id: inst_id,
        version: vref.number,
        rank: advertised_rank,
        g_mop_prf: dodag.g_mop_prf,
        dtsn: inst_dtsn,
        dodag_id,
        conf,
        prefixes,
        routes,
    };
    let mhri = dodag.min_hop_rank_increase();
    let max_rank_increase = dodag.conf.max_rank_increase;
    platform.send_dio(dst.map(|d| d.0), dst.map(|d| d.1), dio);

    let version = inst
        .dodag_mut(&dodag_id)
        .and_then(|d| d.version_mut(vref.number))
        .expect("advertised version exists");
    version.last_advertised_rank = advertised_rank;

    // A new lowest advertised rank re-derives the hard rank limit. This is
    // done on DAGRank, not Rank: DAGMaxRankIncrease 0 is taken as "hold
    // DAGRank", which copes with profiles that insist on 0.
    if advertised_rank < version.lowest_advertised_rank {
        version.lowest_advertised_rank = advertised_rank;
        let dagrank = rank::dag_rank(advertised_rank, mhri);
        let dagmaxinc = rank::dag_rank(max_rank_increase, mhri);
        let dagmax = rank::add(dagrank, dagmaxinc);
        version.hard_rank_limit = if dagmax == RANK_INFINITE {
            RANK_INFINITE
        } else {
            rank::rank_from_dag_rank(1 + dagmax as u32, mhri).wrapping_sub(1)
        };
    }
    version.limit_greediness(advertised_rank, mhri);

    inst.last_advertised = Some(vref);
}

/// Trickle-driven DIO transmission, with the start-up suppression rules.
pub(crate) fn dio_timer_tick(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform, ticks: u32) {
    let params: TrickleParams = match inst.current.or_else(|| {
        (inst.poison_count > 0)
            .then(|| {
                inst.dodags.first().and_then(|d| {
                    d.newest_version()
                        .map(|v| VersionRef { dodag_id: d.id, number: v.number })
                })
            })
            .flatten()
    }) {
        Some(vref) => match inst.dodag(&vref.dodag_id) {
            Some(d) => {
                // Leaves don't send periodic DIOs (poison still goes out)
                if (d.leaf || ctx.force_leaf) && inst.poison_count == 0 {
                    return;
                }
                d.trickle_params
            }
            None => return,
        },
        None => return,
    };

    // Hold the first advertisement back until bootstrap has something to
    // say: an address registered, confirmed, and no DAO exchange pending.
    // Once we have ever advertised we keep talking so problems propagate.
    if inst.last_advertised.is_none() && ctx.policy.parent_confirmation_requested {
        if inst.targets.is_empty() {
            return;
        }
        if inst.pending_neighbour_confirmation {
            return;
        }
        if inst.dao_in_transit || inst.delay_dao_timer > 0 {
            return;
        }
    }

    if inst.dio_timer.tick(&params, ticks, ctx.rng) {
        inst.dio_not_consistent = false;
        dio_trigger(inst, ctx, platform, None);
    }
}

/// Second-granularity upkeep for one instance.
pub(crate) fn slow_tick(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform, seconds: u32) {
    let parent_iface = inst.preferred_parent().map(|n| n.interface_id).unwrap_or(-1);
    for dodag in &mut inst.dodags {
        for prefix in dodag.age_lifetimes(seconds) {
            platform.prefix_update(parent_iface, prefix, 0, 0, 0);
        }
    }

    downward::address_registration_slow_tick(inst, ctx, platform, seconds);

    // Deferred / periodic parent selection
    let seconds16 = seconds.min(u16::MAX as u32) as u16;
    if inst.parent_selection_timer > seconds16 {
        inst.parent_selection_timer -= seconds16;
    } else if inst.parent_selection_timer != 0 {
        debug!(instance = inst.id, "Timed parent selection");
        run_parent_selection(inst, ctx, platform);
    }

    if inst.preferred_parent().is_none() {
        ctx.stats.time_no_next_hop += seconds;
        repair_dis_timer_tick(inst, ctx, platform, seconds);
    }
}

/// Should prefix/route options from this neighbour update DODAG state?
/// Always from the preferred parent (or before one exists); from others
/// only with a same-or-newer version and a long-quiet preferred parent.
fn accept_update_from(
    dodag: &Dodag,
    neighbour: &Neighbour,
    preferred: Option<(&Ipv6Addr, i8, u32, Option<VersionRef>)>,
) -> bool {
    let Some((pp_addr, pp_iface, pp_timestamp, pp_version)) = preferred else {
        return true;
    };
    if neighbour.ll_address == *pp_addr && neighbour.interface_id == pp_iface {
        return true;
    }
    let version_ok = match (neighbour.version, pp_version) {
        (Some(a), Some(b)) if a.dodag_id == b.dodag_id => rank::seq_compare(a.number, b.number).ge(),
        _ => false,
    };
    if !version_ok {
        return false;
    }
    // The neighbour's DIO is the newly-received one, so its timestamp is
    // at least the parent's
    let between = neighbour.dio_timestamp.wrapping_sub(pp_timestamp);
    imax_time(dodag.trickle_params.imax, 0x0200) < between
}

impl Domain {
    /// Ingest a parsed DIO: create or look up the topology objects, apply
    /// the join policies, upsert the neighbour, adopt configuration and
    /// prefix/route options, and schedule delayed parent selection.
    pub fn dio_received(
        &mut self,
        platform: &mut dyn Platform,
        dio: &DioMessage,
        src_ll: Ipv6Addr,
        interface_id: i8,
    ) -> Result<()> {
        if !self.policy.join_instance(dio.instance_id, &dio.dodag_id) {
            debug!(instance = dio.instance_id, "Policy refused instance");
            return Ok(());
        }

        let idx = match self.lookup_instance(dio.instance_id, Some(&dio.dodag_id)) {
            Some(idx) => idx,
            None => self.create_instance(rpl_packet::instance_id::base(dio.instance_id)),
        };

        let join_dodag_ok =
            self.policy.join_dodag(dio.g_mop_prf, dio.instance_id, &dio.dodag_id);
        let join_config_ok = dio.conf.map(|c| self.policy.join_config(&c)).unwrap_or(true);

        let now = self.now;
        let (instances, mut ctx) = self.split();
        let inst = &mut instances[idx];

        // DODAG lookup / creation
        let is_new_dodag = inst.dodag(&dio.dodag_id).is_none();
        if is_new_dodag {
            if inst.is_local() && !inst.dodags.is_empty() {
                ctx.stats.inconsistent_messages += 1;
                return Err(RplError::InconsistentState("second DODAG in local instance"));
            }
            if !join_dodag_ok {
                debug!(dodag = %dio.dodag_id, "Policy refused DODAG");
                return Ok(());
            }
            inst.dodags.push(Dodag::new(dio.dodag_id, dio.g_mop_prf, now));
        }
        {
            let dodag = inst.dodag_mut(&dio.dodag_id).unwrap();
            dodag.timestamp = now;
            // Our own DODAG: nothing to learn from echoes of it
            if dodag.root || dodag.was_root {
                return Ok(());
            }
        }

        // Configuration adoption, gated by policy and by the preferred
        // parent having precedence once we have one
        let mut became_leaf = false;
        if let Some(conf) = &dio.conf {
            if !join_config_ok {
                debug!(dodag = %dio.dodag_id, "Policy refused configuration");
                return Ok(());
            }
            let from_preferred = inst
                .preferred_parent()
                .map(|p| p.ll_address == src_ll && p.interface_id == interface_id)
                .unwrap_or(true);
            let is_current = inst.current.map(|c| c.dodag_id) == Some(dio.dodag_id);
            let mut timing_changed = false;
            let mut applied = None;
            {
                let dodag = inst.dodag_mut(&dio.dodag_id).unwrap();
                if !dodag.have_config || from_preferred {
                    dodag.conf = *conf;
                    dodag.have_config = true;
                    let params = TrickleParams::from_dio_config(
                        conf.dio_interval_min,
                        conf.dio_interval_doublings,
                        conf.dio_redundancy_constant,
                    );
                    timing_changed = dodag.trickle_params != params;
                    dodag.trickle_params = params;
                    if timing_changed {
                        dodag.new_config_advert_count = 0;
                    }
                    applied = Some(params);
                }
            }
            if let Some(params) = applied {
                if timing_changed && is_current {
                    warn!(instance = inst.id, "Trickle parameters changed");
                    inst.dio_timer.start(&params, ctx.rng);
                }
                match Objective::lookup(conf.objective_code_point) {
                    Some(of) => inst.objective = of,
                    None => {
                        // Unknown OCP: join as a leaf, cost parents by OF0
                        inst.objective = Objective::Of0;
                        became_leaf = true;
                    }
                }
            }
        }
        if became_leaf {
            if let Some(dodag) = inst.dodag_mut(&dio.dodag_id) {
                dodag.leaf = true;
            }
        }

        // Without a configuration the DODAG cannot be evaluated; solicit
        // one from the sender and store nothing further.
        if !inst.dodag(&dio.dodag_id).unwrap().have_config {
            debug!(dodag = %dio.dodag_id, "No configuration yet, soliciting");
            platform.send_dis(
                Some(interface_id),
                Some(src_ll),
                DisMessage {
                    pred: SOLINFO_PRED_INSTANCEID | SOLINFO_PRED_DODAGID,
                    instance_id: inst.id,
                    dodag_id: dio.dodag_id,
                    version: 0,
                },
            );
            return Ok(());
        }

        // Version lookup / creation
        if inst.dodag(&dio.dodag_id).unwrap().version(dio.version).is_none() {
            let dropped = {
                let dodag = inst.dodag_mut(&dio.dodag_id).unwrap();
                if !dodag.versions.is_empty() {
                    ctx.stats.global_repairs += 1;
                }
                dodag.create_version(dio.version)
            };
            for number in dropped {
                delete_dodag_version(inst, &dio.dodag_id, number, &mut ctx, platform);
            }
            // The new version may itself have been dropped as incomparable
            if inst.dodag(&dio.dodag_id).unwrap().version(dio.version).is_none() {
                ctx.stats.inconsistent_messages += 1;
                return Err(RplError::InconsistentState("version not comparable"));
            }
        }
        let vref = VersionRef { dodag_id: dio.dodag_id, number: dio.version };

        // Neighbour upsert
        let mut changed = is_new_dodag;
        match inst.neighbour_index(&src_ll, interface_id) {
            Some(n_idx) => {
                let preferred_addr = inst.preferred_parent().map(|p| p.ll_address);
                let n = &mut inst.candidates[n_idx];
                changed |= n.rank != dio.rank || n.version != Some(vref);

                // G/MOP/Prf follows the preferred parent when not moving
                // to an older version
                let version_ge = n
                    .version
                    .map(|v| v.dodag_id == vref.dodag_id && rank::seq_compare(vref.number, v.number).ge())
                    .unwrap_or(true);
                let g_mop_prf_changed = n.g_mop_prf != dio.g_mop_prf;
                n.version = Some(vref);
                n.rank = dio.rank;
                n.g_mop_prf = dio.g_mop_prf;
                n.dio_timestamp = now;
                let dtsn_advanced =
                    n.dodag_parent && rank::seq_compare(dio.dtsn, n.dtsn).is_greater();
                n.dtsn = dio.dtsn;

                if g_mop_prf_changed && version_ge && preferred_addr == Some(src_ll) {
                    let dodag = inst.dodag_mut(&dio.dodag_id).unwrap();
                    if dodag.g_mop_prf != dio.g_mop_prf {
                        dodag.g_mop_prf = dio.g_mop_prf;
                        changed = true;
                        inst.inconsistency(ctx.rng);
                    }
                }
                if dtsn_advanced {
                    debug!(instance = inst.id, parent = %src_ll, "Parent DTSN advanced");
                    downward::dao_trigger(inst, 0);
                }
            }
            None => {
                let max = ctx.policy.max_candidate_neighbours as usize;
                if max != 0 && inst.candidates.len() >= max {
                    // Full table: admit only if clearly better than the
                    // worst replaceable candidate
                    let Some(worst_idx) = choose_worst_neighbour(inst, &mut ctx, platform) else {
                        return Err(RplError::OutOfMemory);
                    };
                    let worst = &inst.candidates[worst_idx];
                    if worst.dodag_parent || !worst.considered {
                        return Err(RplError::OutOfMemory);
                    }
                    let worst_etx = platform.link_etx(worst.interface_id, &worst.ll_address);
                    let cand_etx = platform.link_etx(interface_id, &src_ll);
                    if !inst.objective.possible_better_candidate(
                        inst,
                        ctx.policy,
                        worst,
                        worst_etx,
                        dio.rank,
                        cand_etx,
                    ) {
                        return Err(RplError::OutOfMemory);
                    }
                    delete_neighbour(inst, worst_idx, &mut ctx, platform);
                }
                let mut n = Neighbour::new(vref, src_ll, interface_id, dio.g_mop_prf, dio.dtsn, now);
                n.rank = dio.rank;
                inst.insert_neighbour(n);
                changed = true;
            }
        }

        // Prefixes and routes, subject to the acceptance rule
        let accept = {
            let dodag = inst.dodag(&dio.dodag_id).unwrap();
            let pp = inst
                .preferred_parent()
                .map(|p| (&p.ll_address, p.interface_id, p.dio_timestamp, p.version));
            let n = inst.neighbour(&src_ll, interface_id).unwrap();
            accept_update_from(dodag, n, pp)
        };
        // A PIO with the R flag carries the sender's full global address
        for pio in &dio.prefixes {
            if pio.flags & rpl_packet::messages::PIO_R != 0 {
                if let Some(n) = inst.neighbour_mut(&src_ll, interface_id) {
                    n.update_global_address(pio.prefix);
                }
            }
        }

        if accept {
            let is_current = inst.current.map(|c| c.dodag_id) == Some(dio.dodag_id);
            let dodag = inst.dodag_mut(&dio.dodag_id).unwrap();
            dodag.prefix_update_start();
            for pio in &dio.prefixes {
                dodag.update_dio_prefix(pio, false, true);
                if is_current {
                    platform.prefix_update(
                        interface_id,
                        Ipv6Net::new(pio.prefix, pio.prefix_len.min(128)).unwrap().trunc(),
                        pio.flags,
                        pio.valid_lifetime,
                        pio.preferred_lifetime,
                    );
                }
            }
            dodag.prefix_update_finish();

            let mut any_route_changed = false;
            for rio in &dio.routes {
                any_route_changed |= dodag.update_dio_route(rio, true);
            }
            if any_route_changed && is_current && ctx.process_routes {
                let routes = inst.dodag(&dio.dodag_id).unwrap().routes.clone();
                let parents: Vec<usize> = (0..inst.candidates.len())
                    .filter(|&i| inst.candidates[i].dodag_parent)
                    .collect();
                for p_idx in parents {
                    for route in &routes {
                        update_system_dio_route(inst.id, &inst.candidates[p_idx], route, platform);
                    }
                }
            }
        }

        // A consistent DIO feeds Trickle suppression; anything that moved
        // state schedules a (delayed) parent selection instead
        if changed {
            inst.neighbours_changed = true;
            inst.trigger_parent_selection(
                ctx.policy.dio_parent_selection_delay_s,
                Some(&dio.dodag_id),
                ctx.rng,
            );
        }
        inst.consistent_rx();
        Ok(())
    }

    /// Ingest a parsed DIS. Matching instances answer a unicast DIS with a
    /// unicast DIO; a multicast DIS is a Trickle inconsistency.
    pub fn dis_received(
        &mut self,
        platform: &mut dyn Platform,
        dis: &DisMessage,
        src_ll: Ipv6Addr,
        interface_id: i8,
        multicast: bool,
    ) {
        let (instances, mut ctx) = self.split();
        for inst in instances.iter_mut() {
            let matches = {
                let Some(vref) = inst.current else { continue };
                let Some((dodag, version)) = inst.resolve(&vref) else { continue };
                (dis.pred & SOLINFO_PRED_INSTANCEID == 0 || dis.instance_id == inst.id)
                    && (dis.pred & SOLINFO_PRED_DODAGID == 0 || dis.dodag_id == dodag.id)
                    && (dis.pred & SOLINFO_PRED_VERSION == 0 || dis.version == version.number)
            };
            if !matches {
                continue;
            }
            if multicast {
                inst.inconsistency(ctx.rng);
            } else {
                dio_trigger(inst, &mut ctx, platform, Some((interface_id, src_ll)));
            }
        }
    }

    /// Run parent selection immediately (management/test hook; normally
    /// driven by the deferred timer).
    pub fn run_parent_selection(&mut self, platform: &mut dyn Platform, instance_id: u8, addr: Option<&Ipv6Addr>) -> Result<()> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let (instances, mut ctx) = self.split();
        run_parent_selection(&mut instances[idx], &mut ctx, platform);
        Ok(())
    }

    /// Admission probe: could a DIO sender with this rank and link beat
    /// the worst current candidate? The transport asks before spending a
    /// neighbour-cache slot on an unknown sender.
    pub fn possible_better_candidate(
        &mut self,
        platform: &mut dyn Platform,
        instance_id: u8,
        addr: Option<&Ipv6Addr>,
        candidate_rank: u16,
        candidate_etx: u16,
    ) -> Result<bool> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let (instances, mut ctx) = self.split();
        let inst = &instances[idx];
        let Some(worst_idx) = choose_worst_neighbour(inst, &mut ctx, platform) else {
            return Ok(true);
        };
        let worst = &inst.candidates[worst_idx];
        if worst.dodag_parent || !worst.considered {
            return Ok(false);
        }
        let worst_etx = platform.link_etx(worst.interface_id, &worst.ll_address);
        Ok(inst.objective.possible_better_candidate(
            inst,
            ctx.policy,
            worst,
            worst_etx,
            candidate_rank,
            candidate_etx,
        ))
    }

    /// The ETX service reports a changed link: re-evaluate parents soon.
    pub fn link_etx_changed(&mut self, instance_id: u8, addr: Option<&Ipv6Addr>) -> Result<()> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let delay = self.policy.etx_change_parent_selection_delay_s;
        let (instances, ctx) = self.split();
        instances[idx].trigger_parent_selection(delay, None, ctx.rng);
        Ok(())
    }
}
