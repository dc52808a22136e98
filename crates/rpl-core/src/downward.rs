//! Downward topology: DAO targets, path control and the DAO exchange
//!
//! Each instance keeps one DAO in flight. Path control bits are assigned
//! from parent preferences; an ACK moves the in-flight bits to assigned,
//! a failure parks them for retry.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, info, warn};

use rpl_packet::messages::{DaoAckMessage, DaoGroup, DaoMessage, DaoTargetOption, Mop, TransitOption};

use crate::dodag::RPL_MAX_FINAL_RTR_ADVERTISEMENTS;
use crate::domain::{Ctx, Domain};
use crate::error::{Result, RplError};
use crate::event::RplEvent;
use crate::instance::Instance;
use crate::platform::{Platform, RouteInfo, RouteSource};
use crate::rank;
use crate::root;

/// Default DAO delay when no explicit delay applies (100 ms ticks).
const DEFAULT_DAO_DELAY_TICKS: u16 = 10;

/// Per-target DAO progress on a storing node or non-storing non-root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonRootInfo {
    /// Advertised path lifetime in lifetime units
    pub path_lifetime: u8,
    /// Path control bits carried by the in-flight DAO
    pub pc_assigning: u8,
    /// Path control bits successfully acknowledged
    pub pc_assigned: u8,
    /// Path control bits whose assignment must be retried
    pub pc_to_retry: u8,
    /// Seconds until this target is re-advertised; 0 = not scheduled
    pub refresh_timer: u32,
}

/// One transit edge at a non-storing root: "this target is reachable via
/// this parent address".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootTransit {
    pub transit: Ipv6Addr,
    pub path_control: u8,
    /// Remaining lifetime, seconds
    pub lifetime: u32,
    /// Resolved by path computation: cost of the path from the root
    /// through this transit
    pub cost: u32,
    /// Resolved predecessor: `None` until computed
    pub parent: root::TransitParent,
}

/// Root-side view of a target: the transit graph edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootInfo {
    /// Routing cost from the root, valid after path computation
    pub cost: u32,
    pub transits: Vec<RootTransit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetInfo {
    NonRoot(NonRootInfo),
    Root(RootInfo),
}

/// A (prefix, prefix_len) the instance advertises downward, or at the
/// root, has learnt from DAOs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaoTarget {
    pub prefix: Ipv6Net,
    pub path_sequence: u8,
    /// Union of path control bits advertised for this target
    pub path_control: u8,
    pub interface_id: i8,
    /// Seconds; 0xFFFF_FFFF = infinite, 0 = No-Path pending withdrawal
    pub lifetime: u32,
    pub descriptor: Option<u32>,
    /// RPL 'E' flag
    pub external: bool,
    /// We publish this (as opposed to having learnt it from a DAO)
    pub published: bool,
    /// Our own address rather than an attached host's
    pub own: bool,
    pub need_seq_inc: bool,
    /// Known to have a path to the root (root-side, after computation)
    pub connected: bool,
    /// Remaining No-Path advertisements before deletion
    pub hold_count: u8,
    pub info: TargetInfo,
}

impl DaoTarget {
    fn published(prefix: Ipv6Net, lifetime: u32, own: bool, descriptor: Option<u32>) -> Self {
        DaoTarget {
            prefix,
            path_sequence: rank::seq_init(),
            path_control: 0,
            interface_id: -1,
            lifetime,
            descriptor,
            external: false,
            published: true,
            own,
            need_seq_inc: false,
            connected: false,
            hold_count: 0,
            info: TargetInfo::NonRoot(NonRootInfo::default()),
        }
    }

    pub fn non_root(&self) -> Option<&NonRootInfo> {
        match &self.info {
            TargetInfo::NonRoot(i) => Some(i),
            TargetInfo::Root(_) => None,
        }
    }

    pub fn non_root_mut(&mut self) -> Option<&mut NonRootInfo> {
        match &mut self.info {
            TargetInfo::NonRoot(i) => Some(i),
            TargetInfo::Root(_) => None,
        }
    }

    pub fn root_info(&self) -> Option<&RootInfo> {
        match &self.info {
            TargetInfo::Root(i) => Some(i),
            TargetInfo::NonRoot(_) => None,
        }
    }

    pub fn root_info_mut(&mut self) -> Option<&mut RootInfo> {
        match &mut self.info {
            TargetInfo::Root(i) => Some(i),
            TargetInfo::NonRoot(_) => None,
        }
    }
}

pub(crate) fn match_target(inst: &Instance, prefix: &Ipv6Net) -> Option<usize> {
    inst.targets.iter().position(|t| t.prefix == *prefix)
}

/// Assign DAO path control bits from parent preferences. The 8-bit field
/// splits into four 2-bit groups, best first; parents of equal preference
/// share a group (one bit each, a lone parent takes both); everything is
/// masked to the configured PathControlSize.
pub(crate) fn convert_dodag_preferences_to_dao_path_control(inst: &mut Instance) {
    let pcs_bits = inst
        .current_dodag()
        .map(|d| (d.conf.path_control_size as u32 + 1).min(8))
        .unwrap_or(8);
    let budget_mask: u8 = (0xFF00u16 >> pcs_bits) as u8;

    // Collect parents grouped by preference level (list is ordered)
    let mut level_members: Vec<Vec<usize>> = Vec::new();
    let mut last_pref: Option<u8> = None;
    for (idx, n) in inst.candidates.iter().enumerate() {
        if !n.dodag_parent {
            break;
        }
        if last_pref == Some(n.dodag_pref) {
            level_members.last_mut().unwrap().push(idx);
        } else {
            last_pref = Some(n.dodag_pref);
            level_members.push(vec![idx]);
        }
    }

    for (group, members) in level_members.iter().enumerate().take(4) {
        let group_bits: u8 = 0xC0 >> (2 * group);
        if members.len() == 1 {
            inst.candidates[members[0]].dao_path_control = group_bits & budget_mask;
        } else {
            for (k, &idx) in members.iter().enumerate() {
                let bit = if k < 2 { (0x80u8 >> (2 * group)) >> k } else { 0 };
                inst.candidates[idx].dao_path_control = bit & budget_mask;
            }
        }
    }
}

/// Schedule a DAO transmission. An earlier pending request wins.
pub(crate) fn dao_trigger(inst: &mut Instance, delay_ticks: u16) {
    if inst.am_root() || inst.mop() == Mop::NoDownward {
        return;
    }
    let delay = if delay_ticks == 0 { DEFAULT_DAO_DELAY_TICKS } else { delay_ticks };
    if inst.delay_dao_timer == 0 || inst.delay_dao_timer > delay {
        inst.delay_dao_timer = delay;
        debug!(instance = inst.id, delay, "DAO scheduled");
    }
}

/// A neighbour is going away; any path control it carried is no longer
/// assigned and a fresh DAO announces the change.
pub(crate) fn neighbour_gone(inst: &mut Instance, idx: usize) {
    let bits = {
        let n = &inst.candidates[idx];
        n.dao_path_control | n.old_dao_path_control
    };
    if bits == 0 {
        return;
    }
    let mut any = false;
    for target in &mut inst.targets {
        if let TargetInfo::NonRoot(info) = &mut target.info {
            if info.pc_assigned & bits != 0 || info.pc_assigning & bits != 0 {
                info.pc_assigned &= !bits;
                info.pc_assigning &= !bits;
                target.need_seq_inc = true;
                any = true;
            }
        }
    }
    if any {
        dao_trigger(inst, 0);
    }
}

/// After parent selection: withdrawn bits become No-Path work, new
/// parents need fresh assignment, and confirmation-gated stacks start
/// address registration with the new preferred parent.
pub(crate) fn process_dao_parent_changes(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform) {
    let mut withdrawn: u8 = 0;
    let mut assigned_now: u8 = 0;
    for n in &inst.candidates {
        withdrawn |= n.old_dao_path_control & !n.dao_path_control;
        assigned_now |= n.dao_path_control;
    }
    // A parent that newly owns the top path-control bit is a new
    // preferred parent (the previous one always held that bit)
    let preferred_changed = inst
        .candidates
        .first()
        .map(|n| n.dodag_parent && n.dao_path_control & 0x80 != 0 && n.old_dao_path_control & 0x80 == 0)
        .unwrap_or(false);

    let mut work = false;
    for target in &mut inst.targets {
        let TargetInfo::NonRoot(info) = &mut target.info else { continue };
        if withdrawn != 0 && (info.pc_assigned | info.pc_assigning) & withdrawn != 0 {
            info.pc_assigned &= !withdrawn;
            info.pc_assigning &= !withdrawn;
            target.need_seq_inc = true;
            work = true;
        }
        // Bits assignable now but never acknowledged want a DAO
        if target.published && assigned_now & !info.pc_assigned != 0 {
            work = true;
        }
    }

    if preferred_changed {
        for target in &mut inst.targets {
            if target.published {
                target.need_seq_inc = true;
            }
        }
        work = !inst.targets.is_empty() || work;

        if ctx.policy.parent_confirmation_requested {
            if let Some(parent) = inst.preferred_parent() {
                if !parent.confirmed {
                    let parent_ll = parent.ll_address;
                    let parent_iface = parent.interface_id;
                    let own: Vec<Ipv6Addr> = inst
                        .targets
                        .iter()
                        .filter(|t| t.own && t.published)
                        .map(|t| t.prefix.addr())
                        .collect();
                    if !own.is_empty() {
                        inst.pending_neighbour_confirmation = true;
                        inst.wait_response = Some(parent_ll);
                        for addr in own {
                            platform.request_address_registration(parent_iface, parent_ll, addr);
                        }
                    }
                }
            }
        }
    }

    if work {
        dao_trigger(inst, 0);
    }
}

/// Encode and transmit the instance's DAO, retrying an in-flight sequence
/// or starting a new one.
fn transmit_dao(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform) {
    let mop = inst.mop();
    if inst.am_root() || mop == Mop::NoDownward {
        return;
    }
    let Some(parent) = inst.preferred_parent() else {
        return;
    };
    let parent_iface = parent.interface_id;
    let parent_ll = parent.ll_address;

    let Some(dodag) = inst.current_dodag() else { return };
    let dodag_id = dodag.id;
    let lifetime_unit = dodag.conf.lifetime_unit.max(1) as u32;

    // Destination: the root in non-storing mode, the parent otherwise
    let (dst, interface_id) = match mop {
        Mop::NonStoring => (
            dodag_id,
            ctx.non_storing_downstream_interface.unwrap_or(parent_iface),
        ),
        _ => (parent_ll, parent_iface),
    };

    if !inst.dao_in_transit {
        inst.dao_sequence = rank::seq_inc(inst.dao_sequence);
        inst.dao_sequence_in_transit = inst.dao_sequence;
        inst.dao_attempt = 0;
    }

    // Transit options shared by the advertised targets
    let parents: Vec<(Ipv6Addr, Option<Ipv6Addr>, u8)> = inst
        .parents()
        .filter(|n| n.dao_path_control != 0)
        .map(|n| (n.ll_address, n.global_address, n.dao_path_control))
        .collect();
    if parents.is_empty() {
        return;
    }
    let advertised: u8 = parents.iter().fold(0, |acc, p| acc | p.2);

    let mut reachable_targets = Vec::new();
    let mut no_path_targets = Vec::new();
    for target in &mut inst.targets {
        let TargetInfo::NonRoot(_) = target.info else { continue };
        if !target.published && mop == Mop::NonStoring {
            continue;
        }
        if target.need_seq_inc {
            target.path_sequence = rank::seq_inc(target.path_sequence);
            target.need_seq_inc = false;
        }
        let opt = DaoTargetOption {
            prefix: target.prefix.addr(),
            prefix_len: target.prefix.prefix_len(),
            descriptor: target.descriptor,
        };
        if target.lifetime == 0 {
            no_path_targets.push(opt);
            if target.hold_count > 0 {
                target.hold_count -= 1;
            }
        } else {
            let units = if target.lifetime == 0xFFFF_FFFF {
                0xFF
            } else {
                (target.lifetime / lifetime_unit).clamp(1, 0xFE) as u8
            };
            reachable_targets.push((opt, units));
            target.path_control = advertised;
            if let TargetInfo::NonRoot(info) = &mut target.info {
                info.pc_assigning = advertised;
                info.path_lifetime = units;
            }
        }
    }

    if reachable_targets.is_empty() && no_path_targets.is_empty() {
        return;
    }

    let transits = |path_lifetime: u8| -> Vec<TransitOption> {
        match mop {
            Mop::NonStoring => parents
                .iter()
                .filter_map(|(ll, global, pc)| {
                    // Non-storing transits name the parent's global address
                    let parent_address = global.or(Some(*ll))?;
                    Some(TransitOption {
                        external: false,
                        path_control: *pc,
                        path_sequence: 0,
                        path_lifetime,
                        parent_address: Some(parent_address),
                    })
                })
                .collect(),
            _ => vec![TransitOption {
                external: false,
                path_control: advertised,
                path_sequence: 0,
                path_lifetime,
                parent_address: None,
            }],
        }
    };

    let mut groups = Vec::new();
    // Group reachable targets by advertised lifetime
    let mut by_lifetime: Vec<(u8, Vec<DaoTargetOption>)> = Vec::new();
    for (opt, units) in reachable_targets {
        match by_lifetime.iter_mut().find(|(u, _)| *u == units) {
            Some((_, list)) => list.push(opt),
            None => by_lifetime.push((units, vec![opt])),
        }
    }
    for (units, targets) in by_lifetime {
        groups.push(DaoGroup { targets, transits: transits(units) });
    }
    if !no_path_targets.is_empty() {
        groups.push(DaoGroup { targets: no_path_targets, transits: transits(0) });
    }

    let expect_ack = ctx.policy.request_dao_acks(rpl_packet::messages::g_mop_prf(false, mop, 0));
    inst.requested_dao_ack = expect_ack;
    inst.dao_attempt += 1;

    let dao = DaoMessage {
        instance_id: inst.id,
        expect_ack,
        sequence: inst.dao_sequence_in_transit,
        dodag_id: inst.is_local().then_some(dodag_id),
        groups,
    };
    info!(
        instance = inst.id,
        sequence = dao.sequence,
        attempt = inst.dao_attempt,
        "DAO transmit"
    );
    platform.send_dao(interface_id, dst, dao);

    if expect_ack {
        inst.dao_in_transit = true;
        let retrans = platform.neighbour_retrans_timer_ms(interface_id);
        inst.dao_retry_timer = ctx.policy.initial_dao_ack_wait_ticks(retrans).max(1);
    } else {
        // Without ACKs, assume success immediately
        dao_assume_acked(inst, 0);
    }
}

/// Apply a successful (status 0) or failed acknowledgement.
fn dao_assume_acked(inst: &mut Instance, status: u8) {
    inst.dao_in_transit = false;
    inst.dao_retry_timer = 0;
    let success = status == 0;
    if success {
        inst.dao_attempt = 0;
    }

    let mut retry_needed = false;
    inst.targets.retain_mut(|target| {
        let TargetInfo::NonRoot(info) = &mut target.info else { return true };
        if success {
            info.pc_assigned |= info.pc_assigning;
            info.pc_to_retry &= !info.pc_assigning;
        } else {
            info.pc_to_retry |= info.pc_assigning;
            retry_needed = true;
        }
        info.pc_assigning = 0;
        // No-Path targets die once their final advertisements are done
        if target.lifetime == 0 && target.hold_count == 0 {
            return false;
        }
        true
    });
    if !success {
        warn!(instance = inst.id, status, "DAO rejected");
        retry_needed = true;
    }
    if retry_needed {
        dao_trigger(inst, 0);
    }
}

/// 100 ms tick work: pending DAO delay and ACK retry.
pub(crate) fn dao_timer_tick(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform, ticks: u32) {
    let ticks = ticks.min(u16::MAX as u32) as u16;

    if inst.dao_retry_timer > 0 {
        if inst.dao_retry_timer > ticks {
            inst.dao_retry_timer -= ticks;
        } else {
            inst.dao_retry_timer = 0;
            if inst.dao_attempt <= ctx.policy.dao_retry_count {
                debug!(instance = inst.id, attempt = inst.dao_attempt, "DAO retransmit");
                transmit_dao(inst, ctx, platform);
            } else {
                // Out of retries: declare failure and force the
                // sub-DODAG (and ourselves) to start afresh
                warn!(instance = inst.id, "DAO failed, no acknowledgement");
                ctx.stats.dao_failures += 1;
                inst.dao_in_transit = false;
                for target in &mut inst.targets {
                    if let TargetInfo::NonRoot(info) = &mut target.info {
                        info.pc_to_retry |= info.pc_assigning;
                        info.pc_assigning = 0;
                    }
                }
                inst.increment_dtsn(ctx.now, ctx.rng);
            }
        }
    }

    if inst.delay_dao_timer > 0 {
        if inst.delay_dao_timer > ticks {
            inst.delay_dao_timer -= ticks;
        } else {
            inst.delay_dao_timer = 0;
            if inst.pending_neighbour_confirmation {
                // Address registration still running; it re-triggers on
                // completion
                inst.delay_dao_timer = DEFAULT_DAO_DELAY_TICKS;
            } else if inst.dao_in_transit {
                // Wait for the in-flight exchange to settle first
                inst.delay_dao_timer = DEFAULT_DAO_DELAY_TICKS;
            } else {
                platform.event(RplEvent::DaoTrigger { instance_id: inst.id });
                transmit_dao(inst, ctx, platform);
            }
        }
    }
}

/// 1 s tick work: target lifetimes and periodic refresh.
pub(crate) fn dao_slow_tick(inst: &mut Instance, ctx: &mut Ctx<'_>, platform: &mut dyn Platform, seconds: u32) {
    let mut expired: Vec<Ipv6Net> = Vec::new();
    let mut refresh = false;

    for target in &mut inst.targets {
        if target.lifetime != 0xFFFF_FFFF && target.lifetime != 0 {
            if target.lifetime > seconds {
                target.lifetime -= seconds;
            } else {
                target.lifetime = 0;
                if target.published {
                    // Withdraw with a short run of No-Path DAOs
                    target.hold_count = RPL_MAX_FINAL_RTR_ADVERTISEMENTS;
                    refresh = true;
                } else {
                    expired.push(target.prefix);
                }
            }
        }
        if let TargetInfo::NonRoot(info) = &mut target.info {
            if target.published && target.lifetime != 0 {
                if info.refresh_timer > seconds {
                    info.refresh_timer -= seconds;
                } else {
                    // Re-advertise; the cadence follows the path lifetime
                    // unless policy configures a floor
                    let lifetime_s =
                        if target.lifetime == 0xFFFF_FFFF { 0x4000 } else { target.lifetime };
                    let mut next = lifetime_s / 2;
                    let floor = ctx.policy.minimum_dao_target_refresh_s as u32;
                    if floor != 0 && next > floor {
                        next = floor;
                    }
                    info.refresh_timer = next.max(60);
                    refresh = true;
                }
            }
        }
    }

    for prefix in expired {
        debug!(instance = inst.id, target = %prefix, "DAO target expired");
        remove_target_state(inst, &prefix, platform);
    }
    if refresh {
        dao_trigger(inst, 0);
    }

    root::age_transits(inst, platform, seconds);
}

/// Periodic re-registration of our addresses with the preferred parent.
pub(crate) fn address_registration_slow_tick(
    inst: &mut Instance,
    ctx: &mut Ctx<'_>,
    platform: &mut dyn Platform,
    seconds: u32,
) {
    if !ctx.policy.parent_confirmation_requested {
        return;
    }
    let seconds = seconds.min(u16::MAX as u32) as u16;
    if inst.addr_reg_timer > seconds {
        inst.addr_reg_timer -= seconds;
        return;
    }
    let timeout_min = ctx.policy.address_registration_timeout_min;
    inst.addr_reg_timer = if timeout_min != 0 { timeout_min.saturating_mul(60) } else { 600 };

    let Some(parent) = inst.preferred_parent() else { return };
    let parent_ll = parent.ll_address;
    let parent_iface = parent.interface_id;
    let own: Vec<Ipv6Addr> = inst
        .targets
        .iter()
        .filter(|t| t.own && t.published && t.lifetime != 0)
        .map(|t| t.prefix.addr())
        .collect();
    for addr in own {
        platform.request_address_registration(parent_iface, parent_ll, addr);
    }
}

/// Drop a target and the routes installed for it.
fn remove_target_state(inst: &mut Instance, prefix: &Ipv6Net, platform: &mut dyn Platform) {
    let Some(idx) = match_target(inst, prefix) else { return };
    let target = inst.targets.remove(idx);
    let info = RouteInfo::Target { prefix: target.prefix };
    platform.route_delete_by_info(target.interface_id, RouteSource::RplDao, &info);
    platform.route_delete_by_info(target.interface_id, RouteSource::RplDaoSr, &info);
    if matches!(target.info, TargetInfo::Root(_)) {
        inst.sr_cache.invalidate();
    }
}

impl Domain {
    /// Publish an address (or attached-host prefix) as a DAO target.
    pub fn publish_dao_target(
        &mut self,
        instance_id: u8,
        addr: Option<&Ipv6Addr>,
        prefix: Ipv6Net,
        lifetime: u32,
        own: bool,
        descriptor: Option<u32>,
    ) -> Result<()> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let inst = &mut self.instances[idx];
        match match_target(inst, &prefix) {
            Some(t_idx) => {
                let target = &mut inst.targets[t_idx];
                target.lifetime = lifetime;
                target.published = true;
                target.own = own;
                target.descriptor = descriptor;
            }
            None => {
                inst.targets.push(DaoTarget::published(prefix, lifetime, own, descriptor));
            }
        }
        info!(instance = inst.id, target = %prefix, "DAO target published");
        dao_trigger(inst, 0);
        Ok(())
    }

    /// Withdraw a published target: a short run of No-Path DAOs, then
    /// deletion.
    pub fn delete_dao_target(&mut self, instance_id: u8, addr: Option<&Ipv6Addr>, prefix: &Ipv6Net) -> Result<()> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let inst = &mut self.instances[idx];
        let t_idx = match_target(inst, prefix).ok_or(RplError::NotFound)?;
        let target = &mut inst.targets[t_idx];
        if !target.published {
            return Err(RplError::BadParameter("target not published by us"));
        }
        target.lifetime = 0;
        target.hold_count = RPL_MAX_FINAL_RTR_ADVERTISEMENTS;
        target.need_seq_inc = true;
        dao_trigger(inst, 0);
        Ok(())
    }

    /// Ingest a parsed DAO. Storing nodes install routes and propagate;
    /// a non-storing root updates its transit graph.
    pub fn dao_received(
        &mut self,
        platform: &mut dyn Platform,
        dao: &DaoMessage,
        src_ll: Ipv6Addr,
        interface_id: i8,
    ) -> Result<()> {
        let idx = self
            .lookup_instance(dao.instance_id, dao.dodag_id.as_ref())
            .ok_or(RplError::NotFound)?;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];

        let mop = inst.mop();
        let am_root = inst.am_root();
        let storing = matches!(mop, Mop::Storing | Mop::StoringMulticast);
        if !storing && !am_root {
            ctx.stats.inconsistent_messages += 1;
            return Err(RplError::InconsistentState("DAO at a non-storing non-root"));
        }

        let lifetime_unit = inst
            .current_dodag()
            .map(|d| d.conf.lifetime_unit.max(1) as u32)
            .unwrap_or(60);

        let mut graph_changed = false;
        for group in &dao.groups {
            for transit in &group.transits {
                let lifetime_s = if transit.path_lifetime == 0xFF {
                    0xFFFF_FFFF
                } else {
                    transit.path_lifetime as u32 * lifetime_unit
                };
                for t_opt in &group.targets {
                    let prefix = Ipv6Net::new(t_opt.prefix, t_opt.prefix_len.min(128))
                        .unwrap()
                        .trunc();
                    if am_root && !storing {
                        graph_changed |= root::dao_update_target(
                            inst,
                            platform,
                            &prefix,
                            transit,
                            lifetime_s,
                            interface_id,
                            ctx.non_storing_downstream_interface,
                        );
                    } else {
                        storing_update_target(
                            inst,
                            platform,
                            &prefix,
                            t_opt,
                            transit,
                            lifetime_s,
                            src_ll,
                            interface_id,
                        );
                    }
                }
            }
        }

        if graph_changed {
            inst.sr_cache.invalidate();
            root::invalidate_paths(inst);
        }

        if dao.expect_ack {
            platform.send_dao_ack(
                interface_id,
                src_ll,
                DaoAckMessage {
                    instance_id: dao.instance_id,
                    sequence: dao.sequence,
                    status: 0,
                    dodag_id: dao.dodag_id,
                },
            );
        }

        // Storing nodes fold received targets into their own next DAO
        if storing && !am_root {
            dao_trigger(inst, 0);
        }
        Ok(())
    }

    /// Ingest a DAO-ACK addressed to us.
    pub fn dao_ack_received(
        &mut self,
        _platform: &mut dyn Platform,
        ack: &DaoAckMessage,
        _src_ll: Ipv6Addr,
        _interface_id: i8,
    ) -> Result<()> {
        let idx = self
            .lookup_instance(ack.instance_id, ack.dodag_id.as_ref())
            .ok_or(RplError::NotFound)?;
        let inst = &mut self.instances[idx];
        if !inst.dao_in_transit || ack.sequence != inst.dao_sequence_in_transit {
            debug!(instance = inst.id, sequence = ack.sequence, "Unmatched DAO-ACK");
            return Err(RplError::Busy);
        }
        info!(instance = inst.id, sequence = ack.sequence, status = ack.status, "DAO-ACK");
        dao_assume_acked(inst, ack.status);
        Ok(())
    }

    /// The stack reports completion of an address registration handed out
    /// through [`Platform::request_address_registration`].
    pub fn address_registration_done(
        &mut self,
        platform: &mut dyn Platform,
        instance_id: u8,
        addr: Option<&Ipv6Addr>,
        parent_ll: Ipv6Addr,
        interface_id: i8,
        success: bool,
    ) -> Result<()> {
        let idx = self.lookup_instance(instance_id, addr).ok_or(RplError::NotFound)?;
        let (instances, mut ctx) = self.split();
        let inst = &mut instances[idx];
        let Some(n_idx) = inst.neighbour_index(&parent_ll, interface_id) else {
            return Err(RplError::NotFound);
        };
        if success {
            inst.candidates[n_idx].confirmed = true;
            inst.candidates[n_idx].addr_reg_failures = 0;
            if inst.wait_response == Some(parent_ll) {
                inst.wait_response = None;
            }
            inst.pending_neighbour_confirmation = false;
            dao_trigger(inst, 0);
        } else {
            let failures = {
                let n = &mut inst.candidates[n_idx];
                n.addr_reg_failures = n.addr_reg_failures.saturating_add(1);
                n.addr_reg_failures
            };
            warn!(instance = inst.id, parent = %parent_ll, failures, "Address registration failed");
            if failures >= 3 {
                crate::upward::delete_neighbour(inst, n_idx, &mut ctx, platform);
            }
            inst.pending_neighbour_confirmation = false;
            inst.trigger_parent_selection(1, None, ctx.rng);
        }
        Ok(())
    }
}

/// Storing-mode target/route update from one (target, transit) pair.
#[allow(clippy::too_many_arguments)]
fn storing_update_target(
    inst: &mut Instance,
    platform: &mut dyn Platform,
    prefix: &Ipv6Net,
    t_opt: &DaoTargetOption,
    transit: &TransitOption,
    lifetime_s: u32,
    src_ll: Ipv6Addr,
    interface_id: i8,
) {
    if lifetime_s == 0 {
        // No-Path: drop the route and the target
        debug!(instance = inst.id, target = %prefix, "No-Path DAO");
        remove_target_state(inst, prefix, platform);
        return;
    }

    let t_idx = match match_target(inst, prefix) {
        Some(i) => i,
        None => {
            inst.targets.push(DaoTarget {
                prefix: *prefix,
                path_sequence: transit.path_sequence,
                path_control: transit.path_control,
                interface_id,
                lifetime: lifetime_s,
                descriptor: t_opt.descriptor,
                external: transit.external,
                published: false,
                own: false,
                need_seq_inc: false,
                connected: false,
                hold_count: 0,
                info: TargetInfo::NonRoot(NonRootInfo::default()),
            });
            inst.targets.len() - 1
        }
    };
    {
        let target = &mut inst.targets[t_idx];
        target.lifetime = lifetime_s;
        target.path_sequence = transit.path_sequence;
        target.path_control = transit.path_control;
        target.external = transit.external;
        target.interface_id = interface_id;
        if let TargetInfo::NonRoot(info) = &mut target.info {
            info.path_lifetime = transit.path_lifetime;
        }
    }

    platform.route_add(
        *prefix,
        interface_id,
        Some(src_ll),
        RouteSource::RplDao,
        RouteInfo::Target { prefix: *prefix },
        inst.id,
        lifetime_s,
        crate::platform::IPV6_ROUTE_DEFAULT_METRIC,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbour::{Neighbour, VersionRef};

    fn instance_with_parents(prefs: &[u8]) -> Instance {
        let dodag_id: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mut inst = Instance::new(1, 0);
        let mut dodag = crate::dodag::Dodag::new(dodag_id, 0x08, 0);
        dodag.conf.path_control_size = 7;
        dodag.have_config = true;
        dodag.create_version(240);
        inst.dodags.push(dodag);
        inst.current = Some(VersionRef { dodag_id, number: 240 });
        for (i, &pref) in prefs.iter().enumerate() {
            let mut n = Neighbour::new(
                VersionRef { dodag_id, number: 240 },
                Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, i as u16 + 1),
                1,
                0x08,
                240,
                0,
            );
            n.dodag_parent = true;
            n.dodag_pref = pref;
            inst.candidates.push(n);
        }
        inst
    }

    #[test]
    fn test_path_control_single_parent_per_level() {
        let mut inst = instance_with_parents(&[0, 1]);
        convert_dodag_preferences_to_dao_path_control(&mut inst);
        assert_eq!(inst.candidates[0].dao_path_control, 0xC0);
        assert_eq!(inst.candidates[1].dao_path_control, 0x30);
    }

    #[test]
    fn test_path_control_shared_level() {
        let mut inst = instance_with_parents(&[0, 1, 1]);
        convert_dodag_preferences_to_dao_path_control(&mut inst);
        assert_eq!(inst.candidates[0].dao_path_control, 0xC0);
        assert_eq!(inst.candidates[1].dao_path_control, 0x20);
        assert_eq!(inst.candidates[2].dao_path_control, 0x10);
    }

    #[test]
    fn test_path_control_budget_masks_low_groups() {
        let mut inst = instance_with_parents(&[0, 1]);
        // PCS 1: only the top two bits are usable
        inst.dodags[0].conf.path_control_size = 1;
        convert_dodag_preferences_to_dao_path_control(&mut inst);
        assert_eq!(inst.candidates[0].dao_path_control, 0xC0);
        assert_eq!(inst.candidates[1].dao_path_control, 0x00);
    }

    #[test]
    fn test_withdrawn_bits() {
        let mut inst = instance_with_parents(&[0]);
        inst.targets.push(DaoTarget::published(
            "2001:db8::abcd/128".parse().unwrap(),
            0xFFFF_FFFF,
            true,
            None,
        ));
        if let TargetInfo::NonRoot(info) = &mut inst.targets[0].info {
            info.pc_assigned = 0xC0;
        }
        // The parent loses its bits
        inst.candidates[0].old_dao_path_control = 0xC0;
        inst.candidates[0].dao_path_control = 0;
        inst.candidates[0].dodag_parent = false;

        neighbour_gone(&mut inst, 0);
        let info = inst.targets[0].non_root().unwrap();
        assert_eq!(info.pc_assigned, 0);
        assert!(inst.targets[0].need_seq_inc);
        assert_ne!(inst.delay_dao_timer, 0);
    }
}
