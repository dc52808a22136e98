//! The Domain: process-wide container for instances, policy and time

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, info};

use rpl_packet::instance_id;
use rpl_packet::messages::DodagConf;

use crate::dodag::{DODAG_MIN_PURGE_AGE, Dodag};
use crate::error::{Result, RplError};
use crate::event::RplStats;
use crate::instance::Instance;
use crate::neighbour::VersionRef;
use crate::objective::Objective;
use crate::platform::Platform;
use crate::policy::Policy;
use crate::rank;
use crate::trickle::TrickleParams;
use crate::upward;

/// Management snapshot of the DODAG an instance is a member of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DodagInfo {
    pub dodag_id: Ipv6Addr,
    pub instance_id: u8,
    pub g_mop_prf: u8,
    pub version: u8,
    pub dtsn: u8,
    pub current_rank: u16,
    pub min_hop_rank_increase: u16,
    pub primary_parent: Option<(Ipv6Addr, u16)>,
    pub secondary_parent: Option<(Ipv6Addr, u16)>,
}

/// Everything the engine needs besides the instance list. Splitting it off
/// keeps instance mutation and domain-wide state in disjoint borrows.
pub(crate) struct Ctx<'a> {
    pub policy: &'a Policy,
    pub rng: &'a mut SmallRng,
    pub stats: &'a mut RplStats,
    pub now: u32,
    pub force_leaf: bool,
    pub process_routes: bool,
    pub non_storing_downstream_interface: Option<i8>,
}

/// Process-wide RPL state: an ordered set of instances plus configuration.
pub struct Domain {
    pub policy: Policy,
    pub(crate) instances: Vec<Instance>,
    /// Free-running monotonic time in 100 ms ticks
    pub(crate) now: u32,
    pub(crate) rng: SmallRng,
    /// Never become anything but a leaf, in any instance
    pub force_leaf: bool,
    /// Install RIO routes from DIOs; when false only a default route via
    /// the DODAGID is kept
    pub process_routes: bool,
    /// Interface DAOs and source-routed traffic use at a non-storing root
    pub(crate) non_storing_downstream_interface: Option<i8>,
    pub stats: RplStats,
}

impl Domain {
    pub fn new(policy: Policy) -> Self {
        Self::with_rng(policy, SmallRng::from_os_rng())
    }

    /// Deterministic construction for tests.
    pub fn with_seed(policy: Policy, seed: u64) -> Self {
        Self::with_rng(policy, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(policy: Policy, rng: SmallRng) -> Self {
        Domain {
            policy,
            instances: Vec::new(),
            now: 0,
            rng,
            force_leaf: false,
            process_routes: true,
            non_storing_downstream_interface: None,
            stats: RplStats::default(),
        }
    }

    pub(crate) fn split(&mut self) -> (&mut Vec<Instance>, Ctx<'_>) {
        (
            &mut self.instances,
            Ctx {
                policy: &self.policy,
                rng: &mut self.rng,
                stats: &mut self.stats,
                now: self.now,
                force_leaf: self.force_leaf,
                process_routes: self.process_routes,
                non_storing_downstream_interface: self.non_storing_downstream_interface,
            },
        )
    }

    pub fn monotonic_now(&self) -> u32 {
        self.now
    }

    pub fn set_non_storing_downstream_interface(&mut self, interface_id: Option<i8>) {
        self.non_storing_downstream_interface = interface_id;
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    /// Look up an instance by ID. For local instance IDs, `addr` must name
    /// the DODAGID (from the packet source or destination per the 'D' bit).
    pub(crate) fn lookup_instance(&self, raw_id: u8, addr: Option<&Ipv6Addr>) -> Option<usize> {
        let id = instance_id::base(raw_id);
        self.instances.iter().position(|inst| {
            if inst.id != id {
                return false;
            }
            if instance_id::is_global(id) {
                return true;
            }
            match (addr, inst.dodags.first()) {
                (Some(addr), Some(dodag)) => dodag.id == *addr,
                _ => false,
            }
        })
    }

    pub fn instance(&self, raw_id: u8, addr: Option<&Ipv6Addr>) -> Option<&Instance> {
        self.lookup_instance(raw_id, addr).map(|i| &self.instances[i])
    }

    pub(crate) fn create_instance(&mut self, id: u8) -> usize {
        let inst = Instance::new(id, self.now);
        debug!(instance = id, "Instance created");
        self.instances.push(inst);
        self.instances.len() - 1
    }

    /// Become the root of a new DODAG. The instance is created on demand;
    /// a local instance must not already have a DODAG.
    pub fn create_root_dodag(
        &mut self,
        instance_id: u8,
        dodag_id: Ipv6Addr,
        g_mop_prf: u8,
        conf: DodagConf,
    ) -> Result<()> {
        if !self.policy.join_config(&conf) {
            return Err(RplError::BadParameter("invalid DODAG configuration"));
        }
        let objective = Objective::lookup(conf.objective_code_point)
            .ok_or(RplError::BadParameter("unknown objective code point"))?;

        let idx = match self.lookup_instance(instance_id, Some(&dodag_id)) {
            Some(idx) => idx,
            None => {
                if instance_id::is_local(instance_id)
                    && self.lookup_instance(instance_id, None).is_some()
                {
                    return Err(RplError::BadParameter("local instance already has a DODAG"));
                }
                self.create_instance(instance_id::base(instance_id))
            }
        };

        let now = self.now;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];
        if inst.dodag(&dodag_id).is_some() {
            return Err(RplError::BadParameter("DODAG already exists"));
        }

        let mut dodag = Dodag::new(dodag_id, g_mop_prf, now);
        dodag.conf = conf;
        dodag.have_config = true;
        dodag.root = true;
        dodag.was_root = true;
        dodag.used = true;
        dodag.trickle_params = TrickleParams::from_dio_config(
            conf.dio_interval_min,
            conf.dio_interval_doublings,
            conf.dio_redundancy_constant,
        );
        let version_number = rank::seq_init();
        dodag.create_version(version_number);
        inst.dodags.push(dodag);
        inst.objective = objective;

        // ROOT_RANK is MinHopRankIncrease (DAGRank 1)
        let vref = VersionRef { dodag_id, number: version_number };
        inst.set_current_version(Some(vref), conf.min_hop_rank_increase, ctx.force_leaf, ctx.rng);
        info!(instance = inst.id, dodag = %dodag_id, "DODAG root created");
        Ok(())
    }

    /// Stop being the root. Poisons the DODAG; adverts stay suppressed.
    pub fn delete_root_dodag(&mut self, instance_id: u8, dodag_id: &Ipv6Addr) -> Result<()> {
        let idx = self
            .lookup_instance(instance_id, Some(dodag_id))
            .ok_or(RplError::NotFound)?;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];
        let dodag = inst.dodag_mut(dodag_id).ok_or(RplError::NotFound)?;
        dodag.root = false;
        inst.set_current_version(None, rank::RANK_INFINITE, ctx.force_leaf, ctx.rng);
        inst.poison(ctx.policy.repair_poison_count, ctx.rng);
        Ok(())
    }

    /// Change the root's advertised version number in place. As root we
    /// have no neighbours in our own version, so no state migrates.
    pub fn bump_root_version(&mut self, instance_id: u8, dodag_id: &Ipv6Addr) -> Result<()> {
        let idx = self
            .lookup_instance(instance_id, Some(dodag_id))
            .ok_or(RplError::NotFound)?;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];
        if !inst.am_root() {
            return Err(RplError::BadParameter("not the DODAG root"));
        }
        let current = inst.current.ok_or(RplError::NotFound)?;
        let new_number = rank::seq_inc(current.number);
        if let Some(dodag) = inst.dodag_mut(&current.dodag_id) {
            if let Some(v) = dodag.version_mut(current.number) {
                v.number = new_number;
            }
        }
        inst.current = Some(VersionRef { number: new_number, ..current });
        ctx.stats.global_repairs += 1;
        inst.inconsistency(ctx.rng);
        info!(instance = inst.id, version = new_number, "Root version bumped");
        Ok(())
    }

    /// Replace the configuration of a DODAG we root. Children pick the
    /// change up from the config option in subsequent DIOs.
    pub fn set_root_config(
        &mut self,
        instance_id: u8,
        dodag_id: &Ipv6Addr,
        conf: DodagConf,
    ) -> Result<()> {
        if !self.policy.join_config(&conf) {
            return Err(RplError::BadParameter("invalid DODAG configuration"));
        }
        let objective = Objective::lookup(conf.objective_code_point)
            .ok_or(RplError::BadParameter("unknown objective code point"))?;
        let idx = self
            .lookup_instance(instance_id, Some(dodag_id))
            .ok_or(RplError::NotFound)?;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];
        let is_current = inst.current.map(|c| c.dodag_id) == Some(*dodag_id);
        let dodag = inst.dodag_mut(dodag_id).ok_or(RplError::NotFound)?;
        if !dodag.root {
            return Err(RplError::BadParameter("not the DODAG root"));
        }
        dodag.conf = conf;
        dodag.new_config_advert_count = 0;
        let params = TrickleParams::from_dio_config(
            conf.dio_interval_min,
            conf.dio_interval_doublings,
            conf.dio_redundancy_constant,
        );
        let timing_changed = dodag.trickle_params != params;
        dodag.trickle_params = params;
        inst.objective = objective;
        if timing_changed && is_current {
            inst.dio_timer.start(&params, ctx.rng);
        }
        inst.inconsistency(ctx.rng);
        Ok(())
    }

    /// Force DAO refreshes from the sub-DODAG by incrementing our DTSN.
    pub fn increment_dtsn(&mut self, instance_id: u8, dodag_id: Option<&Ipv6Addr>) -> Result<()> {
        let idx = self
            .lookup_instance(instance_id, dodag_id)
            .ok_or(RplError::NotFound)?;
        let now = self.now;
        let (instances, ctx) = self.split();
        instances[idx].increment_dtsn(now, ctx.rng);
        Ok(())
    }

    /// Join DODAGs of this instance only ever as a leaf.
    pub fn set_dodag_leaf(&mut self, instance_id: u8, dodag_id: &Ipv6Addr, leaf: bool) -> Result<()> {
        let idx = self
            .lookup_instance(instance_id, Some(dodag_id))
            .ok_or(RplError::NotFound)?;
        let inst = &mut self.instances[idx];
        let dodag = inst.dodag_mut(dodag_id).ok_or(RplError::NotFound)?;
        dodag.leaf = leaf;
        Ok(())
    }

    /// Publish a prefix in our DIOs (root only, typically).
    pub fn publish_prefix(
        &mut self,
        instance_id: u8,
        dodag_id: &Ipv6Addr,
        prefix: Ipv6Net,
        flags: u8,
        valid_lifetime: u32,
        preferred_lifetime: u32,
        age: bool,
    ) -> Result<()> {
        let idx = self
            .lookup_instance(instance_id, Some(dodag_id))
            .ok_or(RplError::NotFound)?;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];
        let dodag = inst.dodag_mut(dodag_id).ok_or(RplError::NotFound)?;
        dodag.update_dio_prefix(
            &rpl_packet::messages::PrefixOption {
                prefix: prefix.addr(),
                prefix_len: prefix.prefix_len(),
                flags,
                valid_lifetime,
                preferred_lifetime,
            },
            true,
            age,
        );
        inst.inconsistency(ctx.rng);
        Ok(())
    }

    /// Publish a route in our DIO RIOs.
    pub fn publish_route(
        &mut self,
        instance_id: u8,
        dodag_id: &Ipv6Addr,
        prefix: Ipv6Net,
        flags: u8,
        lifetime: u32,
        age: bool,
    ) -> Result<()> {
        let idx = self
            .lookup_instance(instance_id, Some(dodag_id))
            .ok_or(RplError::NotFound)?;
        let (instances, ctx) = self.split();
        let inst = &mut instances[idx];
        let dodag = inst.dodag_mut(dodag_id).ok_or(RplError::NotFound)?;
        dodag.update_dio_route(
            &rpl_packet::messages::RouteOption {
                prefix: prefix.addr(),
                prefix_len: prefix.prefix_len(),
                flags,
                lifetime,
            },
            age,
        );
        inst.inconsistency(ctx.rng);
        Ok(())
    }

    /// Management read-out for the current DODAG membership.
    pub fn dodag_info(&self, instance_id: u8, addr: Option<&Ipv6Addr>) -> Option<DodagInfo> {
        let inst = &self.instances[self.lookup_instance(instance_id, addr)?];
        let vref = inst.current?;
        let (dodag, version) = inst.resolve(&vref)?;
        Some(DodagInfo {
            dodag_id: dodag.id,
            instance_id: inst.id,
            g_mop_prf: dodag.g_mop_prf,
            version: version.number,
            dtsn: inst.dtsn,
            current_rank: inst.current_rank,
            min_hop_rank_increase: dodag.min_hop_rank_increase(),
            primary_parent: inst
                .preferred_parent()
                .map(|p| (p.global_or_ll_address(), p.rank)),
            secondary_parent: inst
                .secondary_parent()
                .map(|p| (p.global_or_ll_address(), p.rank)),
        })
    }

    /// Drop all neighbours learnt through an interface that went away.
    pub fn remove_interface(&mut self, platform: &mut dyn Platform, interface_id: i8) {
        let (instances, mut ctx) = self.split();
        for inst in instances.iter_mut() {
            while let Some(idx) = inst.candidates.iter().position(|n| n.interface_id == interface_id) {
                upward::delete_neighbour(inst, idx, &mut ctx, platform);
            }
        }
    }

    /// Application request to drop a neighbour everywhere.
    pub fn delete_neighbour_by_address(&mut self, platform: &mut dyn Platform, addr: &Ipv6Addr) {
        let (instances, mut ctx) = self.split();
        for inst in instances.iter_mut() {
            while let Some(idx) = inst.candidates.iter().position(|n| n.ll_address == *addr) {
                upward::delete_neighbour(inst, idx, &mut ctx, platform);
            }
        }
    }

    /// Reclaim one eligible item per call so the caller can amortise
    /// cleanup across ticks. Returns true when something was freed.
    pub fn purge(&mut self, platform: &mut dyn Platform) -> bool {
        let now = self.now;
        let (instances, mut ctx) = self.split();
        for i in 0..instances.len() {
            let inst = &mut instances[i];
            if inst.is_empty() {
                debug!(instance = inst.id, "Purging empty instance");
                for target in &inst.targets {
                    let info = crate::platform::RouteInfo::Target { prefix: target.prefix };
                    platform.route_delete_by_info(
                        target.interface_id,
                        crate::platform::RouteSource::RplDao,
                        &info,
                    );
                    platform.route_delete_by_info(
                        target.interface_id,
                        crate::platform::RouteSource::RplDaoSr,
                        &info,
                    );
                }
                instances.remove(i);
                return true;
            }

            // A DODAG unused for a while, with no referencing neighbours
            if let Some(dodag_id) = choose_dodag_to_purge(inst, now) {
                debug!(instance = inst.id, dodag = %dodag_id, "Purging DODAG");
                upward::delete_dodag(inst, &dodag_id, &mut ctx, platform);
                return true;
            }

            // Otherwise the worst considered non-parent candidate
            if let Some(idx) = upward::choose_worst_neighbour(inst, &mut ctx, platform) {
                let n = &inst.candidates[idx];
                if n.considered && !n.dodag_parent && n.dao_path_control == 0 {
                    debug!(instance = inst.id, neighbour = %n.ll_address, "Purging candidate");
                    upward::delete_neighbour(inst, idx, &mut ctx, platform);
                    return true;
                }
            }
        }
        false
    }

    /// 100 ms tick: Trickle-driven DIO transmission and DAO retry timers.
    pub fn fast_tick(&mut self, platform: &mut dyn Platform, ticks: u32) {
        self.now = self.now.wrapping_add(ticks);
        let (instances, mut ctx) = self.split();
        for inst in instances.iter_mut() {
            upward::dio_timer_tick(inst, &mut ctx, platform, ticks);
            crate::downward::dao_timer_tick(inst, &mut ctx, platform, ticks);
        }
    }

    /// 1 s tick: lifetimes, aging, parent selection and repair timers.
    pub fn slow_tick(&mut self, platform: &mut dyn Platform, seconds: u32) {
        let (instances, mut ctx) = self.split();
        for inst in instances.iter_mut() {
            upward::slow_tick(inst, &mut ctx, platform, seconds);
            crate::downward::dao_slow_tick(inst, &mut ctx, platform, seconds);
        }
    }
}

/// Worst unused DODAG, preferring least recently heard from. DODAGs we
/// have been members of are kept for a minimum period.
fn choose_dodag_to_purge(inst: &Instance, now: u32) -> Option<Ipv6Addr> {
    let mut worst: Option<(&Dodag, u32)> = None;
    for dodag in &inst.dodags {
        if dodag.root {
            continue;
        }
        let referenced = inst
            .candidates
            .iter()
            .any(|n| n.version.map(|v| v.dodag_id == dodag.id).unwrap_or(false));
        if dodag.have_config && referenced {
            continue;
        }
        let age = now.wrapping_sub(dodag.timestamp);
        if age < DODAG_MIN_PURGE_AGE && dodag.used {
            continue;
        }
        match worst {
            Some((_, worst_age)) if age <= worst_age => {}
            _ => worst = Some((dodag, age)),
        }
    }
    worst.map(|(d, _)| d.id)
}
