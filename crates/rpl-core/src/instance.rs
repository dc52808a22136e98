//! RPL instances: the per-instance topology state

use std::net::Ipv6Addr;

use rand::Rng;
use rand::rngs::SmallRng;
use tracing::debug;

use rpl_packet::instance_id;
use rpl_packet::messages::Mop;

use crate::dodag::{Dodag, DodagVersion};
use crate::downward::DaoTarget;
use crate::neighbour::{Neighbour, VersionRef};
use crate::objective::Objective;
use crate::rank::RANK_INFINITE;
use crate::root::SourceRouteCache;
use crate::trickle::TrickleTimer;

/// An RPL instance. A global instance may span multiple DODAGs; a local
/// instance (top bit of the ID set) has exactly one, whose DODAGID
/// disambiguates the instance ID.
#[derive(Debug)]
pub struct Instance {
    pub id: u8,
    /// Our DTSN for this instance
    pub dtsn: u8,
    pub dodags: Vec<Dodag>,
    /// Candidate neighbour set; DODAG parents first, by preference
    pub candidates: Vec<Neighbour>,
    pub targets: Vec<DaoTarget>,
    /// The DODAG version we are a member of, if any
    pub current: Option<VersionRef>,
    pub current_rank: u16,
    pub dio_timer: TrickleTimer,
    pub last_advertised: Option<VersionRef>,

    pub neighbours_changed: bool,
    pub local_repair: bool,
    /// Something changed this Trickle period; don't count consistencies
    pub dio_not_consistent: bool,
    pub dao_in_transit: bool,
    pub requested_dao_ack: bool,
    /// Address registration with a parent has not completed yet
    pub pending_neighbour_confirmation: bool,

    pub poison_count: u8,
    pub repair_dis_count: u8,
    /// Seconds until the next repair DIS
    pub repair_dis_timer: u16,
    /// Seconds until the next periodic parent selection
    pub parent_selection_timer: u16,

    pub dao_sequence: u8,
    pub dao_sequence_in_transit: u8,
    pub dao_attempt: u8,
    /// Ticks until DAO retransmission
    pub dao_retry_timer: u16,
    /// Ticks until the pending DAO goes out
    pub delay_dao_timer: u16,
    /// Monotonic time of the last DAO trigger
    pub last_dao_trigger_time: u32,
    /// SRH errors since the last DAO trigger
    pub srh_error_count: u16,
    /// Seconds until the next address registration refresh
    pub addr_reg_timer: u16,
    /// Parent we are waiting on for address confirmation
    pub wait_response: Option<Ipv6Addr>,

    pub objective: Objective,
    /// Source-route scratchpad, live only at a non-storing root
    pub sr_cache: SourceRouteCache,
}

impl Instance {
    pub fn new(id: u8, now: u32) -> Self {
        Instance {
            id,
            dtsn: crate::rank::seq_init(),
            dodags: Vec::new(),
            candidates: Vec::new(),
            targets: Vec::new(),
            current: None,
            current_rank: RANK_INFINITE,
            dio_timer: TrickleTimer::stopped(),
            last_advertised: None,
            neighbours_changed: false,
            local_repair: false,
            dio_not_consistent: false,
            dao_in_transit: false,
            requested_dao_ack: false,
            pending_neighbour_confirmation: false,
            poison_count: 0,
            repair_dis_count: 0,
            repair_dis_timer: 0,
            parent_selection_timer: 0,
            dao_sequence: crate::rank::seq_init(),
            dao_sequence_in_transit: 0,
            dao_attempt: 0,
            dao_retry_timer: 0,
            delay_dao_timer: 0,
            last_dao_trigger_time: now,
            srh_error_count: 0,
            addr_reg_timer: 0,
            wait_response: None,
            objective: Objective::Of0,
            sr_cache: SourceRouteCache::default(),
        }
    }

    pub fn is_local(&self) -> bool {
        instance_id::is_local(self.id)
    }

    pub fn dodag(&self, id: &Ipv6Addr) -> Option<&Dodag> {
        self.dodags.iter().find(|d| d.id == *id)
    }

    pub fn dodag_mut(&mut self, id: &Ipv6Addr) -> Option<&mut Dodag> {
        self.dodags.iter_mut().find(|d| d.id == *id)
    }

    /// Resolve a version handle. Fails once the version has been retired.
    pub fn resolve(&self, vref: &VersionRef) -> Option<(&Dodag, &DodagVersion)> {
        let dodag = self.dodag(&vref.dodag_id)?;
        let version = dodag.version(vref.number)?;
        Some((dodag, version))
    }

    pub fn current_dodag(&self) -> Option<&Dodag> {
        self.current.as_ref().and_then(|v| self.dodag(&v.dodag_id))
    }

    pub fn current_dodag_mut(&mut self) -> Option<&mut Dodag> {
        let id = self.current.as_ref()?.dodag_id;
        self.dodag_mut(&id)
    }

    pub fn current_version(&self) -> Option<&DodagVersion> {
        self.current.as_ref().and_then(|v| self.resolve(v)).map(|(_, v)| v)
    }

    pub fn am_root(&self) -> bool {
        self.current_dodag().map(|d| d.root).unwrap_or(false)
    }

    /// Mode of operation; the same for all DODAGs of an instance, so any
    /// known DODAG will do.
    pub fn mop(&self) -> Mop {
        self.current_dodag()
            .or_else(|| self.dodags.first())
            .map(|d| d.mop())
            .unwrap_or(Mop::NoDownward)
    }

    /// DODAG parents are first in the candidate list, preferred first. The
    /// `was_dodag_parent` check keeps this usable mid-selection.
    pub fn preferred_parent(&self) -> Option<&Neighbour> {
        let n = self.candidates.first()?;
        if n.dodag_parent || n.was_dodag_parent {
            Some(n)
        } else {
            None
        }
    }

    pub fn preferred_parent_mut(&mut self) -> Option<&mut Neighbour> {
        let n = self.candidates.first_mut()?;
        if n.dodag_parent || n.was_dodag_parent {
            Some(n)
        } else {
            None
        }
    }

    /// The secondary parent, when one exists.
    pub fn secondary_parent(&self) -> Option<&Neighbour> {
        let n = self.candidates.get(1)?;
        if n.dodag_parent { Some(n) } else { None }
    }

    pub fn parents(&self) -> impl Iterator<Item = &Neighbour> {
        self.candidates.iter().take_while(|n| n.dodag_parent)
    }

    pub fn neighbour(&self, ll_address: &Ipv6Addr, interface_id: i8) -> Option<&Neighbour> {
        self.candidates
            .iter()
            .find(|n| n.interface_id == interface_id && n.ll_address == *ll_address)
    }

    pub fn neighbour_mut(&mut self, ll_address: &Ipv6Addr, interface_id: i8) -> Option<&mut Neighbour> {
        self.candidates
            .iter_mut()
            .find(|n| n.interface_id == interface_id && n.ll_address == *ll_address)
    }

    pub fn neighbour_index(&self, ll_address: &Ipv6Addr, interface_id: i8) -> Option<usize> {
        self.candidates
            .iter()
            .position(|n| n.interface_id == interface_id && n.ll_address == *ll_address)
    }

    /// Insert a new candidate after the parents but ahead of older
    /// non-parents.
    pub fn insert_neighbour(&mut self, neighbour: Neighbour) -> usize {
        let pos = self
            .candidates
            .iter()
            .position(|n| !n.dodag_parent)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(pos, neighbour);
        pos
    }

    pub fn is_parent_address(&self, addr: &Ipv6Addr) -> bool {
        self.parents().any(|n| n.ll_address == *addr)
    }

    pub fn clear_parent_flags(&mut self) {
        for n in &mut self.candidates {
            n.dodag_parent = false;
        }
    }

    /// Atomically set the current version and rank. A change of version is
    /// a Trickle inconsistency; leaving a DODAG poisons using the old
    /// parameters.
    pub fn set_current_version(
        &mut self,
        version: Option<VersionRef>,
        mut rank: u16,
        force_leaf: bool,
        rng: &mut SmallRng,
    ) {
        let leaf = match &version {
            None => {
                debug!(instance = self.id, "No version, rank set to infinite");
                true
            }
            Some(v) => match self.dodag(&v.dodag_id) {
                Some(d) if d.leaf || force_leaf => {
                    debug!(instance = self.id, "Leaf, rank set to infinite");
                    true
                }
                _ => false,
            },
        };
        if leaf {
            rank = RANK_INFINITE;
        }

        self.current_rank = rank;

        let old = self.current;
        if old == version {
            return;
        }

        self.current = version;
        if let Some(vref) = &version {
            let root;
            let params;
            {
                let dodag = match self.dodag_mut(&vref.dodag_id) {
                    Some(d) => d,
                    None => return,
                };
                dodag.used = true;
                root = dodag.root;
                params = dodag.trickle_params;
            }
            if root {
                self.clear_parent_flags();
            }
            if old.map(|o| o.dodag_id) != Some(vref.dodag_id) {
                self.dio_timer.start(&params, rng);
            }
        }

        // Changing version is an inconsistency. When going to None we
        // poison using the old DODAG's parameters.
        let params = self
            .current
            .or(old)
            .and_then(|v| self.dodag(&v.dodag_id))
            .map(|d| d.trickle_params);
        if let Some(params) = params {
            self.dio_timer.inconsistent_heard(&params, rng);
        }
    }

    /// Kick the DIO Trickle timer if we are currently in a DODAG.
    pub fn inconsistency(&mut self, rng: &mut SmallRng) {
        if let Some(params) = self.current_dodag().map(|d| d.trickle_params) {
            self.dio_timer.inconsistent_heard(&params, rng);
        }
    }

    /// Count a consistent DIO reception towards Trickle suppression,
    /// unless this period already saw a change.
    pub fn consistent_rx(&mut self) {
        if !self.dio_not_consistent {
            self.dio_timer.consistent_heard();
        }
    }

    pub fn increment_dtsn(&mut self, now: u32, rng: &mut SmallRng) {
        self.dtsn = crate::rank::seq_inc(self.dtsn);
        self.last_dao_trigger_time = now;
        self.srh_error_count = 0;
        self.inconsistency(rng);
    }

    /// Arrange for `count` poison DIOs advertising infinite rank.
    pub fn poison(&mut self, count: u8, rng: &mut SmallRng) {
        if self.poison_count < count {
            self.poison_count = count;
        }
        self.inconsistency(rng);
    }

    /// Schedule parent selection in about `delay` seconds (randomised up
    /// to 1.2x). An earlier pending request wins; Imin of the relevant
    /// DODAG bounds how soon we are willing to run.
    pub fn trigger_parent_selection(&mut self, mut delay: u16, dodag_id: Option<&Ipv6Addr>, rng: &mut SmallRng) {
        if let Some(dodag) = dodag_id.and_then(|id| self.dodag(id)) {
            let imin_s = (dodag.trickle_params.imin / 10) as u16;
            if imin_s > delay {
                delay = imin_s;
            }
        }
        if self.parent_selection_timer == 0 || self.parent_selection_timer > delay {
            let jittered = rng.random_range(delay as u32..=delay as u32 + delay as u32 / 5).min(u16::MAX as u32);
            self.parent_selection_timer = (jittered as u16).max(1);
            debug!(instance = self.id, timer = self.parent_selection_timer, "Parent selection scheduled");
        }
    }

    /// Purge the instance itself when empty.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.dodags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(9)
    }

    fn vref(number: u8) -> VersionRef {
        VersionRef { dodag_id: "2001:db8::1".parse().unwrap(), number }
    }

    fn instance_with_version() -> Instance {
        let mut inst = Instance::new(1, 0);
        let mut dodag = Dodag::new("2001:db8::1".parse().unwrap(), 0x08, 0);
        dodag.create_version(240);
        inst.dodags.push(dodag);
        inst
    }

    #[test]
    fn test_candidate_ordering_on_insert() {
        let mut inst = instance_with_version();
        let mk = |tail: u16, parent: bool| {
            let mut n = Neighbour::new(
                vref(240),
                Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, tail),
                1,
                0x08,
                240,
                0,
            );
            n.dodag_parent = parent;
            n
        };
        inst.candidates.push(mk(1, true));
        inst.candidates.push(mk(2, false));
        let pos = inst.insert_neighbour(mk(3, false));
        assert_eq!(pos, 1, "new candidates go after the parents");
        assert!(inst.candidates[0].dodag_parent);
    }

    #[test]
    fn test_set_current_version_starts_trickle() {
        let mut inst = instance_with_version();
        let mut r = rng();
        assert!(!inst.dio_timer.is_running());
        inst.set_current_version(Some(vref(240)), 512, false, &mut r);
        assert_eq!(inst.current_rank, 512);
        assert!(inst.dio_timer.is_running());
        assert!(inst.dodags[0].used);
    }

    #[test]
    fn test_leaf_forces_infinite_rank() {
        let mut inst = instance_with_version();
        inst.dodags[0].leaf = true;
        let mut r = rng();
        inst.set_current_version(Some(vref(240)), 512, false, &mut r);
        assert_eq!(inst.current_rank, RANK_INFINITE);
    }

    #[test]
    fn test_trigger_parent_selection_keeps_earlier() {
        let mut inst = instance_with_version();
        let mut r = rng();
        inst.trigger_parent_selection(100, None, &mut r);
        let first = inst.parent_selection_timer;
        inst.trigger_parent_selection(200, None, &mut r);
        assert_eq!(inst.parent_selection_timer, first);
        inst.trigger_parent_selection(5, None, &mut r);
        assert!(inst.parent_selection_timer <= first);
    }
}
