//! DODAGs and DODAG versions

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::debug;

use rpl_packet::messages::{self, DodagConf, Mop, PrefixOption, RouteOption};

use crate::rank::{self, RANK_INFINITE, RplCmp};
use crate::trickle::TrickleParams;

/// How many times a zero-lifetime route or prefix is still advertised
pub const RPL_MAX_FINAL_RTR_ADVERTISEMENTS: u8 = 3;

/// Don't purge a DODAG we've been a member of unless it's been quiet for
/// 15 minutes (in 100 ms ticks)
pub const DODAG_MIN_PURGE_AGE: u32 = 15 * 60 * 10;

/// A DODAG version, identified by its lollipop number within the DODAG.
#[derive(Debug, Clone)]
pub struct DodagVersion {
    pub number: u8,
    pub lowest_advertised_rank: u16,
    pub last_advertised_rank: u16,
    /// Hard limit from DAGMaxRankIncrease, DAGRank interpretation
    pub hard_rank_limit: u16,
    /// Rank limit from the greediness rule (RFC 6550 §8.2.2.4)
    pub greediness_rank_limit: u16,
}

impl DodagVersion {
    fn new(number: u8) -> Self {
        DodagVersion {
            number,
            lowest_advertised_rank: RANK_INFINITE,
            last_advertised_rank: RANK_INFINITE,
            hard_rank_limit: RANK_INFINITE,
            greediness_rank_limit: RANK_INFINITE,
        }
    }

    /// After joining a version we don't increase rank unless an existing
    /// parent requires it.
    pub fn limit_greediness(&mut self, rank: u16, min_hop_rank_increase: u16) {
        if rank != RANK_INFINITE && self.greediness_rank_limit == RANK_INFINITE {
            self.greediness_rank_limit = rank::max_at_level(rank, min_hop_rank_increase);
        }
    }

    /// Parent selection may raise the limit for a new preferred parent
    /// circumstance.
    pub fn raise_greediness(&mut self, pref_rank: u16, min_hop_rank_increase: u16) {
        if self.greediness_rank_limit < pref_rank {
            self.greediness_rank_limit = rank::max_at_level(pref_rank, min_hop_rank_increase);
        }
    }
}

/// A route advertised in DIO RIOs.
#[derive(Debug, Clone)]
pub struct DioRoute {
    pub prefix: Ipv6Net,
    /// RA-encoded preference bits
    pub flags: u8,
    pub lifetime: u32,
    /// Remaining zero-lifetime advertisements
    pub hold_count: u8,
    /// Whether the lifetime counts down locally
    pub age: bool,
}

/// A prefix advertised in DIO PIOs, with RPL-specific aging state.
#[derive(Debug, Clone)]
pub struct DioPrefix {
    pub prefix: Ipv6Net,
    /// L/A/R bits
    pub flags: u8,
    pub lifetime: u32,
    pub preferred_lifetime: u32,
    /// We publish this (root/own), as opposed to relaying a parent's
    pub published: bool,
    pub age: bool,
    pub hold_count: u8,
    /// Seen in the DIO currently being processed (bracket marker)
    pub in_current_dio: bool,
}

/// A DODAG, identified by (RPLInstanceID, DODAGID).
#[derive(Debug, Clone)]
pub struct Dodag {
    pub id: Ipv6Addr,
    /// Grounded / Mode / Preference byte from DIOs
    pub g_mop_prf: u8,
    pub conf: DodagConf,
    pub have_config: bool,
    /// We are the root
    pub root: bool,
    /// We have been the root; adverts for this DODAG stay suppressed
    pub was_root: bool,
    /// We are a leaf in this DODAG by policy
    pub leaf: bool,
    /// We have ever been a member
    pub used: bool,
    pub new_config_advert_count: u8,
    /// Monotonic timestamp of the last DIO naming this DODAG
    pub timestamp: u32,
    /// Versions, newest first under lollipop compare
    pub versions: Vec<DodagVersion>,
    pub routes: Vec<DioRoute>,
    pub prefixes: Vec<DioPrefix>,
    pub trickle_params: TrickleParams,
}

impl Dodag {
    pub fn new(id: Ipv6Addr, g_mop_prf: u8, now: u32) -> Self {
        // Default timer parameters are only used if we end up sending
        // poison DIOs before any config arrives.
        let trickle_params = TrickleParams::from_dio_config(3, 20, 10);
        Dodag {
            id,
            g_mop_prf,
            conf: DodagConf::default(),
            have_config: false,
            root: false,
            was_root: false,
            leaf: false,
            used: false,
            new_config_advert_count: 0,
            timestamp: now,
            versions: Vec::new(),
            routes: Vec::new(),
            prefixes: Vec::new(),
            trickle_params,
        }
    }

    pub fn mop(&self) -> Mop {
        messages::mop(self.g_mop_prf)
    }

    pub fn grounded(&self) -> bool {
        messages::grounded(self.g_mop_prf)
    }

    pub fn pref(&self) -> u8 {
        messages::dodag_pref(self.g_mop_prf)
    }

    pub fn set_pref(&mut self, pref: u8) {
        self.g_mop_prf =
            (self.g_mop_prf & !messages::RPL_DODAG_PREF_MASK) | (pref & messages::RPL_DODAG_PREF_MASK);
    }

    pub fn min_hop_rank_increase(&self) -> u16 {
        self.conf.min_hop_rank_increase
    }

    /// RPL lifetime (units of LifetimeUnit, 0xFF = infinite) in seconds.
    pub fn lifetime_seconds(&self, lifetime: u8) -> u32 {
        if lifetime == 0xFF {
            0xFFFF_FFFF
        } else {
            lifetime as u32 * self.conf.lifetime_unit as u32
        }
    }

    pub fn default_lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds(self.conf.default_lifetime)
    }

    pub fn version(&self, number: u8) -> Option<&DodagVersion> {
        self.versions.iter().find(|v| v.number == number)
    }

    pub fn version_mut(&mut self, number: u8) -> Option<&mut DodagVersion> {
        self.versions.iter_mut().find(|v| v.number == number)
    }

    /// Newest version, if any.
    pub fn newest_version(&self) -> Option<&DodagVersion> {
        self.versions.first()
    }

    /// Create a version, keeping the list newest-first and dropping any
    /// tail that is no longer strictly comparable below the newest.
    /// Returns the numbers of versions that were discarded.
    pub fn create_version(&mut self, number: u8) -> Vec<u8> {
        let mut insert_at = self.versions.len();
        for (i, v) in self.versions.iter().enumerate() {
            let cmp = rank::seq_compare(number, v.number);
            // Unordered is treated as newest (RFC 6550 §7.2)
            if matches!(cmp, RplCmp::Greater | RplCmp::Unordered) {
                insert_at = i;
                break;
            }
        }
        self.versions.insert(insert_at, DodagVersion::new(number));

        // Guarantee a totally ordered list: walk from the newest and chop
        // at the first element that isn't strictly less than it.
        let newest = self.versions[0].number;
        let mut keep = 1;
        for v in &self.versions[1..] {
            if rank::seq_compare(v.number, newest) == RplCmp::Less {
                keep += 1;
            } else {
                break;
            }
        }
        let dropped: Vec<u8> = self.versions[keep..].iter().map(|v| v.number).collect();
        if !dropped.is_empty() {
            debug!(dodag = %self.id, ?dropped, "Dropping incomparable DODAG versions");
            self.versions.truncate(keep);
        }
        dropped
    }

    pub fn remove_version(&mut self, number: u8) {
        self.versions.retain(|v| v.number != number);
    }

    /// Compare two version numbers within this DODAG.
    pub fn compare_versions(&self, a: u8, b: u8) -> RplCmp {
        rank::seq_compare(a, b)
    }

    /// Update or create the RIO route entry for a prefix. Returns true if
    /// anything changed (caller refreshes system routes).
    pub fn update_dio_route(&mut self, opt: &RouteOption, age: bool) -> bool {
        let prefix = match Ipv6Net::new(opt.prefix, opt.prefix_len) {
            Ok(net) => net.trunc(),
            Err(_) => return false,
        };
        let hold_count = if opt.lifetime == 0 {
            RPL_MAX_FINAL_RTR_ADVERTISEMENTS
        } else {
            0
        };
        if let Some(route) = self.routes.iter_mut().find(|r| r.prefix == prefix) {
            let changed = route.lifetime != opt.lifetime || route.flags != opt.flags;
            route.lifetime = opt.lifetime;
            route.flags = opt.flags;
            route.age = age;
            route.hold_count = hold_count;
            changed
        } else {
            self.routes.push(DioRoute {
                prefix,
                flags: opt.flags,
                lifetime: opt.lifetime,
                hold_count,
                age,
            });
            true
        }
    }

    /// Bracket start for PIO processing: clear the "seen" marker on
    /// non-published entries.
    pub fn prefix_update_start(&mut self) {
        for p in &mut self.prefixes {
            if !p.published {
                p.in_current_dio = false;
            }
        }
    }

    /// Bracket finish: non-published entries the parent stopped sending
    /// are dropped (unless held for final zero-lifetime advertisements).
    pub fn prefix_update_finish(&mut self) {
        self.prefixes
            .retain(|p| p.published || p.in_current_dio || p.hold_count > 0);
    }

    /// Update or create a PIO entry.
    pub fn update_dio_prefix(&mut self, opt: &PrefixOption, publish: bool, age: bool) -> &mut DioPrefix {
        // Keep only the flags we propagate
        let flags = opt.flags & (messages::PIO_L | messages::PIO_A | messages::PIO_R);
        let prefix = Ipv6Net::new(opt.prefix, opt.prefix_len.min(128)).unwrap().trunc();
        let idx = if let Some(i) = self.prefixes.iter().position(|p| p.prefix == prefix) {
            let p = &mut self.prefixes[i];
            // Newly-seen zero lifetimes are advertised a few more times
            if opt.valid_lifetime == 0 && p.lifetime != 0 {
                p.hold_count = RPL_MAX_FINAL_RTR_ADVERTISEMENTS;
            }
            p.flags = flags;
            p.lifetime = opt.valid_lifetime;
            p.preferred_lifetime = opt.preferred_lifetime;
            p.published |= publish;
            p.age = age;
            p.in_current_dio = true;
            i
        } else {
            self.prefixes.push(DioPrefix {
                prefix,
                flags,
                lifetime: opt.valid_lifetime,
                preferred_lifetime: opt.preferred_lifetime,
                published: publish,
                age,
                hold_count: if opt.valid_lifetime == 0 {
                    RPL_MAX_FINAL_RTR_ADVERTISEMENTS
                } else {
                    0
                },
                in_current_dio: true,
            });
            self.prefixes.len() - 1
        };
        &mut self.prefixes[idx]
    }

    /// Age RIO routes and PIO prefixes by `seconds`. Returns prefixes that
    /// expired (for withdrawal callbacks).
    pub fn age_lifetimes(&mut self, seconds: u32) -> Vec<Ipv6Net> {
        self.routes.retain_mut(|route| {
            if !route.age || route.lifetime == 0xFFFF_FFFF {
                return true;
            }
            if route.lifetime > seconds {
                route.lifetime -= seconds;
                true
            } else {
                route.lifetime = 0;
                route.hold_count > 0
            }
        });

        let mut expired = Vec::new();
        self.prefixes.retain_mut(|p| {
            if !p.age {
                return true;
            }
            if p.preferred_lifetime != 0xFFFF_FFFF {
                p.preferred_lifetime = p.preferred_lifetime.saturating_sub(seconds);
            }
            if p.lifetime == 0xFFFF_FFFF {
                return true;
            }
            if p.lifetime > seconds {
                p.lifetime -= seconds;
                true
            } else {
                p.lifetime = 0;
                // Only drop on timeout when publishing; relayed entries
                // stay until the parent stops advertising them.
                if p.published && p.hold_count == 0 {
                    expired.push(p.prefix);
                    false
                } else {
                    true
                }
            }
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dodag() -> Dodag {
        Dodag::new("2001:db8::1".parse().unwrap(), 0x08, 0)
    }

    #[test]
    fn test_versions_newest_first() {
        let mut d = dodag();
        d.create_version(240);
        d.create_version(241);
        d.create_version(239);
        let numbers: Vec<u8> = d.versions.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![241, 240, 239]);
    }

    #[test]
    fn test_version_wrap_ordering() {
        let mut d = dodag();
        d.create_version(126);
        d.create_version(127);
        d.create_version(0); // wraps: newest
        let numbers: Vec<u8> = d.versions.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![0, 127, 126]);
    }

    #[test]
    fn test_incomparable_versions_dropped() {
        let mut d = dodag();
        d.create_version(0);
        // 64 is unordered with 0: treated as newest, and 0 becomes
        // incomparable below it, so it gets chopped
        let dropped = d.create_version(64);
        assert_eq!(dropped, vec![0]);
        assert_eq!(d.versions.len(), 1);
        assert_eq!(d.versions[0].number, 64);
    }

    #[test]
    fn test_greediness_limits() {
        let mut v = DodagVersion::new(240);
        v.limit_greediness(512, 256);
        assert_eq!(v.greediness_rank_limit, 767);
        // Already set: no change
        v.limit_greediness(256, 256);
        assert_eq!(v.greediness_rank_limit, 767);
        v.raise_greediness(1024, 256);
        assert_eq!(v.greediness_rank_limit, 1279);
    }

    #[test]
    fn test_route_aging_with_hold() {
        let mut d = dodag();
        let opt = RouteOption {
            prefix: "2001:db8:1::".parse().unwrap(),
            prefix_len: 48,
            flags: 0,
            lifetime: 5,
        };
        assert!(d.update_dio_route(&opt, true));
        d.age_lifetimes(10);
        assert!(d.routes.is_empty());

        // Zero lifetime keeps the entry for its hold advertisements
        let opt = RouteOption { lifetime: 0, ..opt };
        d.update_dio_route(&opt, true);
        d.age_lifetimes(10);
        assert_eq!(d.routes.len(), 1);
        assert_eq!(d.routes[0].hold_count, RPL_MAX_FINAL_RTR_ADVERTISEMENTS);
    }

    #[test]
    fn test_prefix_bracket_drops_stale() {
        let mut d = dodag();
        let mk = |tail: u8| PrefixOption {
            prefix: format!("2001:db8:{tail}::").parse().unwrap(),
            prefix_len: 64,
            flags: messages::PIO_A,
            valid_lifetime: 1000,
            preferred_lifetime: 500,
        };
        d.update_dio_prefix(&mk(1), false, true);
        d.update_dio_prefix(&mk(2), false, true);
        // Next DIO only carries prefix 2
        d.prefix_update_start();
        d.update_dio_prefix(&mk(2), false, true);
        d.prefix_update_finish();
        assert_eq!(d.prefixes.len(), 1);
        assert_eq!(d.prefixes[0].prefix, "2001:db8:2::/64".parse().unwrap());
    }

    #[test]
    fn test_lifetime_units() {
        let mut d = dodag();
        d.conf.lifetime_unit = 60;
        d.conf.default_lifetime = 30;
        assert_eq!(d.default_lifetime_seconds(), 1800);
        assert_eq!(d.lifetime_seconds(0xFF), 0xFFFF_FFFF);
    }
}
