//! Packet-path handling: the hop-by-hop RPL option, loop detection,
//! forwarding-error signalling and source-routing header processing
//!
//! The transport owns the buffers and extension-header plumbing; these
//! handlers take the parsed option (or the raw SRH slice) plus packet
//! metadata, mutate them in place, and say what to do with the packet.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, info, warn};

use rpl_packet::RplOption;
use rpl_packet::instance_id;

use crate::domain::Domain;
use crate::error::{Result, RplError};
use crate::event::RplEvent;
use crate::platform::{IcmpError, Platform, RouteInfo, RouteSource};
use crate::policy::ForwardPolicy;
use crate::rank::{self, RANK_INFINITE, RplCmp};

/// Metadata about the packet a handler is looking at.
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub interface_id: i8,
    /// The packet was received and is being forwarded, as opposed to
    /// originated or tunnel-entered here
    pub routed_up: bool,
    /// Link-local address of the previous hop, when known
    pub predecessor: Option<Ipv6Addr>,
    /// Route source of the chosen next hop
    pub route_source: RouteSource,
    /// Next hop, for DODAG-version discontinuity detection
    pub next_hop: Option<(Ipv6Addr, i8)>,
}

/// What to do with a downward packet that has no route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoRouteAction {
    /// Send it back to the predecessor with 'F' set, over a synthetic
    /// RPL_FWD_ERROR route
    ReturnToPredecessor { predecessor: Ipv6Addr },
    /// Emit the normal destination-unreachable error
    Unreachable,
}

/// Source-routing egress decision at the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrhEgress {
    /// External target not yet tunnelled: nothing to insert here
    NotNeeded,
    /// Single-hop route: no SRH, fall back to the HbH option
    HbhOnly,
    /// Insert a header: `first_hop` goes into the IPv6 destination,
    /// `addresses` into the SRH (final destination last)
    Header { first_hop: Ipv6Addr, addresses: Vec<Ipv6Addr> },
}

/// Result of processing an SRH at an intermediate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrhAction {
    /// Segments left was zero; the packet is for us
    Done,
    /// Forward to the (swapped-in) destination over this interface
    Forward { interface_id: i8 },
}

impl Domain {
    /// The DODAGID of a local-instance packet is the source or the
    /// destination, selected by the 'D' bit.
    fn packet_dodag_id<'a>(opt: &RplOption, meta: &'a PacketMeta) -> Option<&'a Ipv6Addr> {
        if instance_id::is_local(opt.instance_id) {
            if instance_id::dest_is_dodagid(opt.instance_id) {
                Some(&meta.dst)
            } else {
                Some(&meta.src)
            }
        } else {
            None
        }
    }

    /// Build the RPL option for a packet we originate (or tunnel) over a
    /// RPL route (RFC 6550 §11.2). `sender_rank` is in DAGRank units.
    pub fn hbh_for_transmit(
        &mut self,
        instance_id_raw: u8,
        meta: &PacketMeta,
    ) -> Result<RplOption> {
        let dodag_hint = if instance_id::is_local(instance_id_raw) {
            if instance_id::dest_is_dodagid(instance_id_raw) {
                Some(meta.dst)
            } else {
                Some(meta.src)
            }
        } else {
            None
        };
        let idx = self
            .lookup_instance(instance_id_raw, dodag_hint.as_ref())
            .ok_or(RplError::NotFound)?;
        let inst = &self.instances[idx];
        let dodag = inst.current_dodag().ok_or(RplError::NotFound)?;

        let mut opt = RplOption::new(inst.id, 0);
        if meta.route_source.is_rpl_downward() {
            opt.down = true;
        } else if inst.is_local() {
            // Upward in a local instance: the DODAGID is the destination
            opt.instance_id |= instance_id::DEST;
        }

        // Crossing into a different DODAG version is advertised as
        // infinite rank (RFC 6550 §11.2.2.2)
        let crossing = match (&meta.next_hop, opt.down) {
            (Some((addr, interface_id)), false) => inst
                .neighbour(addr, *interface_id)
                .map(|n| n.version != inst.current)
                .unwrap_or(false),
            _ => false,
        };
        opt.sender_rank = if crossing {
            RANK_INFINITE
        } else {
            rank::dag_rank(inst.current_rank, dodag.min_hop_rank_increase())
        };
        Ok(opt)
    }

    /// Handle the option of a packet arriving with the 'F' bit: the
    /// predecessor routed it back because our downward route is dead.
    /// Deletes the matching DAO state and clears the bit so the packet
    /// can be forwarded again (or fail further upward).
    pub fn hbh_received(
        &mut self,
        platform: &mut dyn Platform,
        opt: &mut RplOption,
        meta: &PacketMeta,
    ) -> Result<()> {
        if !opt.fwd_error {
            return Ok(());
        }
        warn!(dst = %meta.dst, "Forwarding error reported by next hop");
        let dodag_id = Self::packet_dodag_id(opt, meta).copied();
        let idx = self
            .lookup_instance(opt.instance_id, dodag_id.as_ref())
            .ok_or(RplError::NotFound)?;
        let inst = &mut self.instances[idx];

        // Drop the advertised target and its routes; a later DAO from the
        // destination re-creates the path
        if let Some(t_idx) = inst.targets.iter().position(|t| t.prefix.contains(&meta.dst)) {
            let target = inst.targets.remove(t_idx);
            info!(target = %target.prefix, "Deleting DAO state after forwarding error");
            let route_info = RouteInfo::Target { prefix: target.prefix };
            platform.route_delete_by_info(target.interface_id, RouteSource::RplDao, &route_info);
            platform.route_delete_by_info(target.interface_id, RouteSource::RplDaoSr, &route_info);
        }
        opt.fwd_error = false;
        Ok(())
    }

    /// Update the option while forwarding (RFC 6550 §11.2.2.2): rank-error
    /// detection, direction flag, 'D' bit upkeep and the sender rank.
    /// An error return means the packet must be dropped.
    pub fn hbh_forward(
        &mut self,
        platform: &mut dyn Platform,
        opt: &mut RplOption,
        meta: &PacketMeta,
    ) -> Result<()> {
        let dodag_id = Self::packet_dodag_id(opt, meta).copied();
        let idx = self
            .lookup_instance(opt.instance_id, dodag_id.as_ref())
            .ok_or(RplError::NotFound)?;
        let now_rank;
        let mhri;
        let local;
        let instance_dodag_id;
        {
            let inst = &self.instances[idx];
            let dodag = inst.current_dodag().ok_or(RplError::NotFound)?;
            now_rank = inst.current_rank;
            mhri = dodag.min_hop_rank_increase();
            local = inst.is_local();
            instance_dodag_id = dodag.id;
        }

        if meta.routed_up {
            // Rank errors: sender rank must be strictly less for Down and
            // strictly greater for Up. Equality is treated as an error too,
            // for reliable sibling-loop detection.
            let cmp = rank::compare_dagrank_rank(opt.sender_rank, now_rank, mhri);
            let expected = if opt.down { RplCmp::Less } else { RplCmp::Greater };
            if cmp != expected {
                if opt.rank_error {
                    self.stats.route_loops += 1;
                    info!(sender_rank = opt.sender_rank, "Forwarding inconsistency, dropping");
                    let (instances, ctx) = self.split();
                    instances[idx].inconsistency(ctx.rng);
                    platform.event(RplEvent::RouteLoop { instance_id: instances[idx].id });
                    return Err(RplError::RouteLoop);
                }
                opt.rank_error = true;
            }
        }

        if opt.fwd_error {
            // Keep the flag; the predecessor handler clears it
        } else if meta.route_source.is_rpl_downward() {
            opt.down = true;
        } else {
            opt.down = false;
        }

        // 'D' bit upkeep for local instances
        if local {
            if instance_dodag_id == meta.dst {
                opt.instance_id |= instance_id::DEST;
            } else if instance_dodag_id == meta.src {
                opt.instance_id &= !instance_id::DEST;
            } else {
                self.stats.inconsistent_messages += 1;
                warn!(dodag = %instance_dodag_id, "Local instance packet matches neither endpoint");
                return Err(RplError::InconsistentState("local instance endpoint mismatch"));
            }
        }

        // Sender rank: ours, or infinite across a version discontinuity
        let crossing = match (&meta.next_hop, opt.down || opt.fwd_error) {
            (Some((addr, interface_id)), false) => {
                let inst = &self.instances[idx];
                inst.neighbour(addr, *interface_id)
                    .map(|n| n.version != inst.current)
                    .unwrap_or(false)
            }
            _ => false,
        };
        opt.sender_rank = if crossing {
            RANK_INFINITE
        } else {
            rank::dag_rank(now_rank, mhri)
        };
        Ok(())
    }

    /// A downward packet found no route. If the predecessor is known, the
    /// packet goes back to it with 'F' set; an upward no-route (when we
    /// are not the root) hints at a RPL problem and kicks Trickle.
    pub fn no_route(
        &mut self,
        platform: &mut dyn Platform,
        opt: &mut RplOption,
        meta: &PacketMeta,
    ) -> NoRouteAction {
        let dodag_id = Self::packet_dodag_id(opt, meta).copied();
        let Some(idx) = self.lookup_instance(opt.instance_id, dodag_id.as_ref()) else {
            warn!(instance = opt.instance_id, "No-route for unknown instance");
            return NoRouteAction::Unreachable;
        };

        if opt.down {
            if let Some(predecessor) = meta.predecessor {
                opt.fwd_error = true;
                info!(dst = %meta.dst, predecessor = %predecessor, "Returning packet with forwarding error");
                return NoRouteAction::ReturnToPredecessor { predecessor };
            }
            return NoRouteAction::Unreachable;
        }

        // Upward and not the root: we should always be able to route
        // towards the root, so treat this as an inconsistency
        if !self.instances[idx].am_root() {
            self.stats.route_loops += 1;
            let (instances, ctx) = self.split();
            instances[idx].inconsistency(ctx.rng);
            platform.event(RplEvent::RouteLoop { instance_id: instances[idx].id });
        }
        NoRouteAction::Unreachable
    }

    /// Compute the source-routing egress for a packet leaving a
    /// non-storing root (RFC 6554 §4.1). When tunnelling, the route is
    /// truncated at the hop limit so the tunnel exit generates Time
    /// Exceeded on the inner packet.
    pub fn srh_for_transmit(
        &mut self,
        platform: &mut dyn Platform,
        instance_id_raw: u8,
        final_dest: &Ipv6Addr,
        hop_limit: u8,
        tunnelled: bool,
    ) -> Result<SrhEgress> {
        let idx = self
            .lookup_instance(instance_id_raw, Some(final_dest))
            .or_else(|| self.lookup_instance(instance_id_raw, None))
            .ok_or(RplError::NotFound)?;
        let (instances, mut ctx) = self.split();
        let inst = &mut instances[idx];

        let t_idx = inst
            .targets
            .iter()
            .position(|t| t.prefix.contains(final_dest))
            .ok_or(RplError::NotFound)?;

        let mut final_rpl_dest = *final_dest;
        let mut target_prefix = inst.targets[t_idx].prefix;
        if inst.targets[t_idx].external {
            // External targets are routed only as far as their transit
            if !tunnelled {
                return Ok(SrhEgress::NotNeeded);
            }
            let transit = inst.targets[t_idx]
                .root_info()
                .and_then(|i| i.transits.first())
                .map(|t| t.transit)
                .ok_or(RplError::Unreachable)?;
            final_rpl_dest = transit;
            target_prefix = inst
                .targets
                .iter()
                .find(|t| t.prefix.contains(&transit))
                .map(|t| t.prefix)
                .ok_or(RplError::Unreachable)?;
        }

        let hops = crate::root::compute_source_route(inst, &mut ctx, platform, &final_rpl_dest, &target_prefix)?;

        // Full path after us: the intermediates, then the destination
        let mut path = hops;
        path.push(final_rpl_dest);
        let limit = if tunnelled { hop_limit.max(1) as usize } else { 0xFF };
        if path.len() > limit {
            path.truncate(limit);
        }
        if path.len() <= 1 {
            return Ok(SrhEgress::HbhOnly);
        }
        let first_hop = path.remove(0);
        Ok(SrhEgress::Header { first_hop, addresses: path })
    }

    /// Process a source routing header at an intermediate node
    /// (RFC 6554 §4.2). `srh` is the raw routing header; `dst` is the
    /// packet's current IPv6 destination, swapped in place.
    /// `srh_offset` is the header's byte offset within the packet, used
    /// for ICMPv6 error pointers.
    pub fn process_srh(
        &mut self,
        platform: &mut dyn Platform,
        srh: &mut [u8],
        dst: &mut Ipv6Addr,
        interface_id: i8,
        srh_offset: u32,
    ) -> Result<SrhAction> {
        let info = rpl_packet::SrhInfo::parse(srh).map_err(|e| {
            debug!(error = %e, "Bad source routing header");
            self.stats.inconsistent_messages += 1;
            RplError::InconsistentState("unparseable SRH")
        })?;

        if info.segments_left == 0 {
            return Ok(SrhAction::Done);
        }

        if info.segments_left as u16 > info.n_addrs {
            platform.icmp_error(IcmpError::ParameterProblem { pointer: srh_offset + 3 });
            self.stats.inconsistent_messages += 1;
            return Err(RplError::InconsistentState("segments left exceeds addresses"));
        }

        if dst.is_multicast() {
            return Err(RplError::InconsistentState("multicast destination"));
        }

        let segments_left = rpl_packet::srh::decrement_segments_left(srh);
        let info = rpl_packet::SrhInfo::parse(srh).expect("still parseable");
        let i = info.n_addrs - segments_left as u16;

        // The next address may only be multicast with zero compression;
        // otherwise it inherits a checked first byte from the destination
        let next_addr = info.read_address(srh, i, dst);
        if info.cmpr(i) == 0 && next_addr.is_multicast() {
            return Err(RplError::InconsistentState("multicast address in SRH"));
        }

        // Loop scan (RFC 6554 §4.2): we know Address[i-1] was ours, so two
        // of our addresses separated by a foreign one show up as a
        // non-local-to-local transition in Address[i..n]
        if i + 1 <= info.n_addrs {
            let mut prev_was_local = true;
            let mut rolling = *dst;
            for k in i..=info.n_addrs {
                rolling = info.read_address(srh, k, &rolling);
                let local = platform.is_local_address(interface_id, &rolling);
                if local && !prev_was_local {
                    self.stats.route_loops += 1;
                    warn!(addr = %rolling, "Source route loop");
                    platform.icmp_error(IcmpError::ParameterProblem {
                        pointer: srh_offset + info.addr_offset(k) as u32,
                    });
                    return Err(RplError::RouteLoop);
                }
                prev_was_local = local;
            }
        }

        // Swap Address[i] with the destination
        let mut dst_octets = dst.octets();
        rpl_packet::srh::swap_with_destination(&info, srh, i, &mut dst_octets);
        *dst = Ipv6Addr::from(dst_octets);

        // Policy decides whether we take this next hop: neighbour state
        // plus the stochastic ETX gate
        let out_interface = self.non_storing_downstream_interface.unwrap_or(interface_id);
        if platform.neighbour_reachable(out_interface, dst) == Some(false) {
            warn!(next_hop = %dst, "Rejecting SRH next hop: unreachable");
            platform.probe_neighbour(out_interface, dst);
            platform.icmp_error(IcmpError::SourceRouteError);
            return Err(RplError::Unreachable);
        }
        let etx = platform.link_etx(out_interface, dst);
        if self.policy.link_forward_policy(etx, &mut self.rng) == ForwardPolicy::Drop {
            warn!(next_hop = %dst, etx, "Rejecting SRH next hop: link gate");
            platform.probe_neighbour(out_interface, dst);
            platform.icmp_error(IcmpError::SourceRouteError);
            return Err(RplError::Unreachable);
        }

        // The destination is assumed on-link on the outgoing interface;
        // the SRH route source makes the IP layer produce "error in source
        // routing header" instead of "address unreachable" on failure
        platform.route_add(
            Ipv6Net::new(*dst, 128).unwrap(),
            out_interface,
            None,
            RouteSource::RplSrh,
            RouteInfo::Target { prefix: Ipv6Net::new(*dst, 128).unwrap() },
            0,
            60,
            crate::platform::IPV6_ROUTE_DEFAULT_METRIC,
        );

        Ok(SrhAction::Forward { interface_id: out_interface })
    }
}
