//! Adapter surface towards the embedding IPv6 stack
//!
//! The engine is a library inside a stack: it reads the neighbour cache and
//! ETX database, installs system routes, and hands outgoing control
//! messages and ICMPv6 errors back to the transport. Everything it needs
//! from outside goes through this trait so the engine itself stays
//! deterministic and testable.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use rpl_packet::{DaoAckMessage, DaoMessage, DioMessage, DisMessage};

use crate::event::RplEvent;

/// Route sources installed or consulted by the engine. The stack's routing
/// table must keep these distinguishable for delete-by-info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteSource {
    /// Route advertised in a DIO RIO through a parent
    RplDio,
    /// Per-instance default route through a parent
    RplInstance,
    /// Host route to the DODAGID through a parent
    RplRoot,
    /// Downward route learnt from a DAO (storing mode)
    RplDao,
    /// Downward route at a non-storing root (source-routed)
    RplDaoSr,
    /// Transient next-hop route installed while forwarding an SRH
    RplSrh,
    /// Synthetic route returning a packet to its predecessor
    RplFwdError,
    /// Address registration (6LoWPAN ND)
    Aro,
    /// Router advertisement
    Radv,
}

impl RouteSource {
    pub fn is_rpl(self) -> bool {
        !matches!(self, RouteSource::Aro | RouteSource::Radv)
    }

    /// Routes through a DODAG parent (towards the root).
    pub fn is_rpl_parent(self) -> bool {
        matches!(
            self,
            RouteSource::RplDio | RouteSource::RplInstance | RouteSource::RplRoot
        )
    }

    /// Downward routes (away from the root).
    pub fn is_rpl_downward(self) -> bool {
        matches!(
            self,
            RouteSource::RplDao | RouteSource::RplDaoSr | RouteSource::RplSrh
        )
    }
}

/// Ownership key attached to installed routes, used for delete-by-info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteInfo {
    /// Routes owned by a parent neighbour
    Neighbour { ll_address: Ipv6Addr, interface_id: i8 },
    /// Routes owned by a DAO target
    Target { prefix: Ipv6Net },
    /// Routes owned by the instance itself
    Instance { instance_id: u8 },
}

/// ICMPv6 errors the engine asks the transport to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpError {
    /// Parameter Problem, code "erroneous header field", with a pointer
    /// into the offending packet
    ParameterProblem { pointer: u32 },
    /// Destination Unreachable, code "error in source routing header"
    SourceRouteError,
}

/// Default metric for installed routes; parent preference is added on top.
pub const IPV6_ROUTE_DEFAULT_METRIC: u8 = 128;

/// Map an RFC 4191 style preference (-1, 0, 1) to a route metric.
pub fn route_pref_to_metric(pref: i8) -> u8 {
    (IPV6_ROUTE_DEFAULT_METRIC as i16 - 64 * pref as i16) as u8
}

/// ETX reading for a link, 8.8 fixed point. `UNKNOWN` means measurement has
/// not converged; `NO_SERVICE` means the interface has no ETX service;
/// `NOT_ASSOCIATED` means there is no link.
pub mod etx {
    pub const UNKNOWN: u16 = 0x0000;
    pub const NO_SERVICE: u16 = 0x0001;
    pub const NOT_ASSOCIATED: u16 = 0xFFFF;
}

/// The services the engine consumes from, and the sinks it emits into.
///
/// All methods are synchronous; the engine never blocks or suspends.
pub trait Platform {
    /// Neighbour cache retransmission timer for an interface, milliseconds.
    fn neighbour_retrans_timer_ms(&self, interface_id: i8) -> Option<u32>;

    /// Whether the neighbour cache believes this address is reachable.
    /// `None` when there is no cache entry.
    fn neighbour_reachable(&self, interface_id: i8, addr: &Ipv6Addr) -> Option<bool>;

    /// Nudge the neighbour cache to probe this address.
    fn probe_neighbour(&mut self, interface_id: i8, addr: &Ipv6Addr);

    /// Link ETX in 8.8 fixed point (see [`etx`]).
    fn link_etx(&self, interface_id: i8, addr: &Ipv6Addr) -> u16;

    /// Is this one of our own addresses on the given interface?
    fn is_local_address(&self, interface_id: i8, addr: &Ipv6Addr) -> bool;

    /// Install or refresh a system route. `next_hop` of `None` means
    /// on-link. `lifetime` is seconds, `0xFFFF_FFFF` infinite.
    #[allow(clippy::too_many_arguments)]
    fn route_add(
        &mut self,
        prefix: Ipv6Net,
        interface_id: i8,
        next_hop: Option<Ipv6Addr>,
        source: RouteSource,
        info: RouteInfo,
        instance_id: u8,
        lifetime: u32,
        metric: u8,
    );

    /// Remove every route of `source` owned by `info`.
    fn route_delete_by_info(&mut self, interface_id: i8, source: RouteSource, info: &RouteInfo);

    /// Transmit a DIO. `dst` of `None` means link-local multicast on every
    /// RPL interface (`interface_id` `None`) or the one given.
    fn send_dio(&mut self, interface_id: Option<i8>, dst: Option<Ipv6Addr>, dio: DioMessage);

    /// Transmit a DIS, multicast when `dst` is `None`.
    fn send_dis(&mut self, interface_id: Option<i8>, dst: Option<Ipv6Addr>, dis: DisMessage);

    fn send_dao(&mut self, interface_id: i8, dst: Ipv6Addr, dao: DaoMessage);

    fn send_dao_ack(&mut self, interface_id: i8, dst: Ipv6Addr, ack: DaoAckMessage);

    /// Emit an ICMPv6 error about the packet currently being processed.
    fn icmp_error(&mut self, error: IcmpError);

    /// Deliver an engine event to the application.
    fn event(&mut self, event: RplEvent);

    /// A prefix learnt or expired from DIO PIOs. `lifetime` 0 signals
    /// withdrawal. The stack uses this for address configuration.
    fn prefix_update(
        &mut self,
        interface_id: i8,
        prefix: Ipv6Net,
        flags: u8,
        valid_lifetime: u32,
        preferred_lifetime: u32,
    );

    /// Ask the stack to (re)register our address with a parent (6LoWPAN
    /// ND address registration). Completion is reported back through
    /// [`crate::Domain::address_registration_done`].
    fn request_address_registration(&mut self, interface_id: i8, parent: Ipv6Addr, addr: Ipv6Addr);
}
