//! Mock platform used by the integration tests: records everything the
//! engine does and serves canned neighbour-cache / ETX answers.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use rpl_core::{IcmpError, Platform, RouteInfo, RouteSource, RplEvent};
use rpl_packet::{DaoAckMessage, DaoMessage, DioMessage, DisMessage, DodagConf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: Ipv6Net,
    pub interface_id: i8,
    pub next_hop: Option<Ipv6Addr>,
    pub source: RouteSource,
    pub info: RouteInfo,
    pub instance_id: u8,
    pub lifetime: u32,
    pub metric: u8,
}

#[derive(Default)]
pub struct MockPlatform {
    pub etx: HashMap<(i8, Ipv6Addr), u16>,
    pub retrans_timer_ms: Option<u32>,
    pub reachable: HashMap<(i8, Ipv6Addr), bool>,
    pub local_addresses: Vec<(i8, Ipv6Addr)>,
    pub routes: Vec<RouteEntry>,
    pub dios: Vec<(Option<i8>, Option<Ipv6Addr>, DioMessage)>,
    pub diss: Vec<(Option<i8>, Option<Ipv6Addr>, DisMessage)>,
    pub daos: Vec<(i8, Ipv6Addr, DaoMessage)>,
    pub dao_acks: Vec<(i8, Ipv6Addr, DaoAckMessage)>,
    pub icmp_errors: Vec<IcmpError>,
    pub events: Vec<RplEvent>,
    pub prefix_updates: Vec<(i8, Ipv6Net, u8, u32, u32)>,
    pub reg_requests: Vec<(i8, Ipv6Addr, Ipv6Addr)>,
    pub probes: Vec<(i8, Ipv6Addr)>,
}

/// Enable log output for a test run (`RUST_LOG=rpl_core=debug`).
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_etx(&mut self, interface_id: i8, addr: Ipv6Addr, etx: u16) {
        self.etx.insert((interface_id, addr), etx);
    }

    pub fn add_local_address(&mut self, interface_id: i8, addr: Ipv6Addr) {
        self.local_addresses.push((interface_id, addr));
    }

    pub fn routes_with_source(&self, source: RouteSource) -> Vec<&RouteEntry> {
        self.routes.iter().filter(|r| r.source == source).collect()
    }

    pub fn has_event(&self, pred: impl Fn(&RplEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }
}

impl Platform for MockPlatform {
    fn neighbour_retrans_timer_ms(&self, _interface_id: i8) -> Option<u32> {
        self.retrans_timer_ms
    }

    fn neighbour_reachable(&self, interface_id: i8, addr: &Ipv6Addr) -> Option<bool> {
        self.reachable.get(&(interface_id, *addr)).copied()
    }

    fn probe_neighbour(&mut self, interface_id: i8, addr: &Ipv6Addr) {
        self.probes.push((interface_id, *addr));
    }

    fn link_etx(&self, interface_id: i8, addr: &Ipv6Addr) -> u16 {
        self.etx.get(&(interface_id, *addr)).copied().unwrap_or(0)
    }

    fn is_local_address(&self, interface_id: i8, addr: &Ipv6Addr) -> bool {
        self.local_addresses
            .iter()
            .any(|(ifid, a)| (*ifid == interface_id || *ifid == -1) && a == addr)
    }

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
    ) {
        // Same (prefix, source, info) replaces
        self.routes
            .retain(|r| !(r.prefix == prefix && r.source == source && r.info == info));
        self.routes.push(RouteEntry {
            prefix,
            interface_id,
            next_hop,
            source,
            info,
            instance_id,
            lifetime,
            metric,
        });
    }

    fn route_delete_by_info(&mut self, interface_id: i8, source: RouteSource, info: &RouteInfo) {
        self.routes
            .retain(|r| !(r.interface_id == interface_id && r.source == source && r.info == *info));
    }

    fn send_dio(&mut self, interface_id: Option<i8>, dst: Option<Ipv6Addr>, dio: DioMessage) {
        self.dios.push((interface_id, dst, dio));
    }

    fn send_dis(&mut self, interface_id: Option<i8>, dst: Option<Ipv6Addr>, dis: DisMessage) {
        self.diss.push((interface_id, dst, dis));
    }

    fn send_dao(&mut self, interface_id: i8, dst: Ipv6Addr, dao: DaoMessage) {
        self.daos.push((interface_id, dst, dao));
    }

    fn send_dao_ack(&mut self, interface_id: i8, dst: Ipv6Addr, ack: DaoAckMessage) {
        self.dao_acks.push((interface_id, dst, ack));
    }

    fn icmp_error(&mut self, error: IcmpError) {
        self.icmp_errors.push(error);
    }

    fn event(&mut self, event: RplEvent) {
        self.events.push(event);
    }

    fn prefix_update(
        &mut self,
        interface_id: i8,
        prefix: Ipv6Net,
        flags: u8,
        valid_lifetime: u32,
        preferred_lifetime: u32,
    ) {
        self.prefix_updates
            .push((interface_id, prefix, flags, valid_lifetime, preferred_lifetime));
    }

    fn request_address_registration(&mut self, interface_id: i8, parent: Ipv6Addr, addr: Ipv6Addr) {
        self.reg_requests.push((interface_id, parent, addr));
    }
}

pub const IFACE: i8 = 1;

pub fn dodag_id() -> Ipv6Addr {
    "2001:db8::1".parse().unwrap()
}

pub fn ll(tail: u16) -> Ipv6Addr {
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, tail)
}

pub fn conf(ocp: u16) -> DodagConf {
    DodagConf {
        authentication: false,
        path_control_size: 7,
        dio_interval_min: 3,
        dio_interval_doublings: 20,
        dio_redundancy_constant: 10,
        max_rank_increase: 0,
        min_hop_rank_increase: 256,
        objective_code_point: ocp,
        default_lifetime: 0xFF,
        lifetime_unit: 60,
    }
}

/// A basic non-storing DIO from `src` with the given rank.
pub fn dio(rank: u16, version: u8, with_conf: Option<DodagConf>) -> DioMessage {
    DioMessage {
        instance_id: 1,
        version,
        rank,
        g_mop_prf: 0x08, // MOP 1, non-storing
        dtsn: 240,
        dodag_id: dodag_id(),
        conf: with_conf,
        prefixes: vec![],
        routes: vec![],
    }
}
