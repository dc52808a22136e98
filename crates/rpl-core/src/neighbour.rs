//! Candidate neighbours within an instance

use std::net::Ipv6Addr;

/// Value handle identifying a DODAG version: resolved through the
/// instance's DODAG list on every use. Resolution can fail once the
/// version has been retired; callers handle `None` locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRef {
    pub dodag_id: Ipv6Addr,
    pub number: u8,
}

/// A candidate next hop within an instance.
///
/// DODAG parents are identified by the `dodag_parent` flag and sorted first
/// in the instance candidate list, in order of preference (0 = best).
#[derive(Debug, Clone)]
pub struct Neighbour {
    /// Link-local address (source of its DIOs)
    pub ll_address: Ipv6Addr,
    pub interface_id: i8,
    /// Global address learnt from DAO transit options
    pub global_address: Option<Ipv6Addr>,
    /// Version the neighbour last advertised; may no longer resolve
    pub version: Option<VersionRef>,
    pub rank: u16,
    pub g_mop_prf: u8,
    pub dtsn: u8,
    pub dodag_parent: bool,
    /// Snapshot of `dodag_parent` across parent selection
    pub was_dodag_parent: bool,
    /// Considered by parent selection at least once
    pub considered: bool,
    /// Address registration to this parent completed
    pub confirmed: bool,
    /// Preference among DODAG parents, 0 = best
    pub dodag_pref: u8,
    /// Path control bits currently advertised through this parent
    pub dao_path_control: u8,
    /// Snapshot of `dao_path_control` across parent selection
    pub old_dao_path_control: u8,
    /// Monotonic 100 ms timestamp of the last DIO
    pub dio_timestamp: u32,
    pub addr_reg_failures: u8,
}

impl Neighbour {
    pub fn new(
        version: VersionRef,
        ll_address: Ipv6Addr,
        interface_id: i8,
        g_mop_prf: u8,
        dtsn: u8,
        now: u32,
    ) -> Self {
        Neighbour {
            ll_address,
            interface_id,
            global_address: None,
            version: Some(version),
            rank: crate::rank::RANK_INFINITE,
            g_mop_prf,
            dtsn,
            dodag_parent: false,
            was_dodag_parent: false,
            considered: false,
            confirmed: false,
            dodag_pref: 0,
            dao_path_control: 0,
            old_dao_path_control: 0,
            dio_timestamp: now,
            addr_reg_failures: 0,
        }
    }

    pub fn update_global_address(&mut self, addr: Ipv6Addr) {
        if self.global_address != Some(addr) {
            self.global_address = Some(addr);
        }
    }

    /// Best address for reaching this neighbour in a global-scope context.
    pub fn global_or_ll_address(&self) -> Ipv6Addr {
        self.global_address.unwrap_or(self.ll_address)
    }
}
