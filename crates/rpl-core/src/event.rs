//! Events and statistics reported to the embedding stack

use ipnet::Ipv6Net;

/// Events delivered through [`crate::platform::Platform::event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RplEvent {
    /// Lost the preferred parent; repair DIS cycle starting
    LocalRepairStart { instance_id: u8 },
    /// Repair gave up soliciting; still no parent
    LocalRepairNoMoreDis { instance_id: u8 },
    /// Preferred parent changed (switch, not loss)
    ParentChanged { instance_id: u8 },
    /// A DAO refresh cycle was triggered
    DaoTrigger { instance_id: u8 },
    /// A non-storing root target lost its last usable transit
    TargetDisconnected { instance_id: u8, target: Ipv6Net },
    /// A routing loop was detected on the data path
    RouteLoop { instance_id: u8 },
}

/// Running counters kept on the Domain. The embedding stack may read and
/// reset them; the core only increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RplStats {
    pub parent_changes: u32,
    pub local_repairs: u32,
    pub global_repairs: u32,
    pub route_loops: u32,
    pub inconsistent_messages: u32,
    pub dao_failures: u32,
    /// Seconds spent with no next hop towards the root
    pub time_no_next_hop: u32,
}
