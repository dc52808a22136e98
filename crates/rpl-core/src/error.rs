//! Error taxonomy for the RPL engine

use thiserror::Error;

/// Errors surfaced by fallible entry points. Packet-path problems never
/// propagate out of a tick; they are counted and converted to ICMPv6
/// emissions or drops before reaching the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RplError {
    /// A bounded table is full; the triggering message is dropped whole.
    #[error("out of memory")]
    OutOfMemory,

    #[error("bad parameter: {0}")]
    BadParameter(&'static str),

    #[error("not found")]
    NotFound,

    /// A wire datum violated a protocol invariant.
    #[error("inconsistent state: {0}")]
    InconsistentState(&'static str),

    /// Loop detected during SRH processing or HbH forwarding.
    #[error("route loop")]
    RouteLoop,

    /// SRH policy or next-hop link rejection.
    #[error("unreachable")]
    Unreachable,

    /// Operation deferred; benign.
    #[error("busy")]
    Busy,
}

pub type Result<T> = std::result::Result<T, RplError>;
