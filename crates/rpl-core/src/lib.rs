//! RPL (RFC 6550) control and data plane engine for an IPv6 stack.
//!
//! The engine builds and maintains DODAGs, selects parents through OF0 or
//! MRHOF, advertises and consumes upward and downward routes, and handles
//! the per-packet routing metadata (hop-by-hop RPL option, RFC 6554 source
//! routing headers) needed for loop detection and non-storing routing.
//!
//! It is single-threaded and tick-driven: the embedding stack delivers
//! parsed control messages, forwarding events, a 100 ms and a 1 s tick, and
//! provides routes, ETX readings and message transmission through the
//! [`platform::Platform`] trait. Nothing here blocks or suspends.

pub mod data;
pub mod dodag;
pub mod domain;
pub mod downward;
pub mod error;
pub mod event;
pub mod instance;
pub mod mrhof;
pub mod neighbour;
pub mod objective;
pub mod of0;
pub mod platform;
pub mod policy;
pub mod rank;
pub mod root;
pub mod trickle;
pub mod upward;

pub use data::{NoRouteAction, PacketMeta, SrhAction, SrhEgress};
pub use domain::{Domain, DodagInfo};
pub use error::{Result, RplError};
pub use event::{RplEvent, RplStats};
pub use platform::{IcmpError, Platform, RouteInfo, RouteSource};
pub use policy::Policy;
pub use rank::{RANK_INFINITE, RplCmp};
