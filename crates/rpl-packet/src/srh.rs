//! Source Routing Header codec (RFC 6554, Routing Type 3)
//!
//! The header compresses addresses against the current IPv6 destination:
//! all entries except the last drop their first CmprI bytes, the last entry
//! drops CmprE bytes. The first hop of a route is carried in the IPv6
//! destination field and never appears in the header itself.

use std::net::Ipv6Addr;
use thiserror::Error;

/// Routing Type for the RPL Source Routing Header
pub const IPV6_ROUTING_TYPE_RPL: u8 = 3;
/// IPv6 next-header value for a Routing header
pub const IPV6_NH_ROUTING: u8 = 43;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SrhParseError {
    #[error("Routing header too short: {0} bytes")]
    TooShort(usize),
    #[error("Not a RPL routing header (type {0})")]
    WrongType(u8),
    #[error("Header length inconsistent with compression fields")]
    BadLength,
}

/// Parsed fixed fields of a RPL Source Routing Header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrhInfo {
    pub next_header: u8,
    /// Hdr Ext Len in 8-byte units, excluding the first 8 bytes
    pub hlen_units: u8,
    pub segments_left: u8,
    pub cmpr_i: u8,
    pub cmpr_e: u8,
    pub pad: u8,
    /// Number of addresses carried (n)
    pub n_addrs: u16,
}

impl SrhInfo {
    /// Parse and validate the fixed part. `bytes` is the whole routing
    /// header starting at the Next Header byte.
    pub fn parse(bytes: &[u8]) -> Result<Self, SrhParseError> {
        if bytes.len() < 8 {
            return Err(SrhParseError::TooShort(bytes.len()));
        }
        if bytes[2] != IPV6_ROUTING_TYPE_RPL {
            return Err(SrhParseError::WrongType(bytes[2]));
        }
        let hlen_units = bytes[1];
        let total = (hlen_units as usize + 1) * 8;
        if bytes.len() < total {
            return Err(SrhParseError::TooShort(bytes.len()));
        }
        let cmpr_i = bytes[4] >> 4;
        let cmpr_e = bytes[4] & 0x0F;
        let pad = bytes[5] >> 4;
        let addr_space = hlen_units as usize * 8;
        let last_size = 16 - cmpr_e as usize;
        let entry_size = 16 - cmpr_i as usize;
        if addr_space < pad as usize + last_size {
            return Err(SrhParseError::BadLength);
        }
        let rest = addr_space - pad as usize - last_size;
        if rest % entry_size != 0 {
            return Err(SrhParseError::BadLength);
        }
        Ok(SrhInfo {
            next_header: bytes[0],
            hlen_units,
            segments_left: bytes[3],
            cmpr_i,
            cmpr_e,
            pad,
            n_addrs: (rest / entry_size) as u16 + 1,
        })
    }

    /// Total header size in bytes.
    pub fn header_len(&self) -> usize {
        (self.hlen_units as usize + 1) * 8
    }

    /// Compression applied to Address[i] (1-based, as in the RFC).
    pub fn cmpr(&self, i: u16) -> u8 {
        if i == self.n_addrs { self.cmpr_e } else { self.cmpr_i }
    }

    /// Byte offset of Address[i] (1-based) within the header.
    pub fn addr_offset(&self, i: u16) -> usize {
        8 + (i as usize - 1) * (16 - self.cmpr_i as usize)
    }

    /// Reconstruct Address[i], inheriting the elided prefix from `base`
    /// (normally the IPv6 destination at this hop).
    pub fn read_address(&self, bytes: &[u8], i: u16, base: &Ipv6Addr) -> Ipv6Addr {
        let cmpr = self.cmpr(i) as usize;
        let off = self.addr_offset(i);
        let mut addr = base.octets();
        addr[cmpr..].copy_from_slice(&bytes[off..off + (16 - cmpr)]);
        Ipv6Addr::from(addr)
    }

    /// Reconstruct the final destination of the route, given the current
    /// IPv6 destination. With segments left > 1 both the last "I" entry and
    /// the "E" entry contribute elided bytes.
    pub fn last_address(&self, bytes: &[u8], current_dst: &Ipv6Addr) -> Ipv6Addr {
        let mut addr = current_dst.octets();
        if self.segments_left == 0 {
            return *current_dst;
        }
        if self.segments_left > 1 && self.n_addrs > 1 {
            let off = self.addr_offset(self.n_addrs - 1);
            let cmpr = self.cmpr_i as usize;
            addr[cmpr..].copy_from_slice(&bytes[off..off + (16 - cmpr)]);
        }
        let off = self.addr_offset(self.n_addrs);
        let cmpr = self.cmpr_e as usize;
        addr[cmpr..].copy_from_slice(&bytes[off..off + (16 - cmpr)]);
        Ipv6Addr::from(addr)
    }
}

/// Decrement Segments Left in place, returning the new value.
pub fn decrement_segments_left(bytes: &mut [u8]) -> u8 {
    bytes[3] -= 1;
    bytes[3]
}

/// Swap Address[i] with the IPv6 destination (RFC 6554 §4.2 forwarding
/// step). Only the uncompressed suffix is exchanged; the elided prefix is
/// shared with the destination by construction.
pub fn swap_with_destination(info: &SrhInfo, bytes: &mut [u8], i: u16, dst: &mut [u8; 16]) {
    let cmpr = info.cmpr(i) as usize;
    let off = info.addr_offset(i);
    for k in 0..(16 - cmpr) {
        std::mem::swap(&mut dst[cmpr + k], &mut bytes[off + k]);
    }
}

/// Count matching leading bytes, capped at `max` (compression is at most 15).
fn matching_bytes(a: &[u8; 16], b: &[u8; 16], max: u8) -> u8 {
    let mut m = 0;
    while m < max && a[m as usize] == b[m as usize] {
        m += 1;
    }
    m
}

/// Encode a Source Routing Header.
///
/// `first_hop` is the address that will be placed in the IPv6 destination.
/// `addrs` are the remaining hops in path order; the last entry is the
/// final destination (or the truncation point when tunnelling with a hop
/// limit). Must be non-empty; a route with no remaining hops needs no SRH.
pub fn encode(first_hop: &Ipv6Addr, addrs: &[Ipv6Addr], next_header: u8) -> Vec<u8> {
    debug_assert!(!addrs.is_empty());
    let n = addrs.len();
    let fh = first_hop.octets();

    let mut cmpr_i = 15u8;
    for addr in &addrs[..n - 1] {
        cmpr_i = matching_bytes(&addr.octets(), &fh, cmpr_i);
    }
    let prev = if n >= 2 { addrs[n - 2].octets() } else { fh };
    let cmpr_e = matching_bytes(&addrs[n - 1].octets(), &prev, 15);

    let mut total = (16 - cmpr_e as usize) + (16 - cmpr_i as usize) * (n - 1);
    let pad = if total % 8 != 0 { 8 - (total % 8) as u8 } else { 0 };
    total += pad as usize;

    let mut out = Vec::with_capacity(8 + total);
    out.push(next_header);
    out.push((total / 8) as u8);
    out.push(IPV6_ROUTING_TYPE_RPL);
    out.push(n as u8); // Segments Left
    out.push((cmpr_i << 4) | cmpr_e);
    out.push(pad << 4);
    out.extend_from_slice(&[0, 0]);
    for addr in &addrs[..n - 1] {
        out.extend_from_slice(&addr.octets()[cmpr_i as usize..]);
    }
    out.extend_from_slice(&addrs[n - 1].octets()[cmpr_e as usize..]);
    out.resize(8 + total, 0);
    out
}
