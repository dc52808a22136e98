//! RPL Option carried in an IPv6 Hop-by-Hop header (RFC 6550 §11.2)

use thiserror::Error;

/// IPv6 option type for the RPL option (0x63)
pub const IPV6_OPTION_RPL: u8 = 0x63;
/// Pad1 option type
pub const IPV6_OPTION_PAD1: u8 = 0x00;
/// PadN option type
pub const IPV6_OPTION_PADN: u8 = 0x01;
/// IPv6 next-header value for Hop-by-Hop
pub const IPV6_NH_HOP_BY_HOP: u8 = 0;

/// 'O' flag: packet is travelling down
pub const RPL_OPT_DOWN: u8 = 0x80;
/// 'R' flag: a rank error was detected en route
pub const RPL_OPT_RANK_ERROR: u8 = 0x40;
/// 'F' flag: a node was unable to forward downward
pub const RPL_OPT_FWD_ERROR: u8 = 0x20;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionParseError {
    #[error("RPL option too short: {0} bytes (need 4)")]
    TooShort(usize),
    #[error("Not a RPL option (type {0:#04x})")]
    WrongType(u8),
    #[error("Reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),
}

/// Parsed 4-byte RPL option body.
///
/// `instance_id` is carried verbatim, including the 'D' bit for local
/// instances (see [`crate::instance_id`]). `sender_rank` is in DAGRank form
/// as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RplOption {
    pub down: bool,
    pub rank_error: bool,
    pub fwd_error: bool,
    pub instance_id: u8,
    pub sender_rank: u16,
}

impl RplOption {
    pub fn new(instance_id: u8, sender_rank: u16) -> Self {
        RplOption {
            down: false,
            rank_error: false,
            fwd_error: false,
            instance_id,
            sender_rank,
        }
    }

    /// Parse the option body. `data` starts at the flags byte (after the
    /// option type and length bytes).
    pub fn parse(data: &[u8]) -> Result<Self, OptionParseError> {
        if data.len() < 4 {
            return Err(OptionParseError::TooShort(data.len()));
        }
        let flags = data[0];
        if flags & 0x1F != 0 {
            return Err(OptionParseError::ReservedFlags(flags));
        }
        Ok(RplOption {
            down: flags & RPL_OPT_DOWN != 0,
            rank_error: flags & RPL_OPT_RANK_ERROR != 0,
            fwd_error: flags & RPL_OPT_FWD_ERROR != 0,
            instance_id: data[1],
            sender_rank: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Serialize the option body (flags, instance id, sender rank).
    pub fn to_bytes(&self) -> [u8; 4] {
        let rank = self.sender_rank.to_be_bytes();
        [self.flags(), self.instance_id, rank[0], rank[1]]
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.down {
            flags |= RPL_OPT_DOWN;
        }
        if self.rank_error {
            flags |= RPL_OPT_RANK_ERROR;
        }
        if self.fwd_error {
            flags |= RPL_OPT_FWD_ERROR;
        }
        flags
    }
}

/// Build a complete 8-byte Hop-by-Hop extension header containing a single
/// RPL option (2 bytes HbH header, 2 bytes option TL, 4 bytes option body).
pub fn build_hbh_header(next_header: u8, opt: &RplOption) -> [u8; 8] {
    let body = opt.to_bytes();
    [
        next_header,
        0, // Hdr Ext Len: (8 / 8) - 1
        IPV6_OPTION_RPL,
        4, // Opt Data Len
        body[0],
        body[1],
        body[2],
        body[3],
    ]
}

/// Locate the RPL option inside a Hop-by-Hop header, skipping padding and
/// unknown options. `hbh` is the full extension header starting at the
/// Next Header byte. Returns the offset of the option body (flags byte).
pub fn find_rpl_option(hbh: &[u8]) -> Option<usize> {
    if hbh.len() < 8 {
        return None;
    }
    let hdrlen = (hbh[1] as usize + 1) * 8;
    if hdrlen > hbh.len() {
        return None;
    }
    let mut off = 2;
    while off < hdrlen {
        match hbh[off] {
            IPV6_OPTION_PAD1 => off += 1,
            IPV6_OPTION_RPL => {
                if off + 2 + 4 > hdrlen {
                    return None;
                }
                return Some(off + 2);
            }
            _ => {
                if off + 2 > hdrlen {
                    return None;
                }
                off += 2 + hbh[off + 1] as usize;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_id;

    #[test]
    fn test_roundtrip() {
        let opt = RplOption {
            down: true,
            rank_error: false,
            fwd_error: false,
            instance_id: 0x01,
            sender_rank: 2,
        };
        let bytes = opt.to_bytes();
        assert_eq!(bytes, [0x80, 0x01, 0x00, 0x02]);
        assert_eq!(RplOption::parse(&bytes).unwrap(), opt);
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let bytes = [0x81, 0x01, 0x00, 0x02];
        assert_eq!(
            RplOption::parse(&bytes),
            Err(OptionParseError::ReservedFlags(0x81))
        );
    }

    #[test]
    fn test_hbh_build_and_find() {
        let opt = RplOption::new(0x1E, 7);
        let hbh = build_hbh_header(58, &opt);
        assert_eq!(hbh[0], 58);
        assert_eq!(hbh[1], 0);
        let off = find_rpl_option(&hbh).unwrap();
        assert_eq!(off, 4);
        assert_eq!(RplOption::parse(&hbh[off..]).unwrap(), opt);
    }

    #[test]
    fn test_find_skips_padding() {
        // HbH with PadN(2) before the RPL option, padded to 16 bytes
        let opt = RplOption::new(1, 512);
        let body = opt.to_bytes();
        let mut hbh = vec![59u8, 1, IPV6_OPTION_PADN, 2, 0, 0, IPV6_OPTION_RPL, 4];
        hbh.extend_from_slice(&body);
        hbh.extend_from_slice(&[IPV6_OPTION_PADN, 2, 0, 0]);
        let off = find_rpl_option(&hbh).unwrap();
        assert_eq!(RplOption::parse(&hbh[off..]).unwrap(), opt);
    }

    #[test]
    fn test_find_missing() {
        let hbh = [59u8, 0, IPV6_OPTION_PADN, 4, 0, 0, 0, 0];
        assert_eq!(find_rpl_option(&hbh), None);
    }

    #[test]
    fn test_local_instance_dest_bit() {
        assert!(instance_id::is_local(0x80));
        assert!(!instance_id::is_local(0x7F));
        assert!(instance_id::dest_is_dodagid(0xC0));
        assert!(!instance_id::dest_is_dodagid(0x80));
        assert_eq!(instance_id::base(0xC5), 0x85);
    }
}
