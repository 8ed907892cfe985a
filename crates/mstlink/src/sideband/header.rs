// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sideband message header encoder/decoder.
//!
//! # Wire format
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! +-------+-------+---------------+
//! |  LCT  |  LCR  |  RAD nibbles  |  (lct/2 RAD bytes)
//! +-+-+---+-------+---------------+
//! |B|P|  MSG_LEN  |               |  B=broadcast P=path_msg
//! +-+-+-+---------+---------------+
//! |S|E| |SEQ|CRC4 |               |  S=somt E=eomt
//! +-+-+-+---+-----+---------------+
//! ```
//!
//! The CRC4 occupies the low nibble of the last header byte and covers every
//! preceding header nibble (polynomial 0x13, nibble-serial).

use super::crc::header_crc4;
use super::{SidebandError, SidebandResult};
use std::fmt;

/// Maximum number of hops a relative address can carry (LCT is 4 bits).
pub const RAD_MAX_HOPS: usize = 15;

/// Relative address: the path of downstream port numbers from the root
/// branch to a node, one nibble per hop on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rad {
    hops: [u8; RAD_MAX_HOPS],
    len: u8,
}

impl Rad {
    /// The empty path (the root branch itself, LCT 1).
    pub const fn root() -> Self {
        Self {
            hops: [0; RAD_MAX_HOPS],
            len: 0,
        }
    }

    /// Path extended by one downstream hop through `port_num`.
    pub fn child(mut self, port_num: u8) -> Self {
        debug_assert!((self.len as usize) < RAD_MAX_HOPS);
        self.hops[self.len as usize] = port_num & 0x0f;
        self.len += 1;
        self
    }

    /// Port number taken at hop `i` (0 = first hop below the root).
    pub fn hop(&self, i: usize) -> u8 {
        self.hops[i]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pack into wire nibbles: hop 0 in the high nibble of byte 0, hop 1 in
    /// the low nibble, and so on. Returns the number of bytes written.
    pub fn pack_into(&self, buf: &mut [u8]) -> usize {
        let nbytes = (self.len as usize).div_ceil(2);
        for b in buf.iter_mut().take(nbytes) {
            *b = 0;
        }
        for (i, hop) in self.hops[..self.len as usize].iter().enumerate() {
            if i % 2 == 0 {
                buf[i / 2] |= hop << 4;
            } else {
                buf[i / 2] |= hop & 0x0f;
            }
        }
        nbytes
    }

    /// Unpack `hops` nibbles from packed wire bytes.
    pub fn unpack(bytes: &[u8], hops: usize) -> Self {
        let mut rad = Self::root();
        for i in 0..hops {
            let byte = bytes[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            rad = rad.child(nibble);
        }
        rad
    }
}

impl fmt::Display for Rad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "root");
        }
        for (i, hop) in self.hops[..self.len as usize].iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", hop)?;
        }
        Ok(())
    }
}

/// Decoded sideband chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SidebandHeader {
    /// Link count total: depth of the destination, 1 for the root branch.
    pub lct: u8,
    /// Link count remaining: hops left to the destination.
    pub lcr: u8,
    /// Nibble-packed path of port numbers from the root.
    pub rad: Rad,
    pub broadcast: bool,
    pub path_msg: bool,
    /// Chunk body length (payload bytes plus the trailing data CRC byte).
    pub msg_len: u8,
    /// Start of multi-chunk message transaction.
    pub somt: bool,
    /// End of multi-chunk message transaction.
    pub eomt: bool,
    pub seqno: bool,
}

impl SidebandHeader {
    /// Header for a request addressed at depth `lct` along `rad`.
    pub fn to_branch(lct: u8, rad: Rad) -> Self {
        Self {
            lct,
            lcr: lct.saturating_sub(1),
            rad,
            ..Self::default()
        }
    }

    /// Broadcast header (all branches, path message).
    pub fn broadcast_path() -> Self {
        Self {
            lct: 1,
            lcr: 6,
            broadcast: true,
            path_msg: true,
            ..Self::default()
        }
    }

    /// Encoded size of this header in bytes.
    pub fn size(&self) -> usize {
        3 + (self.lct as usize) / 2
    }

    /// Serialize into `buf`, returning the number of bytes written.
    ///
    /// `buf` must hold at least [`Self::size`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let mut idx = 0;
        buf[idx] = (self.lct & 0x0f) << 4 | (self.lcr & 0x0f);
        idx += 1;
        idx += self.rad.pack_into(&mut buf[idx..idx + (self.lct as usize) / 2]);
        buf[idx] =
            u8::from(self.broadcast) << 7 | u8::from(self.path_msg) << 6 | (self.msg_len & 0x3f);
        idx += 1;
        buf[idx] = u8::from(self.somt) << 7 | u8::from(self.eomt) << 6 | u8::from(self.seqno) << 4;
        // Low nibble of the final byte carries the CRC over all prior nibbles.
        buf[idx] |= header_crc4(buf, (idx << 1) + 1);
        idx + 1
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns the header and its encoded length. Fails with `CorruptHeader`
    /// when the first byte is zero, the computed length exceeds the buffer,
    /// or the CRC4 does not match.
    pub fn decode(buf: &[u8]) -> SidebandResult<(Self, usize)> {
        if buf.len() < 3 {
            return Err(SidebandError::CorruptHeader("short buffer"));
        }
        if buf[0] == 0 {
            return Err(SidebandError::CorruptHeader("zero lead byte"));
        }
        let lct = buf[0] >> 4;
        let len = 3 + (lct as usize) / 2;
        if len > buf.len() {
            return Err(SidebandError::CorruptHeader("length exceeds buffer"));
        }
        let crc = header_crc4(buf, len * 2 - 1);
        if crc != buf[len - 1] & 0x0f {
            return Err(SidebandError::CorruptHeader("crc4 mismatch"));
        }

        let mut idx = 1;
        let rad = Rad::unpack(&buf[idx..], lct.saturating_sub(1) as usize);
        idx += (lct as usize) / 2;
        let hdr = Self {
            lct,
            lcr: buf[0] & 0x0f,
            rad,
            broadcast: buf[idx] & 0x80 != 0,
            path_msg: buf[idx] & 0x40 != 0,
            msg_len: buf[idx] & 0x3f,
            somt: buf[idx + 1] & 0x80 != 0,
            eomt: buf[idx + 1] & 0x40 != 0,
            seqno: buf[idx + 1] & 0x10 != 0,
        };
        Ok((hdr, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rad_of(hops: &[u8]) -> Rad {
        hops.iter().fold(Rad::root(), |r, &h| r.child(h))
    }

    #[test]
    fn roundtrip_all_depths() {
        for lct in 1..=15u8 {
            let hops: Vec<u8> = (0..lct.saturating_sub(1)).map(|i| (i * 3) % 16).collect();
            let hdr = SidebandHeader {
                lct,
                lcr: lct - 1,
                rad: rad_of(&hops),
                broadcast: lct % 2 == 0,
                path_msg: lct % 3 == 0,
                msg_len: (lct + 7) & 0x3f,
                somt: true,
                eomt: lct % 2 == 1,
                seqno: lct % 5 == 0,
            };
            let mut buf = [0u8; 16];
            let n = hdr.encode_into(&mut buf);
            assert_eq!(n, hdr.size());
            let (decoded, len) = SidebandHeader::decode(&buf[..n]).unwrap();
            assert_eq!(len, n);
            assert_eq!(decoded, hdr, "lct={}", lct);
        }
    }

    #[test]
    fn zero_lead_byte_rejected() {
        let buf = [0u8, 0x06, 0x80];
        assert!(matches!(
            SidebandHeader::decode(&buf),
            Err(SidebandError::CorruptHeader(_))
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        let hdr = SidebandHeader::to_branch(8, rad_of(&[1, 2, 3, 4, 5, 6, 7]));
        let mut buf = [0u8; 16];
        let n = hdr.encode_into(&mut buf);
        assert!(SidebandHeader::decode(&buf[..n - 2]).is_err());
    }

    #[test]
    fn single_bit_corruption_detected() {
        let hdr = SidebandHeader {
            lct: 3,
            lcr: 2,
            rad: rad_of(&[5, 9]),
            msg_len: 12,
            somt: true,
            eomt: true,
            ..SidebandHeader::default()
        };
        let mut buf = [0u8; 8];
        let n = hdr.encode_into(&mut buf);
        for byte in 0..n {
            for bit in 0..8 {
                let mut corrupt = buf;
                corrupt[byte] ^= 1 << bit;
                match SidebandHeader::decode(&corrupt[..n]) {
                    Err(_) => {}
                    // A flip in the LCT field changes the computed header
                    // length; anything else must trip the CRC.
                    Ok((decoded, _)) => assert_ne!(
                        (decoded.lct, decoded.lcr),
                        (hdr.lct, hdr.lcr),
                        "undetected corruption at byte {} bit {}",
                        byte,
                        bit
                    ),
                }
            }
        }
    }

    #[test]
    fn rad_display_formats_path() {
        assert_eq!(Rad::root().to_string(), "root");
        assert_eq!(rad_of(&[0, 1, 4]).to_string(), "0.1.4");
    }

    #[test]
    fn rad_pack_unpack_odd_and_even() {
        for hops in [vec![7], vec![1, 2], vec![3, 4, 5], vec![15, 0, 15, 0]] {
            let rad = rad_of(&hops);
            let mut buf = [0u8; 8];
            let n = rad.pack_into(&mut buf);
            assert_eq!(n, hops.len().div_ceil(2));
            assert_eq!(Rad::unpack(&buf, hops.len()), rad);
        }
    }
}
