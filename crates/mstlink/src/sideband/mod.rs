// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Sideband message codec
//!
//! Byte-exact encoders and decoders for the MST sideband channel: chunk
//! headers with nibble-serial CRC4, per-opcode request/reply bodies, and
//! multi-chunk splitting/reassembly with a byte-serial data CRC.
//!
//! This module is pure: it owns no I/O and no topology state. The dispatcher
//! feeds it raw mailbox bytes and transmits what it produces.
//!
//! ```text
//! Request ──encode──> body bytes ──encode_chunk──> [hdr|payload|crc] x N
//! [hdr|payload|crc] x N ──RxBuilder──> body bytes ──decode──> ReplyBody
//! ```

mod body;
mod chunk;
mod crc;
mod header;

pub use body::{
    AckReply, AllocatePayloadReply, ConnectionStatusNotify, EnumPathResourcesReply, I2cWriteTxn,
    LinkAddressPort, LinkAddressReply, NakReason, NakReply, PeerDeviceType, ReplyBody, Request,
    ResourceStatusNotify, UpRequest, REQ_ALLOCATE_PAYLOAD, REQ_CLEAR_PAYLOAD_ID_TABLE,
    REQ_CONNECTION_STATUS_NOTIFY, REQ_ENUM_PATH_RESOURCES, REQ_LINK_ADDRESS, REQ_POWER_DOWN_PHY,
    REQ_POWER_UP_PHY, REQ_QUERY_PAYLOAD, REQ_REMOTE_DPCD_READ, REQ_REMOTE_DPCD_WRITE,
    REQ_REMOTE_I2C_READ, REQ_REMOTE_I2C_WRITE, REQ_RESOURCE_STATUS_NOTIFY,
};
pub use chunk::{encode_chunk, AssembledMsg, RxBuilder};
pub use crc::{data_crc, header_crc4};
pub use header::{Rad, SidebandHeader, RAD_MAX_HOPS};

use std::fmt;

/// Result type for sideband codec operations.
pub type SidebandResult<T> = Result<T, SidebandError>;

/// Errors that can occur while encoding or decoding sideband messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandError {
    /// Header failed validation (zero lead byte, bad length, CRC4 mismatch).
    CorruptHeader(&'static str),
    /// Message body shorter than its layout requires.
    Truncated { need: usize, got: usize },
    /// Chunk payload CRC mismatch; the chunk is discarded.
    DataCrc { expected: u8, got: u8 },
    /// Unrecognized request opcode.
    UnknownRequest(u8),
    /// A field held a value outside its legal range.
    InvalidField(&'static str),
}

impl fmt::Display for SidebandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptHeader(why) => write!(f, "corrupt sideband header: {}", why),
            Self::Truncated { need, got } => {
                write!(f, "truncated sideband message: need {} got {}", need, got)
            }
            Self::DataCrc { expected, got } => {
                write!(f, "chunk data crc mismatch: computed {:#04x} got {:#04x}", expected, got)
            }
            Self::UnknownRequest(req) => write!(f, "unknown request type {:#04x}", req),
            Self::InvalidField(what) => write!(f, "invalid field: {}", what),
        }
    }
}

impl std::error::Error for SidebandError {}

/// 16-byte identifier a branch device uses to persist identity across
/// re-probes.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const ZERO: Self = Self([0; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
