// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MSTLINK Global Configuration - Single Source of Truth
//!
//! This module centralizes the DPCD sideband register map and every protocol
//! constant the engine relies on. **NEVER hardcode elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: Compile-time constants (register map, wire geometry,
//!   CRC polynomials, timeouts)
//! - **Level 2 (Dynamic)**: [`ManagerConfig`] for per-link runtime configuration
//!   (payload table size, PBN divisor, poll mode)

// =======================================================================
// DPCD register map (DP v1.4 Sec.2.9.3, sideband MSG mailboxes)
// =======================================================================

/// DPCD revision register.
pub const DPCD_REV: u32 = 0x000;

/// Branch device GUID register (16 bytes).
pub const DPCD_GUID: u32 = 0x030;

/// MST control register. Bit 0 enables MST mode, bit 1 unmasks UP_REQ.
pub const DPCD_MSTM_CTRL: u32 = 0x111;

/// `MSTM_CTRL` bit: MST mode enable.
pub const MST_EN: u8 = 0x01;
/// `MSTM_CTRL` bit: up-request message delivery enable.
pub const UP_REQ_EN: u8 = 0x02;
/// `MSTM_CTRL` bit: upstream device is an MST source.
pub const UPSTREAM_IS_SRC: u8 = 0x04;

/// Local payload table programming registers.
pub const DPCD_PAYLOAD_ALLOCATE_SET: u32 = 0x1C0;
pub const DPCD_PAYLOAD_ALLOCATE_START_TIME_SLOT: u32 = 0x1C1;
pub const DPCD_PAYLOAD_ALLOCATE_TIME_SLOT_COUNT: u32 = 0x1C2;

/// Payload table status register.
pub const DPCD_PAYLOAD_TABLE_UPDATE_STATUS: u32 = 0x2C0;
/// `PAYLOAD_TABLE_UPDATE_STATUS` bit: table update latched.
pub const PAYLOAD_TABLE_UPDATED: u8 = 0x01;
/// `PAYLOAD_TABLE_UPDATE_STATUS` bit: allocation change trigger handled.
pub const PAYLOAD_ACT_HANDLED: u8 = 0x02;

/// Sideband message mailbox windows (0x200 bytes each).
pub const DPCD_SIDEBAND_DOWN_REQ: u32 = 0x1000;
pub const DPCD_SIDEBAND_UP_REP: u32 = 0x1200;
pub const DPCD_SIDEBAND_DOWN_REP: u32 = 0x1400;
pub const DPCD_SIDEBAND_UP_REQ: u32 = 0x1600;

/// Event status indicator register (ESI0).
pub const DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0: u32 = 0x2003;
/// ESI0 bit: a down-reply chunk is ready in the DOWN_REP mailbox.
pub const DOWN_REP_MSG_RDY: u8 = 0x10;
/// ESI0 bit: an up-request chunk is ready in the UP_REQ mailbox.
pub const UP_REQ_MSG_RDY: u8 = 0x20;

// =======================================================================
// Wire geometry (DP v1.4 Sec.2.11: sideband MSG format)
// =======================================================================

/// Hard per-transaction byte limit of the AUX channel.
pub const AUX_MAX_XFER: usize = 16;

/// Maximum size of one sideband wire chunk (header + payload + data CRC).
pub const SIDEBAND_CHUNK_MAX: usize = 48;

/// Maximum tree depth expressible by the 4-bit LCT field.
pub const MAX_LCT: u8 = 15;

/// Maximum port number on a branch device (4-bit port field).
pub const MAX_PORT_NUM: u8 = 15;

/// Header CRC4 generator polynomial, nibble-serial.
pub const HEADER_CRC4_POLY: u8 = 0x13;

/// Chunk data CRC generator polynomial, byte-serial.
pub const DATA_CRC_POLY: u16 = 0xD5;

// =======================================================================
// Bandwidth model
// =======================================================================

/// Time slots available for payloads on one link (slot 0 carries the MTP
/// header and is never allocatable).
pub const MAX_TIME_SLOTS: u8 = 63;

/// First allocatable time slot.
pub const START_TIME_SLOT: u8 = 1;

/// Default PBN-per-slot divisor for an 8-lane HBR2 equivalent link.
pub const DEFAULT_PBN_DIV: u16 = 54;

// =======================================================================
// Timeouts and retry budgets
// =======================================================================

/// Hard cap on waiting for a down-reply, milliseconds.
pub const REPLY_TIMEOUT_MS: u64 = 4000;

/// Poll-and-retry granularity used when no interrupt source exists.
pub const REPLY_POLL_MS: u64 = 50;

/// Raw AUX write attempts per chunk before failing the queue entry.
pub const TX_RETRIES: u32 = 5;

/// Payload-table-updated poll budget: retries x backoff.
pub const TABLE_UPDATE_RETRIES: u32 = 20;
pub const TABLE_UPDATE_BACKOFF_MIN_MS: u64 = 10;
pub const TABLE_UPDATE_BACKOFF_MAX_MS: u64 = 20;

/// ACT status poll: granularity and hard cap.
pub const ACT_POLL_GRANULARITY_US: u64 = 200;
pub const ACT_TIMEOUT_MS: u64 = 3000;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Per-link runtime configuration handed to the manager at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Capacity of the local payload table (hardware dependent).
    pub max_payloads: u8,
    /// PBN-per-slot divisor for the current link rate and lane count.
    pub pbn_div: u16,
    /// When true, `wait_for_reply` pumps the sideband mailboxes itself every
    /// [`REPLY_POLL_MS`] instead of relying on an external interrupt source.
    pub poll_mode: bool,
}

impl ManagerConfig {
    /// Configuration for a link with `max_payloads` table entries.
    pub fn new(max_payloads: u8) -> Self {
        Self {
            max_payloads,
            pbn_div: DEFAULT_PBN_DIV,
            poll_mode: false,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_payloads: 16,
            pbn_div: DEFAULT_PBN_DIV,
            poll_mode: false,
        }
    }
}
