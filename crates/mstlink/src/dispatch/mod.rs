// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Transaction dispatcher
//!
//! Owns the down-link send queue and the reply path. One transaction is in
//! flight at the head of the queue at any time; replies are matched against
//! it by resolving the reply header's route (or GUID for broadcasts) to a
//! live branch. Unsolicited up requests are acked immediately and handed to
//! a worker channel, never processed inline.
//!
//! ```text
//! submit() ──> [queue] ──drain_one_chunk──> AUX DOWN_REQ mailbox
//! AUX DOWN_REP mailbox ──RxBuilder──> handle_down_reply() ──> wake waiter
//! AUX UP_REQ mailbox ──RxBuilder──> ack + worker channel
//! ```

mod queue;
mod up;

pub use queue::{Dispatcher, TxState};
pub use up::{UpMonitor, UpNotification};

use crate::aux::{read_window, AuxChannel, AuxError};
use crate::sideband::{SidebandError, SidebandHeader};
use std::fmt;

/// Result type for dispatcher operations.
pub type TxResult<T> = Result<T, TxError>;

/// Failure of a single down-link transaction. The queue and the dispatcher
/// stay live across any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// No reply arrived within the hard cap.
    Timeout,
    /// The raw write primitive kept failing; retry budget exhausted.
    Io(AuxError),
    /// The destination branch left the topology before the send.
    DestinationGone,
    /// The engine is suspended; no new transactions are accepted.
    Suspended,
    /// The reply body did not decode.
    Malformed(SidebandError),
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "sideband transaction timed out"),
            Self::Io(e) => write!(f, "sideband i/o failure: {}", e),
            Self::DestinationGone => write!(f, "destination branch left the topology"),
            Self::Suspended => write!(f, "dispatcher suspended"),
            Self::Malformed(e) => write!(f, "malformed reply: {}", e),
        }
    }
}

impl std::error::Error for TxError {}

impl From<SidebandError> for TxError {
    fn from(e: SidebandError) -> Self {
        Self::Malformed(e)
    }
}

/// Read one complete wire chunk from a sideband mailbox window.
///
/// The first AUX transaction fetches enough to decode the header; the chunk
/// length follows from `hdr_len + msg_len` and the remainder is fetched with
/// follow-up transactions.
pub(crate) fn read_mailbox_chunk(aux: &dyn AuxChannel, base: u32) -> Option<Vec<u8>> {
    let mut first = vec![0u8; aux.max_transfer().min(crate::config::SIDEBAND_CHUNK_MAX)];
    if let Err(e) = read_window(aux, base, &mut first) {
        log::debug!("[read_mailbox_chunk] head read failed: {}", e);
        return None;
    }
    let (hdr, hdr_len) = match SidebandHeader::decode(&first) {
        Ok(ok) => ok,
        Err(e) => {
            log::debug!("[read_mailbox_chunk] undecodable mailbox header: {}", e);
            return None;
        }
    };
    let total = hdr_len + hdr.msg_len as usize;
    if total <= first.len() {
        first.truncate(total);
        return Some(first);
    }
    let mut rest = vec![0u8; total - first.len()];
    if let Err(e) = read_window(aux, base + first.len() as u32, &mut rest) {
        log::debug!("[read_mailbox_chunk] tail read failed: {}", e);
        return None;
    }
    first.extend_from_slice(&rest);
    Some(first)
}
