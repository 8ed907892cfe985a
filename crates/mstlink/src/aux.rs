// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! External collaborator interfaces.
//!
//! The engine never touches hardware directly. The host driver supplies an
//! [`AuxChannel`] for register-level DPCD access (bounded to a small
//! per-transaction byte budget), a [`HotplugSink`] to receive one event per
//! probe cycle, and optionally an [`EdidSource`] consumer for cached EDID
//! blobs discovered behind the topology.

use crate::config::AUX_MAX_XFER;
use std::fmt;

/// Result type for AUX channel operations.
pub type AuxResult<T> = Result<T, AuxError>;

/// Failures of the raw register primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxError {
    /// The device did not respond within the hardware timeout.
    Timeout,
    /// The device rejected the transaction.
    Nack,
    /// The device asked for the transaction to be retried later.
    Defer,
    /// The transfer completed short of the requested length.
    ShortXfer { requested: usize, done: usize },
}

impl fmt::Display for AuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "aux transaction timeout"),
            Self::Nack => write!(f, "aux nack"),
            Self::Defer => write!(f, "aux defer"),
            Self::ShortXfer { requested, done } => {
                write!(f, "aux short transfer: requested {} done {}", requested, done)
            }
        }
    }
}

impl std::error::Error for AuxError {}

/// Byte-exact synchronous DPCD register access.
///
/// One call maps to one hardware AUX transaction and is bounded to
/// [`max_transfer`](Self::max_transfer) bytes. The engine splits larger
/// accesses itself via [`read_window`]/[`write_window`].
pub trait AuxChannel: Send + Sync {
    /// Read `buf.len()` bytes starting at DPCD `address`.
    fn dpcd_read(&self, address: u32, buf: &mut [u8]) -> AuxResult<usize>;

    /// Write `data` starting at DPCD `address`.
    fn dpcd_write(&self, address: u32, data: &[u8]) -> AuxResult<usize>;

    /// Hardware per-transaction byte limit.
    fn max_transfer(&self) -> usize {
        AUX_MAX_XFER
    }
}

/// Read an arbitrary-length span in `max_transfer`-sized transactions.
pub fn read_window(aux: &dyn AuxChannel, address: u32, buf: &mut [u8]) -> AuxResult<()> {
    let limit = aux.max_transfer();
    let mut done = 0;
    while done < buf.len() {
        let len = (buf.len() - done).min(limit);
        let got = aux.dpcd_read(address + done as u32, &mut buf[done..done + len])?;
        if got == 0 {
            return Err(AuxError::ShortXfer {
                requested: len,
                done: 0,
            });
        }
        done += got;
    }
    Ok(())
}

/// Write an arbitrary-length span in `max_transfer`-sized transactions.
pub fn write_window(aux: &dyn AuxChannel, address: u32, data: &[u8]) -> AuxResult<()> {
    let limit = aux.max_transfer();
    let mut done = 0;
    while done < data.len() {
        let len = (data.len() - done).min(limit);
        let put = aux.dpcd_write(address + done as u32, &data[done..done + len])?;
        if put == 0 {
            return Err(AuxError::ShortXfer {
                requested: len,
                done: 0,
            });
        }
        done += put;
    }
    Ok(())
}

/// Connector/hotplug event consumer. The topology layer coalesces changes so
/// one probe cycle raises at most one event.
pub trait HotplugSink: Send + Sync {
    fn hotplug(&self);
}

/// Consumer hook for EDID blobs the relay fetches from remote sinks.
pub trait EdidSource: Send + Sync {
    /// Called when a sink port's EDID has been (re)read. `edid` is the raw
    /// blob; parsing belongs to the host driver.
    fn edid_read(&self, port_num: u8, edid: &[u8]);
}
