// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Register relay
//!
//! Remote DPCD and I2C access tunneled through the sideband dispatcher.
//! Requests target the branch a port hangs off; replies are validated
//! against the request (length checks surface as [`RelayError::Protocol`])
//! and NAKs are reported with their reason code.

use crate::config::AUX_MAX_XFER;
use crate::dispatch::{Dispatcher, TxError};
use crate::sideband::{AckReply, I2cWriteTxn, NakReason, ReplyBody, Request};
use crate::topology::{BranchId, PortId, Topology};
use std::fmt;
use std::sync::Arc;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Failures of remote register access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Reply shape disagreed with the request.
    Protocol(&'static str),
    /// Reply carried a different byte count than requested.
    LengthMismatch { expected: usize, got: usize },
    /// The device nacked the access.
    Nak(NakReason),
    /// Transfer list not expressible on the wire.
    InvalidTransfer(&'static str),
    /// The port or its parent branch left the topology.
    NoSuchPort,
    Tx(TxError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(why) => write!(f, "protocol error: {}", why),
            Self::LengthMismatch { expected, got } => {
                write!(f, "reply length mismatch: expected {} got {}", expected, got)
            }
            Self::Nak(reason) => write!(f, "remote access nacked: {:?}", reason),
            Self::InvalidTransfer(why) => write!(f, "invalid transfer list: {}", why),
            Self::NoSuchPort => write!(f, "port not in topology"),
            Self::Tx(e) => write!(f, "sideband failure: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<TxError> for RelayError {
    fn from(e: TxError) -> Self {
        Self::Tx(e)
    }
}

/// One sub-transaction of a relayed I2C transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cMsg {
    Write { dev_id: u8, bytes: Vec<u8> },
    Read { dev_id: u8, len: u8 },
}

/// EDID slave address on the sink's I2C bus.
const EDID_DEV_ID: u8 = 0x50;
/// One EDID block.
const EDID_BLOCK_LEN: usize = 128;

/// Remote register access built atop the dispatcher.
pub struct Relay {
    topo: Arc<Topology>,
    disp: Arc<Dispatcher>,
}

impl Relay {
    pub(crate) fn new(topo: Arc<Topology>, disp: Arc<Dispatcher>) -> Self {
        Self { topo, disp }
    }

    /// Resolve `port` to its live parent branch (topology reference taken)
    /// and its port number.
    fn parent_route(&self, port: PortId) -> RelayResult<(BranchId, u8)> {
        self.topo
            .mutate(|s, _| {
                let p = s.port(port)?;
                if p.topo_refs == 0 {
                    return None;
                }
                let parent = p.parent;
                let port_num = p.port_num;
                if !s.topology_try_get_branch(parent) {
                    return None;
                }
                Some((parent, port_num))
            })
            .ok_or(RelayError::NoSuchPort)
    }

    /// Read `buf.len()` bytes of the remote device's DPCD at `address`.
    pub fn remote_dpcd_read(&self, port: PortId, address: u32, buf: &mut [u8]) -> RelayResult<usize> {
        let (branch, port_num) = self.parent_route(port)?;
        let req = Request::RemoteDpcdRead {
            port_num,
            address,
            num_bytes: buf.len() as u8,
        };
        let reply = self.disp.transact(branch, &req);
        self.topo.topology_put_branch(branch);
        match reply? {
            ReplyBody::Ack(AckReply::RemoteDpcdRead { bytes, .. }) => {
                if bytes.len() != buf.len() {
                    return Err(RelayError::LengthMismatch {
                        expected: buf.len(),
                        got: bytes.len(),
                    });
                }
                buf.copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            ReplyBody::Nak(nak) => Err(RelayError::Nak(nak.reason)),
            _ => Err(RelayError::Protocol("unexpected dpcd read reply")),
        }
    }

    /// Write `data` into the remote device's DPCD at `address`.
    pub fn remote_dpcd_write(&self, port: PortId, address: u32, data: &[u8]) -> RelayResult<()> {
        let (branch, port_num) = self.parent_route(port)?;
        let req = Request::RemoteDpcdWrite {
            port_num,
            address,
            bytes: data.to_vec(),
        };
        let reply = self.disp.transact(branch, &req);
        self.topo.topology_put_branch(branch);
        match reply? {
            ReplyBody::Ack(AckReply::RemoteDpcdWrite { .. }) => Ok(()),
            ReplyBody::Nak(nak) => Err(RelayError::Nak(nak.reason)),
            _ => Err(RelayError::Protocol("unexpected dpcd write reply")),
        }
    }

    /// Proxy an I2C transfer to the sink behind `port`.
    ///
    /// The list must be either an all-write run or a run of writes
    /// terminated by exactly one read (the read carries the stop); at most
    /// four sub-transactions fit one wire request. Returns the read bytes
    /// when the list ends in a read.
    pub fn remote_i2c_xfer(&self, port: PortId, msgs: &[I2cMsg]) -> RelayResult<Option<Vec<u8>>> {
        if msgs.is_empty() {
            return Err(RelayError::InvalidTransfer("empty transfer list"));
        }
        if msgs.len() > 4 {
            return Err(RelayError::InvalidTransfer("more than 4 sub-transactions"));
        }
        let (writes, read) = match msgs.split_last() {
            Some((I2cMsg::Read { dev_id, len }, head)) => (head, Some((*dev_id, *len))),
            _ => (msgs, None),
        };
        if writes.iter().any(|m| matches!(m, I2cMsg::Read { .. })) {
            return Err(RelayError::InvalidTransfer("read before end of run"));
        }
        if read.is_some() && writes.len() > 3 {
            // The wire request packs at most three leading writes.
            return Err(RelayError::InvalidTransfer("too many writes before read"));
        }

        match read {
            Some((read_dev_id, read_len)) => {
                let transactions: Vec<I2cWriteTxn> = writes
                    .iter()
                    .map(|m| match m {
                        I2cMsg::Write { dev_id, bytes } => I2cWriteTxn {
                            dev_id: *dev_id,
                            bytes: bytes.clone(),
                            no_stop_bit: true,
                            delay: 0,
                        },
                        I2cMsg::Read { .. } => unreachable!("reads rejected above"),
                    })
                    .collect();
                let (branch, port_num) = self.parent_route(port)?;
                let req = Request::RemoteI2cRead {
                    port_num,
                    transactions,
                    read_dev_id,
                    read_num_bytes: read_len,
                };
                let reply = self.disp.transact(branch, &req);
                self.topo.topology_put_branch(branch);
                match reply? {
                    ReplyBody::Ack(AckReply::RemoteI2cRead { bytes, .. }) => {
                        if bytes.len() != read_len as usize {
                            return Err(RelayError::LengthMismatch {
                                expected: read_len as usize,
                                got: bytes.len(),
                            });
                        }
                        Ok(Some(bytes))
                    }
                    ReplyBody::Nak(nak) => Err(RelayError::Nak(nak.reason)),
                    _ => Err(RelayError::Protocol("unexpected i2c read reply")),
                }
            }
            None => {
                for m in writes {
                    let I2cMsg::Write { dev_id, bytes } = m else {
                        unreachable!("reads rejected above")
                    };
                    let (branch, port_num) = self.parent_route(port)?;
                    let req = Request::RemoteI2cWrite {
                        port_num,
                        dev_id: *dev_id,
                        bytes: bytes.clone(),
                    };
                    let reply = self.disp.transact(branch, &req);
                    self.topo.topology_put_branch(branch);
                    match reply? {
                        ReplyBody::Ack(AckReply::RemoteI2cWrite { .. }) => {}
                        ReplyBody::Nak(nak) => return Err(RelayError::Nak(nak.reason)),
                        _ => return Err(RelayError::Protocol("unexpected i2c write reply")),
                    }
                }
                Ok(None)
            }
        }
    }

    /// Power the transmit PHY of `port` up or down. Path message: every
    /// branch along the route applies it.
    pub fn set_phy_power(&self, port: PortId, power_up: bool) -> RelayResult<()> {
        let (branch, port_num) = self.parent_route(port)?;
        let req = if power_up {
            Request::PowerUpPhy { port_num }
        } else {
            Request::PowerDownPhy { port_num }
        };
        let reply = self.disp.transact(branch, &req);
        self.topo.topology_put_branch(branch);
        match reply? {
            ReplyBody::Ack(AckReply::PowerUpPhy { .. } | AckReply::PowerDownPhy { .. }) => Ok(()),
            ReplyBody::Nak(nak) => Err(RelayError::Nak(nak.reason)),
            _ => Err(RelayError::Protocol("unexpected phy power reply")),
        }
    }

    /// Fetch the EDID of the sink behind `port` over the I2C relay in
    /// AUX-sized segments, cache it on the port, and return the blob.
    pub fn read_remote_edid(&self, port: PortId) -> RelayResult<Vec<u8>> {
        let mut edid = Vec::with_capacity(EDID_BLOCK_LEN);
        self.read_edid_block(port, 0, &mut edid)?;

        // Extension count lives at byte 126 of the base block.
        let extensions = edid.get(126).copied().unwrap_or(0) as usize;
        for block in 1..=extensions {
            self.read_edid_block(port, block, &mut edid)?;
        }

        self.topo.mutate(|s, _| {
            if let Some(p) = s.port_mut(port) {
                if p.sub_bus_active {
                    p.edid = Some(edid.clone());
                }
            }
        });
        Ok(edid)
    }

    fn read_edid_block(&self, port: PortId, block: usize, out: &mut Vec<u8>) -> RelayResult<()> {
        let base = block * EDID_BLOCK_LEN;
        let mut offset = 0;
        while offset < EDID_BLOCK_LEN {
            let len = (EDID_BLOCK_LEN - offset).min(AUX_MAX_XFER);
            let msgs = [
                I2cMsg::Write {
                    dev_id: EDID_DEV_ID,
                    bytes: vec![(base + offset) as u8],
                },
                I2cMsg::Read {
                    dev_id: EDID_DEV_ID,
                    len: len as u8,
                },
            ];
            match self.remote_i2c_xfer(port, &msgs)? {
                Some(bytes) => out.extend_from_slice(&bytes),
                None => return Err(RelayError::Protocol("i2c read returned no data")),
            }
            offset += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_shape_validation() {
        // Pure shape checks need no topology: invalid lists are rejected
        // before any lookup happens.
        let shapes_ok = [
            vec![I2cMsg::Write {
                dev_id: 0x50,
                bytes: vec![0],
            }],
            vec![
                I2cMsg::Write {
                    dev_id: 0x50,
                    bytes: vec![0],
                },
                I2cMsg::Read {
                    dev_id: 0x50,
                    len: 16,
                },
            ],
        ];
        let shapes_bad = [
            vec![],
            vec![
                I2cMsg::Read {
                    dev_id: 0x50,
                    len: 1,
                },
                I2cMsg::Write {
                    dev_id: 0x50,
                    bytes: vec![0],
                },
            ],
            vec![
                I2cMsg::Write { dev_id: 1, bytes: vec![] },
                I2cMsg::Write { dev_id: 1, bytes: vec![] },
                I2cMsg::Write { dev_id: 1, bytes: vec![] },
                I2cMsg::Write { dev_id: 1, bytes: vec![] },
                I2cMsg::Read { dev_id: 1, len: 1 },
            ],
        ];
        // Shape outcomes are asserted through validate-only behavior: a bad
        // shape must fail with InvalidTransfer, a good shape proceeds far
        // enough to need a topology (NoSuchPort on an empty tree).
        let (tx, _rx) = crossbeam::channel::unbounded();
        let topo = Arc::new(Topology::new(tx));
        let aux: Arc<dyn crate::aux::AuxChannel> = Arc::new(NullAux);
        let disp = Arc::new(Dispatcher::new(aux, Arc::clone(&topo), false));
        let relay = Relay::new(topo, disp);
        let bogus_port = PortId(99);

        for msgs in &shapes_ok {
            assert!(matches!(
                relay.remote_i2c_xfer(bogus_port, msgs),
                Err(RelayError::NoSuchPort)
            ));
        }
        for msgs in &shapes_bad {
            assert!(matches!(
                relay.remote_i2c_xfer(bogus_port, msgs),
                Err(RelayError::InvalidTransfer(_))
            ));
        }
    }

    struct NullAux;
    impl crate::aux::AuxChannel for NullAux {
        fn dpcd_read(&self, _address: u32, _buf: &mut [u8]) -> crate::aux::AuxResult<usize> {
            Err(crate::aux::AuxError::Timeout)
        }
        fn dpcd_write(&self, _address: u32, _data: &[u8]) -> crate::aux::AuxResult<usize> {
            Err(crate::aux::AuxError::Timeout)
        }
    }
}
