// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-opcode sideband message bodies.
//!
//! Every layout here is byte-for-byte fixed by the protocol; encoders and
//! decoders are exact inverses and are pinned by golden-byte tests. Multi-byte
//! fields are big-endian. Replies carry the request opcode in the low 7 bits
//! of their first byte; bit 7 distinguishes ACK (0) from NAK (1).
//!
//! A NAK is a normal protocol outcome and is surfaced as [`ReplyBody::Nak`],
//! never as a decode error.

use super::{Guid, SidebandError, SidebandResult};

// ============================================================================
// Request opcodes
// ============================================================================

pub const REQ_LINK_ADDRESS: u8 = 0x01;
pub const REQ_CONNECTION_STATUS_NOTIFY: u8 = 0x02;
pub const REQ_ENUM_PATH_RESOURCES: u8 = 0x10;
pub const REQ_ALLOCATE_PAYLOAD: u8 = 0x11;
pub const REQ_QUERY_PAYLOAD: u8 = 0x12;
pub const REQ_RESOURCE_STATUS_NOTIFY: u8 = 0x13;
pub const REQ_CLEAR_PAYLOAD_ID_TABLE: u8 = 0x14;
pub const REQ_REMOTE_DPCD_READ: u8 = 0x20;
pub const REQ_REMOTE_DPCD_WRITE: u8 = 0x21;
pub const REQ_REMOTE_I2C_READ: u8 = 0x22;
pub const REQ_REMOTE_I2C_WRITE: u8 = 0x23;
pub const REQ_POWER_UP_PHY: u8 = 0x24;
pub const REQ_POWER_DOWN_PHY: u8 = 0x25;

/// Reply bit 7: NAK marker.
const REPLY_NAK: u8 = 0x80;

// ============================================================================
// Shared wire enums
// ============================================================================

/// Peer device type reported for a port (3-bit wire field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerDeviceType {
    #[default]
    None,
    SourceOrSst,
    MstBranching,
    SstSink,
    DpLegacyConv,
}

impl PeerDeviceType {
    pub fn from_wire(raw: u8) -> SidebandResult<Self> {
        match raw & 0x7 {
            0x0 => Ok(Self::None),
            0x1 => Ok(Self::SourceOrSst),
            0x2 => Ok(Self::MstBranching),
            0x3 => Ok(Self::SstSink),
            0x4 => Ok(Self::DpLegacyConv),
            _ => Err(SidebandError::InvalidField("peer_device_type")),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::None => 0x0,
            Self::SourceOrSst => 0x1,
            Self::MstBranching => 0x2,
            Self::SstSink => 0x3,
            Self::DpLegacyConv => 0x4,
        }
    }
}

/// NAK reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    WriteFailure,
    InvalidRead,
    CrcFailure,
    BadParam,
    Defer,
    LinkFailure,
    NoResources,
    DpcdFail,
    I2cNak,
    AllocateFail,
    Unknown(u8),
}

impl NakReason {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0x01 => Self::WriteFailure,
            0x02 => Self::InvalidRead,
            0x03 => Self::CrcFailure,
            0x04 => Self::BadParam,
            0x05 => Self::Defer,
            0x06 => Self::LinkFailure,
            0x07 => Self::NoResources,
            0x08 => Self::DpcdFail,
            0x09 => Self::I2cNak,
            0x0a => Self::AllocateFail,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::WriteFailure => 0x01,
            Self::InvalidRead => 0x02,
            Self::CrcFailure => 0x03,
            Self::BadParam => 0x04,
            Self::Defer => 0x05,
            Self::LinkFailure => 0x06,
            Self::NoResources => 0x07,
            Self::DpcdFail => 0x08,
            Self::I2cNak => 0x09,
            Self::AllocateFail => 0x0a,
            Self::Unknown(raw) => raw,
        }
    }
}

// ============================================================================
// Down requests
// ============================================================================

/// One write sub-transaction of a REMOTE_I2C_READ request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cWriteTxn {
    pub dev_id: u8,
    pub bytes: Vec<u8>,
    pub no_stop_bit: bool,
    /// Inter-transaction delay, 4-bit unit field.
    pub delay: u8,
}

/// Typed down-link request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    LinkAddress,
    EnumPathResources {
        port_num: u8,
    },
    AllocatePayload {
        port_num: u8,
        vcpi: u8,
        pbn: u16,
        /// One 4-bit sink index per SDP stream.
        sdp_stream_sinks: Vec<u8>,
    },
    QueryPayload {
        port_num: u8,
        vcpi: u8,
    },
    ClearPayloadIdTable,
    PowerUpPhy {
        port_num: u8,
    },
    PowerDownPhy {
        port_num: u8,
    },
    RemoteDpcdRead {
        port_num: u8,
        address: u32,
        num_bytes: u8,
    },
    RemoteDpcdWrite {
        port_num: u8,
        address: u32,
        bytes: Vec<u8>,
    },
    RemoteI2cRead {
        port_num: u8,
        transactions: Vec<I2cWriteTxn>,
        read_dev_id: u8,
        read_num_bytes: u8,
    },
    RemoteI2cWrite {
        port_num: u8,
        dev_id: u8,
        bytes: Vec<u8>,
    },
}

impl Request {
    /// Wire opcode of this request.
    pub fn req_type(&self) -> u8 {
        match self {
            Self::LinkAddress => REQ_LINK_ADDRESS,
            Self::EnumPathResources { .. } => REQ_ENUM_PATH_RESOURCES,
            Self::AllocatePayload { .. } => REQ_ALLOCATE_PAYLOAD,
            Self::QueryPayload { .. } => REQ_QUERY_PAYLOAD,
            Self::ClearPayloadIdTable => REQ_CLEAR_PAYLOAD_ID_TABLE,
            Self::PowerUpPhy { .. } => REQ_POWER_UP_PHY,
            Self::PowerDownPhy { .. } => REQ_POWER_DOWN_PHY,
            Self::RemoteDpcdRead { .. } => REQ_REMOTE_DPCD_READ,
            Self::RemoteDpcdWrite { .. } => REQ_REMOTE_DPCD_WRITE,
            Self::RemoteI2cRead { .. } => REQ_REMOTE_I2C_READ,
            Self::RemoteI2cWrite { .. } => REQ_REMOTE_I2C_WRITE,
        }
    }

    /// Path messages are processed by every branch along the route.
    pub fn is_path_message(&self) -> bool {
        matches!(
            self,
            Self::AllocatePayload { .. }
                | Self::ClearPayloadIdTable
                | Self::PowerUpPhy { .. }
                | Self::PowerDownPhy { .. }
        )
    }

    /// Broadcast requests address every branch in the topology.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::ClearPayloadIdTable)
    }

    /// Serialize the body (opcode byte included).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.req_type()];
        match self {
            Self::LinkAddress | Self::ClearPayloadIdTable => {}
            Self::EnumPathResources { port_num }
            | Self::PowerUpPhy { port_num }
            | Self::PowerDownPhy { port_num } => {
                buf.push(port_num << 4);
            }
            Self::AllocatePayload {
                port_num,
                vcpi,
                pbn,
                sdp_stream_sinks,
            } => {
                buf.push(port_num << 4 | (sdp_stream_sinks.len() as u8 & 0x0f));
                buf.push(vcpi & 0x7f);
                buf.extend_from_slice(&pbn.to_be_bytes());
                for pair in sdp_stream_sinks.chunks(2) {
                    let mut b = (pair[0] & 0x0f) << 4;
                    if let Some(lo) = pair.get(1) {
                        b |= lo & 0x0f;
                    }
                    buf.push(b);
                }
            }
            Self::QueryPayload { port_num, vcpi } => {
                buf.push(port_num << 4);
                buf.push(vcpi & 0x7f);
            }
            Self::RemoteDpcdRead {
                port_num,
                address,
                num_bytes,
            } => {
                buf.push(port_num << 4 | ((address >> 16) & 0x0f) as u8);
                buf.push((address >> 8) as u8);
                buf.push(*address as u8);
                buf.push(*num_bytes);
            }
            Self::RemoteDpcdWrite {
                port_num,
                address,
                bytes,
            } => {
                buf.push(port_num << 4 | ((address >> 16) & 0x0f) as u8);
                buf.push((address >> 8) as u8);
                buf.push(*address as u8);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
            Self::RemoteI2cRead {
                port_num,
                transactions,
                read_dev_id,
                read_num_bytes,
            } => {
                buf.push(port_num << 4 | (transactions.len() as u8 & 0x03));
                for txn in transactions {
                    buf.push(txn.dev_id & 0x7f);
                    buf.push(txn.bytes.len() as u8);
                    buf.extend_from_slice(&txn.bytes);
                    buf.push(u8::from(txn.no_stop_bit) << 4 | (txn.delay & 0x0f));
                }
                buf.push(read_dev_id & 0x7f);
                buf.push(*read_num_bytes);
            }
            Self::RemoteI2cWrite {
                port_num,
                dev_id,
                bytes,
            } => {
                buf.push(port_num << 4);
                buf.push(dev_id & 0x7f);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf
    }

    /// Parse a request body (opcode byte included).
    pub fn decode(msg: &[u8]) -> SidebandResult<Self> {
        let mut c = Cursor::new(msg);
        let req_type = c.u8()?;
        match req_type {
            REQ_LINK_ADDRESS => Ok(Self::LinkAddress),
            REQ_CLEAR_PAYLOAD_ID_TABLE => Ok(Self::ClearPayloadIdTable),
            REQ_ENUM_PATH_RESOURCES => Ok(Self::EnumPathResources {
                port_num: c.u8()? >> 4,
            }),
            REQ_POWER_UP_PHY => Ok(Self::PowerUpPhy {
                port_num: c.u8()? >> 4,
            }),
            REQ_POWER_DOWN_PHY => Ok(Self::PowerDownPhy {
                port_num: c.u8()? >> 4,
            }),
            REQ_ALLOCATE_PAYLOAD => {
                let b = c.u8()?;
                let port_num = b >> 4;
                let num_streams = (b & 0x0f) as usize;
                let vcpi = c.u8()? & 0x7f;
                let pbn = c.u16_be()?;
                let packed = c.bytes(num_streams.div_ceil(2))?;
                let mut sdp_stream_sinks = Vec::with_capacity(num_streams);
                for i in 0..num_streams {
                    let byte = packed[i / 2];
                    sdp_stream_sinks.push(if i % 2 == 0 { byte >> 4 } else { byte & 0x0f });
                }
                Ok(Self::AllocatePayload {
                    port_num,
                    vcpi,
                    pbn,
                    sdp_stream_sinks,
                })
            }
            REQ_QUERY_PAYLOAD => Ok(Self::QueryPayload {
                port_num: c.u8()? >> 4,
                vcpi: c.u8()? & 0x7f,
            }),
            REQ_REMOTE_DPCD_READ => {
                let b = c.u8()?;
                let address =
                    u32::from(b & 0x0f) << 16 | u32::from(c.u8()?) << 8 | u32::from(c.u8()?);
                Ok(Self::RemoteDpcdRead {
                    port_num: b >> 4,
                    address,
                    num_bytes: c.u8()?,
                })
            }
            REQ_REMOTE_DPCD_WRITE => {
                let b = c.u8()?;
                let address =
                    u32::from(b & 0x0f) << 16 | u32::from(c.u8()?) << 8 | u32::from(c.u8()?);
                let len = c.u8()? as usize;
                Ok(Self::RemoteDpcdWrite {
                    port_num: b >> 4,
                    address,
                    bytes: c.bytes(len)?.to_vec(),
                })
            }
            REQ_REMOTE_I2C_READ => {
                let b = c.u8()?;
                let num_txns = (b & 0x03) as usize;
                let mut transactions = Vec::with_capacity(num_txns);
                for _ in 0..num_txns {
                    let dev_id = c.u8()? & 0x7f;
                    let len = c.u8()? as usize;
                    let bytes = c.bytes(len)?.to_vec();
                    let trailer = c.u8()?;
                    transactions.push(I2cWriteTxn {
                        dev_id,
                        bytes,
                        no_stop_bit: trailer & 0x10 != 0,
                        delay: trailer & 0x0f,
                    });
                }
                Ok(Self::RemoteI2cRead {
                    port_num: b >> 4,
                    transactions,
                    read_dev_id: c.u8()? & 0x7f,
                    read_num_bytes: c.u8()?,
                })
            }
            REQ_REMOTE_I2C_WRITE => {
                let port_num = c.u8()? >> 4;
                let dev_id = c.u8()? & 0x7f;
                let len = c.u8()? as usize;
                Ok(Self::RemoteI2cWrite {
                    port_num,
                    dev_id,
                    bytes: c.bytes(len)?.to_vec(),
                })
            }
            other => Err(SidebandError::UnknownRequest(other)),
        }
    }
}

// ============================================================================
// Down replies
// ============================================================================

/// One port entry of a LINK_ADDRESS reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkAddressPort {
    pub input_port: bool,
    pub peer_device_type: PeerDeviceType,
    pub port_number: u8,
    pub mcs: bool,
    pub ddps: bool,
    pub legacy_device_plug_status: bool,
    // Output ports only.
    pub dpcd_revision: u8,
    pub peer_guid: Guid,
    pub num_sdp_streams: u8,
    pub num_sdp_stream_sinks: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddressReply {
    pub guid: Guid,
    pub ports: Vec<LinkAddressPort>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumPathResourcesReply {
    pub port_number: u8,
    pub fec_capable: bool,
    pub full_pbn: u16,
    pub available_pbn: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatePayloadReply {
    pub port_number: u8,
    pub vcpi: u8,
    pub allocated_pbn: u16,
}

/// ACK reply payload, one variant per request opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckReply {
    LinkAddress(LinkAddressReply),
    EnumPathResources(EnumPathResourcesReply),
    AllocatePayload(AllocatePayloadReply),
    QueryPayload { port_number: u8, allocated_pbn: u16 },
    ClearPayloadIdTable,
    PowerUpPhy { port_number: u8 },
    PowerDownPhy { port_number: u8 },
    RemoteDpcdRead { port_number: u8, bytes: Vec<u8> },
    RemoteDpcdWrite { port_number: u8 },
    RemoteI2cRead { port_number: u8, bytes: Vec<u8> },
    RemoteI2cWrite { port_number: u8 },
}

/// NAK reply: a normal, typed outcome carrying the branch GUID, the reason
/// code and one byte of opaque NAK data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakReply {
    pub guid: Guid,
    pub reason: NakReason,
    pub nak_data: u8,
}

/// Decoded down reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ack(AckReply),
    Nak(NakReply),
}

impl ReplyBody {
    /// Request opcode echoed in the reply lead byte.
    pub fn req_type(msg: &[u8]) -> SidebandResult<u8> {
        msg.first()
            .map(|b| b & 0x7f)
            .ok_or(SidebandError::Truncated { need: 1, got: 0 })
    }

    /// Parse a reassembled reply body.
    pub fn decode(msg: &[u8]) -> SidebandResult<Self> {
        let mut c = Cursor::new(msg);
        let lead = c.u8()?;
        let req_type = lead & 0x7f;

        if lead & REPLY_NAK != 0 {
            let guid = Guid(c.array::<16>()?);
            let reason = NakReason::from_wire(c.u8()?);
            let nak_data = c.u8()?;
            return Ok(Self::Nak(NakReply {
                guid,
                reason,
                nak_data,
            }));
        }

        let ack = match req_type {
            REQ_LINK_ADDRESS => {
                let guid = Guid(c.array::<16>()?);
                let nports = (c.u8()? & 0x0f) as usize;
                let mut ports = Vec::with_capacity(nports);
                for _ in 0..nports {
                    let b = c.u8()?;
                    let mut port = LinkAddressPort {
                        input_port: b & 0x80 != 0,
                        peer_device_type: PeerDeviceType::from_wire(b >> 4)?,
                        port_number: b & 0x0f,
                        ..LinkAddressPort::default()
                    };
                    let b = c.u8()?;
                    port.mcs = b & 0x80 != 0;
                    port.ddps = b & 0x40 != 0;
                    if !port.input_port {
                        port.legacy_device_plug_status = b & 0x20 != 0;
                        port.dpcd_revision = c.u8()?;
                        port.peer_guid = Guid(c.array::<16>()?);
                        let b = c.u8()?;
                        port.num_sdp_streams = b >> 4;
                        port.num_sdp_stream_sinks = b & 0x0f;
                    }
                    ports.push(port);
                }
                AckReply::LinkAddress(LinkAddressReply { guid, ports })
            }
            REQ_ENUM_PATH_RESOURCES => {
                let b = c.u8()?;
                AckReply::EnumPathResources(EnumPathResourcesReply {
                    port_number: b >> 4,
                    fec_capable: b & 0x01 != 0,
                    full_pbn: c.u16_be()?,
                    available_pbn: c.u16_be()?,
                })
            }
            REQ_ALLOCATE_PAYLOAD => AckReply::AllocatePayload(AllocatePayloadReply {
                port_number: c.u8()? >> 4,
                vcpi: c.u8()? & 0x7f,
                allocated_pbn: c.u16_be()?,
            }),
            REQ_QUERY_PAYLOAD => AckReply::QueryPayload {
                port_number: c.u8()? >> 4,
                allocated_pbn: c.u16_be()?,
            },
            REQ_CLEAR_PAYLOAD_ID_TABLE => AckReply::ClearPayloadIdTable,
            REQ_POWER_UP_PHY => AckReply::PowerUpPhy {
                port_number: c.u8()? >> 4,
            },
            REQ_POWER_DOWN_PHY => AckReply::PowerDownPhy {
                port_number: c.u8()? >> 4,
            },
            REQ_REMOTE_DPCD_READ => {
                let port_number = c.u8()? & 0x0f;
                let len = c.u8()? as usize;
                AckReply::RemoteDpcdRead {
                    port_number,
                    bytes: c.bytes(len)?.to_vec(),
                }
            }
            REQ_REMOTE_DPCD_WRITE => AckReply::RemoteDpcdWrite {
                port_number: c.u8()? & 0x0f,
            },
            REQ_REMOTE_I2C_READ => {
                let port_number = c.u8()? & 0x0f;
                let len = c.u8()? as usize;
                AckReply::RemoteI2cRead {
                    port_number,
                    bytes: c.bytes(len)?.to_vec(),
                }
            }
            REQ_REMOTE_I2C_WRITE => AckReply::RemoteI2cWrite {
                port_number: c.u8()? & 0x0f,
            },
            other => return Err(SidebandError::UnknownRequest(other)),
        };
        Ok(Self::Ack(ack))
    }

    /// Serialize a reply body. The engine only emits replies when acking up
    /// requests; the full encoder also backs the branch-device emulation used
    /// in tests.
    pub fn encode(&self, req_type: u8) -> Vec<u8> {
        match self {
            Self::Nak(nak) => {
                let mut buf = vec![REPLY_NAK | req_type];
                buf.extend_from_slice(&nak.guid.0);
                buf.push(nak.reason.to_wire());
                buf.push(nak.nak_data);
                buf
            }
            Self::Ack(ack) => {
                let mut buf = vec![req_type & 0x7f];
                match ack {
                    AckReply::LinkAddress(rep) => {
                        buf.extend_from_slice(&rep.guid.0);
                        buf.push(rep.ports.len() as u8 & 0x0f);
                        for port in &rep.ports {
                            buf.push(
                                u8::from(port.input_port) << 7
                                    | port.peer_device_type.to_wire() << 4
                                    | (port.port_number & 0x0f),
                            );
                            let mut b = u8::from(port.mcs) << 7 | u8::from(port.ddps) << 6;
                            if !port.input_port {
                                b |= u8::from(port.legacy_device_plug_status) << 5;
                            }
                            buf.push(b);
                            if !port.input_port {
                                buf.push(port.dpcd_revision);
                                buf.extend_from_slice(&port.peer_guid.0);
                                buf.push(
                                    port.num_sdp_streams << 4 | (port.num_sdp_stream_sinks & 0x0f),
                                );
                            }
                        }
                    }
                    AckReply::EnumPathResources(rep) => {
                        buf.push(rep.port_number << 4 | u8::from(rep.fec_capable));
                        buf.extend_from_slice(&rep.full_pbn.to_be_bytes());
                        buf.extend_from_slice(&rep.available_pbn.to_be_bytes());
                    }
                    AckReply::AllocatePayload(rep) => {
                        buf.push(rep.port_number << 4);
                        buf.push(rep.vcpi & 0x7f);
                        buf.extend_from_slice(&rep.allocated_pbn.to_be_bytes());
                    }
                    AckReply::QueryPayload {
                        port_number,
                        allocated_pbn,
                    } => {
                        buf.push(port_number << 4);
                        buf.extend_from_slice(&allocated_pbn.to_be_bytes());
                    }
                    AckReply::ClearPayloadIdTable => {}
                    AckReply::PowerUpPhy { port_number } | AckReply::PowerDownPhy { port_number } => {
                        buf.push(port_number << 4);
                    }
                    AckReply::RemoteDpcdRead { port_number, bytes } => {
                        buf.push(port_number & 0x0f);
                        buf.push(bytes.len() as u8);
                        buf.extend_from_slice(bytes);
                    }
                    AckReply::RemoteDpcdWrite { port_number }
                    | AckReply::RemoteI2cWrite { port_number } => {
                        buf.push(port_number & 0x0f);
                    }
                    AckReply::RemoteI2cRead { port_number, bytes } => {
                        buf.push(port_number & 0x0f);
                        buf.push(bytes.len() as u8);
                        buf.extend_from_slice(bytes);
                    }
                }
                buf
            }
        }
    }
}

// ============================================================================
// Up requests (unsolicited)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusNotify {
    pub guid: Guid,
    pub port_number: u8,
    pub legacy_device_plug_status: bool,
    pub displayport_device_plug_status: bool,
    pub message_capability_status: bool,
    pub input_port: bool,
    pub peer_device_type: PeerDeviceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStatusNotify {
    pub port_number: u8,
    pub guid: Guid,
    pub available_pbn: u16,
}

/// Decoded unsolicited up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpRequest {
    ConnectionStatus(ConnectionStatusNotify),
    ResourceStatus(ResourceStatusNotify),
}

impl UpRequest {
    pub fn req_type(&self) -> u8 {
        match self {
            Self::ConnectionStatus(_) => REQ_CONNECTION_STATUS_NOTIFY,
            Self::ResourceStatus(_) => REQ_RESOURCE_STATUS_NOTIFY,
        }
    }

    /// Parse a reassembled up-request body.
    pub fn decode(msg: &[u8]) -> SidebandResult<Self> {
        let mut c = Cursor::new(msg);
        match c.u8()? & 0x7f {
            REQ_CONNECTION_STATUS_NOTIFY => {
                let guid = Guid(c.array::<16>()?);
                let port_number = c.u8()? >> 4;
                let b = c.u8()?;
                Ok(Self::ConnectionStatus(ConnectionStatusNotify {
                    guid,
                    port_number,
                    legacy_device_plug_status: b & 0x40 != 0,
                    displayport_device_plug_status: b & 0x20 != 0,
                    message_capability_status: b & 0x10 != 0,
                    input_port: b & 0x08 != 0,
                    peer_device_type: PeerDeviceType::from_wire(b)?,
                }))
            }
            REQ_RESOURCE_STATUS_NOTIFY => {
                let port_number = c.u8()? >> 4;
                let guid = Guid(c.array::<16>()?);
                // 16-bit big-endian bandwidth field. A widely-deployed peer
                // implementation advances its parse cursor by only one byte
                // here; the field itself is two bytes and this is the last
                // field of the message, so both readings see the same value.
                let available_pbn = c.u16_be()?;
                Ok(Self::ResourceStatus(ResourceStatusNotify {
                    port_number,
                    guid,
                    available_pbn,
                }))
            }
            other => Err(SidebandError::UnknownRequest(other)),
        }
    }

    /// Serialize an up-request body (emulation and loopback tests).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.req_type()];
        match self {
            Self::ConnectionStatus(csn) => {
                buf.extend_from_slice(&csn.guid.0);
                buf.push(csn.port_number << 4);
                buf.push(
                    u8::from(csn.legacy_device_plug_status) << 6
                        | u8::from(csn.displayport_device_plug_status) << 5
                        | u8::from(csn.message_capability_status) << 4
                        | u8::from(csn.input_port) << 3
                        | csn.peer_device_type.to_wire(),
                );
            }
            Self::ResourceStatus(rsn) => {
                buf.push(rsn.port_number << 4);
                buf.extend_from_slice(&rsn.guid.0);
                buf.extend_from_slice(&rsn.available_pbn.to_be_bytes());
            }
        }
        buf
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Bounds-checked forward reader over a message body.
struct Cursor<'a> {
    msg: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(msg: &'a [u8]) -> Self {
        Self { msg, pos: 0 }
    }

    fn u8(&mut self) -> SidebandResult<u8> {
        let b = self
            .msg
            .get(self.pos)
            .copied()
            .ok_or(SidebandError::Truncated {
                need: self.pos + 1,
                got: self.msg.len(),
            })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16_be(&mut self) -> SidebandResult<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from(hi) << 8 | u16::from(lo))
    }

    fn bytes(&mut self, n: usize) -> SidebandResult<&'a [u8]> {
        let end = self.pos + n;
        let s = self
            .msg
            .get(self.pos..end)
            .ok_or(SidebandError::Truncated {
                need: end,
                got: self.msg.len(),
            })?;
        self.pos = end;
        Ok(s)
    }

    fn array<const N: usize>(&mut self) -> SidebandResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }
}
