// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Branch and port records stored in the topology arena.
//!
//! Nodes are identified by opaque ids; all linkage between them is id-based
//! and lives behind the tree lock. Two independent reference counts govern
//! each node: the *topology* count keeps a node wired into the tree, the
//! *memory* count keeps its record alive for holders (in-flight transactions,
//! payload assignments) that may outlive topology removal.

use crate::sideband::{Guid, PeerDeviceType, Rad};

/// Opaque id of a branch node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(pub(crate) u32);

/// Opaque id of a port node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) u32);

/// A stream's claim on link time slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vcpi {
    /// Assigned channel id, 0 when unassigned, otherwise 1..=63.
    pub id: u8,
    /// Bandwidth requested by the stream.
    pub requested_pbn: u16,
    /// Request rounded up to a whole number of slots.
    pub aligned_pbn: u16,
    pub slot_count: u8,
    /// Stream carries DSC-compressed pixels.
    pub dsc_enabled: bool,
}

/// Derived life-cycle kind of a port, the three-state peer machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Nothing usable attached.
    None,
    /// A sink or converter: exposes a register/I2C sub-bus.
    EndDevice,
    /// A message-capable branch device: owns a child branch node.
    Branching,
}

/// Map the wire peer-device-type and message-capability bit to the port kind.
pub fn port_kind(pdt: PeerDeviceType, mcs: bool) -> PortKind {
    match pdt {
        PeerDeviceType::None | PeerDeviceType::SourceOrSst => PortKind::None,
        PeerDeviceType::MstBranching => {
            if mcs {
                PortKind::Branching
            } else {
                // A branch that cannot take messages is driven like a sink.
                PortKind::EndDevice
            }
        }
        PeerDeviceType::SstSink | PeerDeviceType::DpLegacyConv => PortKind::EndDevice,
    }
}

/// Branch device record.
#[derive(Debug)]
pub(crate) struct BranchNode {
    /// Tree depth, 1 for the root branch.
    pub lct: u8,
    /// Port-number path from the root.
    pub rad: Rad,
    pub guid: Guid,
    /// Back-reference; holds no count. None for the root.
    pub parent: Option<PortId>,
    /// Owned child ports, in creation order.
    pub ports: Vec<PortId>,
    /// Set once a LINK_ADDRESS probe has been issued; cleared by suspend to
    /// force a full re-probe on resume.
    pub link_address_sent: bool,
    pub topo_refs: u32,
    pub mem_refs: u32,
}

/// Port record.
#[derive(Debug)]
pub(crate) struct PortNode {
    pub port_num: u8,
    /// Back-reference; holds no count.
    pub parent: BranchId,
    /// Address of the parent branch, kept on the port so teardown messages
    /// can be routed even after ancestors left the topology.
    pub parent_lct: u8,
    pub parent_rad: Rad,
    pub input: bool,
    pub pdt: PeerDeviceType,
    /// Message capability status.
    pub mcs: bool,
    /// DisplayPort device plug status.
    pub ddps: bool,
    /// Legacy device plug status.
    pub ldps: bool,
    pub dpcd_rev: u8,
    pub num_sdp_streams: u8,
    pub num_sdp_stream_sinks: u8,
    /// Total and remaining bandwidth from the last ENUM_PATH_RESOURCES.
    pub full_pbn: u16,
    pub available_pbn: u16,
    pub fec_capable: bool,
    /// Child branch when the peer machine is in the Branching state.
    pub child: Option<BranchId>,
    /// Register/I2C sub-bus exposed while in the EndDevice state.
    pub sub_bus_active: bool,
    /// Cached EDID blob fetched over the I2C relay.
    pub edid: Option<Vec<u8>>,
    pub vcpi: Vcpi,
    pub topo_refs: u32,
    pub mem_refs: u32,
}

impl PortNode {
    pub fn kind(&self) -> PortKind {
        port_kind(self.pdt, self.mcs)
    }
}

/// Read-only snapshot of a port, handed to callers outside the tree lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub id: PortId,
    pub port_num: u8,
    pub parent_lct: u8,
    pub parent_rad: Rad,
    pub input: bool,
    pub pdt: PeerDeviceType,
    pub mcs: bool,
    pub ddps: bool,
    pub dpcd_rev: u8,
    pub full_pbn: u16,
    pub available_pbn: u16,
    pub fec_capable: bool,
    pub has_branch: bool,
    pub vcpi: Vcpi,
}
