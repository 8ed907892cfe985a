// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # MSTLINK - Multi-Stream Transport Sideband Engine
//!
//! A pure Rust implementation of the DisplayPort MST sideband protocol and
//! topology manager: it turns a single physical display link into a tree of
//! addressable branch/sink devices, exchanges framed request/reply messages
//! with them over the narrow out-of-band AUX channel, and arbitrates the
//! link's shared time-slot bandwidth among the discovered sinks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mstlink::{ManagerConfig, MstManager};
//! use std::sync::Arc;
//!
//! // The host driver supplies the register primitive and event sinks.
//! let manager = MstManager::new(aux, hotplug, None, ManagerConfig::default());
//! manager.set_mst_enabled(true)?;
//!
//! // Discover the tree, then claim bandwidth for a sink.
//! manager.probe_now();
//! let port = manager.ports().into_iter().find(|p| !p.input).unwrap();
//! let slots = manager.payloads().allocate(port.id, 1000)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            MstManager                              |
//! |   probe_now / pump / suspend / resume / bandwidth API              |
//! +--------------------------------------------------------------------+
//! |  Topology Tree        | Payload Allocator     | Register Relay     |
//! |  dual refcounts,      | admission check,      | remote DPCD, I2C,  |
//! |  peer-type machine,   | two-phase commit,     | EDID fetch         |
//! |  recursive probe      | ACT polling           |                    |
//! +--------------------------------------------------------------------+
//! |                       Transaction Dispatcher                       |
//! |   single-flight down queue | reply matching | up-request worker    |
//! +--------------------------------------------------------------------+
//! |                          Sideband Codec                            |
//! |   headers + CRC4 | per-opcode bodies | chunking/reassembly         |
//! +--------------------------------------------------------------------+
//! |                   AuxChannel (host collaborator)                   |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MstManager`] | Entry point owning the workers and all shared state |
//! | [`AuxChannel`] | Host-supplied byte-exact DPCD register primitive |
//! | [`PayloadManager`] | Slot admission and the two-phase payload commit |
//! | [`Relay`] | Remote DPCD/I2C access through the topology |
//! | [`PortInfo`] | Snapshot of one discovered port |
//!
//! ## Modules Overview
//!
//! - [`sideband`] - Wire codec (start here for the message formats)
//! - [`topology`] - Branch/port tree, reference counting, probing
//! - [`dispatch`] - Down-queue, reply matching, up-request handling
//! - [`payload`] - Bandwidth admission and payload table programming
//! - [`relay`] - Remote register and I2C tunneling

pub mod aux;
pub mod config;
pub mod dispatch;
mod manager;
pub mod payload;
pub mod relay;
pub mod sideband;
pub mod topology;

pub use aux::{AuxChannel, AuxError, AuxResult, EdidSource, HotplugSink};
pub use config::ManagerConfig;
pub use dispatch::{Dispatcher, TxError, TxResult, TxState};
pub use manager::MstManager;
pub use payload::{slots_for, PayloadError, PayloadManager, PayloadResult, ProposedPayload};
pub use relay::{I2cMsg, Relay, RelayError, RelayResult};
pub use sideband::{Guid, NakReason, PeerDeviceType, ReplyBody, Request, SidebandError};
pub use topology::{BranchId, PortId, PortInfo, PortKind, Vcpi};
