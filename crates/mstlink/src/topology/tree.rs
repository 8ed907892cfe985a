// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topology arena and the dual reference-counting scheme.
//!
//! All linkage and both reference counts live in [`TreeState`] behind one
//! `parking_lot::Mutex` — the tree lock. Every mutation helper takes
//! `&mut TreeState`, so holding the lock is proven by the borrow; there are
//! no runtime lock assertions and the lock is never held across a blocking
//! wait.
//!
//! # Reference counting
//!
//! Each node carries two counters:
//!
//! - `topo_refs`: keeps the node wired into the tree. Creation installs one
//!   reference owned by the parent linkage (the manager owns the root's).
//! - `mem_refs`: keeps the record alive. Creation installs one reference
//!   owned by the node itself, and the node takes one memory reference on
//!   its parent.
//!
//! When a node's topology count reaches zero it is unlinked and, in order:
//! every child's topology reference is dropped, then the parent's memory
//! reference, then the node's own memory reference. A record whose memory
//! count reaches zero leaves the arena and is shipped to the reaper worker,
//! so teardown never runs under the tree lock.

use super::node::{BranchId, BranchNode, PortId, PortInfo, PortKind, PortNode, Vcpi};
use super::reaper::ReaperMsg;
use crate::sideband::{Guid, PeerDeviceType, Rad};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// A record evicted from the arena, destined for the reaper.
#[derive(Debug)]
pub(crate) enum ReapedNode {
    Branch(BranchNode),
    Port(PortNode),
}

/// One reference-count operation, queued while walking a cascade.
#[derive(Debug, Clone, Copy)]
enum RefOp {
    BranchTopo(BranchId),
    PortTopo(PortId),
    BranchMem(BranchId),
    PortMem(PortId),
}

/// Outcome of a peer-type transition on a port.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerTypeChange {
    pub changed: bool,
    /// A child branch was installed; its subtree must be probed.
    pub must_probe: bool,
}

/// All mutable topology state, guarded by the tree lock.
#[derive(Debug, Default)]
pub(crate) struct TreeState {
    branches: HashMap<u32, BranchNode>,
    ports: HashMap<u32, PortNode>,
    root: Option<BranchId>,
    next_id: u32,
}

impl TreeState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn root(&self) -> Option<BranchId> {
        self.root
    }

    pub fn branch(&self, id: BranchId) -> Option<&BranchNode> {
        self.branches.get(&id.0)
    }

    pub fn branch_mut(&mut self, id: BranchId) -> Option<&mut BranchNode> {
        self.branches.get_mut(&id.0)
    }

    pub fn port(&self, id: PortId) -> Option<&PortNode> {
        self.ports.get(&id.0)
    }

    pub fn port_mut(&mut self, id: PortId) -> Option<&mut PortNode> {
        self.ports.get_mut(&id.0)
    }

    pub fn branch_alive(&self, id: BranchId) -> bool {
        self.branch(id).is_some_and(|b| b.topo_refs > 0)
    }

    pub fn port_alive(&self, id: PortId) -> bool {
        self.port(id).is_some_and(|p| p.topo_refs > 0)
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Install the root branch (depth 1, empty path). The caller owns the
    /// returned topology reference.
    pub fn create_root(&mut self) -> BranchId {
        debug_assert!(self.root.is_none());
        let id = BranchId(self.alloc_id());
        self.branches.insert(
            id.0,
            BranchNode {
                lct: 1,
                rad: Rad::root(),
                guid: Guid::ZERO,
                parent: None,
                ports: Vec::new(),
                link_address_sent: false,
                topo_refs: 1,
                mem_refs: 1,
            },
        );
        self.root = Some(id);
        id
    }

    /// Create a port under `branch`. The new port starts with one topology
    /// reference (the parent linkage) and takes a memory reference on the
    /// parent branch.
    pub fn add_port(&mut self, branch: BranchId, port_num: u8, input: bool) -> Option<PortId> {
        let (parent_lct, parent_rad) = {
            let b = self.branch(branch)?;
            (b.lct, b.rad)
        };
        let id = PortId(self.alloc_id());
        self.ports.insert(
            id.0,
            PortNode {
                port_num,
                parent: branch,
                parent_lct,
                parent_rad,
                input,
                pdt: PeerDeviceType::None,
                mcs: false,
                ddps: false,
                ldps: false,
                dpcd_rev: 0,
                num_sdp_streams: 0,
                num_sdp_stream_sinks: 0,
                full_pbn: 0,
                available_pbn: 0,
                fec_capable: false,
                child: None,
                sub_bus_active: false,
                edid: None,
                vcpi: Vcpi::default(),
                topo_refs: 1,
                mem_refs: 1,
            },
        );
        let b = self.branch_mut(branch)?;
        b.ports.push(id);
        b.mem_refs += 1;
        Some(id)
    }

    /// Create the child branch behind `port` at depth `parent.lct + 1`, with
    /// the path extended by this port's number.
    pub fn create_child_branch(&mut self, port: PortId) -> Option<BranchId> {
        let (lct, rad) = {
            let p = self.port(port)?;
            (p.parent_lct + 1, p.parent_rad.child(p.port_num))
        };
        let id = BranchId(self.alloc_id());
        self.branches.insert(
            id.0,
            BranchNode {
                lct,
                rad,
                guid: Guid::ZERO,
                parent: Some(port),
                ports: Vec::new(),
                link_address_sent: false,
                topo_refs: 1,
                mem_refs: 1,
            },
        );
        let p = self.port_mut(port)?;
        p.child = Some(id);
        p.mem_refs += 1;
        Some(id)
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// Take a topology reference on a branch known to be alive.
    pub fn topology_get_branch(&mut self, id: BranchId) {
        if let Some(b) = self.branch_mut(id) {
            debug_assert!(b.topo_refs > 0, "topology_get on removed branch");
            b.topo_refs += 1;
        } else {
            debug_assert!(false, "topology_get on freed branch");
        }
    }

    /// Take a topology reference unless the count already reached zero.
    pub fn topology_try_get_branch(&mut self, id: BranchId) -> bool {
        match self.branch_mut(id) {
            Some(b) if b.topo_refs > 0 => {
                b.topo_refs += 1;
                true
            }
            _ => false,
        }
    }

    pub fn topology_get_port(&mut self, id: PortId) {
        if let Some(p) = self.port_mut(id) {
            debug_assert!(p.topo_refs > 0, "topology_get on removed port");
            p.topo_refs += 1;
        } else {
            debug_assert!(false, "topology_get on freed port");
        }
    }

    pub fn topology_try_get_port(&mut self, id: PortId) -> bool {
        match self.port_mut(id) {
            Some(p) if p.topo_refs > 0 => {
                p.topo_refs += 1;
                true
            }
            _ => false,
        }
    }

    pub fn memory_get_branch(&mut self, id: BranchId) -> bool {
        match self.branch_mut(id) {
            Some(b) => {
                b.mem_refs += 1;
                true
            }
            None => false,
        }
    }

    pub fn memory_get_port(&mut self, id: PortId) -> bool {
        match self.port_mut(id) {
            Some(p) => {
                p.mem_refs += 1;
                true
            }
            None => false,
        }
    }

    pub fn topology_put_branch(&mut self, id: BranchId, freed: &mut Vec<ReapedNode>) {
        self.put(RefOp::BranchTopo(id), freed);
    }

    pub fn topology_put_port(&mut self, id: PortId, freed: &mut Vec<ReapedNode>) {
        self.put(RefOp::PortTopo(id), freed);
    }

    pub fn memory_put_branch(&mut self, id: BranchId, freed: &mut Vec<ReapedNode>) {
        self.put(RefOp::BranchMem(id), freed);
    }

    pub fn memory_put_port(&mut self, id: PortId, freed: &mut Vec<ReapedNode>) {
        self.put(RefOp::PortMem(id), freed);
    }

    /// Process one reference drop and everything it cascades into.
    ///
    /// Ops are worked in FIFO order so a topology-zero node releases, in
    /// order: every child's topology reference, the parent's memory
    /// reference, its own memory reference.
    fn put(&mut self, op: RefOp, freed: &mut Vec<ReapedNode>) {
        let mut work = VecDeque::new();
        work.push_back(op);

        while let Some(op) = work.pop_front() {
            match op {
                RefOp::BranchTopo(id) => {
                    let Some(b) = self.branch_mut(id) else {
                        log::warn!("[TreeState::put] topology put on freed branch {:?}", id);
                        continue;
                    };
                    debug_assert!(b.topo_refs > 0);
                    b.topo_refs -= 1;
                    if b.topo_refs == 0 {
                        let ports = b.ports.clone();
                        let parent = b.parent;
                        if let Some(pp) = parent {
                            if let Some(p) = self.port_mut(pp) {
                                if p.child == Some(id) {
                                    p.child = None;
                                }
                            }
                        }
                        for port in ports {
                            work.push_back(RefOp::PortTopo(port));
                        }
                        if let Some(pp) = parent {
                            work.push_back(RefOp::PortMem(pp));
                        }
                        work.push_back(RefOp::BranchMem(id));
                    }
                }
                RefOp::PortTopo(id) => {
                    let Some(p) = self.port_mut(id) else {
                        log::warn!("[TreeState::put] topology put on freed port {:?}", id);
                        continue;
                    };
                    debug_assert!(p.topo_refs > 0);
                    p.topo_refs -= 1;
                    if p.topo_refs == 0 {
                        let child = p.child.take();
                        let parent = p.parent;
                        if let Some(b) = self.branch_mut(parent) {
                            b.ports.retain(|&x| x != id);
                        }
                        if let Some(c) = child {
                            work.push_back(RefOp::BranchTopo(c));
                        }
                        work.push_back(RefOp::BranchMem(parent));
                        work.push_back(RefOp::PortMem(id));
                    }
                }
                RefOp::BranchMem(id) => {
                    let Some(b) = self.branch_mut(id) else {
                        log::warn!("[TreeState::put] memory put on freed branch {:?}", id);
                        continue;
                    };
                    debug_assert!(b.mem_refs > 0);
                    b.mem_refs -= 1;
                    if b.mem_refs == 0 {
                        if let Some(node) = self.branches.remove(&id.0) {
                            if self.root == Some(id) {
                                self.root = None;
                            }
                            freed.push(ReapedNode::Branch(node));
                        }
                    }
                }
                RefOp::PortMem(id) => {
                    let Some(p) = self.port_mut(id) else {
                        log::warn!("[TreeState::put] memory put on freed port {:?}", id);
                        continue;
                    };
                    debug_assert!(p.mem_refs > 0);
                    p.mem_refs -= 1;
                    if p.mem_refs == 0 {
                        if let Some(node) = self.ports.remove(&id.0) {
                            freed.push(ReapedNode::Port(node));
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Linear scan of `branch`'s children; success takes a topology
    /// reference on the port.
    pub fn get_port(&mut self, branch: BranchId, port_num: u8) -> Option<PortId> {
        let id = self
            .branch(branch)?
            .ports
            .iter()
            .copied()
            .find(|&p| self.port(p).is_some_and(|n| n.port_num == port_num))?;
        if self.topology_try_get_port(id) {
            Some(id)
        } else {
            None
        }
    }

    /// Resolve `(lct, rad)` to a live branch by walking from the root.
    /// Success takes a topology reference on the branch.
    pub fn resolve_rad(&mut self, lct: u8, rad: &Rad) -> Option<BranchId> {
        let mut cur = self.root?;
        if !self.branch_alive(cur) {
            return None;
        }
        for depth in 0..lct.saturating_sub(1) {
            let hop = rad.hop(depth as usize);
            let port = self
                .branch(cur)?
                .ports
                .iter()
                .copied()
                .find(|&p| self.port(p).is_some_and(|n| n.port_num == hop))?;
            cur = self.port(port)?.child?;
            if !self.branch_alive(cur) {
                return None;
            }
        }
        if self.topology_try_get_branch(cur) {
            Some(cur)
        } else {
            None
        }
    }

    /// Resolve a branch by GUID (broadcast replies). Success takes a
    /// topology reference.
    pub fn find_branch_by_guid(&mut self, guid: &Guid) -> Option<BranchId> {
        let id = self
            .branches
            .iter()
            .find(|(_, b)| b.topo_refs > 0 && b.guid == *guid)
            .map(|(&id, _)| BranchId(id))?;
        if self.topology_try_get_branch(id) {
            Some(id)
        } else {
            None
        }
    }

    /// Deepest branch on the path to `port` that is still topologically
    /// connected, together with the port number to address at that branch.
    /// Used to route teardown messages for ports whose ancestors left the
    /// topology. Success takes a topology reference on the branch.
    pub fn last_connected_ancestor(&mut self, port: PortId) -> Option<(BranchId, u8)> {
        let (rad, port_num, hops) = {
            let p = self.port(port)?;
            (p.parent_rad, p.port_num, p.parent_rad.len())
        };
        let mut cur = self.root?;
        if !self.branch_alive(cur) {
            return None;
        }
        let mut addressed = if hops == 0 { port_num } else { rad.hop(0) };
        for depth in 0..hops {
            let hop = rad.hop(depth);
            let next = self.branch(cur).and_then(|b| {
                b.ports
                    .iter()
                    .copied()
                    .find(|&p| self.port(p).is_some_and(|n| n.port_num == hop && n.topo_refs > 0))
            });
            let Some(next_port) = next else {
                addressed = hop;
                break;
            };
            let Some(child) = self.port(next_port).and_then(|p| p.child) else {
                addressed = hop;
                break;
            };
            if !self.branch_alive(child) {
                addressed = hop;
                break;
            }
            cur = child;
            addressed = if depth + 1 < hops {
                rad.hop(depth + 1)
            } else {
                port_num
            };
        }
        if self.topology_try_get_branch(cur) {
            Some((cur, addressed))
        } else {
            None
        }
    }

    /// Ports along the path from the root down to and including `port`,
    /// walked by the port's recorded relative address. Stops early where the
    /// path is no longer materialized; the target port itself is always
    /// included.
    pub fn path_ports(&self, port: PortId) -> Vec<PortId> {
        let Some(p) = self.port(port) else {
            return Vec::new();
        };
        let rad = p.parent_rad;
        let mut out = Vec::new();
        let Some(mut branch) = self.root else {
            return vec![port];
        };
        for depth in 0..rad.len() {
            let hop = rad.hop(depth);
            let Some(ancestor) = self.branch(branch).and_then(|b| {
                b.ports
                    .iter()
                    .copied()
                    .find(|&x| self.port(x).is_some_and(|n| n.port_num == hop))
            }) else {
                break;
            };
            out.push(ancestor);
            let Some(child) = self.port(ancestor).and_then(|n| n.child) else {
                break;
            };
            branch = child;
        }
        out.push(port);
        out
    }

    // ------------------------------------------------------------------
    // Peer-type state machine
    // ------------------------------------------------------------------

    /// Drive the {None, EndDevice, Branching} machine for `port`.
    ///
    /// Leaving EndDevice tears down the exposed sub-bus; leaving Branching
    /// drops the topology reference on the child branch; entering Branching
    /// installs a child branch one level deeper and requests a probe;
    /// entering EndDevice exposes the sub-bus.
    pub fn set_peer_type(
        &mut self,
        port: PortId,
        pdt: PeerDeviceType,
        mcs: bool,
        freed: &mut Vec<ReapedNode>,
    ) -> PeerTypeChange {
        let Some(p) = self.port_mut(port) else {
            return PeerTypeChange::default();
        };
        if p.pdt == pdt && p.mcs == mcs {
            return PeerTypeChange::default();
        }
        let old_kind = p.kind();
        p.pdt = pdt;
        p.mcs = mcs;
        let new_kind = p.kind();

        let mut outcome = PeerTypeChange {
            changed: true,
            must_probe: false,
        };
        if old_kind == new_kind {
            return outcome;
        }

        match old_kind {
            PortKind::EndDevice => {
                if let Some(p) = self.port_mut(port) {
                    p.sub_bus_active = false;
                    p.edid = None;
                }
            }
            PortKind::Branching => {
                let child = self.port_mut(port).and_then(|p| p.child.take());
                if let Some(c) = child {
                    self.topology_put_branch(c, freed);
                }
            }
            PortKind::None => {}
        }

        match new_kind {
            PortKind::EndDevice => {
                if let Some(p) = self.port_mut(port) {
                    p.sub_bus_active = true;
                }
            }
            PortKind::Branching => {
                if self.create_child_branch(port).is_some() {
                    outcome.must_probe = true;
                }
            }
            PortKind::None => {}
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn port_info(&self, id: PortId) -> Option<PortInfo> {
        let p = self.port(id)?;
        Some(PortInfo {
            id,
            port_num: p.port_num,
            parent_lct: p.parent_lct,
            parent_rad: p.parent_rad,
            input: p.input,
            pdt: p.pdt,
            mcs: p.mcs,
            ddps: p.ddps,
            dpcd_rev: p.dpcd_rev,
            full_pbn: p.full_pbn,
            available_pbn: p.available_pbn,
            fec_capable: p.fec_capable,
            has_branch: p.child.is_some(),
            vcpi: p.vcpi,
        })
    }

    /// Snapshot every live port of every live branch.
    pub fn live_ports(&self) -> Vec<PortInfo> {
        let mut out: Vec<PortInfo> = self
            .ports
            .iter()
            .filter(|(_, p)| p.topo_refs > 0 && self.branch_alive(p.parent))
            .filter_map(|(&id, _)| self.port_info(PortId(id)))
            .collect();
        out.sort_by_key(|p| (p.parent_lct, p.port_num));
        out
    }

    pub fn live_counts(&self) -> (usize, usize) {
        (
            self.branches.values().filter(|b| b.topo_refs > 0).count(),
            self.ports.values().filter(|p| p.topo_refs > 0).count(),
        )
    }

    pub fn record_counts(&self) -> (usize, usize) {
        (self.branches.len(), self.ports.len())
    }

    pub fn clear_link_address_sent(&mut self) {
        for b in self.branches.values_mut() {
            b.link_address_sent = false;
        }
    }
}

/// Shared topology: the tree lock plus the reaper hand-off.
pub struct Topology {
    state: Mutex<TreeState>,
    reaper_tx: Sender<ReaperMsg>,
}

impl Topology {
    pub(crate) fn new(reaper_tx: Sender<ReaperMsg>) -> Self {
        Self {
            state: Mutex::new(TreeState::default()),
            reaper_tx,
        }
    }

    /// Run `f` under the tree lock; records freed inside are shipped to the
    /// reaper after the lock is released.
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut TreeState, &mut Vec<ReapedNode>) -> R) -> R {
        let mut freed = Vec::new();
        let r = {
            let mut state = self.state.lock();
            f(&mut state, &mut freed)
        };
        for node in freed {
            if self.reaper_tx.send(ReaperMsg::Dispose(node)).is_err() {
                log::debug!("[Topology::mutate] reaper gone, dropping node inline");
            }
        }
        r
    }

    /// Read-only access under the tree lock.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&TreeState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn root(&self) -> Option<BranchId> {
        self.read(TreeState::root)
    }

    pub fn port_info(&self, id: PortId) -> Option<PortInfo> {
        self.read(|s| s.port_info(id))
    }

    pub fn live_ports(&self) -> Vec<PortInfo> {
        self.read(TreeState::live_ports)
    }

    pub fn topology_put_branch(&self, id: BranchId) {
        self.mutate(|s, freed| s.topology_put_branch(id, freed));
    }

    pub fn topology_put_port(&self, id: PortId) {
        self.mutate(|s, freed| s.topology_put_port(id, freed));
    }

    pub fn memory_put_port(&self, id: PortId) {
        self.mutate(|s, freed| s.memory_put_port(id, freed));
    }

    pub fn memory_put_branch(&self, id: BranchId) {
        self.mutate(|s, freed| s.memory_put_branch(id, freed));
    }
}
