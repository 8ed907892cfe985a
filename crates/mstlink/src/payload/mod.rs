// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Bandwidth and payload allocation
//!
//! Arbitrates the link's 63 payload time slots among the sinks in the
//! topology. The flow is two-phase:
//!
//! 1. **Admission + local programming** ([`PayloadManager::update_payloads_part1`]):
//!    the proposed allocation set is checked atomically against per-ancestor
//!    bandwidth and global slot limits, then diffed against the payload
//!    table. Grown entries are written to the local payload-table registers
//!    (polling the table-updated status); entries shrinking to zero get a
//!    best-effort remote zero-slot ALLOCATE_PAYLOAD and are marked
//!    `PendingDelete`.
//! 2. **Remote programming + compaction** ([`PayloadManager::update_payloads_part2`]):
//!    after the caller observes the ACT ([`PayloadManager::check_act_status`]),
//!    grown entries are programmed into the remote branches (routed to the
//!    nearest still-connected ancestor) and `PendingDelete` entries are
//!    compacted out of the table, releasing both id bitmask bits.
//!
//! Admission failures are all-or-nothing: the table is untouched and the
//! error is reported synchronously.

use crate::aux::{read_window, write_window, AuxChannel, AuxError};
use crate::config::{
    ACT_POLL_GRANULARITY_US, ACT_TIMEOUT_MS, DPCD_PAYLOAD_ALLOCATE_SET,
    DPCD_PAYLOAD_TABLE_UPDATE_STATUS, MAX_TIME_SLOTS, PAYLOAD_ACT_HANDLED, PAYLOAD_TABLE_UPDATED,
    START_TIME_SLOT, TABLE_UPDATE_BACKOFF_MAX_MS, TABLE_UPDATE_BACKOFF_MIN_MS,
    TABLE_UPDATE_RETRIES,
};
use crate::dispatch::{Dispatcher, TxError};
use crate::sideband::{AckReply, ReplyBody, Request};
use crate::topology::{PortId, Topology};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result type for payload operations.
pub type PayloadResult<T> = Result<T, PayloadError>;

/// Failures of the bandwidth/payload layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// The request does not fit the link or an ancestor's budget.
    NoBandwidth { needed_slots: u16, limit: u16 },
    /// Table or id bookkeeping cannot satisfy the request.
    InvalidState(&'static str),
    /// The port is unknown or already left the topology.
    NoSuchPort,
    /// Local payload table never latched the update.
    TableUpdateTimeout,
    /// Allocation change trigger never observed.
    ActTimeout,
    Aux(AuxError),
    Tx(TxError),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBandwidth {
                needed_slots,
                limit,
            } => write!(f, "no bandwidth: need {} slots, limit {}", needed_slots, limit),
            Self::InvalidState(why) => write!(f, "invalid payload state: {}", why),
            Self::NoSuchPort => write!(f, "no such port"),
            Self::TableUpdateTimeout => write!(f, "payload table update not latched"),
            Self::ActTimeout => write!(f, "allocation change trigger timeout"),
            Self::Aux(e) => write!(f, "aux failure: {}", e),
            Self::Tx(e) => write!(f, "sideband failure: {}", e),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<AuxError> for PayloadError {
    fn from(e: AuxError) -> Self {
        Self::Aux(e)
    }
}

impl From<TxError> for PayloadError {
    fn from(e: TxError) -> Self {
        Self::Tx(e)
    }
}

/// Slot count for a bandwidth request: `ceil(pbn / divisor)`.
///
/// Zero PBN needs zero slots; anything above the link's 63 allocatable
/// slots is rejected.
pub fn slots_for(pbn: u16, divisor: u16) -> PayloadResult<u8> {
    if divisor == 0 {
        return Err(PayloadError::InvalidState("zero pbn divisor"));
    }
    let slots = (u32::from(pbn)).div_ceil(u32::from(divisor));
    if slots > u32::from(MAX_TIME_SLOTS) {
        return Err(PayloadError::NoBandwidth {
            needed_slots: slots as u16,
            limit: u16::from(MAX_TIME_SLOTS),
        });
    }
    Ok(slots as u8)
}

/// One allocation proposed by the mode-setting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedPayload {
    pub port: PortId,
    pub slots: u8,
    pub pbn: u16,
    pub dsc_enabled: bool,
}

/// Commit state of one payload table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadState {
    /// Programmed into the local table only.
    Local,
    /// Programmed locally and in the remote branches.
    Remote,
    /// Zeroed locally; awaiting compaction in part 2.
    PendingDelete,
}

#[derive(Debug, Clone)]
struct PayloadEntry {
    /// Assigned port; the entry holds a memory reference so teardown can be
    /// routed even after the port leaves the topology.
    port: PortId,
    payload_id: u8,
    vcpi: u8,
    pbn: u16,
    slot_count: u8,
    state: PayloadState,
}

#[derive(Debug, Default)]
struct TableState {
    entries: Vec<PayloadEntry>,
    /// Bit 0 reserved; bits 1..=max_payloads allocatable.
    payload_id_mask: u64,
    vcpi_id_mask: u64,
}

impl TableState {
    fn entry_index(&self, port: PortId) -> Option<usize> {
        self.entries.iter().position(|e| e.port == port)
    }

    /// Start slot of entry `idx`: slot 0 carries the MTP header, payloads
    /// pack from slot 1 in table order.
    fn start_slot(&self, idx: usize) -> u8 {
        START_TIME_SLOT
            + self.entries[..idx]
                .iter()
                .filter(|e| e.state != PayloadState::PendingDelete)
                .map(|e| e.slot_count)
                .sum::<u8>()
    }
}

/// First-zero-bit search over an id bitmask; bit 0 is reserved.
fn assign_id(mask: &mut u64, max: u8) -> PayloadResult<u8> {
    for id in 1..=max {
        if *mask & (1 << id) == 0 {
            *mask |= 1 << id;
            return Ok(id);
        }
    }
    Err(PayloadError::InvalidState("no free id"))
}

fn release_id(mask: &mut u64, id: u8) {
    *mask &= !(1 << id);
}

/// The payload table and bandwidth arbiter.
pub struct PayloadManager {
    aux: Arc<dyn AuxChannel>,
    topo: Arc<Topology>,
    disp: Arc<Dispatcher>,
    state: Mutex<TableState>,
    max_payloads: u8,
    pbn_div: u16,
}

impl PayloadManager {
    pub(crate) fn new(
        aux: Arc<dyn AuxChannel>,
        topo: Arc<Topology>,
        disp: Arc<Dispatcher>,
        max_payloads: u8,
        pbn_div: u16,
    ) -> Self {
        Self {
            aux,
            topo,
            disp,
            state: Mutex::new(TableState::default()),
            max_payloads,
            pbn_div,
        }
    }

    /// Slot count a `pbn` request needs on this link.
    pub fn find_slots(&self, pbn: u16) -> PayloadResult<u8> {
        slots_for(pbn, self.pbn_div)
    }

    /// Reserve a channel id and slot count for `port`. Records the request
    /// on the port; the table itself is only touched by the two-phase
    /// commit.
    pub fn allocate(&self, port: PortId, pbn: u16) -> PayloadResult<u8> {
        let slots = self.find_slots(pbn)?;
        let mut table = self.state.lock();
        self.topo.mutate(|s, _| {
            if !s.port_alive(port) {
                return Err(PayloadError::NoSuchPort);
            }
            let vcpi_id = {
                let p = s.port(port).ok_or(PayloadError::NoSuchPort)?;
                if p.vcpi.id != 0 {
                    p.vcpi.id
                } else {
                    // Both id masks span max_payloads+1 bits; channel ids
                    // additionally never exceed the slot count.
                    assign_id(
                        &mut table.vcpi_id_mask,
                        self.max_payloads.min(MAX_TIME_SLOTS),
                    )?
                }
            };
            let p = s.port_mut(port).ok_or(PayloadError::NoSuchPort)?;
            p.vcpi.id = vcpi_id;
            p.vcpi.requested_pbn = pbn;
            p.vcpi.aligned_pbn = u16::from(slots) * self.pbn_div;
            p.vcpi.slot_count = slots;
            Ok(())
        })?;
        Ok(slots)
    }

    /// Drop `port`'s bandwidth request. The channel id stays claimed while
    /// a table entry exists; compaction in part 2 releases it.
    pub fn release(&self, port: PortId) -> PayloadResult<()> {
        let mut table = self.state.lock();
        let has_entry = table.entry_index(port).is_some();
        self.topo.mutate(|s, _| {
            let Some(p) = s.port_mut(port) else {
                return Err(PayloadError::NoSuchPort);
            };
            if p.vcpi.id == 0 {
                return Err(PayloadError::InvalidState("port has no vcpi"));
            }
            if has_entry {
                p.vcpi.requested_pbn = 0;
                p.vcpi.aligned_pbn = 0;
                p.vcpi.slot_count = 0;
            } else {
                release_id(&mut table.vcpi_id_mask, p.vcpi.id);
                p.vcpi = Default::default();
            }
            Ok(())
        })
    }

    /// Currently recorded slot count for `port`.
    pub fn get_slots(&self, port: PortId) -> PayloadResult<u8> {
        self.topo
            .read(|s| s.port(port).map(|p| p.vcpi.slot_count))
            .ok_or(PayloadError::NoSuchPort)
    }

    /// Toggle DSC on `port`'s stream record.
    pub fn enable_dsc(&self, port: PortId, enable: bool) -> PayloadResult<()> {
        self.topo.mutate(|s, _| {
            let Some(p) = s.port_mut(port) else {
                return Err(PayloadError::NoSuchPort);
            };
            p.vcpi.dsc_enabled = enable;
            Ok(())
        })
    }

    /// Proposed set reflecting every live port's recorded request; feeds the
    /// two-phase commit when the collaborator has no set of its own.
    pub fn proposed_from_vcpi(&self) -> Vec<ProposedPayload> {
        self.topo.read(|s| {
            s.live_ports()
                .into_iter()
                .filter(|p| p.vcpi.id != 0)
                .map(|p| ProposedPayload {
                    port: p.id,
                    slots: p.vcpi.slot_count,
                    pbn: p.vcpi.requested_pbn,
                    dsc_enabled: p.vcpi.dsc_enabled,
                })
                .collect()
        })
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Verify the whole proposed set against link and per-ancestor budgets
    /// without touching any state. Rejection is atomic.
    pub fn check(&self, proposed: &[ProposedPayload]) -> PayloadResult<()> {
        let active: Vec<&ProposedPayload> = proposed.iter().filter(|p| p.slots > 0).collect();

        if active.len() > self.max_payloads as usize {
            return Err(PayloadError::InvalidState("payload table full"));
        }
        let total: u16 = active.iter().map(|p| u16::from(p.slots)).sum();
        if total > u16::from(MAX_TIME_SLOTS) {
            return Err(PayloadError::NoBandwidth {
                needed_slots: total,
                limit: u16::from(MAX_TIME_SLOTS),
            });
        }

        self.topo.read(|s| {
            // Cumulative requested slots at every port on every path.
            let mut demand: HashMap<PortId, u16> = HashMap::new();
            for p in &active {
                let Some(node) = s.port(p.port) else {
                    return Err(PayloadError::NoSuchPort);
                };
                if node.available_pbn == 0 {
                    return Err(PayloadError::NoBandwidth {
                        needed_slots: u16::from(p.slots),
                        limit: 0,
                    });
                }
                for ancestor in s.path_ports(p.port) {
                    *demand.entry(ancestor).or_default() += u16::from(p.slots);
                }
            }
            for (&port, &slots) in &demand {
                let Some(node) = s.port(port) else { continue };
                if node.available_pbn == 0 {
                    // Bandwidth never probed on this hop; nothing to check
                    // against.
                    continue;
                }
                let limit = u32::from(node.available_pbn).div_ceil(u32::from(self.pbn_div)) as u16;
                if slots > limit {
                    return Err(PayloadError::NoBandwidth {
                        needed_slots: slots,
                        limit,
                    });
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Two-phase commit
    // ------------------------------------------------------------------

    /// Stage 1: admission, then local table programming.
    pub fn update_payloads_part1(&self, proposed: &[ProposedPayload]) -> PayloadResult<()> {
        self.check(proposed)?;
        let mut table = self.state.lock();

        // Entries losing their allocation: best-effort remote zero-slot
        // message, local zero programming, then PendingDelete.
        let going: Vec<usize> = (0..table.entries.len())
            .filter(|&i| {
                let e = &table.entries[i];
                e.state != PayloadState::PendingDelete
                    && !proposed.iter().any(|p| p.port == e.port && p.slots > 0)
            })
            .collect();
        for idx in going {
            let (port, payload_id, vcpi) = {
                let e = &table.entries[idx];
                (e.port, e.payload_id, e.vcpi)
            };
            if let Err(e) = self.send_remote_allocation(port, vcpi, 0) {
                log::debug!(
                    "[PayloadManager::part1] tolerated remote zeroing failure for vcpi {}: {}",
                    vcpi,
                    e
                );
            }
            if let Err(e) = self.write_local_payload(payload_id, 0, 0) {
                log::warn!(
                    "[PayloadManager::part1] local zeroing of payload {} failed: {}",
                    payload_id,
                    e
                );
            }
            let e = &mut table.entries[idx];
            e.slot_count = 0;
            e.state = PayloadState::PendingDelete;
        }

        // New or grown entries.
        for p in proposed.iter().filter(|p| p.slots > 0) {
            let idx = match table.entry_index(p.port) {
                Some(idx) => {
                    let e = &mut table.entries[idx];
                    if e.slot_count == p.slots && e.pbn == p.pbn {
                        continue;
                    }
                    e.slot_count = p.slots;
                    e.pbn = p.pbn;
                    e.state = PayloadState::Local;
                    idx
                }
                None => {
                    let pinned = self.topo.mutate(|s, _| s.memory_get_port(p.port));
                    if !pinned {
                        return Err(PayloadError::NoSuchPort);
                    }
                    let vcpi = self
                        .topo
                        .read(|s| s.port(p.port).map(|n| n.vcpi.id))
                        .unwrap_or(0);
                    if vcpi == 0 {
                        self.topo.mutate(|s, freed| s.memory_put_port(p.port, freed));
                        return Err(PayloadError::InvalidState("port has no vcpi"));
                    }
                    let payload_id = match assign_id(&mut table.payload_id_mask, self.max_payloads)
                    {
                        Ok(id) => id,
                        Err(e) => {
                            self.topo.mutate(|s, freed| s.memory_put_port(p.port, freed));
                            return Err(e);
                        }
                    };
                    table.entries.push(PayloadEntry {
                        port: p.port,
                        payload_id,
                        vcpi,
                        pbn: p.pbn,
                        slot_count: p.slots,
                        state: PayloadState::Local,
                    });
                    table.entries.len() - 1
                }
            };
            let (id, start, count) = {
                let start = table.start_slot(idx);
                let e = &table.entries[idx];
                (e.payload_id, start, e.slot_count)
            };
            self.write_local_payload(id, start, count)?;
        }
        Ok(())
    }

    /// Poll the allocation-change-trigger bit; called by the mode-setting
    /// collaborator between stage 1 and stage 2, after it has triggered the
    /// ACT sequence on its own hardware.
    pub fn check_act_status(&self) -> PayloadResult<()> {
        let deadline = Instant::now() + Duration::from_millis(ACT_TIMEOUT_MS);
        loop {
            let mut status = [0u8; 1];
            read_window(
                self.aux.as_ref(),
                DPCD_PAYLOAD_TABLE_UPDATE_STATUS,
                &mut status,
            )?;
            if status[0] & PAYLOAD_ACT_HANDLED != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::error!("[PayloadManager::check_act_status] ACT never handled");
                return Err(PayloadError::ActTimeout);
            }
            std::thread::sleep(Duration::from_micros(ACT_POLL_GRANULARITY_US));
        }
    }

    /// Stage 2: remote programming of grown entries and compaction of
    /// `PendingDelete` entries.
    pub fn update_payloads_part2(&self) -> PayloadResult<()> {
        let mut table = self.state.lock();
        let mut first_err: Option<PayloadError> = None;

        for e in table
            .entries
            .iter_mut()
            .filter(|e| e.state == PayloadState::Local && e.slot_count > 0)
        {
            match self.send_remote_allocation(e.port, e.vcpi, e.pbn) {
                Ok(()) => e.state = PayloadState::Remote,
                Err(err) => {
                    log::warn!(
                        "[PayloadManager::part2] remote allocation for vcpi {} failed: {}",
                        e.vcpi,
                        err
                    );
                    first_err.get_or_insert(err);
                }
            }
        }

        // Compaction: drop PendingDelete entries, shifting later slots down
        // and returning both ids to their masks.
        let mut idx = 0;
        while idx < table.entries.len() {
            if table.entries[idx].state != PayloadState::PendingDelete {
                idx += 1;
                continue;
            }
            let e = table.entries.remove(idx);
            release_id(&mut table.payload_id_mask, e.payload_id);
            release_id(&mut table.vcpi_id_mask, e.vcpi);
            self.topo.mutate(|s, freed| {
                if let Some(p) = s.port_mut(e.port) {
                    p.vcpi = Default::default();
                }
                s.memory_put_port(e.port, freed);
            });
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ask the branch owning `port` how much bandwidth it has latched for
    /// the port's channel. Diagnostic cross-check against the local table.
    pub fn query_payload(&self, port: PortId) -> PayloadResult<u16> {
        let vcpi = self
            .topo
            .read(|s| s.port(port).map(|p| p.vcpi.id))
            .ok_or(PayloadError::NoSuchPort)?;
        if vcpi == 0 {
            return Err(PayloadError::InvalidState("port has no vcpi"));
        }
        let route = self.topo.mutate(|s, _| s.last_connected_ancestor(port));
        let Some((branch, port_num)) = route else {
            return Err(PayloadError::NoSuchPort);
        };
        let reply = self
            .disp
            .transact(branch, &Request::QueryPayload { port_num, vcpi });
        self.topo.topology_put_branch(branch);
        match reply? {
            ReplyBody::Ack(AckReply::QueryPayload { allocated_pbn, .. }) => Ok(allocated_pbn),
            ReplyBody::Nak(nak) => {
                log::debug!("[PayloadManager::query_payload] nacked: {:?}", nak.reason);
                Err(PayloadError::InvalidState("query nacked"))
            }
            _ => Err(PayloadError::InvalidState("unexpected query reply")),
        }
    }

    /// Drop every table entry and both id masks, releasing the ports'
    /// memory references. Used when MST mode is torn down.
    pub(crate) fn reset(&self) {
        let mut table = self.state.lock();
        let entries = std::mem::take(&mut table.entries);
        table.payload_id_mask = 0;
        table.vcpi_id_mask = 0;
        drop(table);
        for e in entries {
            self.topo.mutate(|s, freed| {
                if let Some(p) = s.port_mut(e.port) {
                    p.vcpi = Default::default();
                }
                s.memory_put_port(e.port, freed);
            });
        }
    }

    /// Snapshot of (payload_id, vcpi, slot_count, state) per entry; tests
    /// and debug dumps.
    pub fn table_snapshot(&self) -> Vec<(u8, u8, u8, PayloadState)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| (e.payload_id, e.vcpi, e.slot_count, e.state))
            .collect()
    }

    // ------------------------------------------------------------------
    // Hardware programming
    // ------------------------------------------------------------------

    /// Write one local payload table entry and poll until the device
    /// latches it.
    fn write_local_payload(&self, id: u8, start: u8, count: u8) -> PayloadResult<()> {
        // Clear a stale latched bit, program, then poll for the new latch.
        write_window(
            self.aux.as_ref(),
            DPCD_PAYLOAD_TABLE_UPDATE_STATUS,
            &[PAYLOAD_TABLE_UPDATED],
        )?;
        write_window(
            self.aux.as_ref(),
            DPCD_PAYLOAD_ALLOCATE_SET,
            &[id, start, count],
        )?;
        for retry in 0..TABLE_UPDATE_RETRIES {
            let mut status = [0u8; 1];
            read_window(
                self.aux.as_ref(),
                DPCD_PAYLOAD_TABLE_UPDATE_STATUS,
                &mut status,
            )?;
            if status[0] & PAYLOAD_TABLE_UPDATED != 0 {
                return Ok(());
            }
            let backoff = TABLE_UPDATE_BACKOFF_MIN_MS
                + u64::from(retry) % (TABLE_UPDATE_BACKOFF_MAX_MS - TABLE_UPDATE_BACKOFF_MIN_MS);
            std::thread::sleep(Duration::from_millis(backoff));
        }
        Err(PayloadError::TableUpdateTimeout)
    }

    /// Send ALLOCATE_PAYLOAD for `port`'s channel to the nearest branch on
    /// its path that is still topologically connected. `pbn == 0` tears the
    /// remote allocation down; failures there are tolerated by callers.
    fn send_remote_allocation(&self, port: PortId, vcpi: u8, pbn: u16) -> PayloadResult<()> {
        let route = self.topo.mutate(|s, _| s.last_connected_ancestor(port));
        let Some((branch, port_num)) = route else {
            log::debug!(
                "[PayloadManager::send_remote_allocation] no connected ancestor for {:?}",
                port
            );
            return Err(PayloadError::Tx(TxError::DestinationGone));
        };
        let num_sdp_streams = self
            .topo
            .read(|s| s.port(port).map(|p| p.num_sdp_streams))
            .unwrap_or(0);
        let sinks: Vec<u8> = (0..num_sdp_streams).collect();
        let req = Request::AllocatePayload {
            port_num,
            vcpi,
            pbn,
            sdp_stream_sinks: if pbn == 0 { Vec::new() } else { sinks },
        };
        let result = self.disp.transact(branch, &req);
        self.topo.topology_put_branch(branch);
        match result {
            Ok(ReplyBody::Ack(AckReply::AllocatePayload(_))) => Ok(()),
            Ok(ReplyBody::Nak(nak)) => {
                log::debug!(
                    "[PayloadManager::send_remote_allocation] nacked: {:?}",
                    nak.reason
                );
                Err(PayloadError::InvalidState("remote allocation nacked"))
            }
            Ok(_) => Err(PayloadError::InvalidState("unexpected allocation reply")),
            Err(e) => Err(PayloadError::Tx(e)),
        }
    }
}
