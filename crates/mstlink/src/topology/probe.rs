// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recursive link-address probing.
//!
//! A probe cycle walks the tree top-down: every branch that has not yet been
//! interrogated gets a LINK_ADDRESS transaction; each reported port is
//! created or updated (possibly installing a child branch, possibly issuing
//! ENUM_PATH_RESOURCES to refresh bandwidth); ports absent from the reply
//! are pruned; branches whose presence or contents changed are recursed
//! into. The cycle returns one aggregate change flag so the caller raises a
//! single hotplug event per cycle, not one per port.

use super::node::{BranchId, PortId, PortKind};
use super::tree::Topology;
use crate::aux::{write_window, AuxChannel};
use crate::config::DPCD_GUID;
use crate::dispatch::Dispatcher;
use crate::sideband::{
    AckReply, Guid, LinkAddressPort, LinkAddressReply, PeerDeviceType, ReplyBody, Request,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// Probe `branch` and every branch below it. Returns whether anything in
/// the topology changed.
pub fn probe_topology(
    topo: &Topology,
    disp: &Dispatcher,
    aux: &dyn AuxChannel,
    branch: BranchId,
) -> bool {
    let needs_send = topo.mutate(|s, _| match s.branch_mut(branch) {
        Some(b) if b.topo_refs > 0 && !b.link_address_sent => {
            b.link_address_sent = true;
            true
        }
        _ => false,
    });

    let mut changed = false;
    if needs_send {
        changed |= send_link_address(topo, disp, aux, branch);
    }

    let children: Vec<BranchId> = topo.read(|s| {
        s.branch(branch)
            .map(|b| {
                b.ports
                    .iter()
                    .filter_map(|&p| {
                        let port = s.port(p)?;
                        if port.ddps && !port.input {
                            port.child.filter(|&c| s.branch_alive(c))
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    });
    for child in children {
        changed |= probe_topology(topo, disp, aux, child);
    }
    changed
}

fn send_link_address(
    topo: &Topology,
    disp: &Dispatcher,
    aux: &dyn AuxChannel,
    branch: BranchId,
) -> bool {
    let reset_sent = |why: &str| {
        log::warn!("[probe::send_link_address] {}", why);
        topo.mutate(|s, _| {
            if let Some(b) = s.branch_mut(branch) {
                b.link_address_sent = false;
            }
        });
    };

    let reply = match disp.transact(branch, &Request::LinkAddress) {
        Ok(reply) => reply,
        Err(e) => {
            reset_sent(&format!("link address transaction failed: {}", e));
            return false;
        }
    };
    let rep = match reply {
        ReplyBody::Ack(AckReply::LinkAddress(rep)) => rep,
        ReplyBody::Nak(nak) => {
            reset_sent(&format!("link address nacked: {:?}", nak.reason));
            return false;
        }
        other => {
            reset_sent(&format!("unexpected link address reply: {:?}", other));
            return false;
        }
    };

    apply_link_address(topo, disp, aux, branch, &rep)
}

fn apply_link_address(
    topo: &Topology,
    disp: &Dispatcher,
    aux: &dyn AuxChannel,
    branch: BranchId,
    rep: &LinkAddressReply,
) -> bool {
    check_branch_guid(topo, disp, aux, branch, rep.guid);

    let mut changed = false;
    let mut want_epr: Vec<u8> = Vec::new();
    for la in &rep.ports {
        let (port_changed, epr) = apply_reported_port(topo, branch, la);
        changed |= port_changed;
        if epr {
            want_epr.push(la.port_number);
        }
    }

    // Prune ports the branch no longer reports.
    let stale: Vec<PortId> = topo.read(|s| {
        s.branch(branch)
            .map(|b| {
                b.ports
                    .iter()
                    .copied()
                    .filter(|&p| {
                        s.port(p).is_some_and(|n| {
                            !rep.ports.iter().any(|la| la.port_number == n.port_num)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    });
    for port in stale {
        log::debug!("[probe::apply_link_address] pruning vanished port {:?}", port);
        topo.mutate(|s, freed| s.topology_put_port(port, freed));
        changed = true;
    }

    for port_num in want_epr {
        changed |= refresh_path_resources(topo, disp, branch, port_num);
    }
    changed
}

/// Validate the reported GUID; an all-zero GUID gets a fabricated one that
/// is written back to the device (best-effort).
fn check_branch_guid(
    topo: &Topology,
    disp: &Dispatcher,
    aux: &dyn AuxChannel,
    branch: BranchId,
    reported: Guid,
) {
    let writeback = topo.mutate(|s, _| {
        let b = s.branch_mut(branch)?;
        if !reported.is_zero() {
            b.guid = reported;
            return None;
        }
        let guid = fabricate_guid();
        b.guid = guid;
        let parent_port = b.parent;
        let route = parent_port.and_then(|pp| {
            let p = s.port(pp)?;
            Some((p.parent, p.port_num))
        });
        Some((guid, route))
    });

    let Some((guid, route)) = writeback else { return };
    match route {
        None => {
            // Root branch: its GUID register is locally reachable.
            if let Err(e) = write_window(aux, DPCD_GUID, &guid.0) {
                log::warn!("[probe::check_branch_guid] local guid write failed: {}", e);
            }
        }
        Some((parent_branch, port_num)) => {
            let req = Request::RemoteDpcdWrite {
                port_num,
                address: DPCD_GUID,
                bytes: guid.0.to_vec(),
            };
            if let Err(e) = disp.transact(parent_branch, &req) {
                log::warn!("[probe::check_branch_guid] remote guid write failed: {}", e);
            }
        }
    }
}

/// Create or update one port from a LINK_ADDRESS reply entry.
/// Returns (changed, wants-enum-path-resources).
fn apply_reported_port(topo: &Topology, branch: BranchId, la: &LinkAddressPort) -> (bool, bool) {
    topo.mutate(|s, freed| {
        let existing = s.branch(branch).and_then(|b| {
            b.ports
                .iter()
                .copied()
                .find(|&p| s.port(p).is_some_and(|n| n.port_num == la.port_number))
        });

        let (port, mut changed) = match existing {
            Some(port) => (port, false),
            None => {
                let Some(port) = s.add_port(branch, la.port_number, la.input_port) else {
                    return (false, false);
                };
                (port, true)
            }
        };

        {
            let Some(p) = s.port_mut(port) else {
                return (changed, false);
            };
            if p.ddps != la.ddps || p.ldps != la.legacy_device_plug_status {
                changed = true;
            }
            p.ddps = la.ddps;
            p.ldps = la.legacy_device_plug_status;
            if !la.input_port {
                p.dpcd_rev = la.dpcd_revision;
                p.num_sdp_streams = la.num_sdp_streams;
                p.num_sdp_stream_sinks = la.num_sdp_stream_sinks;
            }
        }

        let outcome = if la.ddps {
            s.set_peer_type(port, la.peer_device_type, la.mcs, freed)
        } else {
            // Unplugged: park the peer machine and forget stale bandwidth.
            let out = s.set_peer_type(port, PeerDeviceType::None, false, freed);
            if let Some(p) = s.port_mut(port) {
                p.full_pbn = 0;
                p.available_pbn = 0;
            }
            out
        };
        changed |= outcome.changed;

        let want_epr = la.ddps
            && !la.input_port
            && s.port(port).is_some_and(|p| p.kind() != PortKind::None);
        (changed, want_epr)
    })
}

/// Refresh one port's bandwidth numbers via ENUM_PATH_RESOURCES.
fn refresh_path_resources(
    topo: &Topology,
    disp: &Dispatcher,
    branch: BranchId,
    port_num: u8,
) -> bool {
    let reply = match disp.transact(branch, &Request::EnumPathResources { port_num }) {
        Ok(reply) => reply,
        Err(e) => {
            log::warn!(
                "[probe::refresh_path_resources] enum path resources failed for port {}: {}",
                port_num,
                e
            );
            return false;
        }
    };
    let rep = match reply {
        ReplyBody::Ack(AckReply::EnumPathResources(rep)) => rep,
        ReplyBody::Nak(nak) => {
            log::debug!(
                "[probe::refresh_path_resources] port {} nacked: {:?}",
                port_num,
                nak.reason
            );
            return false;
        }
        other => {
            log::debug!(
                "[probe::refresh_path_resources] unexpected reply: {:?}",
                other
            );
            return false;
        }
    };

    topo.mutate(|s, _| {
        let port = s.branch(branch).and_then(|b| {
            b.ports
                .iter()
                .copied()
                .find(|&p| s.port(p).is_some_and(|n| n.port_num == rep.port_number))
        });
        let Some(port) = port else { return false };
        let Some(p) = s.port_mut(port) else { return false };
        let changed = p.full_pbn != rep.full_pbn || p.available_pbn != rep.available_pbn;
        p.full_pbn = rep.full_pbn;
        p.available_pbn = rep.available_pbn;
        p.fec_capable = rep.fec_capable;
        changed
    })
}

/// Build a unique GUID from timestamp, process id and a counter; used when a
/// branch reports an all-zero identity.
fn fabricate_guid() -> Guid {
    static SALT: AtomicU32 = AtomicU32::new(1);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let salt = SALT.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();

    let mut g = [0u8; 16];
    g[0..8].copy_from_slice(&(now.as_nanos() as u64).to_be_bytes());
    g[8..12].copy_from_slice(&pid.to_be_bytes());
    g[12..16].copy_from_slice(&salt.to_be_bytes());
    Guid(g)
}
