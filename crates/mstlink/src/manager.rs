// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Top-level MST manager.
//!
//! Ties the codec, dispatcher, topology, payload allocator and relay
//! together, owns the three background workers (deferred destruction,
//! up-request processing, probing), and exposes the host-facing surface:
//! `probe_now`, `pump`, `suspend`/`resume` and the bandwidth API.
//!
//! ```text
//! hotplug irq ──> probe_now() ──> probe worker ──> LINK_ADDRESS walk
//! aux irq/poll ──> pump() ──> down replies / up requests
//! modeset      ──> payloads(): admission + two-phase commit
//! ```

use crate::aux::{write_window, AuxChannel, AuxResult, EdidSource, HotplugSink};
use crate::config::{
    ManagerConfig, DPCD_MSTM_CTRL, MST_EN, UPSTREAM_IS_SRC, UP_REQ_EN,
};
use crate::dispatch::{Dispatcher, TxResult, UpMonitor, UpNotification};
use crate::payload::PayloadManager;
use crate::relay::{Relay, RelayError, RelayResult};
use crate::sideband::{
    ConnectionStatusNotify, ReplyBody, Request, ResourceStatusNotify, UpRequest,
};
use crate::topology::{probe_topology, BranchId, PortInfo, Reaper, Topology};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Control messages for the background workers.
enum WorkerCtrl {
    Flush(Sender<()>),
}

/// The MST sideband engine.
pub struct MstManager {
    aux: Arc<dyn AuxChannel>,
    topo: Arc<Topology>,
    disp: Arc<Dispatcher>,
    payloads: PayloadManager,
    relay: Relay,
    up_monitor: Arc<UpMonitor>,
    reaper: Reaper,
    suspended: Arc<AtomicBool>,
    edid_sink: Option<Arc<dyn EdidSource>>,

    probe_tx: Option<Sender<()>>,
    probe_ctrl_tx: Option<Sender<WorkerCtrl>>,
    probe_worker: Option<JoinHandle<()>>,
    up_ctrl_tx: Option<Sender<WorkerCtrl>>,
    up_worker: Option<JoinHandle<()>>,
}

impl MstManager {
    /// Build the engine around a raw AUX channel and a hotplug sink.
    pub fn new(
        aux: Arc<dyn AuxChannel>,
        hotplug: Arc<dyn HotplugSink>,
        edid_sink: Option<Arc<dyn EdidSource>>,
        config: ManagerConfig,
    ) -> Self {
        let (reaper, reaper_tx) = Reaper::spawn();
        let topo = Arc::new(Topology::new(reaper_tx));
        let disp = Arc::new(Dispatcher::new(
            Arc::clone(&aux),
            Arc::clone(&topo),
            config.poll_mode,
        ));
        let payloads = PayloadManager::new(
            Arc::clone(&aux),
            Arc::clone(&topo),
            Arc::clone(&disp),
            config.max_payloads,
            config.pbn_div,
        );
        let relay = Relay::new(Arc::clone(&topo), Arc::clone(&disp));
        let suspended = Arc::new(AtomicBool::new(false));

        // Probe worker: one LINK_ADDRESS walk per request, one hotplug
        // event per cycle that changed anything.
        let (probe_tx, probe_rx) = unbounded::<()>();
        let (probe_ctrl_tx, probe_ctrl_rx) = unbounded::<WorkerCtrl>();
        let probe_worker = {
            let topo = Arc::clone(&topo);
            let disp = Arc::clone(&disp);
            let aux = Arc::clone(&aux);
            let hotplug = Arc::clone(&hotplug);
            let suspended = Arc::clone(&suspended);
            std::thread::Builder::new()
                .name("mst-probe".into())
                .spawn(move || {
                    probe_worker_loop(&probe_rx, &probe_ctrl_rx, &topo, &disp, aux.as_ref(), hotplug.as_ref(), &suspended);
                })
                .ok()
        };

        // Up-request worker: notifications are acked by the monitor and
        // processed here, never inline.
        let (up_tx, up_rx) = unbounded::<UpNotification>();
        let (up_ctrl_tx, up_ctrl_rx) = unbounded::<WorkerCtrl>();
        let up_monitor = Arc::new(UpMonitor::new(Arc::clone(&aux), up_tx));
        let up_worker = {
            let topo = Arc::clone(&topo);
            let hotplug = Arc::clone(&hotplug);
            let probe_tx = probe_tx.clone();
            std::thread::Builder::new()
                .name("mst-up".into())
                .spawn(move || {
                    up_worker_loop(&up_rx, &up_ctrl_rx, &topo, hotplug.as_ref(), &probe_tx);
                })
                .ok()
        };

        Self {
            aux,
            topo,
            disp,
            payloads,
            relay,
            up_monitor,
            reaper,
            suspended,
            edid_sink,
            probe_tx: Some(probe_tx),
            probe_ctrl_tx: Some(probe_ctrl_tx),
            probe_worker,
            up_ctrl_tx: Some(up_ctrl_tx),
            up_worker,
        }
    }

    // ------------------------------------------------------------------
    // Mode control
    // ------------------------------------------------------------------

    /// Enable or disable MST mode on the link partner. Enabling installs
    /// the root branch and schedules the first probe; disabling tears the
    /// whole tree down.
    pub fn set_mst_enabled(&self, enabled: bool) -> AuxResult<()> {
        if enabled {
            write_window(
                self.aux.as_ref(),
                DPCD_MSTM_CTRL,
                &[MST_EN | UP_REQ_EN | UPSTREAM_IS_SRC],
            )?;
            let created = self.topo.mutate(|s, _| {
                if s.root().is_none() {
                    s.create_root();
                    true
                } else {
                    false
                }
            });
            if created {
                self.probe_now();
            }
        } else {
            write_window(self.aux.as_ref(), DPCD_MSTM_CTRL, &[0])?;
            self.payloads.reset();
            if let Some(root) = self.topo.root() {
                self.topo.topology_put_branch(root);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------

    /// Schedule a full-tree probe; the caller's hotplug interrupt lands
    /// here.
    pub fn probe_now(&self) {
        if let Some(tx) = &self.probe_tx {
            let _ = tx.send(());
        }
    }

    /// Poll-mode event pump: drain one pending down-reply and one pending
    /// up-request from the sideband mailboxes. Returns true when anything
    /// was handled.
    pub fn pump(&self) -> bool {
        let down = self.disp.poll_once();
        let up = self.up_monitor.poll_once();
        down || up
    }

    // ------------------------------------------------------------------
    // Suspend / resume
    // ------------------------------------------------------------------

    /// Quiesce the engine: flush all three workers and clear every branch's
    /// probed flag so resume re-walks the whole tree. In-flight
    /// transactions run to completion or timeout; new ones are refused.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.disp.set_suspended(true);
        self.flush_worker(&self.probe_ctrl_tx);
        self.flush_worker(&self.up_ctrl_tx);
        self.reaper.flush();
        self.topo.mutate(|s, _| s.clear_link_address_sent());
    }

    /// Undo [`Self::suspend`]: re-enable the control register, clear stale
    /// remote payload tables, and force a full re-probe.
    pub fn resume(&self) -> AuxResult<()> {
        self.suspended.store(false, Ordering::Release);
        self.disp.set_suspended(false);
        write_window(
            self.aux.as_ref(),
            DPCD_MSTM_CTRL,
            &[MST_EN | UP_REQ_EN | UPSTREAM_IS_SRC],
        )?;
        if let Some(root) = self.topo.root() {
            match self.disp.transact(root, &Request::ClearPayloadIdTable) {
                Ok(ReplyBody::Ack(_)) => {}
                Ok(ReplyBody::Nak(nak)) => {
                    log::warn!("[MstManager::resume] clear payload table nacked: {:?}", nak.reason);
                }
                Err(e) => {
                    log::warn!("[MstManager::resume] clear payload table failed: {}", e);
                }
            }
        }
        self.probe_now();
        Ok(())
    }

    fn flush_worker(&self, ctrl: &Option<Sender<WorkerCtrl>>) {
        let Some(ctrl) = ctrl else { return };
        let (ack_tx, ack_rx) = bounded(1);
        if ctrl.send(WorkerCtrl::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    /// Submit-and-wait transaction API.
    pub fn transact(&self, dst: BranchId, req: &Request) -> TxResult<ReplyBody> {
        self.disp.transact(dst, req)
    }

    /// Bandwidth API: `find_slots`, `allocate`, `release`, `get_slots`,
    /// `enable_dsc` and the two-phase commit.
    pub fn payloads(&self) -> &PayloadManager {
        &self.payloads
    }

    /// Remote DPCD/I2C access.
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topo
    }

    /// Snapshot of every live port.
    pub fn ports(&self) -> Vec<PortInfo> {
        self.topo.live_ports()
    }

    /// Fetch and cache the EDID of the sink behind `port`, notifying the
    /// EDID consumer if one is installed.
    pub fn read_edid(&self, port: crate::topology::PortId) -> RelayResult<Vec<u8>> {
        let info = self.topo.port_info(port).ok_or(RelayError::NoSuchPort)?;
        let edid = self.relay.read_remote_edid(port)?;
        if let Some(sink) = &self.edid_sink {
            sink.edid_read(info.port_num, &edid);
        }
        Ok(edid)
    }
}

impl Drop for MstManager {
    fn drop(&mut self) {
        // Closing the channels ends both worker loops.
        self.probe_tx.take();
        self.probe_ctrl_tx.take();
        self.up_ctrl_tx.take();
        if let Some(h) = self.probe_worker.take() {
            let _ = h.join();
        }
        if let Some(h) = self.up_worker.take() {
            let _ = h.join();
        }
    }
}

// ----------------------------------------------------------------------
// Workers
// ----------------------------------------------------------------------

fn probe_worker_loop(
    probe_rx: &Receiver<()>,
    ctrl_rx: &Receiver<WorkerCtrl>,
    topo: &Arc<Topology>,
    disp: &Arc<Dispatcher>,
    aux: &dyn AuxChannel,
    hotplug: &dyn HotplugSink,
    suspended: &AtomicBool,
) {
    loop {
        crossbeam::select! {
            recv(probe_rx) -> msg => match msg {
                Ok(()) => {
                    if suspended.load(Ordering::Acquire) {
                        continue;
                    }
                    let Some(root) = topo.root() else { continue };
                    if probe_topology(topo, disp, aux, root) {
                        hotplug.hotplug();
                    }
                }
                Err(_) => break,
            },
            recv(ctrl_rx) -> msg => match msg {
                Ok(WorkerCtrl::Flush(ack)) => {
                    // Coalesce queued probe requests into this flush.
                    while probe_rx.try_recv().is_ok() {}
                    let _ = ack.send(());
                }
                Err(_) => break,
            },
        }
    }
}

fn up_worker_loop(
    up_rx: &Receiver<UpNotification>,
    ctrl_rx: &Receiver<WorkerCtrl>,
    topo: &Arc<Topology>,
    hotplug: &dyn HotplugSink,
    probe_tx: &Sender<()>,
) {
    loop {
        crossbeam::select! {
            recv(up_rx) -> msg => match msg {
                Ok(note) => handle_up_note(topo, hotplug, probe_tx, &note),
                Err(_) => break,
            },
            recv(ctrl_rx) -> msg => match msg {
                Ok(WorkerCtrl::Flush(ack)) => {
                    while let Ok(note) = up_rx.try_recv() {
                        handle_up_note(topo, hotplug, probe_tx, &note);
                    }
                    let _ = ack.send(());
                }
                Err(_) => break,
            },
        }
    }
}

fn handle_up_note(
    topo: &Arc<Topology>,
    hotplug: &dyn HotplugSink,
    probe_tx: &Sender<()>,
    note: &UpNotification,
) {
    match note.request {
        UpRequest::ConnectionStatus(csn) => handle_connection_status(topo, hotplug, probe_tx, &csn),
        UpRequest::ResourceStatus(rsn) => handle_resource_status(topo, &rsn),
    }
}

/// Apply a connection-status change: create/update the port, install or
/// drop its child branch, and schedule a probe when a new subtree appeared.
fn handle_connection_status(
    topo: &Arc<Topology>,
    hotplug: &dyn HotplugSink,
    probe_tx: &Sender<()>,
    csn: &ConnectionStatusNotify,
) {
    let branch = topo.mutate(|s, _| s.find_branch_by_guid(&csn.guid));
    let Some(branch) = branch else {
        log::debug!(
            "[manager::handle_connection_status] no branch with guid {}, dropping",
            csn.guid
        );
        return;
    };

    let (changed, must_probe) = topo.mutate(|s, freed| {
        let existing = s.branch(branch).and_then(|b| {
            b.ports
                .iter()
                .copied()
                .find(|&p| s.port(p).is_some_and(|n| n.port_num == csn.port_number))
        });
        let port = match existing {
            Some(port) => port,
            None => match s.add_port(branch, csn.port_number, csn.input_port) {
                Some(port) => port,
                None => return (false, false),
            },
        };
        if let Some(p) = s.port_mut(port) {
            p.ddps = csn.displayport_device_plug_status;
            p.ldps = csn.legacy_device_plug_status;
        }
        let outcome = if csn.displayport_device_plug_status {
            s.set_peer_type(
                port,
                csn.peer_device_type,
                csn.message_capability_status,
                freed,
            )
        } else {
            let out = s.set_peer_type(port, crate::sideband::PeerDeviceType::None, false, freed);
            if let Some(p) = s.port_mut(port) {
                p.full_pbn = 0;
                p.available_pbn = 0;
            }
            out
        };
        (true, outcome.must_probe)
    });

    topo.topology_put_branch(branch);
    if must_probe {
        let _ = probe_tx.send(());
    }
    if changed {
        hotplug.hotplug();
    }
}

/// Refresh a port's available bandwidth from a resource-status notify.
fn handle_resource_status(topo: &Arc<Topology>, rsn: &ResourceStatusNotify) {
    let branch = topo.mutate(|s, _| s.find_branch_by_guid(&rsn.guid));
    let Some(branch) = branch else {
        log::debug!(
            "[manager::handle_resource_status] no branch with guid {}, dropping",
            rsn.guid
        );
        return;
    };
    topo.mutate(|s, freed| {
        if let Some(port) = s.get_port(branch, rsn.port_number) {
            if let Some(p) = s.port_mut(port) {
                p.available_pbn = rsn.available_pbn;
            }
            s.topology_put_port(port, freed);
        }
    });
    topo.topology_put_branch(branch);
}
