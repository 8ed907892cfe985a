// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deferred-destruction worker.
//!
//! Reference-count arithmetic happens under the tree lock and must stay fast;
//! dropping a node record may be arbitrarily slow (cached EDID blobs, future
//! teardown callbacks into higher layers). The two are decoupled by message
//! passing: zero-count records are shipped over a channel and dropped on this
//! dedicated thread, off any latency-sensitive path.

use super::tree::ReapedNode;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use std::thread::JoinHandle;

/// Messages accepted by the reaper thread.
pub(crate) enum ReaperMsg {
    /// Drop this record.
    Dispose(ReapedNode),
    /// Ack once every previously queued record has been dropped.
    Flush(Sender<()>),
    Shutdown,
}

/// Handle to the destruction worker.
pub(crate) struct Reaper {
    tx: Sender<ReaperMsg>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawn the worker and return its handle plus the sender the topology
    /// feeds records into.
    pub fn spawn() -> (Self, Sender<ReaperMsg>) {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("mst-reaper".into())
            .spawn(move || run(&rx))
            .ok();
        if handle.is_none() {
            log::error!("[Reaper::spawn] failed to spawn worker thread");
        }
        (
            Self {
                tx: tx.clone(),
                handle,
            },
            tx,
        )
    }

    /// Block until every record queued so far has been dropped.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(ReaperMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        let _ = self.tx.send(ReaperMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: &Receiver<ReaperMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            ReaperMsg::Dispose(node) => {
                match &node {
                    ReapedNode::Branch(b) => {
                        log::debug!("[reaper] dropping branch lct={} rad={}", b.lct, b.rad);
                    }
                    ReapedNode::Port(p) => {
                        log::debug!(
                            "[reaper] dropping port {} under lct={} rad={}",
                            p.port_num,
                            p.parent_lct,
                            p.parent_rad
                        );
                    }
                }
                drop(node);
            }
            ReaperMsg::Flush(ack) => {
                let _ = ack.send(());
            }
            ReaperMsg::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sideband::PeerDeviceType;
    use crate::topology::tree::Topology;

    #[test]
    fn reaper_drains_teardown_and_flush_synchronizes() {
        let (reaper, tx) = Reaper::spawn();
        let topo = Topology::new(tx);
        let root = topo.mutate(|s, freed| {
            let root = s.create_root();
            let p = s.add_port(root, 3, false).unwrap();
            s.set_peer_type(p, PeerDeviceType::SstSink, false, freed);
            root
        });
        topo.topology_put_branch(root);
        reaper.flush();
        topo.read(|s| assert_eq!(s.record_counts(), (0, 0)));
    }

    #[test]
    fn flush_on_idle_reaper_returns() {
        let (reaper, _tx) = Reaper::spawn();
        reaper.flush();
    }
}
