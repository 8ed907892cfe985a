// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Up-link (unsolicited) request path.
//!
//! Branch devices post CONNECTION_STATUS_NOTIFY and RESOURCE_STATUS_NOTIFY
//! into the UP_REQ mailbox. Each reassembled request is acknowledged
//! immediately on the UP_REP mailbox and queued to a worker channel —
//! never processed inline, since processing may itself issue further
//! down-link transactions.

use super::read_mailbox_chunk;
use crate::aux::{write_window, AuxChannel};
use crate::config::{
    DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0, DPCD_SIDEBAND_UP_REP, DPCD_SIDEBAND_UP_REQ,
    UP_REQ_MSG_RDY,
};
use crate::sideband::{encode_chunk, RxBuilder, SidebandHeader, UpRequest};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;

/// A parsed up request, as delivered to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpNotification {
    pub request: UpRequest,
    /// Route of the originating branch, taken from the chunk header.
    pub origin_lct: u8,
    pub origin_rad: crate::sideband::Rad,
}

/// Receives, acks and forwards unsolicited up requests.
pub struct UpMonitor {
    aux: Arc<dyn AuxChannel>,
    rx: Mutex<RxBuilder>,
    worker_tx: Sender<UpNotification>,
}

impl UpMonitor {
    pub(crate) fn new(aux: Arc<dyn AuxChannel>, worker_tx: Sender<UpNotification>) -> Self {
        Self {
            aux,
            rx: Mutex::new(RxBuilder::new()),
            worker_tx,
        }
    }

    /// Feed one raw UP_REQ chunk.
    pub fn handle_up_chunk(&self, raw: &[u8]) {
        let assembled = {
            let mut rx = self.rx.lock();
            match rx.push_chunk(raw) {
                Ok(done) => done,
                Err(e) => {
                    log::debug!("[UpMonitor::handle_up_chunk] discarding chunk: {}", e);
                    None
                }
            }
        };
        let Some(msg) = assembled else { return };

        let request = match UpRequest::decode(&msg.body) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[UpMonitor::handle_up_chunk] undecodable up request: {}", e);
                return;
            }
        };

        // Ack first: the device retries the request until it sees the reply.
        self.send_up_ack(&msg.origin, request.req_type());

        let note = UpNotification {
            request,
            origin_lct: msg.origin.lct,
            origin_rad: msg.origin.rad,
        };
        if self.worker_tx.send(note).is_err() {
            log::debug!("[UpMonitor::handle_up_chunk] worker gone, dropping notification");
        }
    }

    /// Write a one-byte ACK reply into the UP_REP mailbox, mirroring the
    /// request's route and sequence number.
    fn send_up_ack(&self, origin: &SidebandHeader, req_type: u8) {
        let route = SidebandHeader {
            lct: origin.lct,
            lcr: origin.lct.saturating_sub(1),
            rad: origin.rad,
            seqno: origin.seqno,
            ..SidebandHeader::default()
        };
        let body = [req_type];
        let (chunk, _) = encode_chunk(&route, &body, 0);
        if let Err(e) = write_window(self.aux.as_ref(), DPCD_SIDEBAND_UP_REP, &chunk) {
            log::warn!("[UpMonitor::send_up_ack] up ack write failed: {}", e);
        }
    }

    /// Poll the event status register once and consume a pending up-request
    /// chunk if one is ready. Returns true when something was handled.
    pub fn poll_once(&self) -> bool {
        let mut esi = [0u8; 1];
        if crate::aux::read_window(
            self.aux.as_ref(),
            DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0,
            &mut esi,
        )
        .is_err()
        {
            return false;
        }
        if esi[0] & UP_REQ_MSG_RDY == 0 {
            return false;
        }
        let chunk = read_mailbox_chunk(self.aux.as_ref(), DPCD_SIDEBAND_UP_REQ);
        let _ = self
            .aux
            .dpcd_write(DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0, &[UP_REQ_MSG_RDY]);
        if let Some(chunk) = chunk {
            self.handle_up_chunk(&chunk);
            return true;
        }
        false
    }
}
