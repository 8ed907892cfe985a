// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Down-link transaction queue.
//!
//! Transactions are appended under the queue lock and transmitted strictly
//! in order: the head entry is chunked into the DOWN_REQ mailbox and must
//! complete (reply, timeout, or send failure) before the next entry starts.
//! Waiters block on a condition variable signaled by every state transition.
//!
//! The queue lock is never held together with the tree lock: destination
//! resolution happens before the queue is touched, reply resolution after it
//! is released.

use super::{read_mailbox_chunk, TxError, TxResult};
use crate::aux::{write_window, AuxChannel};
use crate::config::{
    DOWN_REP_MSG_RDY, DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0, DPCD_SIDEBAND_DOWN_REP,
    DPCD_SIDEBAND_DOWN_REQ, REPLY_POLL_MS, REPLY_TIMEOUT_MS, TX_RETRIES,
};
use crate::sideband::{encode_chunk, Rad, ReplyBody, Request, RxBuilder, SidebandHeader};
use crate::topology::{BranchId, Topology};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Life cycle of one queued transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Queued,
    Sending,
    Sent,
    ReplyReceived,
    TimedOut,
}

/// One down-link transaction.
#[derive(Debug)]
struct TxEntry {
    id: u64,
    /// Destination branch; a topology reference is held from submit until
    /// the entry leaves the queue.
    dst: BranchId,
    dst_lct: u8,
    dst_rad: Rad,
    broadcast: bool,
    path_msg: bool,
    req_type: u8,
    body: Vec<u8>,
    cur_offset: usize,
    state: TxState,
    reply: Option<ReplyBody>,
    io_error: Option<TxError>,
}

#[derive(Debug, Default)]
struct DispatchState {
    queue: std::collections::VecDeque<TxEntry>,
    next_id: u64,
    down_rx: RxBuilder,
}

/// The down-link dispatcher.
pub struct Dispatcher {
    aux: Arc<dyn AuxChannel>,
    topo: Arc<Topology>,
    inner: Mutex<DispatchState>,
    cv: Condvar,
    poll_mode: bool,
    suspended: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(aux: Arc<dyn AuxChannel>, topo: Arc<Topology>, poll_mode: bool) -> Self {
        Self {
            aux,
            topo,
            inner: Mutex::new(DispatchState::default()),
            cv: Condvar::new(),
            poll_mode,
            suspended: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Append a request to the down queue. If the queue was empty,
    /// transmission starts immediately. Takes a topology reference on `dst`
    /// for the lifetime of the entry.
    pub fn submit(&self, dst: BranchId, req: &Request) -> TxResult<u64> {
        if self.suspended.load(Ordering::Acquire) {
            return Err(TxError::Suspended);
        }
        let route = self.topo.mutate(|s, _| {
            if !s.topology_try_get_branch(dst) {
                return None;
            }
            s.branch(dst).map(|b| (b.lct, b.rad))
        });
        let Some((dst_lct, dst_rad)) = route else {
            return Err(TxError::DestinationGone);
        };

        let mut st = self.inner.lock();
        st.next_id += 1;
        let id = st.next_id;
        st.queue.push_back(TxEntry {
            id,
            dst,
            dst_lct,
            dst_rad,
            broadcast: req.is_broadcast(),
            path_msg: req.is_path_message(),
            req_type: req.req_type(),
            body: req.encode(),
            cur_offset: 0,
            state: TxState::Queued,
            reply: None,
            io_error: None,
        });
        if st.queue.len() == 1 {
            self.process_queue(&mut st);
        }
        Ok(id)
    }

    /// Submit and block for the reply. A NAK is a successful outcome.
    pub fn transact(&self, dst: BranchId, req: &Request) -> TxResult<ReplyBody> {
        let id = self.submit(dst, req)?;
        self.wait_for_reply(id)
    }

    /// Transmit chunks of the head entry until it is fully sent or fails.
    fn process_queue(&self, st: &mut DispatchState) {
        loop {
            let head = match st.queue.front_mut() {
                Some(h) if matches!(h.state, TxState::Queued | TxState::Sending) => h,
                _ => return,
            };
            head.state = TxState::Sending;
            if !self.drain_one_chunk(head) {
                self.cv.notify_all();
                return;
            }
            if head.state == TxState::Sent {
                // Single-flight: the head must complete before the next
                // entry starts transmitting.
                return;
            }
        }
    }

    /// Encode and transmit the next chunk of `head`, retrying the raw write
    /// up to the I/O budget. Marks the entry Sent once the body is out, or
    /// TimedOut when the budget is exhausted.
    fn drain_one_chunk(&self, head: &mut TxEntry) -> bool {
        let route = SidebandHeader {
            lct: head.dst_lct,
            lcr: if head.broadcast {
                6
            } else {
                head.dst_lct.saturating_sub(1)
            },
            rad: head.dst_rad,
            broadcast: head.broadcast,
            path_msg: head.path_msg,
            ..SidebandHeader::default()
        };
        let (chunk, next_offset) = encode_chunk(&route, &head.body, head.cur_offset);

        let mut last_err = None;
        for attempt in 1..=TX_RETRIES {
            match write_window(self.aux.as_ref(), DPCD_SIDEBAND_DOWN_REQ, &chunk) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    log::debug!(
                        "[Dispatcher::drain_one_chunk] aux write attempt {}/{} failed: {}",
                        attempt,
                        TX_RETRIES,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            log::error!(
                "[Dispatcher::drain_one_chunk] giving up on tx {} after {} attempts: {}",
                head.id,
                TX_RETRIES,
                e
            );
            head.io_error = Some(TxError::Io(e));
            head.state = TxState::TimedOut;
            return false;
        }

        head.cur_offset = next_offset;
        if head.cur_offset >= head.body.len() {
            head.state = TxState::Sent;
        }
        true
    }

    /// Restart transmission of whatever is at the head of the queue.
    fn kick(&self) {
        let mut st = self.inner.lock();
        self.process_queue(&mut st);
    }

    /// Block until the reply for `id` arrives, with a hard cap of
    /// [`REPLY_TIMEOUT_MS`]. In poll mode the sideband mailbox is pumped
    /// every [`REPLY_POLL_MS`] instead of relying on an interrupt source.
    ///
    /// Win or lose, the entry leaves the queue, its topology reference is
    /// released, and transmission of the remaining queue is re-kicked.
    pub fn wait_for_reply(&self, id: u64) -> TxResult<ReplyBody> {
        let deadline = Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS);
        let mut st = self.inner.lock();
        loop {
            let Some(pos) = st.queue.iter().position(|e| e.id == id) else {
                // Entry vanished: a concurrent waiter already reaped it.
                return Err(TxError::Timeout);
            };
            match st.queue[pos].state {
                TxState::ReplyReceived => {
                    let entry = st.queue.remove(pos);
                    drop(st);
                    return self.finish_entry(entry, None);
                }
                TxState::TimedOut => {
                    let entry = st.queue.remove(pos);
                    drop(st);
                    let err = entry
                        .as_ref()
                        .and_then(|e| e.io_error)
                        .unwrap_or(TxError::Timeout);
                    return self.finish_entry(entry, Some(err));
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                let entry = st.queue.remove(pos);
                drop(st);
                log::warn!("[Dispatcher::wait_for_reply] tx {} timed out", id);
                return self.finish_entry(entry, Some(TxError::Timeout));
            }
            let remaining = deadline - now;
            if self.poll_mode {
                let slice = remaining.min(Duration::from_millis(REPLY_POLL_MS));
                self.cv.wait_for(&mut st, slice);
                drop(st);
                self.poll_once();
                st = self.inner.lock();
            } else {
                self.cv.wait_for(&mut st, remaining);
            }
        }
    }

    /// Release the entry's topology reference, re-kick the queue, and map
    /// the outcome.
    fn finish_entry(
        &self,
        entry: Option<TxEntry>,
        err: Option<TxError>,
    ) -> TxResult<ReplyBody> {
        let Some(entry) = entry else {
            return Err(TxError::Timeout);
        };
        self.topo.topology_put_branch(entry.dst);
        self.kick();
        match err {
            Some(e) => Err(e),
            None => entry.reply.ok_or(TxError::Timeout),
        }
    }

    // ------------------------------------------------------------------
    // Reply path
    // ------------------------------------------------------------------

    /// Feed one raw DOWN_REP chunk. Invoked from the interrupt path or from
    /// [`Self::poll_once`].
    pub fn handle_down_chunk(&self, raw: &[u8]) {
        let assembled = {
            let mut st = self.inner.lock();
            match st.down_rx.push_chunk(raw) {
                Ok(done) => done,
                Err(e) => {
                    log::debug!("[Dispatcher::handle_down_chunk] discarding chunk: {}", e);
                    None
                }
            }
        };
        if let Some(msg) = assembled {
            self.handle_down_reply(&msg.origin, &msg.body);
        }
    }

    /// Match one reassembled reply against the head-of-queue transaction.
    fn handle_down_reply(&self, origin: &SidebandHeader, body: &[u8]) {
        // Snapshot the head without holding the lock across resolution.
        let head = {
            let st = self.inner.lock();
            st.queue
                .front()
                .map(|e| (e.id, e.dst, e.req_type, e.broadcast))
        };
        let Some((head_id, head_dst, head_req, head_broadcast)) = head else {
            log::debug!("[Dispatcher::handle_down_reply] reply with empty queue, dropping");
            return;
        };

        // Resolve the replying branch to a live node: by GUID for broadcast
        // replies, by walking (lct, rad) from the root otherwise.
        let resolved = self.topo.mutate(|s, _| {
            if origin.broadcast && head_broadcast {
                if body.len() >= 17 {
                    let mut guid = [0u8; 16];
                    guid.copy_from_slice(&body[1..17]);
                    s.find_branch_by_guid(&crate::sideband::Guid(guid))
                } else {
                    None
                }
            } else {
                s.resolve_rad(origin.lct, &origin.rad)
            }
        });
        let Some(branch) = resolved else {
            log::debug!(
                "[Dispatcher::handle_down_reply] no live branch for reply lct={} rad={}, dropping",
                origin.lct,
                origin.rad
            );
            return;
        };
        let matches = branch == head_dst;
        self.topo.topology_put_branch(branch);
        if !matches {
            log::debug!(
                "[Dispatcher::handle_down_reply] reply source does not match head tx {}, dropping",
                head_id
            );
            return;
        }

        let reply = match ReplyBody::decode(body) {
            Ok(r) => r,
            Err(e) => {
                log::warn!(
                    "[Dispatcher::handle_down_reply] undecodable reply for tx {}: {}",
                    head_id,
                    e
                );
                return;
            }
        };
        if body.first().map(|b| b & 0x7f) != Some(head_req) {
            log::debug!(
                "[Dispatcher::handle_down_reply] reply opcode mismatch for tx {}, dropping",
                head_id
            );
            return;
        }

        let mut st = self.inner.lock();
        if let Some(front) = st.queue.front_mut() {
            if front.id == head_id {
                front.reply = Some(reply);
                front.state = TxState::ReplyReceived;
                self.cv.notify_all();
            }
        }
    }

    /// Poll the event status register once and consume a pending down-reply
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
        if esi[0] & DOWN_REP_MSG_RDY == 0 {
            return false;
        }
        let chunk = read_mailbox_chunk(self.aux.as_ref(), DPCD_SIDEBAND_DOWN_REP);
        // Write-1-to-clear before processing so the device can post the next
        // chunk while we reassemble.
        let _ = self.aux.dpcd_write(
            DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0,
            &[DOWN_REP_MSG_RDY],
        );
        if let Some(chunk) = chunk {
            self.handle_down_chunk(&chunk);
            return true;
        }
        false
    }

    /// Number of transactions currently queued (tests and debugfs-style
    /// introspection).
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
