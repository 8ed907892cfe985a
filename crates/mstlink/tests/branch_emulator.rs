// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests against an in-process emulated MST hub.
//!
//! The emulator implements [`AuxChannel`] over a flat register file plus a
//! scripted branch/port topology: sideband requests written into the
//! DOWN_REQ mailbox are decoded, answered per opcode, and the replies served
//! back through the DOWN_REP mailbox with the event-status bits a real
//! device would raise. Up requests can be injected to exercise the
//! unsolicited path.

use mstlink::config as cfg;
use mstlink::sideband::{
    encode_chunk, AckReply, AllocatePayloadReply, EnumPathResourcesReply, Guid, LinkAddressPort,
    LinkAddressReply, PeerDeviceType, Rad, ReplyBody, Request, RxBuilder, SidebandHeader,
    UpRequest,
};
use mstlink::{
    AuxChannel, AuxResult, EdidSource, HotplugSink, ManagerConfig, MstManager, PayloadError,
    PortInfo,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ======================================================================
// Emulated hub
// ======================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmuKind {
    Empty,
    Sink,
    Branch(usize),
}

#[derive(Debug, Clone)]
struct EmuPort {
    num: u8,
    kind: EmuKind,
    full_pbn: u16,
    avail_pbn: u16,
}

#[derive(Debug, Clone)]
struct EmuBranch {
    guid: [u8; 16],
    ports: Vec<EmuPort>,
}

#[derive(Debug, Default)]
struct EmuState {
    branches: Vec<EmuBranch>,
    regs: Vec<u8>,
    down_req_buf: Vec<u8>,
    down_rx: RxBuilder,
    pending_down: VecDeque<Vec<u8>>,
    pending_up: VecDeque<Vec<u8>>,
    /// Remote ALLOCATE_PAYLOAD messages seen: (branch path, port, vcpi, pbn).
    allocations: Vec<(Vec<u8>, u8, u8, u16)>,
    /// Local payload table writes seen: (id, start, count).
    local_payloads: Vec<(u8, u8, u8)>,
    /// Remote DPCD register files, keyed by (branch path, port, address).
    remote_regs: HashMap<(Vec<u8>, u8, u32), u8>,
    /// EDID blobs behind sink ports, keyed by (branch path, port).
    edids: HashMap<(Vec<u8>, u8), Vec<u8>>,
}

struct EmuAux {
    state: Mutex<EmuState>,
}

impl EmuAux {
    fn new(branches: Vec<EmuBranch>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EmuState {
                branches,
                regs: vec![0u8; 0x1_0000],
                ..EmuState::default()
            }),
        })
    }

    fn root_guid(&self) -> [u8; 16] {
        self.state.lock().branches[0].guid
    }

    fn allocations(&self) -> Vec<(Vec<u8>, u8, u8, u16)> {
        self.state.lock().allocations.clone()
    }

    fn set_edid(&self, path: &[u8], port: u8, edid: Vec<u8>) {
        self.state
            .lock()
            .edids
            .insert((path.to_vec(), port), edid);
    }

    fn set_remote_reg(&self, path: &[u8], port: u8, address: u32, value: u8) {
        self.state
            .lock()
            .remote_regs
            .insert((path.to_vec(), port, address), value);
    }

    /// Queue an unsolicited up request originating from the branch at `path`.
    fn inject_up(&self, path: &[u8], up: &UpRequest) {
        let mut st = self.state.lock();
        let route = route_header(path);
        let body = up.encode();
        let mut offset = 0;
        loop {
            let (chunk, next) = encode_chunk(&route, &body, offset);
            st.pending_up.push_back(chunk);
            offset = next;
            if offset >= body.len() {
                break;
            }
        }
        st.regs[cfg::DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0 as usize] |= cfg::UP_REQ_MSG_RDY;
    }
}

/// Reply/injection route for the branch at `path`.
fn route_header(path: &[u8]) -> SidebandHeader {
    let rad = path.iter().fold(Rad::root(), |r, &hop| r.child(hop));
    SidebandHeader {
        lct: path.len() as u8 + 1,
        lcr: path.len() as u8,
        rad,
        ..SidebandHeader::default()
    }
}

impl EmuState {
    fn branch_at(&self, rad: &Rad, lct: u8) -> Option<usize> {
        let mut idx = 0;
        for depth in 0..lct.saturating_sub(1) {
            let hop = rad.hop(depth as usize);
            let port = self.branches[idx].ports.iter().find(|p| p.num == hop)?;
            match port.kind {
                EmuKind::Branch(child) => idx = child,
                _ => return None,
            }
        }
        Some(idx)
    }

    fn path_of(&self, idx: usize) -> Vec<u8> {
        // Search from the root; topologies in these tests are tiny.
        fn walk(branches: &[EmuBranch], cur: usize, target: usize, path: &mut Vec<u8>) -> bool {
            if cur == target {
                return true;
            }
            for port in &branches[cur].ports {
                if let EmuKind::Branch(child) = port.kind {
                    path.push(port.num);
                    if walk(branches, child, target, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }
        let mut path = Vec::new();
        walk(&self.branches, 0, idx, &mut path);
        path
    }

    fn queue_reply(&mut self, origin: &SidebandHeader, body: &[u8]) {
        let route = SidebandHeader {
            lct: origin.lct,
            lcr: origin.lcr,
            rad: origin.rad,
            seqno: origin.seqno,
            ..SidebandHeader::default()
        };
        let mut offset = 0;
        loop {
            let (chunk, next) = encode_chunk(&route, body, offset);
            self.pending_down.push_back(chunk);
            offset = next;
            if offset >= body.len() {
                break;
            }
        }
        self.regs[cfg::DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0 as usize] |= cfg::DOWN_REP_MSG_RDY;
    }

    fn link_address_reply(&self, idx: usize) -> ReplyBody {
        let branch = &self.branches[idx];
        let ports = branch
            .ports
            .iter()
            .map(|p| match p.kind {
                EmuKind::Empty => LinkAddressPort {
                    input_port: false,
                    peer_device_type: PeerDeviceType::None,
                    port_number: p.num,
                    ddps: false,
                    dpcd_revision: 0x12,
                    ..LinkAddressPort::default()
                },
                EmuKind::Sink => LinkAddressPort {
                    input_port: false,
                    peer_device_type: PeerDeviceType::SstSink,
                    port_number: p.num,
                    mcs: false,
                    ddps: true,
                    dpcd_revision: 0x12,
                    num_sdp_streams: 0,
                    num_sdp_stream_sinks: 0,
                    ..LinkAddressPort::default()
                },
                EmuKind::Branch(child) => LinkAddressPort {
                    input_port: false,
                    peer_device_type: PeerDeviceType::MstBranching,
                    port_number: p.num,
                    mcs: true,
                    ddps: true,
                    dpcd_revision: 0x12,
                    peer_guid: Guid(self.branches[child].guid),
                    ..LinkAddressPort::default()
                },
            })
            .collect();
        ReplyBody::Ack(AckReply::LinkAddress(LinkAddressReply {
            guid: Guid(self.branches[idx].guid),
            ports,
        }))
    }

    fn handle_request(&mut self, origin: &SidebandHeader, body: &[u8]) {
        let Ok(req) = Request::decode(body) else {
            return;
        };
        let Some(idx) = self.branch_at(&origin.rad, origin.lct) else {
            return;
        };
        let path = self.path_of(idx);
        let req_type = req.req_type();

        let reply = match req {
            Request::LinkAddress => self.link_address_reply(idx),
            Request::EnumPathResources { port_num } => {
                let port = self.branches[idx].ports.iter().find(|p| p.num == port_num);
                match port {
                    Some(p) => ReplyBody::Ack(AckReply::EnumPathResources(EnumPathResourcesReply {
                        port_number: port_num,
                        fec_capable: false,
                        full_pbn: p.full_pbn,
                        available_pbn: p.avail_pbn,
                    })),
                    None => return,
                }
            }
            Request::AllocatePayload {
                port_num,
                vcpi,
                pbn,
                ..
            } => {
                self.allocations.push((path, port_num, vcpi, pbn));
                ReplyBody::Ack(AckReply::AllocatePayload(AllocatePayloadReply {
                    port_number: port_num,
                    vcpi,
                    allocated_pbn: pbn,
                }))
            }
            Request::ClearPayloadIdTable => ReplyBody::Ack(AckReply::ClearPayloadIdTable),
            Request::RemoteDpcdWrite {
                port_num,
                address,
                bytes,
            } => {
                if address == cfg::DPCD_GUID && bytes.len() == 16 {
                    // GUID writeback targets the branch behind this port.
                    if let Some(EmuKind::Branch(child)) = self.branches[idx]
                        .ports
                        .iter()
                        .find(|p| p.num == port_num)
                        .map(|p| p.kind)
                    {
                        self.branches[child].guid.copy_from_slice(&bytes);
                    }
                }
                for (i, b) in bytes.iter().enumerate() {
                    self.remote_regs
                        .insert((path.clone(), port_num, address + i as u32), *b);
                }
                ReplyBody::Ack(AckReply::RemoteDpcdWrite {
                    port_number: port_num,
                })
            }
            Request::RemoteDpcdRead {
                port_num,
                address,
                num_bytes,
            } => {
                let bytes = (0..num_bytes)
                    .map(|i| {
                        self.remote_regs
                            .get(&(path.clone(), port_num, address + u32::from(i)))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect();
                ReplyBody::Ack(AckReply::RemoteDpcdRead {
                    port_number: port_num,
                    bytes,
                })
            }
            Request::RemoteI2cRead {
                port_num,
                transactions,
                read_num_bytes,
                ..
            } => {
                let offset = transactions
                    .first()
                    .and_then(|t| t.bytes.first())
                    .copied()
                    .unwrap_or(0) as usize;
                let blob = self.edids.get(&(path.clone(), port_num));
                let bytes: Vec<u8> = match blob {
                    Some(edid) => (0..read_num_bytes as usize)
                        .map(|i| edid.get(offset + i).copied().unwrap_or(0))
                        .collect(),
                    None => vec![0; read_num_bytes as usize],
                };
                ReplyBody::Ack(AckReply::RemoteI2cRead {
                    port_number: port_num,
                    bytes,
                })
            }
            Request::RemoteI2cWrite { port_num, .. } => ReplyBody::Ack(AckReply::RemoteI2cWrite {
                port_number: port_num,
            }),
            Request::PowerUpPhy { port_num } => ReplyBody::Ack(AckReply::PowerUpPhy {
                port_number: port_num,
            }),
            Request::PowerDownPhy { port_num } => ReplyBody::Ack(AckReply::PowerDownPhy {
                port_number: port_num,
            }),
            Request::QueryPayload { port_num, .. } => ReplyBody::Ack(AckReply::QueryPayload {
                port_number: port_num,
                allocated_pbn: 0,
            }),
        };
        let encoded = reply.encode(req_type);
        self.queue_reply(origin, &encoded);
    }
}

impl AuxChannel for EmuAux {
    fn dpcd_read(&self, address: u32, buf: &mut [u8]) -> AuxResult<usize> {
        assert!(buf.len() <= cfg::AUX_MAX_XFER, "aux budget exceeded");
        let st = self.state.lock();
        let a = address as usize;

        let down_rep = cfg::DPCD_SIDEBAND_DOWN_REP as usize;
        let up_req = cfg::DPCD_SIDEBAND_UP_REQ as usize;
        if (down_rep..down_rep + 0x200).contains(&a) {
            let offset = a - down_rep;
            let chunk = st.pending_down.front();
            for (i, b) in buf.iter_mut().enumerate() {
                *b = chunk
                    .and_then(|c| c.get(offset + i))
                    .copied()
                    .unwrap_or(0);
            }
            return Ok(buf.len());
        }
        if (up_req..up_req + 0x200).contains(&a) {
            let offset = a - up_req;
            let chunk = st.pending_up.front();
            for (i, b) in buf.iter_mut().enumerate() {
                *b = chunk
                    .and_then(|c| c.get(offset + i))
                    .copied()
                    .unwrap_or(0);
            }
            return Ok(buf.len());
        }

        buf.copy_from_slice(&st.regs[a..a + buf.len()]);
        Ok(buf.len())
    }

    fn dpcd_write(&self, address: u32, data: &[u8]) -> AuxResult<usize> {
        assert!(data.len() <= cfg::AUX_MAX_XFER, "aux budget exceeded");
        let mut st = self.state.lock();
        let a = address as usize;

        let down_req = cfg::DPCD_SIDEBAND_DOWN_REQ as usize;
        let up_rep = cfg::DPCD_SIDEBAND_UP_REP as usize;
        let esi = cfg::DPCD_DEVICE_SERVICE_IRQ_VECTOR_ESI0 as usize;

        if (down_req..down_req + 0x200).contains(&a) {
            if a == down_req {
                st.down_req_buf.clear();
            }
            st.down_req_buf.extend_from_slice(data);
            // A chunk is complete once the buffered bytes cover the length
            // its header announces.
            if let Ok((hdr, hdr_len)) = SidebandHeader::decode(&st.down_req_buf) {
                let total = hdr_len + hdr.msg_len as usize;
                if st.down_req_buf.len() >= total {
                    let chunk = st.down_req_buf[..total].to_vec();
                    st.down_req_buf.clear();
                    if let Ok(Some(msg)) = st.down_rx.push_chunk(&chunk) {
                        st.handle_request(&msg.origin, &msg.body);
                    }
                }
            }
            return Ok(data.len());
        }
        if (up_rep..up_rep + 0x200).contains(&a) {
            // Up-request acks land here; nothing to emulate beyond accepting
            // them.
            return Ok(data.len());
        }
        if a == esi {
            let cleared = data[0];
            st.regs[esi] &= !cleared;
            if cleared & cfg::DOWN_REP_MSG_RDY != 0 {
                st.pending_down.pop_front();
                if !st.pending_down.is_empty() {
                    st.regs[esi] |= cfg::DOWN_REP_MSG_RDY;
                }
            }
            if cleared & cfg::UP_REQ_MSG_RDY != 0 {
                st.pending_up.pop_front();
                if !st.pending_up.is_empty() {
                    st.regs[esi] |= cfg::UP_REQ_MSG_RDY;
                }
            }
            return Ok(data.len());
        }
        if a == cfg::DPCD_PAYLOAD_TABLE_UPDATE_STATUS as usize {
            // Write-1-to-clear status register.
            st.regs[a] &= !data[0];
            return Ok(data.len());
        }

        st.regs[a..a + data.len()].copy_from_slice(data);
        if a == cfg::DPCD_PAYLOAD_ALLOCATE_SET as usize && data.len() == 3 {
            st.local_payloads.push((data[0], data[1], data[2]));
            // The device latches the table update and, for these tests,
            // handles the ACT immediately.
            st.regs[cfg::DPCD_PAYLOAD_TABLE_UPDATE_STATUS as usize] |=
                cfg::PAYLOAD_TABLE_UPDATED | cfg::PAYLOAD_ACT_HANDLED;
        }
        Ok(data.len())
    }
}

// ======================================================================
// Harness
// ======================================================================

#[derive(Default)]
struct CountingHotplug {
    count: AtomicUsize,
}

impl HotplugSink for CountingHotplug {
    fn hotplug(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CapturingEdidSink {
    seen: Mutex<Vec<(u8, Vec<u8>)>>,
}

impl EdidSource for CapturingEdidSink {
    fn edid_read(&self, port_num: u8, edid: &[u8]) {
        self.seen.lock().push((port_num, edid.to_vec()));
    }
}

struct Harness {
    manager: Arc<MstManager>,
    aux: Arc<EmuAux>,
    hotplug: Arc<CountingHotplug>,
    edid_sink: Arc<CapturingEdidSink>,
    stop: Arc<AtomicBool>,
    pumper: Option<JoinHandle<()>>,
}

impl Harness {
    fn new(aux: Arc<EmuAux>) -> Self {
        let hotplug = Arc::new(CountingHotplug::default());
        let edid_sink = Arc::new(CapturingEdidSink::default());
        let manager = Arc::new(MstManager::new(
            Arc::clone(&aux) as Arc<dyn AuxChannel>,
            Arc::clone(&hotplug) as Arc<dyn HotplugSink>,
            Some(Arc::clone(&edid_sink) as Arc<dyn EdidSource>),
            ManagerConfig::default(),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let pumper = {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if !manager.pump() {
                        std::thread::sleep(Duration::from_micros(500));
                    }
                }
            })
        };
        Self {
            manager,
            aux,
            hotplug,
            edid_sink,
            stop,
            pumper: Some(pumper),
        }
    }

    fn start(aux: Arc<EmuAux>) -> Self {
        let h = Self::new(aux);
        h.manager.set_mst_enabled(true).unwrap();
        assert!(
            h.wait_until(|| h.hotplug.count.load(Ordering::SeqCst) >= 1),
            "initial probe never completed"
        );
        h
    }

    fn wait_until(&self, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn sink_ports(&self) -> Vec<PortInfo> {
        self.manager
            .ports()
            .into_iter()
            .filter(|p| !p.input && p.pdt == PeerDeviceType::SstSink)
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.pumper.take() {
            let _ = h.join();
        }
    }
}

// ======================================================================
// Topology fixtures
// ======================================================================

fn guid(tag: u8) -> [u8; 16] {
    let mut g = [tag; 16];
    g[0] = 0x10;
    g
}

/// Root hub with one SST sink on port 0 and one empty port 1.
fn flat_hub() -> Vec<EmuBranch> {
    vec![EmuBranch {
        guid: guid(1),
        ports: vec![
            EmuPort {
                num: 0,
                kind: EmuKind::Sink,
                full_pbn: 2048,
                avail_pbn: 2048,
            },
            EmuPort {
                num: 1,
                kind: EmuKind::Empty,
                full_pbn: 0,
                avail_pbn: 0,
            },
        ],
    }]
}

/// Root hub whose port 1 leads to a second branch with a sink on port 0.
fn nested_hub() -> Vec<EmuBranch> {
    vec![
        EmuBranch {
            guid: guid(1),
            ports: vec![EmuPort {
                num: 1,
                kind: EmuKind::Branch(1),
                full_pbn: 4096,
                avail_pbn: 4096,
            }],
        },
        EmuBranch {
            guid: guid(2),
            ports: vec![EmuPort {
                num: 0,
                kind: EmuKind::Sink,
                full_pbn: 2048,
                avail_pbn: 2048,
            }],
        },
    ]
}

/// Root hub with four independent sinks.
fn quad_sink_hub() -> Vec<EmuBranch> {
    vec![EmuBranch {
        guid: guid(1),
        ports: (0..4)
            .map(|num| EmuPort {
                num,
                kind: EmuKind::Sink,
                full_pbn: 4096,
                avail_pbn: 4096,
            })
            .collect(),
    }]
}

// ======================================================================
// Tests
// ======================================================================

#[test]
fn flat_probe_creates_two_ports_one_hotplug() {
    let h = Harness::start(EmuAux::new(flat_hub()));

    let ports = h.manager.ports();
    assert_eq!(ports.len(), 2, "both reported ports materialize");
    assert!(ports.iter().all(|p| !p.has_branch), "no child branches");

    let sink = ports.iter().find(|p| p.port_num == 0).unwrap();
    assert_eq!(sink.pdt, PeerDeviceType::SstSink);
    assert!(sink.ddps);
    assert_eq!(sink.available_pbn, 2048, "bandwidth refreshed via EPR");

    let empty = ports.iter().find(|p| p.port_num == 1).unwrap();
    assert_eq!(empty.pdt, PeerDeviceType::None);
    assert!(!empty.ddps);

    // One change signal for the whole probe cycle, not one per port.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.hotplug.count.load(Ordering::SeqCst), 1);
}

#[test]
fn nested_probe_discovers_branch_and_sink() {
    let h = Harness::start(EmuAux::new(nested_hub()));
    assert!(
        h.wait_until(|| h.manager.ports().len() == 2),
        "nested sink never appeared"
    );

    let ports = h.manager.ports();
    let trunk = ports.iter().find(|p| p.parent_lct == 1).unwrap();
    assert_eq!(trunk.pdt, PeerDeviceType::MstBranching);
    assert!(trunk.has_branch);
    assert_eq!(trunk.available_pbn, 4096);

    let sink = ports.iter().find(|p| p.parent_lct == 2).unwrap();
    assert_eq!(sink.pdt, PeerDeviceType::SstSink);
    assert_eq!(sink.parent_rad.hop(0), 1, "path goes through port 1");
    assert_eq!(sink.available_pbn, 2048);
}

#[test]
fn allocate_and_commit_programs_local_and_remote_tables() {
    let h = Harness::start(EmuAux::new(nested_hub()));
    assert!(h.wait_until(|| !h.sink_ports().is_empty()));
    let sink = h.sink_ports().remove(0);

    let payloads = h.manager.payloads();
    let slots = payloads.allocate(sink.id, 1000).unwrap();
    assert_eq!(slots, 19, "ceil(1000/54)");

    let proposed = payloads.proposed_from_vcpi();
    payloads.update_payloads_part1(&proposed).unwrap();
    payloads.check_act_status().unwrap();
    payloads.update_payloads_part2().unwrap();

    // Local table got (id=1, start=1, count=19).
    let locals = h.aux.state.lock().local_payloads.clone();
    assert!(locals.contains(&(1, 1, 19)));

    // Remote ALLOCATE_PAYLOAD reached the nested branch, addressing the
    // sink's own port.
    let allocations = h.aux.allocations();
    assert_eq!(allocations.len(), 1);
    let (path, port_num, vcpi, pbn) = &allocations[0];
    assert_eq!(path.as_slice(), &[1]);
    assert_eq!(*port_num, 0);
    assert!(*vcpi >= 1);
    assert_eq!(*pbn, 1000);

    let table = payloads.table_snapshot();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].2, 19);

    // Diagnostic opcodes ride the same path.
    assert_eq!(payloads.query_payload(sink.id).unwrap(), 0);
    h.manager.relay().set_phy_power(sink.id, true).unwrap();
}

#[test]
fn admission_rejects_overcommitted_batch_atomically() {
    let h = Harness::start(EmuAux::new(quad_sink_hub()));
    assert!(h.wait_until(|| h.sink_ports().len() == 4));

    let payloads = h.manager.payloads();
    for sink in h.sink_ports() {
        assert_eq!(payloads.allocate(sink.id, 1000).unwrap(), 19);
    }

    // 4 x 19 = 76 slots on a 63-slot link: the whole batch must bounce.
    let proposed = payloads.proposed_from_vcpi();
    let err = payloads.update_payloads_part1(&proposed).unwrap_err();
    assert!(matches!(err, PayloadError::NoBandwidth { .. }), "{err:?}");

    assert!(payloads.table_snapshot().is_empty(), "table untouched");
    assert!(h.aux.allocations().is_empty(), "no remote programming");
    assert!(h.aux.state.lock().local_payloads.is_empty());
}

#[test]
fn release_after_branch_removal_routes_to_connected_ancestor() {
    let h = Harness::start(EmuAux::new(nested_hub()));
    assert!(h.wait_until(|| !h.sink_ports().is_empty()));
    let sink = h.sink_ports().remove(0);

    let payloads = h.manager.payloads();
    payloads.allocate(sink.id, 1000).unwrap();
    let proposed = payloads.proposed_from_vcpi();
    payloads.update_payloads_part1(&proposed).unwrap();
    payloads.check_act_status().unwrap();
    payloads.update_payloads_part2().unwrap();
    assert_eq!(h.aux.allocations().len(), 1);

    // The intermediate branch unplugs while the sink still owns a payload.
    let root_guid = h.aux.root_guid();
    h.aux.inject_up(
        &[],
        &UpRequest::ConnectionStatus(mstlink::sideband::ConnectionStatusNotify {
            guid: Guid(root_guid),
            port_number: 1,
            legacy_device_plug_status: false,
            displayport_device_plug_status: false,
            message_capability_status: false,
            input_port: false,
            peer_device_type: PeerDeviceType::None,
        }),
    );
    assert!(
        h.wait_until(|| h.manager.ports().iter().all(|p| p.parent_lct == 1)),
        "subtree never pruned"
    );

    // Tear the payload down: the zero-slot message must route to the root
    // (nearest connected ancestor), addressed at the hop that led away.
    payloads.update_payloads_part1(&[]).unwrap();
    payloads.check_act_status().unwrap();
    payloads.update_payloads_part2().unwrap();

    let allocations = h.aux.allocations();
    assert_eq!(allocations.len(), 2);
    let (path, port_num, _vcpi, pbn) = &allocations[1];
    assert_eq!(path.as_slice(), &[] as &[u8], "routed to the root");
    assert_eq!(*port_num, 1, "addressed at the vanished hop");
    assert_eq!(*pbn, 0);

    // The pinned port record is gone once the table let go of it.
    assert!(payloads.table_snapshot().is_empty());
    assert!(h.wait_until(|| h
        .manager
        .ports()
        .iter()
        .all(|p| p.parent_lct == 1 && p.port_num == 1)));
}

#[test]
fn remote_dpcd_read_validates_and_returns_registers() {
    let aux = EmuAux::new(nested_hub());
    aux.set_remote_reg(&[1], 0, 0x000, 0x14);
    let h = Harness::start(aux);
    assert!(h.wait_until(|| !h.sink_ports().is_empty()));
    let sink = h.sink_ports().remove(0);

    let mut buf = [0u8; 1];
    let got = h.manager.relay().remote_dpcd_read(sink.id, 0x000, &mut buf).unwrap();
    assert_eq!(got, 1);
    assert_eq!(buf[0], 0x14);
}

#[test]
fn remote_dpcd_write_reaches_remote_register_file() {
    let h = Harness::start(EmuAux::new(nested_hub()));
    assert!(h.wait_until(|| !h.sink_ports().is_empty()));
    let sink = h.sink_ports().remove(0);

    h.manager
        .relay()
        .remote_dpcd_write(sink.id, 0x600, &[0x01])
        .unwrap();
    let st = h.aux.state.lock();
    assert_eq!(st.remote_regs.get(&(vec![1], 0, 0x600)), Some(&0x01));
}

#[test]
fn edid_fetch_over_i2c_relay() {
    let aux = EmuAux::new(flat_hub());
    let mut edid = vec![0u8; 128];
    edid[0] = 0x00;
    edid[1] = 0xff;
    edid[8] = 0x4c;
    edid[126] = 0; // no extension blocks
    aux.set_edid(&[], 0, edid.clone());

    let h = Harness::start(aux);
    let sink = h.sink_ports().remove(0);

    let got = h.manager.read_edid(sink.id).unwrap();
    assert_eq!(got, edid);

    let seen = h.edid_sink.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 0);
    assert_eq!(seen[0].1, edid);
}

#[test]
fn zero_guid_branch_gets_fabricated_identity_written_back() {
    let mut branches = flat_hub();
    branches[0].guid = [0; 16];
    let h = Harness::start(EmuAux::new(branches));

    // The engine must have fabricated a GUID and written it to the local
    // GUID register.
    let regs: Vec<u8> = {
        let st = h.aux.state.lock();
        st.regs[cfg::DPCD_GUID as usize..cfg::DPCD_GUID as usize + 16].to_vec()
    };
    assert!(regs.iter().any(|&b| b != 0), "guid register still zero");
}

#[test]
fn connection_status_notify_plugs_new_sink() {
    let h = Harness::start(EmuAux::new(flat_hub()));
    let before = h.hotplug.count.load(Ordering::SeqCst);

    let root_guid = h.aux.root_guid();
    h.aux.inject_up(
        &[],
        &UpRequest::ConnectionStatus(mstlink::sideband::ConnectionStatusNotify {
            guid: Guid(root_guid),
            port_number: 1,
            legacy_device_plug_status: false,
            displayport_device_plug_status: true,
            message_capability_status: false,
            input_port: false,
            peer_device_type: PeerDeviceType::SstSink,
        }),
    );

    assert!(h.wait_until(|| {
        h.manager
            .ports()
            .iter()
            .any(|p| p.port_num == 1 && p.pdt == PeerDeviceType::SstSink)
    }));
    assert!(h.wait_until(|| h.hotplug.count.load(Ordering::SeqCst) > before));
}

#[test]
fn resource_status_notify_refreshes_available_pbn() {
    let h = Harness::start(EmuAux::new(flat_hub()));
    let root_guid = h.aux.root_guid();

    h.aux.inject_up(
        &[],
        &UpRequest::ResourceStatus(mstlink::sideband::ResourceStatusNotify {
            port_number: 0,
            guid: Guid(root_guid),
            available_pbn: 512,
        }),
    );

    assert!(h.wait_until(|| {
        h.manager
            .ports()
            .iter()
            .any(|p| p.port_num == 0 && p.available_pbn == 512)
    }));
}

#[test]
fn suspend_resume_forces_full_reprobe() {
    let h = Harness::start(EmuAux::new(flat_hub()));
    let before = h.hotplug.count.load(Ordering::SeqCst);

    h.manager.suspend();
    // While suspended, new transactions are refused; a probe request is a
    // no-op.
    h.manager.probe_now();
    std::thread::sleep(Duration::from_millis(20));

    h.manager.resume().unwrap();
    // Resume clears remote payload tables and walks the tree again; the
    // reply set is unchanged, so the port set stays stable.
    assert!(h.wait_until(|| h.manager.ports().len() == 2));
    let _ = before;

    // Drain the re-probe before the harness tears down the event pump.
    h.manager.suspend();
}
