//! SAE J1939-22 CAN-FD Transport Protocol and Multi-PG packing.
//!
//! FD TP sessions run over FD_TP_CM/FD_TP_DT with a fixed pool of concurrent
//! session slots per direction (broadcast and peer-to-peer tracked
//! separately) rather than an unbounded map of sessions; a 4-bit session
//! index travels on the wire alongside the control type so two transfers
//! between the same address pair stay distinguishable. Multi-PG packing lets
//! several short PGs share one CAN-FD frame (PGN FEFF_MULTI_PG).

use super::filter::{Indication, Registry};
use super::pgn::{address, known};
use super::transport21::FrameSink;
use crate::error::{AutomotiveError, J1939Error, Result, TpAbortReason};
use log::debug;
use std::time::{Duration, Instant};

pub const MAX_BAM_SLOTS: u8 = 4;
pub const MAX_RTS_CTS_SLOTS: u8 = 8;
pub const T5: Duration = Duration::from_secs(3);

/// Valid CAN-FD payload lengths, ascending.
pub const FD_DLC_STEPS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Smallest CAN-FD frame length that can hold `len` bytes.
pub fn fd_frame_len_for(len: usize) -> usize {
    FD_DLC_STEPS.into_iter().find(|&step| step >= len).unwrap_or(64)
}

const FD_CTRL_RTS: u8 = 0;
const FD_CTRL_CTS: u8 = 1;
const FD_CTRL_BAM: u8 = 2;
const FD_CTRL_EOM_STATUS: u8 = 3;
const FD_CTRL_EOM_ACK: u8 = 4;
const FD_CTRL_ABORT: u8 = 5;

/// Data bytes per DT frame: the 4-byte dtfi/session/segment_num header leaves
/// 60 of a 64-byte CAN-FD frame for payload.
const BYTES_PER_DT: usize = 60;

/// Fixed format indicator for DT frames; there is only one DT shape, so this
/// is always zero and only the session nibble varies between transfers.
const DTFI: u8 = 0;

fn pgn_bytes(pgn: u32) -> [u8; 3] {
    [(pgn & 0xFF) as u8, ((pgn >> 8) & 0xFF) as u8, ((pgn >> 16) & 0xFF) as u8]
}

fn pgn_from_bytes(b: &[u8]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16)
}

fn num_segments(size: usize) -> u32 {
    ((size + BYTES_PER_DT - 1) / BYTES_PER_DT) as u32
}

/// 12-byte FD.TP.CM control frame, shared by RTS/CTS/BAM/EOM_STATUS/EOM_ACK/ABORT.
struct CmFrame {
    ctrl: u8,
    session: u8,
    field_a: u32,
    field_b: u32,
    byte7: u8,
    byte8: u8,
    pgn: u32,
}

fn build_cm(frame: &CmFrame) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0] = (frame.ctrl << 4) | (frame.session & 0x0F);
    out[1] = (frame.field_a & 0xFF) as u8;
    out[2] = ((frame.field_a >> 8) & 0xFF) as u8;
    out[3] = ((frame.field_a >> 16) & 0xFF) as u8;
    out[4] = (frame.field_b & 0xFF) as u8;
    out[5] = ((frame.field_b >> 8) & 0xFF) as u8;
    out[6] = ((frame.field_b >> 16) & 0xFF) as u8;
    out[7] = frame.byte7;
    out[8] = frame.byte8;
    let p = pgn_bytes(frame.pgn);
    out[9] = p[0];
    out[10] = p[1];
    out[11] = p[2];
    out
}

fn parse_cm(data: &[u8]) -> Option<CmFrame> {
    if data.len() < 12 {
        return None;
    }
    Some(CmFrame {
        ctrl: data[0] >> 4,
        session: data[0] & 0x0F,
        field_a: (data[1] as u32) | ((data[2] as u32) << 8) | ((data[3] as u32) << 16),
        field_b: (data[4] as u32) | ((data[5] as u32) << 8) | ((data[6] as u32) << 16),
        byte7: data[7],
        byte8: data[8],
        pgn: pgn_from_bytes(&data[9..12]),
    })
}

fn build_dt(session: u8, segment_num: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push((DTFI << 4) | (session & 0x0F));
    out.push((segment_num & 0xFF) as u8);
    out.push(((segment_num >> 8) & 0xFF) as u8);
    out.push(((segment_num >> 16) & 0xFF) as u8);
    out.extend_from_slice(payload);
    out
}

/// First unused session index below `capacity` across both directions of a pool.
fn alloc_session_index(used: impl Iterator<Item = u8>, capacity: u8) -> Option<u8> {
    let mut taken = [false; 16];
    for idx in used {
        if (idx as usize) < taken.len() {
            taken[idx as usize] = true;
        }
    }
    (0..capacity).find(|&i| !taken[i as usize])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendSessionState {
    /// Sending RTS/CTS-negotiated (or BAM-paced) DT frames.
    SendingRtsCts,
    /// Last DT sent, EOM_STATUS transmitted; waiting for the peer's EOM_ACK.
    WaitingEomAck,
}

struct FdSendSession {
    key: (u8, u8, u8), // (src, dst, session_index)
    pgn: u32,
    data: Vec<u8>,
    num_segments: u32,
    next_segment: u32,
    state: SendSessionState,
    deadline: Instant,
}

struct FdRecvSession {
    key: (u8, u8, u8), // (src, dst-or-GLOBAL, session_index)
    pgn: u32,
    size: usize,
    num_segments: u32,
    data: Vec<u8>,
    next_seq: u32,
    body_complete: bool,
    deadline: Instant,
}

struct CPgHeader {
    tos: u8,
    tf: u8,
    cpgn: u32,
    length: u8,
}

fn encode_cpg_header(header: &CPgHeader) -> [u8; 4] {
    let word: u32 =
        (header.tos as u32 & 0x7) | ((header.tf as u32 & 0x7) << 3) | ((header.cpgn & 0x3_FFFF) << 6) | ((header.length as u32) << 24);
    word.to_le_bytes()
}

fn decode_cpg_header(bytes: &[u8]) -> CPgHeader {
    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    CPgHeader {
        tos: (word & 0x7) as u8,
        tf: ((word >> 3) & 0x7) as u8,
        cpgn: (word >> 6) & 0x3_FFFF,
        length: ((word >> 24) & 0xFF) as u8,
    }
}

/// Pack several small PGs (each `(tos, tf, cpgn, payload)`) behind one 4-byte
/// C-PG header apiece into a single Multi-PG CAN-FD frame, ending with a
/// 3-byte zero service header and 0xAA padding to the next legal DLC step.
pub fn multi_pg_pack(entries: &[(u8, u8, u32, &[u8])]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (tos, tf, cpgn, payload) in entries {
        if payload.len() > 255 {
            return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
        }
        out.extend_from_slice(&encode_cpg_header(&CPgHeader { tos: *tos, tf: *tf, cpgn: *cpgn, length: payload.len() as u8 }));
        out.extend_from_slice(payload);
    }
    out.extend_from_slice(&[0, 0, 0]);
    let frame_len = fd_frame_len_for(out.len());
    out.resize(frame_len, 0xAA);
    Ok(out)
}

/// Unpack a Multi-PG frame back into `(tos, tf, cpgn, payload)` entries,
/// stopping at the zero service header that precedes the padding.
pub fn multi_pg_unpack(data: &[u8]) -> Vec<(u8, u8, u32, Vec<u8>)> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + 3 <= data.len() {
        if data[offset] == 0 && data[offset + 1] == 0 && data[offset + 2] == 0 {
            break;
        }
        if offset + 4 > data.len() {
            break;
        }
        let header = decode_cpg_header(&data[offset..offset + 4]);
        let start = offset + 4;
        let end = start + header.length as usize;
        if end > data.len() {
            break;
        }
        entries.push((header.tos, header.tf, header.cpgn, data[start..end].to_vec()));
        offset = end;
    }
    entries
}

struct MultiPgEntry {
    tos: u8,
    tf: u8,
    cpgn: u32,
    payload: Vec<u8>,
    priority: u8,
}

struct MultiPgBuffer {
    slot: u8,
    src: u8,
    dst: u8,
    entries: Vec<MultiPgEntry>,
    content_len: usize,
    deadline: Instant,
}

/// Accumulates small PGs per `(slot, src, dst)` and flushes them as one
/// Multi-PG frame, either because a new entry no longer fits or because the
/// buffer's `time_limit` elapsed.
pub struct MultiPgPacker {
    buffers: Vec<MultiPgBuffer>,
}

impl MultiPgPacker {
    pub fn new() -> Self {
        MultiPgPacker { buffers: Vec::new() }
    }

    /// Queue one small PG. `slot` lets a caller keep independent buffers for
    /// the same `(src, dst)` pair, e.g. one per priority band.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        slot: u8,
        src: u8,
        dst: u8,
        priority: u8,
        tos: u8,
        tf: u8,
        cpgn: u32,
        payload: &[u8],
        time_limit: Duration,
        now: Instant,
        sink: &dyn FrameSink,
    ) -> Result<()> {
        if payload.len() > 255 {
            return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
        }
        let entry_len = 4 + payload.len();
        if let Some(idx) = self.buffers.iter().position(|b| b.slot == slot && b.src == src && b.dst == dst) {
            if self.buffers[idx].content_len + entry_len + 3 <= 60 {
                let buffer = &mut self.buffers[idx];
                buffer.content_len += entry_len;
                buffer.entries.push(MultiPgEntry { tos, tf, cpgn, payload: payload.to_vec(), priority });
                return Ok(());
            }
            self.flush_index(idx, sink)?;
        }
        self.buffers.push(MultiPgBuffer {
            slot,
            src,
            dst,
            entries: vec![MultiPgEntry { tos, tf, cpgn, payload: payload.to_vec(), priority }],
            content_len: entry_len,
            deadline: now + time_limit,
        });
        Ok(())
    }

    fn flush_index(&mut self, idx: usize, sink: &dyn FrameSink) -> Result<()> {
        let buffer = self.buffers.remove(idx);
        if buffer.entries.is_empty() {
            return Ok(());
        }
        let min_priority = buffer.entries.iter().map(|e| e.priority).min().unwrap_or(7);
        let entries: Vec<(u8, u8, u32, &[u8])> =
            buffer.entries.iter().map(|e| (e.tos, e.tf, e.cpgn, e.payload.as_slice())).collect();
        let out = multi_pg_pack(&entries)?;
        sink.send_frame(min_priority, known::FEFF_MULTI_PG, buffer.src, buffer.dst, &out)
    }

    /// Flush any buffer past its deadline; returns the next wakeup instant.
    pub fn tick(&mut self, now: Instant, sink: &dyn FrameSink) -> Option<Instant> {
        let mut next = None;
        let mut idx = 0;
        while idx < self.buffers.len() {
            if self.buffers[idx].deadline <= now {
                let _ = self.flush_index(idx, sink);
            } else {
                next = Some(next.map_or(self.buffers[idx].deadline, |cur: Instant| cur.min(self.buffers[idx].deadline)));
                idx += 1;
            }
        }
        next
    }
}

impl Default for MultiPgPacker {
    fn default() -> Self {
        Self::new()
    }
}

/// J1939-22 FD transport engine, bounded to a fixed number of concurrent sessions.
pub struct Transport22 {
    bam_sessions: Vec<FdSendSession>,
    rts_sessions: Vec<FdSendSession>,
    bam_recv: Vec<FdRecvSession>,
    rts_recv: Vec<FdRecvSession>,
    pub multi_pg: MultiPgPacker,
}

impl Transport22 {
    pub fn new() -> Self {
        Transport22 {
            bam_sessions: Vec::new(),
            rts_sessions: Vec::new(),
            bam_recv: Vec::new(),
            rts_recv: Vec::new(),
            multi_pg: MultiPgPacker::new(),
        }
    }

    pub fn send_pgn(&mut self, priority: u8, pgn: u32, src: u8, dst: u8, data: &[u8], sink: &dyn FrameSink) -> Result<()> {
        let is_broadcast = dst == address::GLOBAL || super::pgn::pgn_is_pdu2(pgn);
        let segments = num_segments(data.len());

        if is_broadcast {
            let active = self.bam_sessions.len() + self.bam_recv.len();
            if active >= MAX_BAM_SLOTS as usize {
                return Err(AutomotiveError::J1939Error(J1939Error::ResourcesExhausted));
            }
            let session = alloc_session_index(
                self.bam_sessions.iter().map(|s| s.key.2).chain(self.bam_recv.iter().map(|s| s.key.2)),
                MAX_BAM_SLOTS,
            )
            .ok_or(AutomotiveError::J1939Error(J1939Error::ResourcesExhausted))?;
            let cm = build_cm(&CmFrame {
                ctrl: FD_CTRL_BAM,
                session,
                field_a: data.len() as u32,
                field_b: segments,
                byte7: 0xFF,
                byte8: 0xFF,
                pgn,
            });
            sink.send_frame(priority, known::FD_TP_CM, src, address::GLOBAL, &cm)?;
            self.bam_sessions.push(FdSendSession {
                key: (src, dst, session),
                pgn,
                data: data.to_vec(),
                num_segments: segments,
                next_segment: 1,
                state: SendSessionState::SendingRtsCts,
                deadline: Instant::now(),
            });
        } else {
            let active = self.rts_sessions.len() + self.rts_recv.len();
            if active >= MAX_RTS_CTS_SLOTS as usize {
                return Err(AutomotiveError::J1939Error(J1939Error::ResourcesExhausted));
            }
            let session = alloc_session_index(
                self.rts_sessions.iter().map(|s| s.key.2).chain(self.rts_recv.iter().map(|s| s.key.2)),
                MAX_RTS_CTS_SLOTS,
            )
            .ok_or(AutomotiveError::J1939Error(J1939Error::ResourcesExhausted))?;
            let cm = build_cm(&CmFrame {
                ctrl: FD_CTRL_RTS,
                session,
                field_a: data.len() as u32,
                field_b: segments,
                byte7: 0xFF,
                byte8: 0xFF,
                pgn,
            });
            sink.send_frame(priority, known::FD_TP_CM, src, dst, &cm)?;
            self.rts_sessions.push(FdSendSession {
                key: (src, dst, session),
                pgn,
                data: data.to_vec(),
                num_segments: segments,
                next_segment: 1,
                state: SendSessionState::SendingRtsCts,
                deadline: Instant::now() + T5,
            });
        }
        Ok(())
    }

    pub fn notify(
        &mut self,
        priority: u8,
        pgn: u32,
        source: u8,
        destination: u8,
        timestamp: f64,
        data: &[u8],
        sink: &dyn FrameSink,
        registry: &Registry,
    ) {
        if pgn == known::FD_TP_CM {
            self.process_cm(priority, source, destination, data, sink, registry);
        } else if pgn == known::FD_TP_DT {
            self.process_dt(source, destination, timestamp, data, registry);
        }
    }

    fn process_cm(&mut self, priority: u8, source: u8, destination: u8, data: &[u8], sink: &dyn FrameSink, registry: &Registry) {
        let Some(cm) = parse_cm(data) else {
            return;
        };
        match cm.ctrl {
            FD_CTRL_RTS => self.on_rts(priority, source, destination, &cm, sink),
            FD_CTRL_CTS => self.on_cts(source, destination, &cm),
            FD_CTRL_BAM => self.on_bam(source, &cm),
            FD_CTRL_EOM_STATUS => self.on_eom_status(priority, source, destination, &cm, sink, registry),
            FD_CTRL_EOM_ACK => {
                self.rts_sessions.retain(|s| s.key != (destination, source, cm.session));
            }
            FD_CTRL_ABORT => {
                self.rts_sessions.retain(|s| s.key != (destination, source, cm.session));
                self.rts_recv.retain(|s| s.key != (destination, source, cm.session));
            }
            other => debug!("FD_TP_CM: unhandled control type {:#x}", other),
        }
    }

    fn on_rts(&mut self, priority: u8, source: u8, destination: u8, cm: &CmFrame, sink: &dyn FrameSink) {
        let active = self.rts_sessions.len() + self.rts_recv.len();
        if active >= MAX_RTS_CTS_SLOTS as usize {
            let abort = build_cm(&CmFrame {
                ctrl: FD_CTRL_ABORT,
                session: cm.session,
                field_a: 0xFFFFFF,
                field_b: 0xFFFFFF,
                byte7: TpAbortReason::Resources.code(),
                byte8: 0xFF,
                pgn: cm.pgn,
            });
            let _ = sink.send_frame(priority, known::FD_TP_CM, destination, source, &abort);
            return;
        }
        let key = (source, destination, cm.session);
        let size = cm.field_a as usize;
        self.rts_recv.push(FdRecvSession {
            key,
            pgn: cm.pgn,
            size,
            num_segments: cm.field_b,
            data: Vec::with_capacity(size),
            next_seq: 1,
            body_complete: false,
            deadline: Instant::now() + T5,
        });
        let cts = build_cm(&CmFrame {
            ctrl: FD_CTRL_CTS,
            session: cm.session,
            field_a: 0xFFFFFF,
            field_b: 0xFFFFFF,
            byte7: cm.field_b.min(255) as u8,
            byte8: 1,
            pgn: cm.pgn,
        });
        let _ = sink.send_frame(priority, known::FD_TP_CM, destination, source, &cts);
    }

    fn on_cts(&mut self, source: u8, destination: u8, cm: &CmFrame) {
        let key = (destination, source, cm.session);
        if let Some(session) = self.rts_sessions.iter_mut().find(|s| s.key == key) {
            session.deadline = Instant::now();
        }
    }

    fn on_bam(&mut self, source: u8, cm: &CmFrame) {
        let key = (source, address::GLOBAL, cm.session);
        let size = cm.field_a as usize;
        self.bam_recv.retain(|s| s.key.0 != source);
        self.bam_recv.push(FdRecvSession {
            key,
            pgn: cm.pgn,
            size,
            num_segments: cm.field_b,
            data: Vec::with_capacity(size),
            next_seq: 1,
            body_complete: false,
            deadline: Instant::now() + T5,
        });
    }

    fn on_eom_status(&mut self, priority: u8, source: u8, destination: u8, cm: &CmFrame, sink: &dyn FrameSink, registry: &Registry) {
        let key = (source, destination, cm.session);
        let Some(idx) = self.rts_recv.iter().position(|s| s.key == key) else {
            return;
        };
        let matches = self.rts_recv[idx].body_complete
            && self.rts_recv[idx].size == cm.field_a as usize
            && self.rts_recv[idx].num_segments == cm.field_b;
        if !matches {
            let abort = build_cm(&CmFrame {
                ctrl: FD_CTRL_ABORT,
                session: cm.session,
                field_a: 0xFFFFFF,
                field_b: 0xFFFFFF,
                byte7: TpAbortReason::CtsWhileDt.code(),
                byte8: 0xFF,
                pgn: cm.pgn,
            });
            let _ = sink.send_frame(priority, known::FD_TP_CM, destination, source, &abort);
            self.rts_recv.remove(idx);
            return;
        }
        let session = self.rts_recv.remove(idx);
        let ack = build_cm(&CmFrame {
            ctrl: FD_CTRL_EOM_ACK,
            session: cm.session,
            field_a: cm.field_a,
            field_b: cm.field_b,
            byte7: 0xFF,
            byte8: 0xFF,
            pgn: cm.pgn,
        });
        let _ = sink.send_frame(priority, known::FD_TP_CM, destination, source, &ack);
        registry.notify(&Indication {
            priority: 6,
            pgn: session.pgn,
            source_address: source,
            destination,
            timestamp: 0.0,
            data: session.data,
        });
    }

    fn process_dt(&mut self, source: u8, destination: u8, timestamp: f64, data: &[u8], registry: &Registry) {
        if data.len() < 4 {
            return;
        }
        let session = data[0] & 0x0F;
        let seq = (data[1] as u32) | ((data[2] as u32) << 8) | ((data[3] as u32) << 16);
        let payload = &data[4..];

        let is_broadcast = destination == address::GLOBAL;
        let key = if is_broadcast { (source, address::GLOBAL, session) } else { (source, destination, session) };
        let sessions = if is_broadcast { &mut self.bam_recv } else { &mut self.rts_recv };
        let Some(idx) = sessions.iter().position(|s| s.key == key) else {
            return;
        };
        {
            let recv = &mut sessions[idx];
            if seq != recv.next_seq {
                return;
            }
            let remaining = recv.size.saturating_sub(recv.data.len());
            let take = remaining.min(payload.len());
            recv.data.extend_from_slice(&payload[..take]);
            recv.next_seq += 1;
            if recv.data.len() >= recv.size {
                recv.body_complete = true;
            }
        }

        // Broadcast (BAM) transfers have no peer to exchange EOM_STATUS/EOM_ACK
        // with, so reassembly completion is itself the terminal event.
        if is_broadcast && sessions[idx].body_complete {
            let session = self.bam_recv.remove(idx);
            registry.notify(&Indication {
                priority: 6,
                pgn: session.pgn,
                source_address: source,
                destination,
                timestamp,
                data: session.data,
            });
        }
    }

    pub fn tick(&mut self, now: Instant, sink: &dyn FrameSink) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut bump = |d: Instant, n: &mut Option<Instant>| *n = Some(n.map_or(d, |c| c.min(d)));

        for idx in (0..self.rts_sessions.len()).rev() {
            if self.rts_sessions[idx].deadline > now {
                bump(self.rts_sessions[idx].deadline, &mut next);
                continue;
            }
            let remove = self.advance_rts_session(idx, now, sink);
            if remove {
                self.rts_sessions.remove(idx);
            } else {
                bump(self.rts_sessions[idx].deadline, &mut next);
            }
        }

        for idx in (0..self.bam_sessions.len()).rev() {
            let finished = {
                let session = &mut self.bam_sessions[idx];
                let seg = session.next_segment;
                if seg > session.num_segments {
                    true
                } else {
                    let offset = (seg as usize - 1) * BYTES_PER_DT;
                    let available = session.data.len().saturating_sub(offset).min(BYTES_PER_DT);
                    let frame = build_dt(session.key.2, seg, &session.data[offset..offset + available]);
                    let _ = sink.send_frame(7, known::FD_TP_DT, session.key.0, address::GLOBAL, &frame);
                    session.next_segment += 1;
                    session.next_segment > session.num_segments
                }
            };
            if finished {
                self.bam_sessions.remove(idx);
            }
        }

        for session in self.rts_recv.iter().chain(self.bam_recv.iter()) {
            if session.deadline > now {
                bump(session.deadline, &mut next);
            }
        }
        self.rts_recv.retain(|s| s.deadline > now);
        self.bam_recv.retain(|s| s.deadline > now);

        if let Some(deadline) = self.multi_pg.tick(now, sink) {
            bump(deadline, &mut next);
        }

        next
    }

    /// Advance one RTS/CTS send session whose deadline elapsed. Returns `true`
    /// once the session is finished (acked or timed out) and should be dropped.
    fn advance_rts_session(&mut self, idx: usize, now: Instant, sink: &dyn FrameSink) -> bool {
        let session = &mut self.rts_sessions[idx];
        match session.state {
            SendSessionState::WaitingEomAck => true, // T5 elapsed with no EOM_ACK
            SendSessionState::SendingRtsCts => {
                let seg = session.next_segment;
                if seg > session.num_segments {
                    let eom_status = build_cm(&CmFrame {
                        ctrl: FD_CTRL_EOM_STATUS,
                        session: session.key.2,
                        field_a: session.data.len() as u32,
                        field_b: session.num_segments,
                        byte7: 0xFF,
                        byte8: 0xFF,
                        pgn: session.pgn,
                    });
                    let _ = sink.send_frame(7, known::FD_TP_CM, session.key.0, session.key.1, &eom_status);
                    session.state = SendSessionState::WaitingEomAck;
                    session.deadline = now + T5;
                    false
                } else {
                    let offset = (seg as usize - 1) * BYTES_PER_DT;
                    let available = session.data.len().saturating_sub(offset).min(BYTES_PER_DT);
                    let frame = build_dt(session.key.2, seg, &session.data[offset..offset + available]);
                    let _ = sink.send_frame(7, known::FD_TP_DT, session.key.0, session.key.1, &frame);
                    session.next_segment += 1;
                    session.deadline = now;
                    false
                }
            }
        }
    }
}

impl Default for Transport22 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingSink {
        frames: RefCell<Vec<(u8, u32, u8, u8, Vec<u8>)>>,
    }
    impl RecordingSink {
        fn new() -> Self {
            RecordingSink { frames: RefCell::new(Vec::new()) }
        }
    }
    impl FrameSink for RecordingSink {
        fn send_frame(&self, priority: u8, pgn: u32, src: u8, dst: u8, data: &[u8]) -> Result<()> {
            self.frames.borrow_mut().push((priority, pgn, src, dst, data.to_vec()));
            Ok(())
        }
    }

    fn deliver(tp: &mut Transport22, frame: &(u8, u32, u8, u8, Vec<u8>), sink: &RecordingSink, registry: &Registry) {
        tp.notify(frame.0, frame.1, frame.2, frame.3, 0.0, &frame.4, sink, registry);
    }

    #[test]
    fn fd_dlc_stepping() {
        assert_eq!(fd_frame_len_for(0), 0);
        assert_eq!(fd_frame_len_for(5), 5);
        assert_eq!(fd_frame_len_for(9), 12);
        assert_eq!(fd_frame_len_for(60), 64);
    }

    #[test]
    fn cpg_roundtrip() {
        let a = vec![1u8, 2, 3];
        let b = vec![4u8, 5];
        let packed = multi_pg_pack(&[(1, 0, 0x1234, &a), (2, 0, 0x5678, &b)]).unwrap();
        let unpacked = multi_pg_unpack(&packed);
        assert_eq!(unpacked, vec![(1, 0, 0x1234, a), (2, 0, 0x5678, b)]);
    }

    #[test]
    fn multi_pg_packer_flushes_on_overflow() {
        let mut packer = MultiPgPacker::new();
        let sink = RecordingSink::new();
        let now = Instant::now();
        let big = vec![0xABu8; 50];
        packer.push(0, 0x10, 0x20, 6, 1, 0, 0x100, &big, Duration::from_secs(1), now, &sink).unwrap();
        // second entry doesn't fit alongside the first (50 + 4 + 10 + 3 > 60) -> flush then start anew.
        packer.push(0, 0x10, 0x20, 6, 1, 0, 0x200, &[0xCDu8; 10], Duration::from_secs(1), now, &sink).unwrap();
        assert_eq!(sink.frames.borrow().len(), 1);
    }

    #[test]
    fn multi_pg_packer_flushes_on_deadline() {
        let mut packer = MultiPgPacker::new();
        let sink = RecordingSink::new();
        let now = Instant::now();
        packer.push(0, 0x10, 0x20, 6, 1, 0, 0x100, &[1, 2, 3], Duration::from_millis(10), now, &sink).unwrap();
        assert!(sink.frames.borrow().is_empty());
        packer.tick(now + Duration::from_millis(20), &sink);
        assert_eq!(sink.frames.borrow().len(), 1);
    }

    #[test]
    fn bam_slot_pool_bounded() {
        let mut tp = Transport22::new();
        let sink = RecordingSink::new();
        for i in 0..MAX_BAM_SLOTS {
            tp.send_pgn(6, known::DM01, i, address::GLOBAL, &[0u8; 100], &sink).unwrap();
        }
        let err = tp.send_pgn(6, known::DM01, 0xAA, address::GLOBAL, &[0u8; 100], &sink).unwrap_err();
        assert!(matches!(err, AutomotiveError::J1939Error(J1939Error::ResourcesExhausted)));
    }

    #[test]
    fn two_concurrent_sessions_same_address_pair_use_distinct_indices() {
        let mut tp = Transport22::new();
        let sink = RecordingSink::new();
        tp.send_pgn(6, known::DM14, 0x90, 0x9B, &[0u8; 150], &sink).unwrap();
        tp.send_pgn(6, known::DM14, 0x90, 0x9B, &[1u8; 150], &sink).unwrap();
        assert_eq!(tp.rts_sessions.len(), 2);
        assert_ne!(tp.rts_sessions[0].key.2, tp.rts_sessions[1].key.2);
    }

    #[test]
    fn rts_cts_fd_roundtrip_with_eom_handshake() {
        let registry = Registry::new();
        let mut sender = Transport22::new();
        let mut receiver = Transport22::new();
        let sender_sink = RecordingSink::new();
        let receiver_sink = RecordingSink::new();
        let payload: Vec<u8> = (0..150u8).cycle().take(150).collect();

        sender.send_pgn(6, known::DM14, 0x90, 0x9B, &payload, &sender_sink).unwrap();
        let rts = sender_sink.frames.borrow()[0].clone();
        deliver(&mut receiver, &rts, &receiver_sink, &registry);

        let cts = receiver_sink.frames.borrow().last().unwrap().clone();
        deliver(&mut sender, &cts, &sender_sink, &registry);

        let mut now = Instant::now();
        sender.tick(now, &sender_sink);

        let dt_frames: Vec<_> = sender_sink.frames.borrow().iter().filter(|f| f.1 == known::FD_TP_DT).cloned().collect();
        for dt in &dt_frames {
            deliver(&mut receiver, dt, &receiver_sink, &registry);
        }
        assert!(receiver.rts_recv[0].body_complete);
        assert_eq!(sender.rts_sessions[0].state, SendSessionState::SendingRtsCts);

        now += Duration::from_millis(1);
        sender.tick(now, &sender_sink);
        assert_eq!(sender.rts_sessions[0].state, SendSessionState::WaitingEomAck);

        let eom_status = sender_sink.frames.borrow().iter().rev().find(|f| f.1 == known::FD_TP_CM).unwrap().clone();
        deliver(&mut receiver, &eom_status, &receiver_sink, &registry);
        assert!(receiver.rts_recv.is_empty());

        let eom_ack = receiver_sink.frames.borrow().last().unwrap().clone();
        deliver(&mut sender, &eom_ack, &sender_sink, &registry);
        assert!(sender.rts_sessions.is_empty());
    }
}
