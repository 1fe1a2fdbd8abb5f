//! SAE J1939-21 Transport Protocol (TP.CM / TP.DT): RTS/CTS peer-to-peer
//! sessions with flow control, and BAM broadcast sessions. Reassembles and
//! segments payloads larger than a single 8-byte frame.

use super::filter::{Indication, Registry};
use super::pgn::{address, known};
use crate::error::{AutomotiveError, J1939Error, Result, TpAbortReason};
use log::{debug, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const CTRL_RTS: u8 = 16;
const CTRL_CTS: u8 = 17;
const CTRL_EOM_ACK: u8 = 19;
const CTRL_BAM: u8 = 32;
const CTRL_ABORT: u8 = 255;

/// SAE J1939-21 timing constants.
pub mod timeout {
    use std::time::Duration;
    pub const TR: Duration = Duration::from_millis(200);
    pub const TH: Duration = Duration::from_millis(500);
    pub const T1: Duration = Duration::from_millis(750);
    pub const T2: Duration = Duration::from_millis(1250);
    pub const T3: Duration = Duration::from_millis(1250);
    pub const T4: Duration = Duration::from_millis(1050);
    pub const TB_DEFAULT: Duration = Duration::from_millis(50);
}

/// A function that transmits one already-framed CAN message: `(priority, pgn, src, dst, data)`.
pub trait FrameSink {
    fn send_frame(&self, priority: u8, pgn: u32, src: u8, dst: u8, data: &[u8]) -> Result<()>;
}

impl<F: Fn(u8, u32, u8, u8, &[u8]) -> Result<()>> FrameSink for F {
    fn send_frame(&self, priority: u8, pgn: u32, src: u8, dst: u8, data: &[u8]) -> Result<()> {
        self(priority, pgn, src, dst, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    WaitingCts,
    SendingInCts,
    SendingBam,
}

struct SendBuffer {
    pgn: u32,
    priority: u8,
    data: Vec<u8>,
    num_segments: u8,
    state: SendState,
    deadline: Instant,
    next_segment_to_send: u8,
    next_wait_on_cts: u8,
    bam_interval: Duration,
}

struct RecvBuffer {
    pgn: u32,
    size: usize,
    num_segments: u8,
    next_seq: u8,
    max_segments_per_cts: u8,
    data: Vec<u8>,
    deadline: Instant,
    is_broadcast: bool,
}

type Key = (u8, u8); // (src, dst)

/// J1939-21 transport engine: reassembles/segments payloads for a single ECU.
pub struct Transport21 {
    max_cmdt_packets: u8,
    min_rts_cts_dt_interval: Option<Duration>,
    min_bam_dt_interval: Duration,
    send_buffers: HashMap<Key, SendBuffer>,
    recv_buffers: HashMap<Key, RecvBuffer>,
}

fn num_segments(size: usize) -> u8 {
    (((size + 6) / 7) as u32).min(255) as u8
}

fn pgn_bytes(pgn: u32) -> [u8; 3] {
    [(pgn & 0xFF) as u8, ((pgn >> 8) & 0xFF) as u8, ((pgn >> 16) & 0xFF) as u8]
}

fn pgn_from_bytes(b: &[u8]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16)
}

impl Transport21 {
    pub fn new(
        max_cmdt_packets: u8,
        min_rts_cts_dt_interval: Option<Duration>,
        min_bam_dt_interval: Option<Duration>,
    ) -> Self {
        Transport21 {
            max_cmdt_packets,
            min_rts_cts_dt_interval,
            min_bam_dt_interval: min_bam_dt_interval.unwrap_or(timeout::TB_DEFAULT),
            send_buffers: HashMap::new(),
            recv_buffers: HashMap::new(),
        }
    }

    /// Begin (or immediately complete) an outbound transfer. Payloads of 8 bytes
    /// or fewer are not this engine's concern; callers should send them directly.
    pub fn send_pgn(
        &mut self,
        priority: u8,
        pgn: u32,
        src: u8,
        dst: u8,
        data: &[u8],
        sink: &dyn FrameSink,
    ) -> Result<()> {
        let key = (src, dst);
        if self.send_buffers.contains_key(&key) {
            return Err(AutomotiveError::J1939Error(J1939Error::BusyLocal));
        }

        let segments = num_segments(data.len());
        let is_broadcast = dst == address::GLOBAL || super::pgn::pgn_is_pdu2(pgn);

        if is_broadcast {
            let cm = [
                CTRL_BAM,
                (data.len() & 0xFF) as u8,
                ((data.len() >> 8) & 0xFF) as u8,
                segments,
                0xFF,
                pgn_bytes(pgn)[0],
                pgn_bytes(pgn)[1],
                pgn_bytes(pgn)[2],
            ];
            sink.send_frame(priority, known::TP_CM, src, address::GLOBAL, &cm)?;
            self.send_buffers.insert(
                key,
                SendBuffer {
                    pgn,
                    priority,
                    data: data.to_vec(),
                    num_segments: segments,
                    state: SendState::SendingBam,
                    deadline: Instant::now(),
                    next_segment_to_send: 1,
                    next_wait_on_cts: 0,
                    bam_interval: self.min_bam_dt_interval,
                },
            );
        } else {
            let cm = [
                CTRL_RTS,
                (data.len() & 0xFF) as u8,
                ((data.len() >> 8) & 0xFF) as u8,
                segments,
                self.max_cmdt_packets,
                pgn_bytes(pgn)[0],
                pgn_bytes(pgn)[1],
                pgn_bytes(pgn)[2],
            ];
            sink.send_frame(priority, known::TP_CM, src, dst, &cm)?;
            self.send_buffers.insert(
                key,
                SendBuffer {
                    pgn,
                    priority,
                    data: data.to_vec(),
                    num_segments: segments,
                    state: SendState::WaitingCts,
                    deadline: Instant::now() + timeout::T3,
                    next_segment_to_send: 1,
                    next_wait_on_cts: 0,
                    bam_interval: Duration::from_millis(0),
                },
            );
        }
        Ok(())
    }

    pub fn is_busy(&self, src: u8, dst: u8) -> bool {
        self.send_buffers.contains_key(&(src, dst)) || self.recv_buffers.contains_key(&(src, dst))
    }

    /// Handle an inbound PGN. `pgn` must be one of TP_CM or DATATRANSFER; other
    /// PGNs are not this engine's concern and should go straight to the registry.
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
        if pgn == known::TP_CM {
            self.process_tp_cm(priority, source, destination, data, sink);
        } else if pgn == known::DATATRANSFER {
            self.process_tp_dt(source, destination, timestamp, data, sink, registry);
        }
    }

    fn process_tp_cm(&mut self, priority: u8, source: u8, destination: u8, data: &[u8], sink: &dyn FrameSink) {
        if data.len() < 8 {
            return;
        }
        match data[0] {
            CTRL_RTS => self.on_rts(priority, source, destination, data, sink),
            CTRL_CTS => self.on_cts(source, destination, data, sink),
            CTRL_EOM_ACK => self.on_eom_ack(source, destination),
            CTRL_BAM => self.on_bam(source, data),
            CTRL_ABORT => self.on_abort(source, destination),
            other => debug!("TP.CM: unhandled control byte {:#04x}", other),
        }
    }

    fn on_rts(&mut self, priority: u8, source: u8, destination: u8, data: &[u8], sink: &dyn FrameSink) {
        let key = (source, destination);
        let size = (data[1] as usize) | ((data[2] as usize) << 8);
        let segments = data[3];
        let sender_max = data[4];
        let pgn = pgn_from_bytes(&data[5..8]);

        if self.recv_buffers.contains_key(&key) {
            let abort = abort_frame(pgn, TpAbortReason::Busy);
            let _ = sink.send_frame(priority, known::TP_CM, destination, source, &abort);
            return;
        }

        let max_segments_per_cts = if sender_max == 0 { 1 } else { self.max_cmdt_packets.min(sender_max.max(1)) };
        self.recv_buffers.insert(
            key,
            RecvBuffer {
                pgn,
                size,
                num_segments: segments,
                next_seq: 1,
                max_segments_per_cts,
                data: Vec::with_capacity(size),
                deadline: Instant::now() + timeout::T2,
                is_broadcast: false,
            },
        );

        let cts = [
            CTRL_CTS,
            max_segments_per_cts,
            1,
            0xFF,
            0xFF,
            pgn_bytes(pgn)[0],
            pgn_bytes(pgn)[1],
            pgn_bytes(pgn)[2],
        ];
        let _ = sink.send_frame(priority, known::TP_CM, destination, source, &cts);
    }

    fn on_cts(&mut self, source: u8, destination: u8, data: &[u8], sink: &dyn FrameSink) {
        // We are the sender; key is (us=destination, peer=source) i.e. (src,dst) of our own send buffer.
        let key = (destination, source);
        let requested_packets = data[1];
        let next = data[2];
        let pgn = pgn_from_bytes(&data[5..8]);

        let Some(buffer) = self.send_buffers.get_mut(&key) else {
            let abort = abort_frame(pgn, TpAbortReason::Resources);
            let _ = sink.send_frame(6, known::TP_CM, destination, source, &abort);
            return;
        };

        if requested_packets == 0 {
            buffer.state = SendState::WaitingCts;
            buffer.deadline = Instant::now() + timeout::TH;
            return;
        }

        let remaining = buffer.num_segments.saturating_sub(next.saturating_sub(1));
        let packets = requested_packets.min(remaining).min(buffer.num_segments);
        buffer.next_segment_to_send = next.max(1);
        buffer.next_wait_on_cts = buffer.next_segment_to_send.saturating_add(packets).saturating_sub(1);
        buffer.state = SendState::SendingInCts;
        buffer.deadline = Instant::now();
    }

    fn on_eom_ack(&mut self, source: u8, destination: u8) {
        self.send_buffers.remove(&(destination, source));
    }

    fn on_bam(&mut self, source: u8, data: &[u8]) {
        let size = (data[1] as usize) | ((data[2] as usize) << 8);
        let segments = data[3];
        let pgn = pgn_from_bytes(&data[5..8]);
        let key = (source, address::GLOBAL);
        // A fresh BAM silently replaces any existing buffer from the same source.
        self.recv_buffers.insert(
            key,
            RecvBuffer {
                pgn,
                size,
                num_segments: segments,
                next_seq: 1,
                max_segments_per_cts: segments,
                data: Vec::with_capacity(size),
                deadline: Instant::now() + timeout::T1,
                is_broadcast: true,
            },
        );
    }

    fn on_abort(&mut self, source: u8, destination: u8) {
        self.send_buffers.remove(&(destination, source));
        self.recv_buffers.remove(&(destination, source));
        self.recv_buffers.remove(&(source, address::GLOBAL));
    }

    fn process_tp_dt(
        &mut self,
        source: u8,
        destination: u8,
        timestamp: f64,
        data: &[u8],
        sink: &dyn FrameSink,
        registry: &Registry,
    ) {
        if data.is_empty() {
            return;
        }
        let seq = data[0];
        let payload = &data[1..];

        let key = if destination == address::GLOBAL {
            (source, address::GLOBAL)
        } else {
            (source, destination)
        };

        let Some(buffer) = self.recv_buffers.get_mut(&key) else {
            return;
        };

        if seq != buffer.next_seq {
            warn!("TP.DT: out-of-order sequence {} (expected {})", seq, buffer.next_seq);
            return;
        }

        let remaining = buffer.size.saturating_sub(buffer.data.len());
        let take = remaining.min(payload.len());
        buffer.data.extend_from_slice(&payload[..take]);
        buffer.next_seq = buffer.next_seq.wrapping_add(1);
        buffer.deadline = Instant::now() + if buffer.is_broadcast { timeout::T1 } else { timeout::T1 };

        if buffer.data.len() >= buffer.size {
            let pgn = buffer.pgn;
            let size = buffer.size;
            let segments = buffer.num_segments;
            let payload = std::mem::take(&mut buffer.data);
            let is_broadcast = buffer.is_broadcast;
            self.recv_buffers.remove(&key);

            if !is_broadcast {
                let eom = [
                    CTRL_EOM_ACK,
                    (size & 0xFF) as u8,
                    ((size >> 8) & 0xFF) as u8,
                    segments,
                    0xFF,
                    pgn_bytes(pgn)[0],
                    pgn_bytes(pgn)[1],
                    pgn_bytes(pgn)[2],
                ];
                let _ = sink.send_frame(6, known::TP_CM, destination, source, &eom);
            }

            registry.notify(&Indication {
                priority: 6,
                pgn,
                source_address: source,
                destination,
                timestamp,
                data: payload,
            });
        }
    }

    /// Advance all sessions whose deadline has elapsed; returns the next wakeup instant.
    pub fn tick(&mut self, now: Instant, sink: &dyn FrameSink) -> Option<Instant> {
        let mut next_wakeup: Option<Instant> = None;
        let mut bump = |candidate: Instant, next: &mut Option<Instant>| {
            *next = Some(next.map_or(candidate, |cur| cur.min(candidate)));
        };

        let send_keys: Vec<Key> = self.send_buffers.keys().copied().collect();
        for key in send_keys {
            let ready = {
                let buffer = self.send_buffers.get(&key).unwrap();
                buffer.deadline <= now
            };
            if !ready {
                let deadline = self.send_buffers.get(&key).unwrap().deadline;
                bump(deadline, &mut next_wakeup);
                continue;
            }
            self.advance_send(key, now, sink, &mut next_wakeup, &mut bump);
        }

        let recv_keys: Vec<Key> = self.recv_buffers.keys().copied().collect();
        for key in recv_keys {
            let buffer = self.recv_buffers.get(&key).unwrap();
            if buffer.deadline <= now {
                let is_broadcast = buffer.is_broadcast;
                let pgn = buffer.pgn;
                self.recv_buffers.remove(&key);
                if !is_broadcast {
                    let (src, dst) = key;
                    let abort = abort_frame(pgn, TpAbortReason::Timeout);
                    let _ = sink.send_frame(6, known::TP_CM, dst, src, &abort);
                }
            } else {
                bump(buffer.deadline, &mut next_wakeup);
            }
        }

        next_wakeup
    }

    fn advance_send(
        &mut self,
        key: Key,
        now: Instant,
        sink: &dyn FrameSink,
        next_wakeup: &mut Option<Instant>,
        bump: &mut impl FnMut(Instant, &mut Option<Instant>),
    ) {
        let (src, dst) = key;
        let should_remove;
        {
            let buffer = self.send_buffers.get_mut(&key).unwrap();
            match buffer.state {
                SendState::WaitingCts => {
                    // Timed out waiting for CTS (or post-pause) -> abort.
                    let abort = abort_frame(buffer.pgn, TpAbortReason::Timeout);
                    let _ = sink.send_frame(6, known::TP_CM, src, dst, &abort);
                    should_remove = true;
                }
                SendState::SendingInCts => {
                    let seq = buffer.next_segment_to_send;
                    let offset = (seq as usize - 1) * 7;
                    let mut segment = [0xFFu8; 7];
                    let available = buffer.data.len().saturating_sub(offset).min(7);
                    segment[..available].copy_from_slice(&buffer.data[offset..offset + available]);
                    let mut frame = [0u8; 8];
                    frame[0] = seq;
                    frame[1..].copy_from_slice(&segment);
                    let _ = sink.send_frame(7, known::DATATRANSFER, src, dst, &frame);

                    if seq == buffer.next_wait_on_cts || seq == buffer.num_segments {
                        buffer.state = SendState::WaitingCts;
                        buffer.deadline = now + timeout::T3;
                    } else {
                        buffer.next_segment_to_send += 1;
                        buffer.deadline = now;
                    }
                    should_remove = false;
                }
                SendState::SendingBam => {
                    let seq = buffer.next_segment_to_send;
                    if seq > buffer.num_segments {
                        should_remove = true;
                    } else {
                        let offset = (seq as usize - 1) * 7;
                        let mut segment = [0xFFu8; 7];
                        let available = buffer.data.len().saturating_sub(offset).min(7);
                        segment[..available].copy_from_slice(&buffer.data[offset..offset + available]);
                        let mut frame = [0u8; 8];
                        frame[0] = seq;
                        frame[1..].copy_from_slice(&segment);
                        let _ = sink.send_frame(7, known::DATATRANSFER, src, address::GLOBAL, &frame);
                        buffer.next_segment_to_send += 1;
                        buffer.deadline = now + buffer.bam_interval;
                        should_remove = buffer.next_segment_to_send > buffer.num_segments;
                    }
                }
            }
        }
        if should_remove {
            self.send_buffers.remove(&key);
        } else {
            let deadline = self.send_buffers.get(&key).unwrap().deadline;
            bump(deadline, next_wakeup);
        }
    }
}

fn abort_frame(pgn: u32, reason: TpAbortReason) -> [u8; 8] {
    let pgn_b = pgn_bytes(pgn);
    [CTRL_ABORT, reason.code(), 0xFF, 0xFF, 0xFF, pgn_b[0], pgn_b[1], pgn_b[2]]
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

    #[test]
    fn rts_cts_send_emits_expected_frames() {
        let mut tp = Transport21::new(3, None, None);
        let sink = RecordingSink::new();
        let payload: Vec<u8> = (0..20u8).collect();
        tp.send_pgn(6, 0x00DF00, 0x90, 0x9B, &payload, &sink).unwrap();

        assert_eq!(tp.send_buffers.len(), 1);
        let frames = sink.frames.borrow();
        assert_eq!(frames[0].1, known::TP_CM);
        assert_eq!(frames[0].4[0], CTRL_RTS);
        assert_eq!(frames[0].4[3], 3); // ceil(20/7) == 3 segments
    }

    #[test]
    fn full_roundtrip_rts_cts() {
        let registry = Registry::new();
        let mut sender = Transport21::new(3, None, None);
        let mut receiver = Transport21::new(3, None, None);
        let sender_sink = RecordingSink::new();
        let receiver_sink = RecordingSink::new();
        let payload: Vec<u8> = (0..20u8).collect();

        sender.send_pgn(6, 0x00DF00, 0x90, 0x9B, &payload, &sender_sink).unwrap();
        let rts = sender_sink.frames.borrow()[0].clone();
        receiver.notify(6, known::TP_CM, rts.2, rts.3, 0.0, &rts.4, &receiver_sink, &registry);

        let cts = receiver_sink.frames.borrow().last().unwrap().clone();
        assert_eq!(cts.4[0], CTRL_CTS);
        sender.notify(6, known::TP_CM, cts.2, cts.3, 0.0, &cts.4, &sender_sink, &registry);

        let mut now = Instant::now();
        for _ in 0..5 {
            sender.tick(now, &sender_sink);
            now += Duration::from_millis(1);
        }

        let dt_frames: Vec<_> = sender_sink
            .frames
            .borrow()
            .iter()
            .filter(|f| f.1 == known::DATATRANSFER)
            .cloned()
            .collect();
        assert_eq!(dt_frames.len(), 3);
        for dt in &dt_frames {
            receiver.notify(6, known::DATATRANSFER, dt.2, dt.3, 0.0, &dt.4, &receiver_sink, &registry);
        }

        let eom = receiver_sink.frames.borrow().last().unwrap().clone();
        assert_eq!(eom.4[0], CTRL_EOM_ACK);
        sender.notify(6, known::TP_CM, eom.2, eom.3, 0.0, &eom.4, &sender_sink, &registry);
        assert!(sender.send_buffers.is_empty());
        assert!(receiver.recv_buffers.is_empty());
    }

    #[test]
    fn bam_send_paces_frames() {
        let mut tp = Transport21::new(3, None, Some(Duration::from_millis(50)));
        let sink = RecordingSink::new();
        let payload: Vec<u8> = (0..20u8).collect();
        tp.send_pgn(6, 0x00FEB0, 0x90, address::GLOBAL, &payload, &sink).unwrap();
        assert_eq!(sink.frames.borrow().last().unwrap().4[0], CTRL_BAM);

        let mut now = Instant::now();
        tp.tick(now, &sink);
        now += Duration::from_millis(60);
        tp.tick(now, &sink);
        now += Duration::from_millis(60);
        tp.tick(now, &sink);

        let dt_count = sink.frames.borrow().iter().filter(|f| f.1 == known::DATATRANSFER).count();
        assert_eq!(dt_count, 3);
    }

    #[test]
    fn busy_local_rejected() {
        let mut tp = Transport21::new(3, None, None);
        let sink = RecordingSink::new();
        let payload = vec![0u8; 20];
        tp.send_pgn(6, 0x00DF00, 0x90, 0x9B, &payload, &sink).unwrap();
        let err = tp.send_pgn(6, 0x00DF00, 0x90, 0x9B, &payload, &sink).unwrap_err();
        assert!(matches!(err, AutomotiveError::J1939Error(J1939Error::BusyLocal)));
    }
}
