//! Cyclic and on-demand diagnostic messaging: DM1 (active DTC broadcast),
//! DM11 (clear all), DM22 (clear one DTC by SPN/FMI).

use super::dtc::{dtc_pack, dtc_unpack, Dtc};
use super::pgn::{address, known};
use crate::error::{AutomotiveError, J1939Error, Result};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One of the four SAE lamp indicators reported by DM1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LampState {
    #[default]
    Off,
    On,
    OnSlowFlash,
    OnFastFlash,
    NotAvailable,
}

impl LampState {
    fn bits(self) -> (u8, u8) {
        match self {
            LampState::Off => (0, 3),
            LampState::On => (1, 3),
            LampState::OnSlowFlash => (1, 0),
            LampState::OnFastFlash => (1, 1),
            LampState::NotAvailable => (3, 3),
        }
    }

    fn from_bits(lamp: u8, flash: u8) -> Self {
        match (lamp, flash) {
            (0, _) => LampState::Off,
            (1, 3) => LampState::On,
            (1, 0) => LampState::OnSlowFlash,
            (1, 1) => LampState::OnFastFlash,
            _ => LampState::NotAvailable,
        }
    }
}

/// The four lamp indicators DM1 reports, each independently on/off/flashing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LampStatus {
    pub protect: LampState,
    pub amber_warning: LampState,
    pub red_stop: LampState,
    pub malfunction_indicator: LampState,
}

/// Pack lamp status into the leading 2 bytes of a DM1 payload.
///
/// Bit pairs sit at positions 0/2/4/6 of byte 0 for `(lamp)` bits and the
/// matching positions of byte 1 for `(flash)` bits, in `{pl, awl, rsl, mil}` order.
pub fn lamp_status_pack(status: &LampStatus) -> [u8; 2] {
    let lamps = [status.protect, status.amber_warning, status.red_stop, status.malfunction_indicator];
    let mut byte0 = 0u8;
    let mut byte1 = 0u8;
    for (i, lamp) in lamps.iter().enumerate() {
        let (l, f) = lamp.bits();
        byte0 |= l << (2 * i);
        byte1 |= f << (2 * i);
    }
    [byte0, byte1]
}

pub fn lamp_status_unpack(byte0: u8, byte1: u8) -> LampStatus {
    let lamp_at = |i: usize| (byte0 >> (2 * i)) & 0x3;
    let flash_at = |i: usize| (byte1 >> (2 * i)) & 0x3;
    LampStatus {
        protect: LampState::from_bits(lamp_at(0), flash_at(0)),
        amber_warning: LampState::from_bits(lamp_at(1), flash_at(1)),
        red_stop: LampState::from_bits(lamp_at(2), flash_at(2)),
        malfunction_indicator: LampState::from_bits(lamp_at(3), flash_at(3)),
    }
}

/// Encode a DM1 payload: `[lamp0, lamp1, dtc0(4B)... dtcN(4B)]`.
pub fn dm1_encode(status: &LampStatus, dtcs: &[Dtc]) -> Vec<u8> {
    let lamp = lamp_status_pack(status);
    let mut out = Vec::with_capacity(2 + dtcs.len() * 4);
    out.extend_from_slice(&lamp);
    for dtc in dtcs {
        out.extend_from_slice(&dtc_pack(dtc).to_le_bytes());
    }
    out
}

/// Decode a DM1 payload. Rejects undersized or misaligned payloads.
pub fn dm1_decode(data: &[u8]) -> Result<(LampStatus, Vec<Dtc>)> {
    if data.len() < 6 {
        warn!("DM01: payload too short ({} bytes)", data.len());
        return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
    }
    if data.len() != 8 && (data.len() - 2) % 4 != 0 {
        warn!("DM01: payload length {} is not a valid DTC-aligned size", data.len());
        return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
    }
    let status = lamp_status_unpack(data[0], data[1]);
    let mut dtcs = Vec::new();
    let mut i = 2;
    while i + 4 <= data.len() {
        let raw = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        dtcs.push(dtc_unpack(raw));
        i += 4;
    }
    Ok((status, dtcs))
}

pub type Dm1Supplier = Arc<dyn Fn() -> (LampStatus, Vec<Dtc>) + Send + Sync>;
pub type Dm1Subscriber = Arc<dyn Fn(LampStatus, &[Dtc]) + Send + Sync>;

/// Cyclic DM1 sender/receiver. The cyclic send timer itself is owned by the
/// scheduler that drives `next_payload()` on a schedule; this type only holds
/// the pieces specific to DM1 framing.
pub struct Dm1 {
    supplier: Mutex<Option<Dm1Supplier>>,
    subscribers: Mutex<Vec<Dm1Subscriber>>,
    sending: AtomicBool,
}

impl Dm1 {
    pub fn new() -> Self {
        Dm1 {
            supplier: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            sending: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self, callback: Dm1Subscriber) {
        self.subscribers.lock().unwrap().push(callback);
    }

    /// Begin cyclic sending with the given supplier; idempotent per instance.
    pub fn start_send(&self, supplier: Dm1Supplier) -> bool {
        if self.sending.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.supplier.lock().unwrap() = Some(supplier);
        true
    }

    pub fn stop_send(&self) {
        self.sending.store(false, Ordering::SeqCst);
        *self.supplier.lock().unwrap() = None;
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    /// Called by the scheduler on each cyclic tick; produces the payload to send.
    pub fn next_payload(&self) -> Option<Vec<u8>> {
        let supplier = self.supplier.lock().unwrap();
        supplier.as_ref().map(|f| {
            let (status, dtcs) = f();
            dm1_encode(&status, &dtcs)
        })
    }

    /// Feed an inbound DM1 frame to all subscribers. Malformed payloads are
    /// logged and dropped, never propagated.
    pub fn on_receive(&self, data: &[u8]) {
        match dm1_decode(data) {
            Ok((status, dtcs)) => {
                for subscriber in self.subscribers.lock().unwrap().iter() {
                    subscriber(status, &dtcs);
                }
            }
            Err(e) => warn!("DM01: dropping malformed payload: {}", e),
        }
    }
}

impl Default for Dm1 {
    fn default() -> Self {
        Self::new()
    }
}

pub type Dm11Callback = Arc<dyn Fn(u8) + Send + Sync>;

/// DM11: request-to-clear-all-active-DTCs, and acknowledgement of that request.
pub struct Dm11 {
    request_subscribers: Mutex<Vec<Dm11Callback>>,
    acknowledge_subscribers: Mutex<Vec<Dm11Callback>>,
}

impl Dm11 {
    pub fn new() -> Self {
        Dm11 {
            request_subscribers: Mutex::new(Vec::new()),
            acknowledge_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Build the REQUEST frame (PGN 59904) payload asking peers to clear DM11.
    pub fn request_clear_all_payload() -> [u8; 3] {
        let pgn = known::DM11.to_le_bytes();
        [pgn[0], pgn[1], pgn[2]]
    }

    pub fn subscribe_request_clear_all(&self, callback: Dm11Callback) {
        self.request_subscribers.lock().unwrap().push(callback);
    }

    pub fn subscribe_acknowledge_clear_all(&self, callback: Dm11Callback) {
        self.acknowledge_subscribers.lock().unwrap().push(callback);
    }

    pub fn on_request(&self, source: u8) {
        for subscriber in self.request_subscribers.lock().unwrap().iter() {
            subscriber(source);
        }
    }

    pub fn on_acknowledge(&self, source: u8) {
        for subscriber in self.acknowledge_subscribers.lock().unwrap().iter() {
            subscriber(source);
        }
    }
}

impl Default for Dm11 {
    fn default() -> Self {
        Self::new()
    }
}

/// DM22 control-byte values (clear individual DTC).
pub mod dtc_clr_ctrl {
    pub const PA_REQ: u8 = 1;
    pub const PA_ACK: u8 = 2;
    pub const PA_NACK: u8 = 3;
    pub const ACT_REQ: u8 = 17;
    pub const ACT_ACK: u8 = 18;
    pub const ACT_NACK: u8 = 19;
}

pub type Dm22Callback = Arc<dyn Fn(u8, u32, u8) + Send + Sync>;

/// DM22: request to clear one active or previously-active DTC by `(spn, fmi)`,
/// and the acknowledgement/non-acknowledgement of that request.
#[derive(Default)]
pub struct Dm22 {
    request_subscribers: Mutex<Vec<Dm22Callback>>,
    acknowledge_subscribers: Mutex<Vec<Dm22Callback>>,
}

impl Dm22 {
    pub fn new() -> Self {
        Dm22 {
            request_subscribers: Mutex::new(Vec::new()),
            acknowledge_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Encode a clear request for either an active (`ACT_REQ`) or
    /// previously-active (`PA_REQ`) DTC. Layout: `ctrl, FF, FF, FF, FF, spn_lo, spn_hi, spn_top3|fmi5`.
    fn encode(ctrl: u8, spn: u32, fmi: u8) -> [u8; 8] {
        let spn_lo = (spn & 0xFF) as u8;
        let spn_hi = ((spn >> 8) & 0xFF) as u8;
        let last_byte = (((spn >> 16) as u8) & 0x07).wrapping_shl(5) | (fmi & 0x1F);
        [ctrl, 0xFF, 0xFF, 0xFF, 0xFF, spn_lo, spn_hi, last_byte]
    }

    pub fn request_clear_act_dtc(spn: u32, fmi: u8) -> [u8; 8] {
        Self::encode(dtc_clr_ctrl::ACT_REQ, spn, fmi)
    }

    pub fn request_clear_pa_dtc(spn: u32, fmi: u8) -> [u8; 8] {
        Self::encode(dtc_clr_ctrl::PA_REQ, spn, fmi)
    }

    pub fn decode(data: &[u8]) -> Result<(u8, u32, u8)> {
        if data.len() < 8 {
            return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
        }
        let spn = (data[5] as u32) | ((data[6] as u32) << 8) | (((data[7] >> 5) as u32) << 16);
        let fmi = data[7] & 0x1F;
        Ok((data[0], spn, fmi))
    }

    pub fn subscribe_request(&self, callback: Dm22Callback) {
        self.request_subscribers.lock().unwrap().push(callback);
    }

    pub fn subscribe_acknowledge(&self, callback: Dm22Callback) {
        self.acknowledge_subscribers.lock().unwrap().push(callback);
    }

    /// Decode an inbound DM22 frame and fan it out to the request or
    /// acknowledge subscribers depending on its control byte. Malformed
    /// payloads are logged and dropped, never propagated.
    pub fn on_frame(&self, source: u8, data: &[u8]) {
        let (ctrl, spn, fmi) = match Self::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("DM22 from {:#04x}: dropping malformed payload: {}", source, e);
                return;
            }
        };
        let subscribers = match ctrl {
            dtc_clr_ctrl::PA_REQ | dtc_clr_ctrl::ACT_REQ => &self.request_subscribers,
            _ => &self.acknowledge_subscribers,
        };
        for subscriber in subscribers.lock().unwrap().iter() {
            subscriber(source, spn, fmi);
        }
    }
}

pub const DM1_DEFAULT_PERIOD_MS: u64 = 1000;
pub const _DM1_PGN: u32 = known::DM01;
pub const _DM11_PGN: u32 = known::DM11;
pub const _DM22_PGN: u32 = known::DM22;
pub const _GLOBAL: u8 = address::GLOBAL;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lamp_status_roundtrip() {
        let status = LampStatus {
            protect: LampState::Off,
            amber_warning: LampState::On,
            red_stop: LampState::OnSlowFlash,
            malfunction_indicator: LampState::OnFastFlash,
        };
        let [b0, b1] = lamp_status_pack(&status);
        let decoded = lamp_status_unpack(b0, b1);
        assert_eq!(decoded.protect, LampState::Off);
        assert_eq!(decoded.amber_warning, LampState::On);
        assert_eq!(decoded.red_stop, LampState::OnSlowFlash);
        assert_eq!(decoded.malfunction_indicator, LampState::OnFastFlash);
    }

    #[test]
    fn s5_dm1_two_dtcs_roundtrip() {
        let status = LampStatus::default();
        let dtcs = vec![Dtc::new(100, 3, 1), Dtc::new(200, 5, 2)];
        let payload = dm1_encode(&status, &dtcs);
        assert_eq!(payload.len(), 10);
        let (decoded_status, decoded_dtcs) = dm1_decode(&payload).unwrap();
        assert_eq!(decoded_status.protect, LampState::Off);
        assert_eq!(decoded_dtcs.len(), 2);
        assert_eq!(decoded_dtcs[0].spn, 100);
        assert_eq!(decoded_dtcs[1].spn, 200);
    }

    #[test]
    fn dm1_rejects_short_payload() {
        let err = dm1_decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, AutomotiveError::J1939Error(J1939Error::BadLength)));
    }

    #[test]
    fn dm1_rejects_misaligned_payload() {
        let err = dm1_decode(&[0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, AutomotiveError::J1939Error(J1939Error::BadLength)));
    }

    #[test]
    fn dm1_start_send_idempotent() {
        let dm1 = Dm1::new();
        assert!(dm1.start_send(Arc::new(|| (LampStatus::default(), vec![]))));
        assert!(!dm1.start_send(Arc::new(|| (LampStatus::default(), vec![]))));
        dm1.stop_send();
        assert!(dm1.start_send(Arc::new(|| (LampStatus::default(), vec![]))));
    }

    #[test]
    fn dm22_request_roundtrip() {
        let frame = Dm22::request_clear_act_dtc(0x12345, 0x1A);
        let (ctrl, spn, fmi) = Dm22::decode(&frame).unwrap();
        assert_eq!(ctrl, dtc_clr_ctrl::ACT_REQ);
        assert_eq!(spn, 0x12345);
        assert_eq!(fmi, 0x1A);
    }
}
