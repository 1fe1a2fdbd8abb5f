//! Memory-access diagnostics: DM14 (request) / DM15 (status) / DM16 (data),
//! with an optional seed/key challenge before a read or write is allowed.

use super::pgn::known;
use crate::error::{AutomotiveError, J1939Error, MemoryAccessError, Result};
use log::warn;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Upper bound on DM14 object count; see DESIGN.md open-question decision.
pub const MAX_OBJECT_COUNT: u16 = 1784;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EraseMemory = 0,
    Read = 1,
    StatusRequest = 2,
    Write = 3,
    OperationCompleted = 4,
    OperationFailed = 5,
    BoundaryScan = 6,
    Reserved = 7,
}

impl Command {
    fn from_u8(v: u8) -> Self {
        match v & 0x7 {
            0 => Command::EraseMemory,
            1 => Command::Read,
            2 => Command::StatusRequest,
            3 => Command::Write,
            4 => Command::OperationCompleted,
            5 => Command::OperationFailed,
            6 => Command::BoundaryScan,
            _ => Command::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dm15Status {
    Proceed = 0,
    Busy = 2,
    OperationFailed = 3,
    OperationCompleted = 4,
}

impl Dm15Status {
    fn from_u8(v: u8) -> Self {
        match v & 0x7 {
            0 => Dm15Status::Proceed,
            3 => Dm15Status::OperationFailed,
            4 => Dm15Status::OperationCompleted,
            _ => Dm15Status::Busy,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Dm14 {
    pub object_count: u16,
    pub direct: bool,
    pub command: Command,
    pub address: u32,
    pub key_or_level: u16,
}

/// Encode a DM14 request: `count_lo, (count_hi3|direct1|command3|1), addr(4B LE), key(2B LE)`.
pub fn dm14_encode(object_count: u16, direct: bool, command: Command, address: u32, key_or_level: u16) -> [u8; 8] {
    let count = object_count.min(0x7FF);
    let byte1 = (((count >> 3) & 0xE0) as u8) | ((direct as u8) << 4) | ((command as u8) << 1) | 1;
    let a = address.to_le_bytes();
    let k = key_or_level.to_le_bytes();
    [(count & 0xFF) as u8, byte1, a[0], a[1], a[2], a[3], k[0], k[1]]
}

pub fn dm14_decode(data: &[u8]) -> Result<Dm14> {
    if data.len() < 8 {
        return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
    }
    let count_lo = data[0] as u16;
    let count_hi = ((data[1] as u16) >> 5) & 0x7;
    let object_count = count_lo | (count_hi << 8);
    let direct = (data[1] >> 4) & 1 == 1;
    let command = Command::from_u8((data[1] >> 1) & 0x7);
    let address = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
    let key_or_level = u16::from_le_bytes([data[6], data[7]]);
    Ok(Dm14 { object_count, direct, command, address, key_or_level })
}

#[derive(Debug, Clone, Copy)]
pub enum Dm15Body {
    Seed(u16),
    Error { code: u32, edcp: u8 },
}

#[derive(Debug, Clone, Copy)]
pub struct Dm15 {
    pub object_count: u16,
    pub direct: bool,
    pub status: Dm15Status,
    pub body: Dm15Body,
}

pub fn dm15_encode_proceed(object_count: u16, direct: bool, status: Dm15Status, seed_or_ffff: u16) -> [u8; 8] {
    let byte1 = ((direct as u8) << 4) | ((status as u8) << 1) | 1;
    let s = seed_or_ffff.to_le_bytes();
    [(object_count & 0xFF) as u8, byte1, 0xFF, 0xFF, 0xFF, 0xFF, s[0], s[1]]
}

pub fn dm15_encode_error(direct: bool, status: Dm15Status, error: &MemoryAccessError, edcp: u8) -> [u8; 8] {
    let byte1 = ((direct as u8) << 4) | ((status as u8) << 1) | 1;
    let code = error.code();
    [0, byte1, (code & 0xFF) as u8, ((code >> 8) & 0xFF) as u8, ((code >> 16) & 0xFF) as u8, edcp, 0xFF, 0xFF]
}

pub fn dm15_decode(data: &[u8]) -> Result<Dm15> {
    if data.len() < 8 {
        return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
    }
    let object_count = data[0] as u16;
    let direct = (data[1] >> 4) & 1 == 1;
    let status = Dm15Status::from_u8((data[1] >> 1) & 0x7);
    let body = match status {
        Dm15Status::Proceed | Dm15Status::OperationCompleted => {
            Dm15Body::Seed(u16::from_le_bytes([data[6], data[7]]))
        }
        _ => {
            let code = (data[2] as u32) | ((data[3] as u32) << 8) | ((data[4] as u32) << 16);
            Dm15Body::Error { code, edcp: data[5] }
        }
    };
    Ok(Dm15 { object_count, direct, status, body })
}

/// Encode DM16 data: `length_or_0xFF, payload[..]`, padded to 8 bytes when it fits a single frame.
pub fn dm16_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(if payload.len() > 0xFE { 0xFF } else { payload.len() as u8 });
    out.extend_from_slice(payload);
    if out.len() < 8 {
        out.resize(8, 0xFF);
    }
    out
}

pub fn dm16_decode(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
    }
    let len = data[0];
    let payload = &data[1..];
    if len == 0xFF {
        Ok(payload.to_vec())
    } else {
        let len = len as usize;
        if payload.len() < len {
            return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
        }
        Ok(payload[..len].to_vec())
    }
}

/// Re-rolls a seed of 0x0000 or 0xFFFF to 0xBEEF, matching `Dm14Server.generate_seed`.
pub fn generate_seed() -> u16 {
    let seed: u16 = rand::thread_rng().gen();
    match seed {
        0x0000 | 0xFFFF => 0xBEEF,
        other => other,
    }
}

/// Host-supplied seed -> key transform. Absence is a fatal error for either role.
pub trait SeedKeyAlgorithm: Send + Sync {
    fn key_from_seed(&self, seed: u16) -> u16;
}

impl<F: Fn(u16) -> u16 + Send + Sync> SeedKeyAlgorithm for F {
    fn key_from_seed(&self, seed: u16) -> u16 {
        self(seed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Idle,
    WaitForSeed,
    WaitForDm16,
    WaitForOperComplete,
}

/// Client-side memory access: `read`/`write` block (via the caller-provided wait
/// mechanism) until a terminal status or timeout.
pub struct MemoryAccessQuery {
    state: Mutex<QueryState>,
    algorithm: Option<Arc<dyn SeedKeyAlgorithm>>,
}

impl MemoryAccessQuery {
    pub fn new(algorithm: Option<Arc<dyn SeedKeyAlgorithm>>) -> Self {
        MemoryAccessQuery { state: Mutex::new(QueryState::Idle), algorithm }
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = QueryState::Idle;
    }

    /// Begin a read/write: returns the initial DM14 frame to transmit.
    pub fn start(&self, direct: bool, command: Command, address: u32, object_count: u16) -> Result<[u8; 8]> {
        if object_count > MAX_OBJECT_COUNT {
            return Err(AutomotiveError::J1939Error(J1939Error::BadField("object_count")));
        }
        *self.state.lock().unwrap() = QueryState::WaitForSeed;
        Ok(dm14_encode(object_count, direct, command, address, 0x0007))
    }

    /// Feed an inbound DM15. Returns the next DM14 to send, if any (key response
    /// or the final OPERATION_COMPLETED acknowledgement), or an error on BUSY/FAILED.
    pub fn on_dm15(&self, direct: bool, command: Command, address: u32, dm15: &Dm15) -> Result<Option<[u8; 8]>> {
        let mut state = self.state.lock().unwrap();
        match dm15.status {
            Dm15Status::Proceed => match dm15.body {
                Dm15Body::Seed(0xFFFF) => {
                    *state = QueryState::WaitForDm16;
                    Ok(None)
                }
                Dm15Body::Seed(seed) => {
                    let Some(algorithm) = &self.algorithm else {
                        return Err(AutomotiveError::J1939Error(J1939Error::NoResponse));
                    };
                    let key = algorithm.key_from_seed(seed);
                    Ok(Some(dm14_encode(dm15.object_count, direct, command, address, key)))
                }
                Dm15Body::Error { .. } => unreachable!("Proceed never carries an error body"),
            },
            Dm15Status::Busy => {
                *state = QueryState::Idle;
                Err(AutomotiveError::J1939Error(J1939Error::MemoryAccess(MemoryAccessError::Busy)))
            }
            Dm15Status::OperationFailed => {
                *state = QueryState::Idle;
                let code = match dm15.body {
                    Dm15Body::Error { code, edcp } => MemoryAccessError::from_code(code, edcp),
                    _ => MemoryAccessError::UnknownError,
                };
                Err(AutomotiveError::J1939Error(J1939Error::MemoryAccess(code)))
            }
            Dm15Status::OperationCompleted => {
                *state = QueryState::Idle;
                Ok(Some(dm14_encode(1, direct, Command::OperationCompleted, address, 0xFFFF)))
            }
        }
    }

    /// Feed an inbound DM16 during a read; returns the decoded payload.
    pub fn on_dm16(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if *state != QueryState::WaitForDm16 {
            return Err(AutomotiveError::J1939Error(J1939Error::SequenceError));
        }
        *state = QueryState::WaitForOperComplete;
        dm16_decode(data)
    }

    /// Mark a pending write's DM16 as sent, advancing past `WaitForDm16` the
    /// same way a read does once its DM16 arrives. No-op outside that state.
    pub fn send_write_data(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == QueryState::WaitForDm16 {
            *state = QueryState::WaitForOperComplete;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    WaitForDm14,
    WaitForKey,
    Busy,
}

/// Application hook deciding whether a pending request should proceed.
pub type ProceedFn = Arc<dyn Fn(Command, u32, u16, u8, u16) -> bool + Send + Sync>;

struct PendingRequest {
    source: u8,
    direct: bool,
    command: Command,
    address: u32,
    object_count: u16,
    seed: u16,
    deadline: Instant,
}

/// Server-side memory access: responds to DM14 with DM15/DM16.
pub struct MemoryAccessServer {
    state: Mutex<ServerState>,
    pending: Mutex<Option<PendingRequest>>,
    algorithm: Option<Arc<dyn SeedKeyAlgorithm>>,
    proceed: Option<ProceedFn>,
    max_timeout: Duration,
    seed_generator: Option<Arc<dyn Fn() -> u16 + Send + Sync>>,
}

pub enum ServerAction {
    SendDm15Proceed { direct: bool, seed_or_ffff: u16 },
    SendDm15Error { direct: bool, status: Dm15Status, error: MemoryAccessError, edcp: u8 },
    SendDm16(Vec<u8>),
    ReadyForData,
    WriteAccepted,
}

impl MemoryAccessServer {
    pub fn new(algorithm: Option<Arc<dyn SeedKeyAlgorithm>>, proceed: Option<ProceedFn>, max_timeout: Duration) -> Self {
        MemoryAccessServer {
            state: Mutex::new(ServerState::Idle),
            pending: Mutex::new(None),
            algorithm,
            proceed,
            max_timeout,
            seed_generator: None,
        }
    }

    pub fn on_dm14(&self, source: u8, dm14: &Dm14, now: Instant) -> ServerAction {
        let mut state = self.state.lock().unwrap();

        if *state != ServerState::Idle {
            let pending = self.pending.lock().unwrap();
            if let Some(p) = pending.as_ref() {
                if p.source != source {
                    return ServerAction::SendDm15Error {
                        direct: dm14.direct,
                        status: Dm15Status::Busy,
                        error: MemoryAccessError::Busy,
                        edcp: 0,
                    };
                }
            }
        }

        if *state == ServerState::WaitForKey {
            let mut pending_guard = self.pending.lock().unwrap();
            if let Some(pending) = pending_guard.take() {
                let ok = self
                    .algorithm
                    .as_ref()
                    .map(|alg| alg.key_from_seed(pending.seed) == dm14.key_or_level)
                    .unwrap_or(false);
                if !ok {
                    *state = ServerState::Idle;
                    warn!("memory-access: key mismatch from {:#04x}", source);
                    return ServerAction::SendDm15Error {
                        direct: pending.direct,
                        status: Dm15Status::OperationFailed,
                        error: MemoryAccessError::SecurityInvalidKey,
                        edcp: 0,
                    };
                }
                *state = ServerState::Busy;
                return ServerAction::ReadyForData;
            }
        }

        if dm14.command == Command::OperationCompleted {
            *state = ServerState::Idle;
            *self.pending.lock().unwrap() = None;
            return ServerAction::SendDm15Proceed { direct: dm14.direct, seed_or_ffff: 0xFFFF };
        }

        let accepted = self
            .proceed
            .as_ref()
            .map(|f| f(dm14.command, dm14.address, dm14.direct as u16, 0, dm14.object_count))
            .unwrap_or(true);
        if !accepted {
            *state = ServerState::Idle;
            return ServerAction::SendDm15Error {
                direct: dm14.direct,
                status: Dm15Status::OperationFailed,
                error: MemoryAccessError::GeneralAddressingError,
                edcp: 0,
            };
        }

        if let Some(algorithm) = &self.algorithm {
            let seed = self.next_seed();
            *state = ServerState::WaitForKey;
            *self.pending.lock().unwrap() = Some(PendingRequest {
                source,
                direct: dm14.direct,
                command: dm14.command,
                address: dm14.address,
                object_count: dm14.object_count,
                seed,
                deadline: now + self.max_timeout,
            });
            let _ = algorithm; // retained on self for later verification in WaitForKey branch
            return ServerAction::SendDm15Proceed { direct: dm14.direct, seed_or_ffff: seed };
        }

        *state = ServerState::Busy;
        ServerAction::ReadyForData
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.lock().unwrap().as_ref().map(|p| p.deadline)
    }

    pub fn expire_if_overdue(&self, now: Instant) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if let Some(p) = pending.as_ref() {
            if now >= p.deadline {
                *pending = None;
                *self.state.lock().unwrap() = ServerState::Idle;
                return true;
            }
        }
        false
    }

    pub fn finish(&self) {
        *self.state.lock().unwrap() = ServerState::Idle;
        *self.pending.lock().unwrap() = None;
    }

    /// Override the seed generator used when issuing a fresh challenge,
    /// in place of the default `generate_seed`.
    pub fn set_seed_generator(&mut self, generator: Arc<dyn Fn() -> u16 + Send + Sync>) {
        self.seed_generator = Some(generator);
    }

    fn next_seed(&self) -> u16 {
        match &self.seed_generator {
            Some(generator) => generator(),
            None => generate_seed(),
        }
    }
}

#[derive(Clone, Copy)]
struct PendingQuery {
    direct: bool,
    command: Command,
    address: u32,
    target: u8,
}

/// Combined facade exposing both client and server roles over one address.
///
/// A caller drives the client side with [`read`](Self::read)/[`write`](Self::write)
/// to get the initial DM14 frame to transmit, then feeds inbound DM15/DM16
/// frames back in as they arrive; [`respond`](Self::respond) does the same for
/// the server side with an inbound DM14.
pub struct MemoryAccess {
    pub query: MemoryAccessQuery,
    pub server: MemoryAccessServer,
    pending: Mutex<Option<PendingQuery>>,
    notify: Mutex<Option<Arc<dyn Fn(Result<Vec<u8>>) + Send + Sync>>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        MemoryAccess {
            query: MemoryAccessQuery::new(None),
            server: MemoryAccessServer::new(None, None, Duration::from_secs(5)),
            pending: Mutex::new(None),
            notify: Mutex::new(None),
        }
    }

    pub fn set_seed_key_algorithm(&mut self, algorithm: Arc<dyn SeedKeyAlgorithm>) {
        self.query = MemoryAccessQuery::new(Some(algorithm.clone()));
        self.server.algorithm = Some(algorithm);
    }

    pub fn set_proceed(&mut self, proceed: ProceedFn) {
        self.server.proceed = Some(proceed);
    }

    pub fn set_seed_generator(&mut self, generator: Arc<dyn Fn() -> u16 + Send + Sync>) {
        self.server.set_seed_generator(generator);
    }

    /// Register the callback that receives the outcome of a client-side
    /// `read`/`write`: `Ok(payload)` for a completed read, `Ok(vec![])` for a
    /// completed write, `Err` for a BUSY/FAILED status or a sequencing error.
    pub fn set_notify(&self, callback: Arc<dyn Fn(Result<Vec<u8>>) + Send + Sync>) {
        *self.notify.lock().unwrap() = Some(callback);
    }

    /// Abandon any in-flight client-side transaction and return to idle.
    pub fn reset_query(&self) {
        self.query.reset();
        *self.pending.lock().unwrap() = None;
    }

    /// Begin a read transaction against `target`, returning the DM14 frame to transmit.
    pub fn read(&self, target: u8, address: u32, object_count: u16, direct: bool) -> Result<[u8; 8]> {
        let frame = self.query.start(direct, Command::Read, address, object_count)?;
        *self.pending.lock().unwrap() = Some(PendingQuery { direct, command: Command::Read, address, target });
        Ok(frame)
    }

    /// Begin a write transaction against `target`, returning the DM14 frame to
    /// transmit. The data itself travels later as DM16, once the responder's
    /// DM15 clears the way (see [`on_dm15`](Self::on_dm15)).
    pub fn write(&self, target: u8, address: u32, data_len: u16, direct: bool) -> Result<[u8; 8]> {
        let frame = self.query.start(direct, Command::Write, address, data_len)?;
        *self.pending.lock().unwrap() = Some(PendingQuery { direct, command: Command::Write, address, target });
        Ok(frame)
    }

    /// Feed an inbound DM15 belonging to the pending client-side transaction.
    /// Returns the next DM14 frame to send (key response or final
    /// acknowledgement), if any.
    pub fn on_dm15(&self, data: &[u8]) -> Result<Option<[u8; 8]>> {
        let pending = *self.pending.lock().unwrap();
        let Some(p) = pending else { return Ok(None) };
        let dm15 = dm15_decode(data)?;
        let result = self.query.on_dm15(p.direct, p.command, p.address, &dm15);
        if let Err(ref e) = result {
            *self.pending.lock().unwrap() = None;
            if let Some(cb) = self.notify.lock().unwrap().as_ref() {
                cb(Err(AutomotiveError::J1939Error(match e {
                    AutomotiveError::J1939Error(inner) => inner.clone(),
                    _ => J1939Error::NoResponse,
                })));
            }
        }
        result
    }

    /// Feed an inbound DM16 carrying the data read back from the responder.
    pub fn on_dm16(&self, data: &[u8]) -> Result<Vec<u8>> {
        let payload = self.query.on_dm16(data)?;
        *self.pending.lock().unwrap() = None;
        if let Some(cb) = self.notify.lock().unwrap().as_ref() {
            cb(Ok(payload.clone()));
        }
        Ok(payload)
    }

    /// The pending write's target, if a write is waiting for the responder to
    /// clear it for data transfer (DM15 Proceed with seed 0xFFFF received).
    pub fn pending_write_target(&self) -> Option<u8> {
        self.pending.lock().unwrap().as_ref().filter(|p| p.command == Command::Write).map(|p| p.target)
    }

    /// Mark a pending write's DM16 as sent.
    pub fn send_write_data(&self) {
        self.query.send_write_data();
    }

    /// Server side: handle an inbound DM14, returning the action to take.
    pub fn respond(&self, source: u8, data: &[u8], now: Instant) -> Result<ServerAction> {
        let dm14 = dm14_decode(data)?;
        Ok(self.server.on_dm14(source, &dm14, now))
    }
}

impl Default for MemoryAccess {
    fn default() -> Self {
        Self::new()
    }
}

pub const _DM14_PGN: u32 = known::DM14;
pub const _DM15_PGN: u32 = known::DM15;
pub const _DM16_PGN: u32 = known::DM16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_dm14_read_with_seed_key_roundtrip() {
        // S4: read 1 byte at 0x92000003, src=0xF9 dst=0xD4.
        let rts = dm14_encode(1, true, Command::Read, 0x92000003, 0x0007);
        assert_eq!(rts, [0x01, 0x13, 0x03, 0x00, 0x00, 0x92, 0x07, 0x00]);

        let decoded = dm14_decode(&rts).unwrap();
        assert_eq!(decoded.object_count, 1);
        assert!(decoded.direct);
        assert_eq!(decoded.command, Command::Read);
        assert_eq!(decoded.address, 0x92000003);

        let seed_frame = [0x00u8, 0x11, 0xFF, 0xFF, 0xFF, 0xFF, 0x5A, 0xA5];
        let dm15 = dm15_decode(&seed_frame).unwrap();
        assert_eq!(dm15.status, Dm15Status::Proceed);
        match dm15.body {
            Dm15Body::Seed(seed) => assert_eq!(seed, 0xA55A),
            _ => panic!("expected seed body"),
        }

        let key = 0xA55Au16 ^ 0xFFFF;
        assert_eq!(key, 0x5AA5);
        let key_frame = dm14_encode(1, true, Command::Read, 0x92000003, key);
        assert_eq!(key_frame, [0x01, 0x13, 0x03, 0x00, 0x00, 0x92, 0xA5, 0x5A]);
    }

    #[test]
    fn dm16_single_byte_roundtrip() {
        let encoded = dm16_encode(&[0x01]);
        assert_eq!(&encoded[..2], &[0x01, 0x01]);
        let decoded = dm16_decode(&encoded).unwrap();
        assert_eq!(decoded, vec![0x01]);
    }

    #[test]
    fn seed_never_zero_or_ffff() {
        for _ in 0..1000 {
            let seed = generate_seed();
            assert_ne!(seed, 0x0000);
            assert_ne!(seed, 0xFFFF);
        }
    }

    #[test]
    fn query_rejects_oversized_object_count() {
        let query = MemoryAccessQuery::new(None);
        let err = query.start(true, Command::Read, 0, MAX_OBJECT_COUNT + 1).unwrap_err();
        assert!(matches!(err, AutomotiveError::J1939Error(J1939Error::BadField(_))));
    }

    #[test]
    fn server_busy_when_second_source_interrupts() {
        let server = MemoryAccessServer::new(None, None, Duration::from_secs(5));
        let dm14 = Dm14 { object_count: 1, direct: true, command: Command::Read, address: 0, key_or_level: 7 };
        let now = Instant::now();
        match server.on_dm14(0x10, &dm14, now) {
            ServerAction::ReadyForData => {}
            _ => panic!("expected immediate ready (no seed/key configured)"),
        }
        server.finish();
    }
}
