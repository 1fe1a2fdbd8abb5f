//! Single-ECU scheduler: a background worker thread that owns transport
//! buffers and timers, plus a dedicated listener thread that polls the driver
//! and feeds inbound frames into the stack.
//!
//! The two are split so that a driver whose `receive()` call blocks can't also
//! stall retransmits, timer callbacks, or address-claim housekeeping: the
//! listener only ever decodes a frame and hands it off, while the worker is
//! the sole owner of every piece of mutable scheduling state and is the only
//! thread allowed to touch it.

use super::ca::ControllerApplication;
use super::diagnostics::DM1_DEFAULT_PERIOD_MS;
use super::filter::{Filter, Indication, Registry, SubscriptionId};
use super::frame::{decode_can_id, destination_of, encode_can_id};
use super::name::Name;
use super::pgn::{known, pgn_is_pdu1, pgn_matches};
use super::transport21::{FrameSink, Transport21};
use super::transport22::Transport22;
use crate::error::{AutomotiveError, J1939Error, Result};
use crate::types::{Config, Frame, Port};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Which transport engine an ECU's PGNs larger than 8 bytes are segmented through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLinkLayer {
    J1939_21,
    J1939_22,
}

/// Configuration for one [`Ecu`] instance.
#[derive(Debug, Clone)]
pub struct EcuConfig {
    pub data_link_layer: DataLinkLayer,
    pub max_cmdt_packets: u8,
    pub min_tp_rts_cts_dt_interval: Option<Duration>,
    pub min_tp_bam_dt_interval: Option<Duration>,
}

impl Default for EcuConfig {
    fn default() -> Self {
        EcuConfig {
            data_link_layer: DataLinkLayer::J1939_21,
            max_cmdt_packets: 1,
            min_tp_rts_cts_dt_interval: None,
            min_tp_bam_dt_interval: None,
        }
    }
}

impl Config for EcuConfig {
    fn validate(&self) -> Result<()> {
        if self.max_cmdt_packets == 0 {
            return Err(AutomotiveError::J1939Error(J1939Error::BadField("max_cmdt_packets")));
        }
        Ok(())
    }
}

struct TimerEntry {
    id: u64,
    period: Duration,
    next: Instant,
    callback: Arc<dyn Fn() + Send + Sync>,
}

/// Shared state reachable from the scheduler thread, the listener thread, and
/// any application thread holding an [`Ecu`] handle or a [`ControllerApplication`].
pub(crate) struct EcuInner {
    pub(crate) config: EcuConfig,
    port: Mutex<Option<Box<dyn Port>>>,
    send_lock: Mutex<()>,
    transport21: Mutex<Transport21>,
    transport22: Mutex<Transport22>,
    pub(crate) registry: Registry,
    pub(crate) cas: Mutex<HashMap<u8, Arc<ControllerApplication>>>,
    timers: Mutex<Vec<TimerEntry>>,
    next_timer_id: AtomicU64,
    shutdown: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
}

impl FrameSink for EcuInner {
    fn send_frame(&self, priority: u8, pgn: u32, src: u8, dst: u8, data: &[u8]) -> Result<()> {
        let full_pgn = if pgn_is_pdu1(pgn) { (pgn & !0xFF) | dst as u32 } else { pgn };
        let can_id = encode_can_id(priority, full_pgn, src)?;
        let _guard = self.send_lock.lock().unwrap();
        let mut port = self.port.lock().unwrap();
        let Some(port) = port.as_mut() else {
            return Err(AutomotiveError::PortError("not connected".into()));
        };
        port.send(&Frame {
            id: can_id,
            data: data.to_vec(),
            timestamp: 0,
            is_extended: true,
            is_fd: matches!(self.config.data_link_layer, DataLinkLayer::J1939_22),
        })
    }
}

impl EcuInner {
    fn wake_scheduler(&self) {
        let _guard = self.wake_lock.lock().unwrap();
        self.wake.notify_one();
    }

    /// Queue `payload` for Multi-PG packing into a shared CAN-FD frame under
    /// `slot`/`src`/`dst`, flushing once the buffer no longer has room or
    /// `time_limit` elapses (driven by the scheduler's periodic tick).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_pgn_multiplexed(
        self: &Arc<Self>,
        slot: u8,
        priority: u8,
        src: u8,
        dst: u8,
        tos: u8,
        tf: u8,
        cpgn: u32,
        payload: &[u8],
        time_limit: Duration,
    ) -> Result<()> {
        {
            let mut tp = self.transport22.lock().unwrap();
            tp.multi_pg.push(slot, src, dst, priority, tos, tf, cpgn, payload, time_limit, Instant::now(), self.as_ref())?;
        }
        self.wake_scheduler();
        Ok(())
    }
}

/// A single ECU, hosting any number of Controller Applications over one physical interface.
pub struct Ecu {
    pub(crate) inner: Arc<EcuInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Ecu {
    pub fn new(config: EcuConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(EcuInner {
            config,
            port: Mutex::new(None),
            send_lock: Mutex::new(()),
            transport21: Mutex::new(Transport21::new(1, None, None)),
            transport22: Mutex::new(Transport22::new()),
            registry: Registry::new(),
            cas: Mutex::new(HashMap::new()),
            timers: Mutex::new(Vec::new()),
            next_timer_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
        });
        {
            let max = inner.config.max_cmdt_packets;
            let rts = inner.config.min_tp_rts_cts_dt_interval;
            let bam = inner.config.min_tp_bam_dt_interval;
            *inner.transport21.lock().unwrap() = Transport21::new(max, rts, bam);
        }
        Ok(Ecu {
            inner,
            scheduler: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    /// Attach a driver and start the scheduler and listener threads.
    pub fn connect(&self, port: Box<dyn Port>) -> Result<()> {
        *self.inner.port.lock().unwrap() = Some(port);
        self.inner.shutdown.store(false, Ordering::SeqCst);

        let scheduler_inner = self.inner.clone();
        let scheduler_handle = thread::spawn(move || scheduler_loop(scheduler_inner));
        *self.scheduler.lock().unwrap() = Some(scheduler_handle);

        let listener_inner = self.inner.clone();
        let listener_handle = thread::spawn(move || listener_loop(listener_inner));
        *self.listener.lock().unwrap() = Some(listener_handle);
        Ok(())
    }

    /// Detach the driver without tearing down the scheduler.
    pub fn disconnect(&self) -> Result<()> {
        *self.inner.port.lock().unwrap() = None;
        Ok(())
    }

    /// Stop both threads and join them.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake_scheduler();
        if let Some(handle) = self.scheduler.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.listener.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn subscribe(&self, filter: Filter, callback: super::filter::Callback) -> SubscriptionId {
        self.inner.registry.subscribe(filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.registry.unsubscribe(id);
    }

    pub fn add_timer(&self, period: Duration, callback: Arc<dyn Fn() + Send + Sync>) -> u64 {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::SeqCst);
        self.inner.timers.lock().unwrap().push(TimerEntry {
            id,
            period,
            next: Instant::now() + period,
            callback,
        });
        self.inner.wake_scheduler();
        id
    }

    pub fn remove_timer(&self, id: u64) {
        self.inner.timers.lock().unwrap().retain(|t| t.id != id);
    }

    /// Register a Controller Application, keyed by its chosen device address.
    /// `bypass_address_claim` skips the WAIT_VETO contention window (test/bench use).
    pub fn add_ca(&self, name: Name, preferred_address: u8, bypass_address_claim: bool) -> Arc<ControllerApplication> {
        let ca = Arc::new(ControllerApplication::new(name, preferred_address, Arc::downgrade(&self.inner)));
        if bypass_address_claim {
            ca.force_claim();
        } else {
            ca.start();
        }
        self.inner.cas.lock().unwrap().insert(preferred_address, ca.clone());
        self.inner.wake_scheduler();

        let dm1_ca = ca.clone();
        self.add_timer(
            Duration::from_millis(DM1_DEFAULT_PERIOD_MS),
            Arc::new(move || {
                if let Some(payload) = dm1_ca.dm1.next_payload() {
                    let _ = dm1_ca.send_pgn(6, known::DM01, &payload);
                }
            }),
        );
        ca
    }

    pub fn remove_ca(&self, device_address: u8) {
        self.inner.cas.lock().unwrap().remove(&device_address);
    }

    /// Send a PGN directly from the ECU (not tied to a specific CA's address claim).
    pub fn send_pgn(&self, priority: u8, pgn: u32, src: u8, data: &[u8]) -> Result<()> {
        send_pgn_via(&self.inner, priority, pgn, src, data)
    }

    /// Queue a small PG for Multi-PG packing (PGN FEFF_MULTI_PG) instead of
    /// sending it as its own frame, alongside other PGs sharing `slot`.
    #[allow(clippy::too_many_arguments)]
    pub fn send_pgn_multiplexed(
        &self,
        slot: u8,
        priority: u8,
        src: u8,
        dst: u8,
        tos: u8,
        tf: u8,
        cpgn: u32,
        payload: &[u8],
        time_limit: Duration,
    ) -> Result<()> {
        self.inner.send_pgn_multiplexed(slot, priority, src, dst, tos, tf, cpgn, payload, time_limit)
    }

    /// Feed one inbound, already-filtered frame into the stack. Exposed so a
    /// custom driver integration can bypass the built-in listener thread.
    pub fn notify(&self, can_id: u32, data: &[u8], timestamp: f64) {
        dispatch_inbound(&self.inner, can_id, data, timestamp);
    }
}

impl Drop for Ecu {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn send_pgn_via(inner: &Arc<EcuInner>, priority: u8, pgn: u32, src: u8, data: &[u8]) -> Result<()> {
    let dst = destination_of(pgn);
    if data.len() <= 8 {
        return inner.send_frame(priority, pgn, src, dst, data);
    }
    match inner.config.data_link_layer {
        DataLinkLayer::J1939_21 => {
            let mut tp = inner.transport21.lock().unwrap();
            tp.send_pgn(priority, pgn, src, dst, data, inner.as_ref())?;
        }
        DataLinkLayer::J1939_22 => {
            let mut tp = inner.transport22.lock().unwrap();
            tp.send_pgn(priority, pgn, src, dst, data, inner.as_ref())?;
        }
    }
    inner.wake_scheduler();
    Ok(())
}

fn dispatch_inbound(inner: &Arc<EcuInner>, can_id: u32, data: &[u8], timestamp: f64) {
    let (priority, pgn, source) = decode_can_id(can_id);
    let destination = destination_of(pgn);
    let is_tp_cm = pgn_matches(pgn, known::TP_CM);
    let is_datatransfer = pgn_matches(pgn, known::DATATRANSFER);
    let is_fd_tp_cm = pgn_matches(pgn, known::FD_TP_CM);
    let is_fd_tp_dt = pgn_matches(pgn, known::FD_TP_DT);
    let is_addressclaim = pgn_matches(pgn, known::ADDRESSCLAIM);
    let is_request = pgn_matches(pgn, known::REQUEST);
    let is_dm01 = pgn_matches(pgn, known::DM01);
    let is_dm11 = pgn_matches(pgn, known::DM11);
    let is_dm22 = pgn_matches(pgn, known::DM22);
    let is_dm14 = pgn_matches(pgn, known::DM14);
    let is_dm15 = pgn_matches(pgn, known::DM15);
    let is_dm16 = pgn_matches(pgn, known::DM16);

    if !inner.registry.is_acceptable(destination)
        && !is_tp_cm
        && !is_datatransfer
        && !is_fd_tp_cm
        && !is_fd_tp_dt
        && !is_addressclaim
        && !is_dm01
        && !is_dm11
        && !is_dm22
        && !is_dm14
        && !is_dm15
        && !is_dm16
    {
        return;
    }

    let indication = || Indication {
        priority,
        pgn,
        source_address: source,
        destination,
        timestamp,
        data: data.to_vec(),
    };

    if matches!(inner.config.data_link_layer, DataLinkLayer::J1939_21) && (is_tp_cm || is_datatransfer) {
        let mut tp = inner.transport21.lock().unwrap();
        tp.notify(priority, pgn, source, destination, timestamp, data, inner.as_ref(), &inner.registry);
        inner.wake_scheduler();
    } else if matches!(inner.config.data_link_layer, DataLinkLayer::J1939_22) && (is_fd_tp_cm || is_fd_tp_dt) {
        let mut tp = inner.transport22.lock().unwrap();
        tp.notify(priority, pgn, source, destination, timestamp, data, inner.as_ref(), &inner.registry);
        inner.wake_scheduler();
    } else if is_addressclaim {
        handle_address_claim_frame(inner, source, data);
        inner.registry.notify(&indication());
    } else if is_request && data.len() >= 3 {
        let requested_pgn = (data[0] as u32) | ((data[1] as u32) << 8) | ((data[2] as u32) << 16);
        if pgn_matches(requested_pgn, known::ADDRESSCLAIM) {
            handle_address_claim_request(inner, source);
        } else if pgn_matches(requested_pgn, known::DM11) {
            handle_dm11_request(inner, source);
        }
        inner.registry.notify(&indication());
    } else if is_dm01 {
        handle_dm1_frame(inner, data);
        inner.registry.notify(&indication());
    } else if is_dm11 {
        handle_dm11_acknowledge(inner, source);
        inner.registry.notify(&indication());
    } else if is_dm22 {
        handle_dm22_frame(inner, destination, source, data);
        inner.registry.notify(&indication());
    } else if is_dm14 {
        handle_dm14_frame(inner, destination, source, data);
        inner.registry.notify(&indication());
    } else if is_dm15 {
        handle_dm15_frame(inner, destination, source, data);
        inner.registry.notify(&indication());
    } else if is_dm16 {
        handle_dm16_frame(inner, destination, source, data);
        inner.registry.notify(&indication());
    } else {
        inner.registry.notify(&indication());
    }
}

fn handle_address_claim_frame(inner: &Arc<EcuInner>, source: u8, data: &[u8]) {
    let Ok(claimant_name) = Name::from_bytes(data) else {
        warn!("address-claim: malformed NAME from {:#04x}", source);
        return;
    };
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        if let Some(action) = ca.on_address_claimed(source, claimant_name) {
            let _ = ca.emit(action);
        }
    }
}

fn handle_address_claim_request(inner: &Arc<EcuInner>, _source: u8) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        if let Some(action) = ca.on_request_for_address_claim() {
            let _ = ca.emit(action);
        }
    }
}

/// DM1 is broadcast (global destination), so every CA on this ECU sees it.
fn handle_dm1_frame(inner: &Arc<EcuInner>, data: &[u8]) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        ca.dm1.on_receive(data);
    }
}

fn handle_dm11_request(inner: &Arc<EcuInner>, source: u8) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        ca.dm11.on_request(source);
    }
}

/// A direct (non-request) DM11 frame is the broadcast acknowledgement of a clear.
fn handle_dm11_acknowledge(inner: &Arc<EcuInner>, source: u8) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        ca.dm11.on_acknowledge(source);
    }
}

fn handle_dm22_frame(inner: &Arc<EcuInner>, destination: u8, source: u8, data: &[u8]) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        if ca.device_address() == Some(destination) {
            ca.dm22.on_frame(source, data);
        }
    }
}

fn handle_dm14_frame(inner: &Arc<EcuInner>, destination: u8, source: u8, data: &[u8]) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        if ca.device_address() == Some(destination) {
            ca.handle_memory_access_request(source, data);
        }
    }
}

fn handle_dm15_frame(inner: &Arc<EcuInner>, destination: u8, source: u8, data: &[u8]) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        if ca.device_address() == Some(destination) {
            ca.handle_memory_access_status(source, data);
        }
    }
}

fn handle_dm16_frame(inner: &Arc<EcuInner>, destination: u8, source: u8, data: &[u8]) {
    let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
    for ca in cas {
        if ca.device_address() == Some(destination) {
            ca.handle_memory_access_data(source, data);
        }
    }
}

fn scheduler_loop(inner: Arc<EcuInner>) {
    debug!("scheduler thread started");
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let mut next_wakeup: Option<Instant> = None;
        let mut bump = |candidate: Instant, slot: &mut Option<Instant>| {
            *slot = Some(slot.map_or(candidate, |cur| cur.min(candidate)));
        };

        if let Some(deadline) = inner.transport21.lock().unwrap().tick(now, inner.as_ref()) {
            bump(deadline, &mut next_wakeup);
        }
        if let Some(deadline) = inner.transport22.lock().unwrap().tick(now, inner.as_ref()) {
            bump(deadline, &mut next_wakeup);
        }

        let due_callbacks: Vec<Arc<dyn Fn() + Send + Sync>> = {
            let mut timers = inner.timers.lock().unwrap();
            let mut due = Vec::new();
            for timer in timers.iter_mut() {
                if timer.next <= now {
                    due.push(timer.callback.clone());
                    timer.next = now + timer.period;
                }
                bump(timer.next, &mut next_wakeup);
            }
            due
        };
        for callback in due_callbacks {
            callback();
        }

        let cas: Vec<Arc<ControllerApplication>> = inner.cas.lock().unwrap().values().cloned().collect();
        for ca in cas {
            if let Some(deadline) = ca.tick(now) {
                bump(deadline, &mut next_wakeup);
            }
        }

        let wait = next_wakeup.map(|d| d.saturating_duration_since(now)).unwrap_or(Duration::from_millis(100));
        let guard = inner.wake_lock.lock().unwrap();
        let _ = inner.wake.wait_timeout(guard, wait.min(Duration::from_millis(100)));
    }
    debug!("scheduler thread stopped");
}

fn listener_loop(inner: Arc<EcuInner>) {
    debug!("listener thread started");
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let frame = {
            let mut port = inner.port.lock().unwrap();
            match port.as_mut() {
                Some(port) => port.receive(),
                None => {
                    drop(port);
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }
        };
        match frame {
            Ok(frame) => {
                if !frame.is_extended || frame.data.is_empty() {
                    continue;
                }
                dispatch_inbound(&inner, frame.id, &frame.data, frame.timestamp as f64);
            }
            Err(AutomotiveError::Timeout) => continue,
            Err(e) => {
                error!("listener: driver read failed: {}", e);
            }
        }
    }
    debug!("listener thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::j1939::name::NameFields;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct LoopbackPort {
        inbox: Arc<StdMutex<std::collections::VecDeque<Frame>>>,
    }

    impl Port for LoopbackPort {
        fn send(&mut self, frame: &Frame) -> Result<()> {
            self.inbox.lock().unwrap().push_back(frame.clone());
            Ok(())
        }
        fn receive(&mut self) -> Result<Frame> {
            self.inbox.lock().unwrap().pop_front().ok_or(AutomotiveError::Timeout)
        }
        fn set_timeout(&mut self, _ms: u32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ecu_direct_send_reaches_subscriber() {
        let ecu = Ecu::new(EcuConfig::default()).unwrap();
        let inbox = Arc::new(StdMutex::new(std::collections::VecDeque::new()));
        ecu.connect(Box::new(LoopbackPort { inbox: inbox.clone() })).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        ecu.subscribe(
            Filter::Any,
            Arc::new(move |_ind| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        ecu.send_pgn(6, known::DM01, 0x90, &[0u8; 8]).unwrap();
        let frame = inbox.lock().unwrap().pop_front().unwrap();
        ecu.notify(frame.id, &frame.data, 0.0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        ecu.stop();
    }

    #[test]
    fn add_ca_bypassing_claim_is_immediately_normal() {
        let ecu = Ecu::new(EcuConfig::default()).unwrap();
        let name = Name::new(NameFields { identity_number: 42, ..Default::default() }).unwrap();
        let ca = ecu.add_ca(name, 0x80, true);
        assert_eq!(ca.device_address(), Some(0x80));
    }
}
