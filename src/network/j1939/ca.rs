//! Controller Application: one NAME/address pair and its address-claim state
//! machine, plus request/acknowledge subscriptions layered on top of the
//! owning [`Ecu`](super::ecu::Ecu)'s registry.
//!
//! The ECU owns its Controller Applications through `Arc`; each CA only holds
//! a non-owning [`Weak`] handle back to the ECU, so the two can't keep each
//! other alive in a reference cycle and a CA can still reach its ECU to send
//! frames or touch the subscriber registry for as long as the ECU exists.

use super::address_claim::{Action, AddressClaimer, State};
use super::diagnostics::{Dm1, Dm11, Dm22};
use super::ecu::{send_pgn_via, EcuInner};
use super::filter::{Filter, Indication};
use super::memory_access::{dm15_encode_error, dm15_encode_proceed, dm16_encode, Dm15Status, MemoryAccess, ServerAction};
use super::name::Name;
use super::pgn::{address, known, pgn_matches};
use crate::error::Result;
use log::warn;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

const ADDRESS_CLAIM_PRIORITY: u8 = 6;
const MEMORY_ACCESS_PRIORITY: u8 = 6;

pub type CaCallback = Arc<dyn Fn(u8) + Send + Sync>;

struct CaSubscriptions {
    request: Mutex<Vec<CaCallback>>,
    acknowledge: Mutex<Vec<CaCallback>>,
}

/// A logical endpoint on the bus: a NAME, an address it is trying to (or has)
/// claimed, and the subscriptions scoped to that address.
pub struct ControllerApplication {
    claimer: Mutex<AddressClaimer>,
    ecu: Weak<EcuInner>,
    subscriptions: CaSubscriptions,
    pub dm1: Dm1,
    pub dm11: Dm11,
    pub dm22: Dm22,
    pub memory_access: MemoryAccess,
    pending_write: Mutex<Option<(u8, Vec<u8>)>>,
}

impl ControllerApplication {
    pub(crate) fn new(name: Name, preferred_address: u8, ecu: Weak<EcuInner>) -> Self {
        ControllerApplication {
            claimer: Mutex::new(AddressClaimer::new(name, preferred_address)),
            ecu,
            subscriptions: CaSubscriptions {
                request: Mutex::new(Vec::new()),
                acknowledge: Mutex::new(Vec::new()),
            },
            dm1: Dm1::new(),
            dm11: Dm11::new(),
            dm22: Dm22::new(),
            memory_access: MemoryAccess::new(),
            pending_write: Mutex::new(None),
        }
    }

    pub fn name(&self) -> Name {
        self.claimer.lock().unwrap().name()
    }

    pub fn state(&self) -> State {
        self.claimer.lock().unwrap().state()
    }

    pub fn device_address(&self) -> Option<u8> {
        self.claimer.lock().unwrap().address()
    }

    /// Begin the address-claim handshake, transmitting the initial claim.
    pub fn start(&self) {
        let action = self.claimer.lock().unwrap().start(Instant::now());
        let _ = self.emit(action);
    }

    /// Skip WAIT_VETO and become NORMAL immediately at the preferred address.
    /// For tests and bench setups where contention is known not to occur.
    pub(crate) fn force_claim(&self) {
        let mut claimer = self.claimer.lock().unwrap();
        claimer.start(Instant::now());
        claimer.tick(Instant::now() + super::address_claim::VETO_PERIOD);
    }

    pub(crate) fn on_address_claimed(&self, claimed_address: u8, claimant_name: Name) -> Option<Action> {
        let action = self
            .claimer
            .lock()
            .unwrap()
            .on_address_claimed(claimed_address, claimant_name, Instant::now());
        if action == Action::None {
            None
        } else {
            Some(action)
        }
    }

    pub(crate) fn on_request_for_address_claim(&self) -> Option<Action> {
        let action = self.claimer.lock().unwrap().on_request_for_address_claim();
        if action == Action::None {
            None
        } else {
            Some(action)
        }
    }

    pub(crate) fn tick(&self, now: Instant) -> Option<Instant> {
        self.claimer.lock().unwrap().tick(now)
    }

    pub(crate) fn emit(&self, action: Action) -> Result<()> {
        let Some(ecu) = self.ecu.upgrade() else {
            return Ok(());
        };
        // Address Claimed is always broadcast: the destination embedded in the PGN
        // is GLOBAL, while the CAN source address is the claiming (or NULL) address.
        let broadcast_claim_pgn = (known::ADDRESSCLAIM & !0xFF) | address::GLOBAL as u32;
        match action {
            Action::SendClaim(addr) => {
                let name_bytes = self.name().to_bytes();
                send_pgn_via(&ecu, ADDRESS_CLAIM_PRIORITY, broadcast_claim_pgn, addr, &name_bytes)
            }
            Action::SendCannotClaim => {
                let name_bytes = self.name().to_bytes();
                send_pgn_via(&ecu, ADDRESS_CLAIM_PRIORITY, broadcast_claim_pgn, address::NULL, &name_bytes)
            }
            Action::None => Ok(()),
        }
    }

    /// Send a PGN from this CA's claimed address. Fails silently (returns Ok)
    /// if the address has not yet been claimed; callers should check [`state`](Self::state).
    pub fn send_pgn(&self, priority: u8, pgn: u32, data: &[u8]) -> Result<()> {
        let Some(ecu) = self.ecu.upgrade() else {
            return Ok(());
        };
        let Some(src) = self.device_address() else {
            return Ok(());
        };
        send_pgn_via(&ecu, priority, pgn, src, data)
    }

    /// Queue a small PG for Multi-PG packing from this CA's claimed address,
    /// sharing a frame with other PGs queued under the same `slot`.
    #[allow(clippy::too_many_arguments)]
    pub fn send_pgn_multiplexed(
        &self,
        slot: u8,
        priority: u8,
        dst: u8,
        tos: u8,
        tf: u8,
        cpgn: u32,
        payload: &[u8],
        time_limit: std::time::Duration,
    ) -> Result<()> {
        let Some(ecu) = self.ecu.upgrade() else {
            return Ok(());
        };
        let Some(src) = self.device_address() else {
            return Ok(());
        };
        ecu.send_pgn_multiplexed(slot, priority, src, dst, tos, tf, cpgn, payload, time_limit)
    }

    /// Send a PGN 59904 REQUEST for `target_pgn` to `destination` (use
    /// `address::GLOBAL` for a broadcast request).
    pub fn send_request(&self, target_pgn: u32, destination: u8) -> Result<()> {
        let bytes = target_pgn.to_le_bytes();
        let payload = [bytes[0], bytes[1], bytes[2]];
        let full_pgn = (known::REQUEST & !0xFF) | destination as u32;
        self.send_pgn(6, full_pgn, &payload)
    }

    /// Begin a DM14 read against `target`, transmitting the initial request.
    /// Completion (or a seed/key challenge) arrives asynchronously through the
    /// inbound DM15/DM16 handlers below; register a [`MemoryAccess::set_notify`]
    /// callback beforehand to learn the outcome.
    pub fn memory_access_read(&self, target: u8, address: u32, object_count: u16, direct: bool) -> Result<()> {
        let frame = self.memory_access.read(target, address, object_count, direct)?;
        let full_pgn = (known::DM14 & !0xFF) | target as u32;
        self.send_pgn(MEMORY_ACCESS_PRIORITY, full_pgn, &frame)
    }

    /// Begin a DM14 write against `target`. `data` is buffered and sent as DM16
    /// once the responder's DM15 clears the transaction for data transfer.
    pub fn memory_access_write(&self, target: u8, address: u32, data: &[u8], direct: bool) -> Result<()> {
        let frame = self.memory_access.write(target, address, data.len() as u16, direct)?;
        *self.pending_write.lock().unwrap() = Some((target, data.to_vec()));
        let full_pgn = (known::DM14 & !0xFF) | target as u32;
        self.send_pgn(MEMORY_ACCESS_PRIORITY, full_pgn, &frame)
    }

    /// Feed an inbound DM14 addressed to this CA's server side, transmitting
    /// whatever DM15/DM16 response the transaction calls for.
    pub(crate) fn handle_memory_access_request(&self, source: u8, data: &[u8]) {
        match self.memory_access.respond(source, data, Instant::now()) {
            Ok(action) => self.emit_memory_access(source, action),
            Err(e) => warn!("DM14 from {:#04x}: {}", source, e),
        }
    }

    /// Feed an inbound DM15 belonging to this CA's pending client-side transaction.
    pub(crate) fn handle_memory_access_status(&self, source: u8, data: &[u8]) {
        match self.memory_access.on_dm15(data) {
            Ok(Some(frame)) => {
                let full_pgn = (known::DM14 & !0xFF) | source as u32;
                let _ = self.send_pgn(MEMORY_ACCESS_PRIORITY, full_pgn, &frame);
            }
            Ok(None) => {
                if self.memory_access.pending_write_target() == Some(source) {
                    if let Some((target, payload)) = self.pending_write.lock().unwrap().take() {
                        self.memory_access.send_write_data();
                        let full_pgn = (known::DM16 & !0xFF) | target as u32;
                        let _ = self.send_pgn(MEMORY_ACCESS_PRIORITY, full_pgn, &dm16_encode(&payload));
                    }
                }
            }
            Err(e) => warn!("DM15 from {:#04x}: {}", source, e),
        }
    }

    /// Feed an inbound DM16 carrying the data read back from the responder.
    pub(crate) fn handle_memory_access_data(&self, source: u8, data: &[u8]) {
        if let Err(e) = self.memory_access.on_dm16(data) {
            warn!("DM16 from {:#04x}: {}", source, e);
        }
    }

    fn emit_memory_access(&self, peer: u8, action: ServerAction) {
        let full_dm15 = (known::DM15 & !0xFF) | peer as u32;
        let full_dm16 = (known::DM16 & !0xFF) | peer as u32;
        match action {
            ServerAction::SendDm15Proceed { direct, seed_or_ffff } => {
                let frame = dm15_encode_proceed(0, direct, Dm15Status::Proceed, seed_or_ffff);
                let _ = self.send_pgn(MEMORY_ACCESS_PRIORITY, full_dm15, &frame);
            }
            ServerAction::SendDm15Error { direct, status, error, edcp } => {
                let frame = dm15_encode_error(direct, status, &error, edcp);
                let _ = self.send_pgn(MEMORY_ACCESS_PRIORITY, full_dm15, &frame);
            }
            ServerAction::SendDm16(payload) => {
                let frame = dm16_encode(&payload);
                let _ = self.send_pgn(MEMORY_ACCESS_PRIORITY, full_dm16, &frame);
            }
            // The proceed/notify hooks already ran inside `MemoryAccessServer::on_dm14`;
            // these two variants mark state transitions with nothing left to transmit.
            ServerAction::ReadyForData | ServerAction::WriteAccepted => {}
        }
    }

    /// Subscribe to every inbound PDU addressed to this CA (or global).
    pub fn subscribe(&self, callback: super::filter::Callback) -> Option<super::filter::SubscriptionId> {
        let ecu = self.ecu.upgrade()?;
        let addr = self.device_address()?;
        Some(ecu.registry.subscribe(Filter::Address(addr), callback))
    }

    /// Subscribe to inbound REQUEST (PGN 59904) messages directed at this CA.
    pub fn subscribe_request(&self, callback: CaCallback) -> Option<super::filter::SubscriptionId> {
        let ecu = self.ecu.upgrade()?;
        let addr = self.device_address()?;
        self.subscriptions.request.lock().unwrap().push(callback.clone());
        let wrapped: super::filter::Callback = Arc::new(move |ind: &Indication| {
            if pgn_matches(ind.pgn, known::REQUEST) {
                callback(ind.source_address);
            }
        });
        Some(ecu.registry.subscribe(Filter::Address(addr), wrapped))
    }

    /// Subscribe to Address Claimed messages acknowledging/contending this CA's claim.
    pub fn subscribe_acknowledge(&self, callback: CaCallback) -> Option<super::filter::SubscriptionId> {
        let ecu = self.ecu.upgrade()?;
        self.subscriptions.acknowledge.lock().unwrap().push(callback.clone());
        let wrapped: super::filter::Callback = Arc::new(move |ind: &Indication| {
            if pgn_matches(ind.pgn, known::ADDRESSCLAIM) {
                callback(ind.source_address);
            }
        });
        Some(ecu.registry.subscribe(Filter::Any, wrapped))
    }

    pub fn stop(&self) {
        // Address-claim state is owned entirely by this CA; dropping the CA
        // from the ECU's table (via Ecu::remove_ca) is what actually frees it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::j1939::ecu::{Ecu, EcuConfig};
    use crate::network::j1939::name::NameFields;

    #[test]
    fn device_address_unset_before_start() {
        let ecu = Ecu::new(EcuConfig::default()).unwrap();
        let name = Name::new(NameFields { identity_number: 7, ..Default::default() }).unwrap();
        let ca = ecu.add_ca(name, 0x80, false);
        // start() was already invoked by add_ca; immediately after, state is WAIT_VETO
        // with the preferred address provisionally held.
        assert_eq!(ca.device_address(), Some(0x80));
        assert_eq!(ca.state(), State::WaitVeto);
    }
}
