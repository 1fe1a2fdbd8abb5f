//! End-to-end tests driving two in-process `Ecu`s over a shared in-memory bus:
//! address claim, direct PGN delivery, and a segmented (>8 byte) transfer
//! carried by the J1939-21 transport protocol.

use libautomotive::error::{AutomotiveError, Result};
use libautomotive::j1939::{Ecu, EcuConfig, Filter, Name, NameFields};
use libautomotive::types::{Frame, Port};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One node's view of a shared bus: every frame sent by any node is pushed to
/// every other node's inbox, mirroring a real CAN bus's broadcast delivery.
struct BusPort {
    inbox: Arc<Mutex<VecDeque<Frame>>>,
    peers: Vec<Arc<Mutex<VecDeque<Frame>>>>,
}

impl Port for BusPort {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        for peer in &self.peers {
            peer.lock().unwrap().push_back(frame.clone());
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Frame> {
        self.inbox
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(AutomotiveError::Timeout)
    }

    fn set_timeout(&mut self, _ms: u32) -> Result<()> {
        Ok(())
    }
}

fn two_node_bus() -> (BusPort, BusPort) {
    let inbox_a = Arc::new(Mutex::new(VecDeque::new()));
    let inbox_b = Arc::new(Mutex::new(VecDeque::new()));
    let port_a = BusPort {
        inbox: inbox_a.clone(),
        peers: vec![inbox_b.clone()],
    };
    let port_b = BusPort {
        inbox: inbox_b,
        peers: vec![inbox_a],
    };
    (port_a, port_b)
}

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn address_claim_settles_to_normal_on_both_nodes() {
    let (port_a, port_b) = two_node_bus();
    let ecu_a = Ecu::new(EcuConfig::default()).unwrap();
    let ecu_b = Ecu::new(EcuConfig::default()).unwrap();
    ecu_a.connect(Box::new(port_a)).unwrap();
    ecu_b.connect(Box::new(port_b)).unwrap();

    let name_a = Name::new(NameFields { identity_number: 10, ..Default::default() }).unwrap();
    let name_b = Name::new(NameFields { identity_number: 20, ..Default::default() }).unwrap();
    let ca_a = ecu_a.add_ca(name_a, 0x80, false);
    let ca_b = ecu_b.add_ca(name_b, 0x80, false);

    // Both CAs contend for 0x80 with arbitrary_address_capable = false. The lower NAME
    // (ca_a, identity 10) wins and settles at Normal; ca_b (identity 20) loses and, having
    // no fallback address to retry, ends up CannotClaim rather than Normal.
    let settled = wait_until(
        || {
            ca_a.state() == libautomotive::j1939::address_claim::State::Normal
                && ca_b.state() == libautomotive::j1939::address_claim::State::CannotClaim
        },
        Duration::from_millis(500),
    );
    assert!(settled, "lower NAME should win the contended address, loser should give up");
    assert_ne!(ca_a.device_address(), None);
    assert_eq!(ca_b.device_address(), None);

    ecu_a.stop();
    ecu_b.stop();
}

#[test]
fn direct_pgn_delivered_across_bus() {
    let (port_a, port_b) = two_node_bus();
    let ecu_a = Ecu::new(EcuConfig::default()).unwrap();
    let ecu_b = Ecu::new(EcuConfig::default()).unwrap();
    ecu_a.connect(Box::new(port_a)).unwrap();
    ecu_b.connect(Box::new(port_b)).unwrap();

    let name_a = Name::new(NameFields { identity_number: 1, ..Default::default() }).unwrap();
    let ca_a = ecu_a.add_ca(name_a, 0x90, true);

    let received = Arc::new(AtomicUsize::new(0));
    let received_clone = received.clone();
    ecu_b.subscribe(
        Filter::Any,
        Arc::new(move |ind| {
            if ind.data == [1u8, 2, 3, 4, 5, 6, 7, 8] {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    ca_a.send_pgn(6, libautomotive::j1939::known::DM01, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

    let got_it = wait_until(|| received.load(Ordering::SeqCst) == 1, Duration::from_millis(300));
    assert!(got_it, "direct broadcast PGN should reach the subscriber on the other node");

    ecu_a.stop();
    ecu_b.stop();
}

#[test]
fn segmented_transfer_reassembles_on_peer() {
    let (port_a, port_b) = two_node_bus();
    let ecu_a = Ecu::new(EcuConfig::default()).unwrap();
    let ecu_b = Ecu::new(EcuConfig::default()).unwrap();
    ecu_a.connect(Box::new(port_a)).unwrap();
    ecu_b.connect(Box::new(port_b)).unwrap();

    let name_a = Name::new(NameFields { identity_number: 2, ..Default::default() }).unwrap();
    let ca_a = ecu_a.add_ca(name_a, 0x91, true);
    let dest_addr = 0x92u8;

    let payload: Vec<u8> = (0..30u8).collect();
    let reassembled = Arc::new(Mutex::new(None));
    let reassembled_clone = reassembled.clone();
    ecu_b.subscribe(
        Filter::Address(dest_addr),
        Arc::new(move |ind| {
            if ind.data.len() == 30 {
                *reassembled_clone.lock().unwrap() = Some(ind.data.clone());
            }
        }),
    );

    // DM14 (55552) is peer-to-peer (PDU1); route it to dest_addr explicitly.
    let full_pgn = (libautomotive::j1939::known::DM14 & !0xFF) | dest_addr as u32;
    ca_a.send_pgn(7, full_pgn, &payload).unwrap();

    let got_it = wait_until(|| reassembled.lock().unwrap().is_some(), Duration::from_millis(500));
    assert!(got_it, "segmented RTS/CTS transfer should reassemble on the receiving node");
    assert_eq!(reassembled.lock().unwrap().as_deref(), Some(payload.as_slice()));

    ecu_a.stop();
    ecu_b.stop();
}
