//! Address-claim state machine: NONE -> WAIT_VETO -> NORMAL, or
//! NONE -> CANNOT_CLAIM when the preferred NAME loses to an unclaimable peer.

use super::name::Name;
use super::pgn::address;
use log::{debug, info};
use std::time::{Duration, Instant};

/// How long a claimed address is held open to contention before becoming final.
pub const VETO_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No address has been claimed and no attempt is in progress.
    None,
    /// A claim has been sent; still within the contention window.
    WaitVeto,
    /// The address is held uncontested.
    Normal,
    /// Arbitrary-address-incapable and out-NAME'd; this CA cannot take the bus.
    CannotClaim,
}

/// Drives address claiming for a single Controller Application NAME.
pub struct AddressClaimer {
    name: Name,
    preferred_address: u8,
    address: Option<u8>,
    state: State,
    veto_deadline: Option<Instant>,
}

/// `true` for the fixed, single-device address ranges (0-127, 248-253) that settle
/// without contention instead of going through the veto window.
fn is_single_device_range(addr: u8) -> bool {
    addr <= 127 || (248..=253).contains(&addr)
}

/// Next address to try after losing contention, skipping the reserved NULL/GLOBAL
/// addresses and wrapping back to 0 past the top of the claimable range.
fn next_candidate_address(addr: u8) -> u8 {
    if addr >= 253 {
        0
    } else {
        addr + 1
    }
}

/// An action the caller must perform as a result of feeding an event in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transmit an Address Claimed message (PGN 60928) with this NAME, from this address.
    SendClaim(u8),
    /// Transmit a Cannot Claim Address message (NAME only, destination-specific address 0xFE).
    SendCannotClaim,
    None,
}

impl AddressClaimer {
    pub fn new(name: Name, preferred_address: u8) -> Self {
        AddressClaimer {
            name,
            preferred_address,
            address: None,
            state: State::None,
            veto_deadline: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn address(&self) -> Option<u8> {
        self.address
    }

    pub fn name(&self) -> Name {
        self.name
    }

    /// Begin claiming the preferred address. Returns the claim to transmit.
    ///
    /// Addresses in the single-device ranges 0-127 and 248-253 are reserved for
    /// one function each and never contended, so a claim there settles immediately;
    /// every other address has to sit through the veto window before it's final.
    pub fn start(&mut self, now: Instant) -> Action {
        self.address = Some(self.preferred_address);
        if is_single_device_range(self.preferred_address) {
            self.state = State::Normal;
            self.veto_deadline = None;
            debug!("address-claim: {:#04x} is a single-device address, claiming immediately", self.preferred_address);
        } else {
            self.state = State::WaitVeto;
            self.veto_deadline = Some(now + VETO_PERIOD);
            debug!("address-claim: attempting {:#04x}", self.preferred_address);
        }
        Action::SendClaim(self.preferred_address)
    }

    /// A competing Address Claimed was received for `claimed_address` with `claimant_name`.
    pub fn on_address_claimed(&mut self, claimed_address: u8, claimant_name: Name, now: Instant) -> Action {
        let Some(our_address) = self.address else {
            return Action::None;
        };
        if claimed_address != our_address {
            return Action::None;
        }
        if claimant_name == self.name {
            // Our own claim echoed back; ignore.
            return Action::None;
        }

        if claimant_name < self.name {
            // We lose the contention.
            if self.name.arbitrary_address_capable() {
                let next_address = next_candidate_address(our_address);
                info!(
                    "address-claim: lost {:#04x}, retrying at {:#04x} (arbitrary-capable)",
                    our_address, next_address
                );
                self.address = Some(next_address);
                self.state = State::WaitVeto;
                self.veto_deadline = Some(now + VETO_PERIOD);
                return Action::SendClaim(next_address);
            } else {
                info!("address-claim: lost {:#04x} and cannot retry; moving to CANNOT_CLAIM", our_address);
                self.address = None;
                self.state = State::CannotClaim;
                self.veto_deadline = None;
                return Action::SendCannotClaim;
            }
        } else {
            // Our NAME wins; re-assert the claim.
            debug!("address-claim: re-asserting {:#04x} against a losing contender", our_address);
            return Action::SendClaim(our_address);
        }
    }

    /// Someone requested Address Claimed (PGN 59904 against PGN 60928, or global).
    pub fn on_request_for_address_claim(&self) -> Action {
        match (self.state, self.address) {
            (State::Normal, Some(addr)) | (State::WaitVeto, Some(addr)) => Action::SendClaim(addr),
            (State::CannotClaim, _) => Action::SendCannotClaim,
            _ => Action::None,
        }
    }

    /// Advance time; transitions WAIT_VETO -> NORMAL once the veto period elapses.
    /// Returns the next wakeup instant if still waiting.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        if self.state == State::WaitVeto {
            if let Some(deadline) = self.veto_deadline {
                if now >= deadline {
                    self.state = State::Normal;
                    self.veto_deadline = None;
                    info!("address-claim: {:#04x} is now NORMAL", self.address.unwrap_or(address::NULL));
                    return None;
                }
                return Some(deadline);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::j1939::name::NameFields;

    fn name(identity: u32) -> Name {
        Name::new(NameFields {
            identity_number: identity,
            ..Default::default()
        })
        .unwrap()
    }

    fn arbitrary_name(identity: u32) -> Name {
        Name::new(NameFields {
            identity_number: identity,
            arbitrary_address_capable: true,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn claim_then_normal_after_veto() {
        let mut claimer = AddressClaimer::new(name(1), 0x80);
        let now = Instant::now();
        assert_eq!(claimer.start(now), Action::SendClaim(0x80));
        assert_eq!(claimer.state(), State::WaitVeto);
        assert!(claimer.tick(now).is_some());
        claimer.tick(now + VETO_PERIOD);
        assert_eq!(claimer.state(), State::Normal);
    }

    #[test]
    fn single_device_address_skips_veto() {
        let mut claimer = AddressClaimer::new(name(1), 0x05);
        let now = Instant::now();
        assert_eq!(claimer.start(now), Action::SendClaim(0x05));
        assert_eq!(claimer.state(), State::Normal);
        assert_eq!(claimer.tick(now), None);
    }

    #[test]
    fn loses_to_lower_name_and_cannot_retry() {
        let mut claimer = AddressClaimer::new(name(100), 0x80);
        let now = Instant::now();
        claimer.start(now);
        let action = claimer.on_address_claimed(0x80, name(1), now);
        assert_eq!(action, Action::SendCannotClaim);
        assert_eq!(claimer.state(), State::CannotClaim);
        assert_eq!(claimer.address(), None);
    }

    #[test]
    fn loses_to_lower_name_but_arbitrary_capable_retries_next_address() {
        let mut claimer = AddressClaimer::new(arbitrary_name(100), 0x80);
        let now = Instant::now();
        claimer.start(now);
        let action = claimer.on_address_claimed(0x80, name(1), now);
        assert_eq!(action, Action::SendClaim(0x81));
        assert_eq!(claimer.state(), State::WaitVeto);
        assert_eq!(claimer.address(), Some(0x81));
    }

    #[test]
    fn wins_against_higher_name_by_reasserting() {
        let mut claimer = AddressClaimer::new(name(1), 0x80);
        let now = Instant::now();
        claimer.start(now);
        let action = claimer.on_address_claimed(0x80, name(100), now);
        assert_eq!(action, Action::SendClaim(0x80));
        assert_eq!(claimer.state(), State::WaitVeto);
    }

    #[test]
    fn request_while_normal_reasserts() {
        let mut claimer = AddressClaimer::new(name(1), 0x80);
        let now = Instant::now();
        claimer.start(now);
        claimer.tick(now + VETO_PERIOD);
        assert_eq!(claimer.on_request_for_address_claim(), Action::SendClaim(0x80));
    }
}
