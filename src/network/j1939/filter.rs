//! Subscriber registry and dispatch filter.
//!
//! Each subscriber's destination filter is an explicit tagged enum rather than
//! a loosely-typed "none, one address, or predicate" value, so the match in
//! [`Registry::notify`] is exhaustive and the compiler catches a missing case.

use super::pgn::address;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Payload handed to a subscriber on each inbound PDU.
#[derive(Debug, Clone)]
pub struct Indication {
    pub priority: u8,
    pub pgn: u32,
    pub source_address: u8,
    pub destination: u8,
    pub timestamp: f64,
    pub data: Vec<u8>,
}

/// Which destination addresses a subscriber wants to see.
#[derive(Clone)]
pub enum Filter {
    /// Matches every inbound PDU regardless of destination.
    Any,
    /// Matches only PDUs addressed to this specific address.
    Address(u8),
    /// Matches PDUs whose destination satisfies the predicate.
    Predicate(Arc<dyn Fn(u8) -> bool + Send + Sync>),
}

impl Filter {
    fn matches(&self, destination: u8) -> bool {
        match self {
            Filter::Any => true,
            Filter::Address(addr) => destination == *addr,
            Filter::Predicate(pred) => pred(destination),
        }
    }
}

pub type Callback = Arc<dyn Fn(&Indication) + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Filter,
    callback: Callback,
}

/// Registry of subscribers invoked in registration order on each inbound PDU.
///
/// Global broadcasts (`destination == GLOBAL`) are delivered to every
/// subscriber regardless of filter, since a broadcast has no single addressee
/// for a destination filter to match against.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<RegistryState>>,
}

struct RegistryState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// An opaque handle returned by [`Registry::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Arc::new(Mutex::new(RegistryState {
                next_id: 1,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Register a callback, returning a handle that [`unsubscribe`](Self::unsubscribe) accepts.
    pub fn subscribe(&self, filter: Filter, callback: Callback) -> SubscriptionId {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, filter, callback });
        SubscriptionId(id)
    }

    /// Remove a previously registered subscriber. No-op if already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.inner.lock().unwrap();
        state.subscribers.retain(|s| s.id != id.0);
    }

    /// `true` if at least one subscriber would accept traffic addressed to `destination`.
    pub fn is_acceptable(&self, destination: u8) -> bool {
        let state = self.inner.lock().unwrap();
        state.subscribers.iter().any(|s| s.filter.matches(destination))
    }

    /// Fan out an inbound PDU to every matching subscriber, in registration order.
    /// A panicking subscriber is caught and logged; dispatch continues for the rest
    /// so one broken callback can't stop traffic from reaching everyone else.
    pub fn notify(&self, indication: &Indication) {
        let callbacks: Vec<Callback> = {
            let state = self.inner.lock().unwrap();
            state
                .subscribers
                .iter()
                .filter(|s| {
                    indication.destination == address::GLOBAL || s.filter.matches(indication.destination)
                })
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(indication)));
            if result.is_err() {
                log::error!(
                    "subscriber panicked while handling PGN {:#x} from {:#04x}",
                    indication.pgn,
                    indication.source_address
                );
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribe_unsubscribe_idempotent() {
        let registry = Registry::new();
        assert_eq!(registry.len(), 0);
        let id = registry.subscribe(Filter::Any, Arc::new(|_| {}));
        assert_eq!(registry.len(), 1);
        registry.unsubscribe(id);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn global_destination_reaches_address_filtered_subscriber() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        registry.subscribe(
            Filter::Address(0x10),
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.notify(&Indication {
            priority: 6,
            pgn: 0xFECA,
            source_address: 0x20,
            destination: address::GLOBAL,
            timestamp: 0.0,
            data: vec![],
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_order_preserved() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            registry.subscribe(
                Filter::Any,
                Arc::new(move |_| order.lock().unwrap().push(i)),
            );
        }
        registry.notify(&Indication {
            priority: 6,
            pgn: 0,
            source_address: 0,
            destination: address::GLOBAL,
            timestamp: 0.0,
            data: vec![],
        });
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
