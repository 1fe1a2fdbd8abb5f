//! SAE J1939 higher-layer protocol stack: frame codec, transport protocols
//! (classical and CAN-FD), address claiming, memory-access diagnostics, and
//! cyclic diagnostic messaging, wired together by a single-threaded scheduler.

pub mod address_claim;
pub mod ca;
pub mod diagnostics;
pub mod dtc;
pub mod ecu;
pub mod filter;
pub mod frame;
pub mod memory_access;
pub mod name;
pub mod pgn;
pub mod transport21;
pub mod transport22;

pub use ca::ControllerApplication;
pub use diagnostics::{Dm1, Dm11, Dm22};
pub use dtc::{dtc_pack, dtc_unpack, Dtc};
pub use ecu::{DataLinkLayer, Ecu, EcuConfig};
pub use filter::{Filter, Indication, Registry, SubscriptionId};
pub use memory_access::{MemoryAccess, MemoryAccessQuery, MemoryAccessServer};
pub use name::{Name, NameFields};
pub use pgn::{address, known, Pgn};
