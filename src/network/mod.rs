//! Network layer implementations for automotive protocols.
//!
//! This module provides implementations for network layer protocols, primarily:
//! - J1939 (SAE J1939) - A higher-layer protocol for commercial vehicles
//!
//! The network layer is responsible for:
//! - Message routing and addressing
//! - Network management
//! - Message prioritization
//! - Protocol-specific addressing schemes
//!
//! The J1939 protocol is widely used in commercial vehicles and provides:
//! - Parameter Group Numbers (PGN) based addressing
//! - Multi-packet message transport
//! - Network management functions
//! - Standardized diagnostic messages
//!
//! # Examples
//!
//! ```rust,no_run
//! use libautomotive::network::j1939::{Ecu, EcuConfig, Name, NameFields};
//!
//! let ecu = Ecu::new(EcuConfig::default())?;
//! let name = Name::new(NameFields { identity_number: 1, ..Default::default() })?;
//! let ca = ecu.add_ca(name, 0x80, false);
//! ca.send_pgn(6, 0xFECA, &[0u8; 8])?;
//! # Ok::<(), libautomotive::error::AutomotiveError>(())
//! ```
//!
//! `j1939::Ecu` is driven by a background scheduler thread and a dedicated
//! listener thread rather than a single blocking send/receive call, so it does
//! not implement a shared single-message `NetworkLayer` trait the way the
//! request/response transports under `transport` do.

pub mod j1939;
