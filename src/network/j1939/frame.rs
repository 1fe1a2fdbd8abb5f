//! 29-bit CAN identifier codec: `priority(3) | data_page(1) | reserved(1) |
//! pdu_format(8) | pdu_specific(8) | source_address(8)`, bijective with the
//! `(priority, pgn, source_address)` triple used throughout the stack.

use super::pgn::Pgn;
use crate::error::{AutomotiveError, J1939Error, Result};

/// Encode `(priority, pgn, source_address)` into a 29-bit CAN identifier.
///
/// The result always has bit 31 (and bits 29-30) clear: a 29-bit value fits in
/// `0..=0x1FFFFFFF`.
pub fn encode_can_id(priority: u8, pgn: u32, source_address: u8) -> Result<u32> {
    if priority > 0x7 {
        return Err(AutomotiveError::J1939Error(J1939Error::BadField("priority")));
    }
    if pgn > 0x3FFFF {
        return Err(AutomotiveError::J1939Error(J1939Error::BadField("pgn")));
    }
    Ok(((priority as u32) << 26) | (pgn << 8) | (source_address as u32))
}

/// Decode a 29-bit CAN identifier into `(priority, pgn, source_address)`.
pub fn decode_can_id(can_id: u32) -> (u8, u32, u8) {
    let priority = ((can_id >> 26) & 0x7) as u8;
    let pgn = (can_id >> 8) & 0x3FFFF;
    let source_address = (can_id & 0xFF) as u8;
    (priority, pgn, source_address)
}

/// Destination address implied by a PGN/source pair: for PDU1 PGNs the
/// destination is carried in `pdu_specific`; for PDU2 PGNs the message is a
/// broadcast and the destination is GLOBAL.
pub fn destination_of(pgn: u32) -> u8 {
    let fields = Pgn::from_value(pgn);
    if fields.is_pdu1() {
        fields.pdu_specific
    } else {
        super::pgn::address::GLOBAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        for priority in 0u8..8 {
            for pgn in [0x00DF00u32, 0x00FECAu32, 0x03FFFFu32] {
                for sa in [0u8, 0x90, 0xFE, 0xFF] {
                    let id = encode_can_id(priority, pgn, sa).unwrap();
                    assert_eq!(id & 0xE0000000, 0);
                    assert_eq!(decode_can_id(id), (priority, pgn, sa));
                }
            }
        }
    }

    #[test]
    fn s1_rts_id_matches() {
        // S1: src=0x90 dst=0x9B, PGN 60416 (TP.CM) -> 0x18EC9B90
        let id = encode_can_id(6, 0x00EC00 | 0x9B, 0x90).unwrap();
        assert_eq!(id, 0x18EC9B90);
    }

    #[test]
    fn destination_pdu1_vs_pdu2() {
        assert_eq!(destination_of(0x00EC9B), 0x9B);
        assert_eq!(destination_of(0x00FECA), super::super::pgn::address::GLOBAL);
    }
}
