//! 64-bit NAME codec (SAE J1939-81).
//!
//! A NAME identifies a Controller Application uniquely on the network and is used
//! to arbitrate address-claim contention: NAMEs are totally ordered by their raw
//! 64-bit value, lower wins.

use crate::error::{AutomotiveError, J1939Error};
use crate::error::Result;

/// The decoded fields of a 64-bit NAME, per SAE J1939-81.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameFields {
    pub arbitrary_address_capable: bool,
    pub industry_group: u8,
    pub vehicle_system_instance: u8,
    pub vehicle_system: u8,
    pub function: u8,
    pub function_instance: u8,
    pub ecu_instance: u8,
    pub manufacturer_code: u16,
    pub identity_number: u32,
}

impl Default for NameFields {
    fn default() -> Self {
        NameFields {
            arbitrary_address_capable: false,
            industry_group: 0,
            vehicle_system_instance: 0,
            vehicle_system: 0,
            function: 0,
            function_instance: 0,
            ecu_instance: 0,
            manufacturer_code: 0,
            identity_number: 0,
        }
    }
}

/// A NAME is the immutable 64-bit identity of a Controller Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(u64);

impl Name {
    /// Construct a NAME from its decoded fields, range-checking each one.
    pub fn new(fields: NameFields) -> Result<Self> {
        Ok(Name(name_pack(&fields)?))
    }

    /// Wrap a raw 64-bit NAME value without field validation (e.g. received off the wire).
    pub fn from_raw(value: u64) -> Self {
        Name(value)
    }

    /// The raw 64-bit NAME value. Lower values win address-claim contention.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Decode the packed fields back out.
    pub fn fields(&self) -> NameFields {
        name_unpack(self.0)
    }

    /// Little-endian 8-byte wire representation.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Parse a NAME from its little-endian 8-byte wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(AutomotiveError::J1939Error(J1939Error::BadLength));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        Ok(Name(u64::from_le_bytes(raw)))
    }

    pub fn arbitrary_address_capable(&self) -> bool {
        (self.0 >> 63) & 0x1 != 0
    }
}

fn range_check(cond: bool, field: &'static str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(AutomotiveError::J1939Error(J1939Error::BadField(field)))
    }
}

/// Pack decoded NAME fields into the raw 64-bit value, bit layout (LSB first):
/// identity_number(21) | manufacturer_code(11) | ecu_instance(3) | function_instance(5) |
/// function(8) | reserved(1) | vehicle_system(7) | vehicle_system_instance(4) |
/// industry_group(3) | arbitrary_address_capable(1).
pub fn name_pack(fields: &NameFields) -> Result<u64> {
    range_check(fields.industry_group <= 0x7, "industry_group")?;
    range_check(fields.vehicle_system_instance <= 0xF, "vehicle_system_instance")?;
    range_check(fields.vehicle_system <= 0x7F, "vehicle_system")?;
    range_check(fields.function_instance <= 0x1F, "function_instance")?;
    range_check(fields.ecu_instance <= 0x7, "ecu_instance")?;
    range_check(fields.manufacturer_code <= 0x7FF, "manufacturer_code")?;
    range_check(fields.identity_number <= 0x1FFFFF, "identity_number")?;

    let value = (fields.identity_number as u64)
        | ((fields.manufacturer_code as u64) << 21)
        | ((fields.ecu_instance as u64) << 32)
        | ((fields.function_instance as u64) << 35)
        | ((fields.function as u64) << 40)
        // bit 48 is reserved, left 0
        | ((fields.vehicle_system as u64) << 49)
        | ((fields.vehicle_system_instance as u64) << 56)
        | ((fields.industry_group as u64) << 60)
        | ((fields.arbitrary_address_capable as u64) << 63);
    Ok(value)
}

/// Unpack the raw 64-bit NAME value into its fields.
pub fn name_unpack(value: u64) -> NameFields {
    NameFields {
        identity_number: (value & 0x1FFFFF) as u32,
        manufacturer_code: ((value >> 21) & 0x7FF) as u16,
        ecu_instance: ((value >> 32) & 0x7) as u8,
        function_instance: ((value >> 35) & 0x1F) as u8,
        function: ((value >> 40) & 0xFF) as u8,
        vehicle_system: ((value >> 49) & 0x7F) as u8,
        vehicle_system_instance: ((value >> 56) & 0xF) as u8,
        industry_group: ((value >> 60) & 0x7) as u8,
        arbitrary_address_capable: (value >> 63) & 0x1 != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let fields = NameFields {
            arbitrary_address_capable: true,
            industry_group: 5,
            vehicle_system_instance: 9,
            vehicle_system: 0x55,
            function: 0x81,
            function_instance: 0x1A,
            ecu_instance: 0x3,
            manufacturer_code: 0x321,
            identity_number: 0x1ABCDE,
        };
        let name = Name::new(fields).unwrap();
        assert_eq!(name.fields(), fields);
        assert_eq!(name.to_bytes()[0], (name.value() & 0xFF) as u8);
    }

    #[test]
    fn out_of_range_field_rejected() {
        let mut fields = NameFields::default();
        fields.industry_group = 0xFF;
        assert!(Name::new(fields).is_err());
    }

    #[test]
    fn lower_value_wins_contention() {
        let low = Name::from_raw(10);
        let high = Name::from_raw((1u64 << 63) | 10);
        assert!(low < high);
    }

    #[test]
    fn bytes_roundtrip() {
        let name = Name::from_raw(0x0102030405060708);
        let bytes = name.to_bytes();
        assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(Name::from_bytes(&bytes).unwrap(), name);
    }
}
