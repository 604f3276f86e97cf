use std::fmt;

pub mod connection;
pub mod datatype;
pub mod decode;
pub mod device;
pub mod transport;

pub use datatype::DataType;
pub use decode::{Decoder, Value};
pub use device::{Access, Device, Poller, Reference};
pub use transport::{ModbusTransport, RawData, TransportError};

pub type UnitId = tokio_modbus::prelude::SlaveId;
pub type Unit = tokio_modbus::prelude::Slave;

/// Failures after which a poller is disabled when auto-remove is on.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Largest coil/discrete-input window a single poller may read.
pub const MAX_BIT_QUANTITY: u16 = 2000;

// The protocol allows 125 registers per read; stay a little below it.
pub const MAX_REGISTER_QUANTITY: u16 = 123;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
}

impl FunctionCode {
    /// Maps the object-type name used in configuration rows.
    pub fn from_object_type(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "coil" => Some(Self::ReadCoils),
            "discrete_input" => Some(Self::ReadDiscreteInputs),
            "holding_register" => Some(Self::ReadHoldingRegisters),
            "input_register" => Some(Self::ReadInputRegisters),
            _ => None,
        }
    }

    pub fn is_bit_access(self) -> bool {
        matches!(self, Self::ReadCoils | Self::ReadDiscreteInputs)
    }

    pub fn max_quantity(self) -> u16 {
        if self.is_bit_access() {
            MAX_BIT_QUANTITY
        } else {
            MAX_REGISTER_QUANTITY
        }
    }

    /// Number of addressable units covered by a read of `quantity` items.
    ///
    /// Bit reads are addressed in packed bytes, so 10 coils span 2 units.
    pub fn effective_units(self, quantity: u16) -> u16 {
        if self.is_bit_access() {
            quantity.div_ceil(8)
        } else {
            quantity
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadCoils => "coil",
            Self::ReadDiscreteInputs => "discrete_input",
            Self::ReadHoldingRegisters => "holding_register",
            Self::ReadInputRegisters => "input_register",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Byte order within a word combined with word order across words.
///
/// Written `<byte order>_<word order>` in configuration rows, e.g. `BE_LE` is
/// big-endian bytes with the least significant word first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndianMode {
    BigBig,
    LittleBig,
    LittleLittle,
    #[default]
    BigLittle,
}

impl EndianMode {
    /// Unrecognised strings fall back to the default, `BE_LE`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "BE_BE" => Self::BigBig,
            "LE_BE" => Self::LittleBig,
            "LE_LE" => Self::LittleLittle,
            _ => Self::BigLittle,
        }
    }

    pub fn byte_order(self) -> ByteOrder {
        match self {
            Self::BigBig | Self::BigLittle => ByteOrder::Big,
            Self::LittleBig | Self::LittleLittle => ByteOrder::Little,
        }
    }

    pub fn word_order(self) -> ByteOrder {
        match self {
            Self::BigBig | Self::LittleBig => ByteOrder::Big,
            Self::LittleLittle | Self::BigLittle => ByteOrder::Little,
        }
    }
}

impl fmt::Display for EndianMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BigBig => "BE_BE",
            Self::LittleBig => "LE_BE",
            Self::LittleLittle => "LE_LE",
            Self::BigLittle => "BE_LE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn function_codes_from_object_types() {
    assert_eq!(
        FunctionCode::from_object_type("Holding_Register"),
        Some(FunctionCode::ReadHoldingRegisters)
    );
    assert_eq!(
        FunctionCode::from_object_type("discrete_input"),
        Some(FunctionCode::ReadDiscreteInputs)
    );
    assert_eq!(FunctionCode::from_object_type("register"), None);
    assert_eq!(FunctionCode::ReadCoils as u8, 1);
    assert_eq!(FunctionCode::ReadInputRegisters as u8, 4);
}

#[test]
fn effective_units_pack_bits_into_bytes() {
    assert_eq!(FunctionCode::ReadCoils.effective_units(1), 1);
    assert_eq!(FunctionCode::ReadCoils.effective_units(8), 1);
    assert_eq!(FunctionCode::ReadCoils.effective_units(9), 2);
    assert_eq!(FunctionCode::ReadHoldingRegisters.effective_units(9), 9);
}

#[test]
fn endian_modes() {
    assert_eq!(EndianMode::parse("be_be"), EndianMode::BigBig);
    assert_eq!(EndianMode::parse("LE_BE"), EndianMode::LittleBig);
    assert_eq!(EndianMode::parse("LE_LE"), EndianMode::LittleLittle);
    assert_eq!(EndianMode::parse("BE_LE"), EndianMode::BigLittle);
    assert_eq!(EndianMode::parse("middle"), EndianMode::BigLittle);
    assert_eq!(EndianMode::LittleBig.byte_order(), ByteOrder::Little);
    assert_eq!(EndianMode::LittleBig.word_order(), ByteOrder::Big);
}
