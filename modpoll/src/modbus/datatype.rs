use std::fmt;

/// Widest string a reference may declare, in units.
pub const MAX_STRING_WIDTH: u16 = 100;

/// The value types a reference can be decoded as.
///
/// Widths are in window units: 16-bit words for register reads, packed bytes
/// of 8 bits for coil/discrete reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Bool8,
    Bool16,
    Int16,
    UInt16,
    Float16,
    Int32,
    UInt32,
    Float32,
    Int64,
    UInt64,
    Float64,
    /// A string of `width` units, always even.
    String { width: u16 },
    /// Anything we don't know how to decode. Consumes one unit.
    Unknown(String),
}

impl DataType {
    pub fn parse(s: &str) -> Self {
        use DataType::*;

        let s = s.trim().to_lowercase();
        match s.as_str() {
            "bool" => Bool,
            "bool8" => Bool8,
            "bool16" => Bool16,
            "int16" => Int16,
            "uint16" => UInt16,
            "float16" => Float16,
            "int32" => Int32,
            "uint32" => UInt32,
            "float32" => Float32,
            "int64" => Int64,
            "uint64" => UInt64,
            "float64" => Float64,
            _ => match s.strip_prefix("string") {
                Some(length) => String {
                    width: string_width(parse_length(length)),
                },
                None => Unknown(s),
            },
        }
    }

    pub fn width(&self) -> u16 {
        use DataType::*;

        match self {
            Bool | Bool8 | Int16 | UInt16 | Float16 => 1,
            Bool16 | Int32 | UInt32 | Float32 => 2,
            Int64 | UInt64 | Float64 => 4,
            String { width } => *width,
            Unknown(_) => 1,
        }
    }

    pub fn is_bits(&self) -> bool {
        matches!(self, DataType::Bool | DataType::Bool8 | DataType::Bool16)
    }
}

/// Declared string length, saturating at `u16::MAX`. Anything that isn't a
/// number counts as zero.
fn parse_length(length: &str) -> u16 {
    if length.is_empty() || !length.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    let length = length.parse::<u64>().unwrap_or(u64::MAX);
    u16::try_from(length).unwrap_or(u16::MAX)
}

/// Units needed for a string of `length` characters: `ceil(length / 2)`,
/// rounded up to an even count and capped at [`MAX_STRING_WIDTH`].
fn string_width(length: u16) -> u16 {
    let width = length.div_ceil(2).max(1);
    (width + width % 2).min(MAX_STRING_WIDTH)
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DataType::*;

        match self {
            Bool => f.write_str("bool"),
            Bool8 => f.write_str("bool8"),
            Bool16 => f.write_str("bool16"),
            Int16 => f.write_str("int16"),
            UInt16 => f.write_str("uint16"),
            Float16 => f.write_str("float16"),
            Int32 => f.write_str("int32"),
            UInt32 => f.write_str("uint32"),
            Float32 => f.write_str("float32"),
            Int64 => f.write_str("int64"),
            UInt64 => f.write_str("uint64"),
            Float64 => f.write_str("float64"),
            String { width } => write!(f, "string{}", width * 2),
            Unknown(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn widths_follow_the_table() {
    for (name, width) in [
        ("bool", 1),
        ("bool8", 1),
        ("bool16", 2),
        ("int16", 1),
        ("uint16", 1),
        ("float16", 1),
        ("int32", 2),
        ("uint32", 2),
        ("float32", 2),
        ("int64", 4),
        ("uint64", 4),
        ("float64", 4),
    ] {
        assert_eq!(DataType::parse(name).width(), width, "{name}");
    }
}

#[test]
fn parse_is_case_insensitive() {
    assert_eq!(DataType::parse(" Float32 "), DataType::Float32);
    assert_eq!(DataType::parse("UINT16"), DataType::UInt16);
}

#[test]
fn string_widths_are_even_and_capped() {
    assert_eq!(DataType::parse("string1").width(), 2);
    assert_eq!(DataType::parse("string4").width(), 2);
    assert_eq!(DataType::parse("string5").width(), 4);
    assert_eq!(DataType::parse("string10").width(), 6);
    assert_eq!(DataType::parse("string12").width(), 6);
    assert_eq!(DataType::parse("string500").width(), 100);
    assert_eq!(DataType::parse("string70000").width(), 100);
    assert_eq!(DataType::parse("string99999999999999999999999").width(), 100);
    assert_eq!(DataType::parse("string").width(), 2);
    assert_eq!(DataType::parse("stringx").width(), 2);
}

#[test]
fn unknown_types_take_one_unit() {
    let dtype = DataType::parse("decimal128");
    assert_eq!(dtype, DataType::Unknown("decimal128".to_owned()));
    assert_eq!(dtype.width(), 1);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn string_width_is_even_and_bounded(length in any::<u32>()) {
            let width = DataType::parse(&format!("string{length}")).width();
            prop_assert!(width % 2 == 0);
            prop_assert!(width <= MAX_STRING_WIDTH);
            let wanted = length.div_ceil(2).min(u32::from(MAX_STRING_WIDTH));
            prop_assert!(u32::from(width) >= wanted);
        }
    }
}
