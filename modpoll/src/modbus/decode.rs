use std::fmt;

use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal,
};
use serde_json::json;

use super::{transport::RawData, ByteOrder, DataType, EndianMode};

/// Decimal places kept when a float is published or exported.
pub const FLOAT_PRECISION: u32 = 3;

/// A decoded reference value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bits(Vec<bool>),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Multiplies numeric values by `scale`. Bits and text can't be scaled
    /// and come back untouched.
    pub fn scaled(self, scale: f64) -> Value {
        match self {
            Value::Int(v) => Value::Float(v as f64 * scale),
            Value::UInt(v) => Value::Float(v as f64 * scale),
            Value::Float(v) => Value::Float(v * scale),
            other => other,
        }
    }

    /// JSON form used in payloads, with floats rounded to [`FLOAT_PRECISION`].
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bits(bits) => json!(bits),
            Value::Int(v) => json!(v),
            Value::UInt(v) => json!(v),
            Value::Float(v) => json!(round_float(*v)),
            Value::Text(s) => json!(s),
        }
    }

    /// The individual elements of a sequence value, if this is one.
    pub fn elements(&self) -> Option<Vec<serde_json::Value>> {
        match self {
            Value::Bits(bits) => Some(bits.iter().map(|b| json!(b)).collect()),
            _ => None,
        }
    }
}

fn round_float(v: f64) -> f64 {
    Decimal::from_f64(v)
        .map(|d| d.round_dp(FLOAT_PRECISION))
        .and_then(|d| d.to_f64())
        .unwrap_or(v)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bits(bits) => {
                let bits: Vec<_> = bits.iter().map(|b| u8::from(*b).to_string()).collect();
                write!(f, "[{}]", bits.join(", "))
            }
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{}", round_float(*v)),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Result of decoding one reference.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Value(Value),
    /// The type can't be decoded from this window; its units were consumed.
    Skipped,
    /// Not enough data left for the type; nothing was consumed.
    Exhausted,
}

/// Walks the raw data of one read, one reference at a time.
///
/// The cursor counts window units from the start of the read: words for
/// register reads, packed bytes of eight bits for coil/discrete reads.
pub struct Decoder<'a> {
    data: &'a RawData,
    endian: EndianMode,
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a RawData, endian: EndianMode) -> Self {
        Self {
            data,
            endian,
            cursor: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Total units available in the response.
    pub fn units(&self) -> usize {
        match self.data {
            RawData::Bits(bits) => bits.len().div_ceil(8),
            RawData::Words(words) => words.len(),
        }
    }

    /// Moves the cursor to `unit`, skipping (or revisiting) data.
    pub fn seek(&mut self, unit: usize) {
        self.cursor = unit;
    }

    pub fn decode(&mut self, dtype: &DataType) -> Decoded {
        let width = usize::from(dtype.width());
        if self.cursor + width > self.units() {
            return Decoded::Exhausted;
        }

        let value = match (self.data, dtype) {
            (_, DataType::Unknown(_)) => None,
            (RawData::Bits(bits), dtype) if dtype.is_bits() => {
                let start = self.cursor * 8;
                let mut out: Vec<bool> = bits.iter().skip(start).take(width * 8).copied().collect();
                out.resize(width * 8, false);
                Some(Value::Bits(out))
            }
            (RawData::Bits(_), _) => None,
            (RawData::Words(words), dtype) => {
                Some(self.decode_words(&words[self.cursor..self.cursor + width], dtype))
            }
        };

        self.cursor += width;
        match value {
            Some(value) => Decoded::Value(value),
            None => Decoded::Skipped,
        }
    }

    fn decode_words(&self, words: &[u16], dtype: &DataType) -> Value {
        use DataType::*;

        match dtype {
            Bool | Bool8 => Value::Bits(unpack_bits(&self.word_bytes(words[0])[..1])),
            Bool16 => Value::Bits(unpack_bits(&self.word_bytes(words[0]))),
            Int16 => Value::Int(self.combine(words) as u16 as i16 as i64),
            UInt16 => Value::UInt(self.combine(words)),
            Float16 => Value::Float(f16_to_f64(self.combine(words) as u16)),
            Int32 => Value::Int(self.combine(words) as u32 as i32 as i64),
            UInt32 => Value::UInt(self.combine(words)),
            Float32 => Value::Float(f32::from_bits(self.combine(words) as u32) as f64),
            Int64 => Value::Int(self.combine(words) as i64),
            UInt64 => Value::UInt(self.combine(words)),
            Float64 => Value::Float(f64::from_bits(self.combine(words))),
            String { .. } => {
                let bytes: Vec<u8> = words.iter().flat_map(|w| self.word_bytes(*w)).collect();
                let text = std::string::String::from_utf8_lossy(&bytes);
                Value::Text(text.trim_end_matches('\0').to_owned())
            }
            Unknown(_) => unreachable!("unknown types are skipped before decoding"),
        }
    }

    /// The two bytes of a word in stream order.
    fn word_bytes(&self, word: u16) -> [u8; 2] {
        match self.endian.byte_order() {
            ByteOrder::Big => word.to_be_bytes(),
            ByteOrder::Little => word.to_le_bytes(),
        }
    }

    /// Assembles up to four words into one integer, most significant first
    /// after byte and word order have been applied.
    fn combine(&self, words: &[u16]) -> u64 {
        let mut ordered: Vec<u16> = words
            .iter()
            .map(|w| match self.endian.byte_order() {
                ByteOrder::Big => *w,
                ByteOrder::Little => w.swap_bytes(),
            })
            .collect();
        if self.endian.word_order() == ByteOrder::Little {
            ordered.reverse();
        }
        ordered
            .into_iter()
            .fold(0u64, |acc, w| (acc << 16) | u64::from(w))
    }
}

fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |i| byte & (1 << i) != 0))
        .collect()
}

/// IEEE-754 binary16 to f64.
fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x3ff);
    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        e => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(e - 15),
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn decode_one(words: &[u16], endian: EndianMode, dtype: &str) -> Decoded {
    let data = RawData::Words(words.to_vec());
    Decoder::new(&data, endian).decode(&DataType::parse(dtype))
}

#[test]
fn float32_big_endian() {
    assert_eq!(
        decode_one(&[0x4348, 0x0000], EndianMode::BigBig, "float32"),
        Decoded::Value(Value::Float(200.0))
    );
    assert_eq!(
        decode_one(&[0x41C8, 0x0000], EndianMode::BigBig, "float32"),
        Decoded::Value(Value::Float(25.0))
    );
}

#[test]
fn word_order_swaps_words() {
    assert_eq!(
        decode_one(&[0x0000, 0x4348], EndianMode::BigLittle, "float32"),
        Decoded::Value(Value::Float(200.0))
    );
    assert_eq!(
        decode_one(&[0x0001, 0x0000], EndianMode::BigLittle, "uint32"),
        Decoded::Value(Value::UInt(1))
    );
    assert_eq!(
        decode_one(&[0x0001, 0x0000], EndianMode::BigBig, "uint32"),
        Decoded::Value(Value::UInt(0x10000))
    );
}

#[test]
fn byte_order_swaps_bytes() {
    assert_eq!(
        decode_one(&[0x3412], EndianMode::LittleBig, "uint16"),
        Decoded::Value(Value::UInt(0x1234))
    );
    assert_eq!(
        decode_one(&[0x2211, 0x4433], EndianMode::LittleLittle, "uint32"),
        Decoded::Value(Value::UInt(0x33441122))
    );
}

#[test]
fn signed_integers() {
    assert_eq!(
        decode_one(&[0xFFFE], EndianMode::BigBig, "int16"),
        Decoded::Value(Value::Int(-2))
    );
    assert_eq!(
        decode_one(&[0xFFFF, 0xFFFF, 0xFFFF, 0xFFFD], EndianMode::BigBig, "int64"),
        Decoded::Value(Value::Int(-3))
    );
}

#[test]
fn float16_and_float64() {
    assert_eq!(
        decode_one(&[0x3C00], EndianMode::BigBig, "float16"),
        Decoded::Value(Value::Float(1.0))
    );
    assert_eq!(
        decode_one(&[0xC100], EndianMode::BigBig, "float16"),
        Decoded::Value(Value::Float(-2.5))
    );
    let bits = 1234.5f64.to_bits();
    let words = [
        (bits >> 48) as u16,
        (bits >> 32) as u16,
        (bits >> 16) as u16,
        bits as u16,
    ];
    assert_eq!(
        decode_one(&words, EndianMode::BigBig, "float64"),
        Decoded::Value(Value::Float(1234.5))
    );
}

#[test]
fn strings_strip_nul_padding() {
    // "AB", "C\0"
    assert_eq!(
        decode_one(&[0x4142, 0x4300], EndianMode::BigBig, "string4"),
        Decoded::Value(Value::Text("ABC".to_owned()))
    );
    assert_eq!(
        decode_one(&[0x4241, 0x0043], EndianMode::LittleLittle, "string4"),
        Decoded::Value(Value::Text("ABC".to_owned()))
    );
}

#[test]
fn bits_from_registers_use_the_first_byte() {
    let Decoded::Value(Value::Bits(bits)) = decode_one(&[0x0102], EndianMode::BigBig, "bool8")
    else {
        panic!("expected bits");
    };
    assert_eq!(bits, vec![true, false, false, false, false, false, false, false]);

    let Decoded::Value(Value::Bits(bits)) =
        decode_one(&[0x0102, 0xFFFF], EndianMode::BigBig, "bool16")
    else {
        panic!("expected bits");
    };
    assert_eq!(bits.len(), 16);
    assert!(bits[0] && bits[9]);
}

#[test]
fn bits_from_coils_are_packed_bytes() {
    let mut coils = vec![false; 10];
    coils[1] = true;
    coils[9] = true;
    let data = RawData::Bits(coils);
    let mut decoder = Decoder::new(&data, EndianMode::default());
    assert_eq!(decoder.units(), 2);

    let Decoded::Value(Value::Bits(first)) = decoder.decode(&DataType::Bool) else {
        panic!("expected bits");
    };
    assert!(first[1]);
    let Decoded::Value(Value::Bits(second)) = decoder.decode(&DataType::Bool) else {
        panic!("expected bits");
    };
    assert_eq!(second.len(), 8);
    assert!(second[1]);
    assert_eq!(decoder.decode(&DataType::Bool), Decoded::Exhausted);
}

#[test]
fn numbers_in_bit_windows_are_skipped() {
    let data = RawData::Bits(vec![true; 16]);
    let mut decoder = Decoder::new(&data, EndianMode::default());
    assert_eq!(decoder.decode(&DataType::UInt16), Decoded::Skipped);
    assert_eq!(decoder.position(), 1);
}

#[test]
fn unknown_type_consumes_one_unit() {
    let data = RawData::Words(vec![1, 2]);
    let mut decoder = Decoder::new(&data, EndianMode::BigBig);
    assert_eq!(
        decoder.decode(&DataType::Unknown("mystery".into())),
        Decoded::Skipped
    );
    assert_eq!(decoder.position(), 1);
    assert_eq!(decoder.decode(&DataType::UInt16), Decoded::Value(Value::UInt(2)));
}

#[test]
fn short_response_is_exhausted_without_consuming() {
    let data = RawData::Words(vec![1]);
    let mut decoder = Decoder::new(&data, EndianMode::BigBig);
    assert_eq!(decoder.decode(&DataType::UInt32), Decoded::Exhausted);
    assert_eq!(decoder.position(), 0);
}

#[test]
fn scaling_turns_numbers_into_floats() {
    assert_eq!(Value::Int(25).scaled(0.1), Value::Float(25.0 * 0.1));
    assert_eq!(Value::UInt(3).scaled(2.0), Value::Float(6.0));
    assert_eq!(
        Value::Text("x".into()).scaled(2.0),
        Value::Text("x".into())
    );
    assert_eq!(Value::Bits(vec![true]).scaled(2.0), Value::Bits(vec![true]));
}

#[test]
fn json_rounds_floats() {
    assert_eq!(Value::Float(25.0 * 0.1).to_json(), json!(2.5));
    assert_eq!(Value::Float(1.23456).to_json(), json!(1.235));
    assert_eq!(Value::Int(-4).to_json(), json!(-4));
    assert_eq!(Value::Bits(vec![true, false]).to_json(), json!([true, false]));
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Lays `value` out over `width` words the way a device in `endian` would.
    fn encode(value: u64, width: usize, endian: EndianMode) -> Vec<u16> {
        let mut words: Vec<u16> = (0..width)
            .rev()
            .map(|i| (value >> (16 * i)) as u16)
            .collect();
        if endian.word_order() == ByteOrder::Little {
            words.reverse();
        }
        if endian.byte_order() == ByteOrder::Little {
            words.iter_mut().for_each(|w| *w = w.swap_bytes());
        }
        words
    }

    fn endian_mode() -> impl Strategy<Value = EndianMode> {
        prop_oneof![
            Just(EndianMode::BigBig),
            Just(EndianMode::LittleBig),
            Just(EndianMode::LittleLittle),
            Just(EndianMode::BigLittle),
        ]
    }

    proptest! {
        #[test]
        fn int32_round_trips(value: i32, endian in endian_mode()) {
            let words = encode(value as u32 as u64, 2, endian);
            prop_assert_eq!(
                decode_one(&words, endian, "int32"),
                Decoded::Value(Value::Int(value as i64))
            );
        }

        #[test]
        fn uint64_round_trips(value: u64, endian in endian_mode()) {
            let words = encode(value, 4, endian);
            prop_assert_eq!(
                decode_one(&words, endian, "uint64"),
                Decoded::Value(Value::UInt(value))
            );
        }

        #[test]
        fn float32_round_trips(value in -1.0e6f32..1.0e6, endian in endian_mode()) {
            let words = encode(value.to_bits() as u64, 2, endian);
            match decode_one(&words, endian, "float32") {
                Decoded::Value(Value::Float(decoded)) => {
                    prop_assert!((decoded - value as f64).abs() < 1e-6)
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}
