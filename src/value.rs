use crate::error::DecodeError;
use crate::planner::ReadBlock;
use crate::register::{RegisterSpec, ValueKind, WordOrder};

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

// Decimal {{{
/// Exact fixed-point quantity `mantissa / divisor`.
///
/// Scaled registers are kept in this form instead of `f64` so repeated
/// polls of a monotonic energy counter never pick up binary rounding
/// noise. Equality is by numeric value, so `100/10 == 10/1`.
#[derive(Clone, Copy, Debug)]
pub struct Decimal {
    mantissa: i64,
    divisor: u32,
}

impl Decimal {
    pub fn new(mantissa: i64, divisor: u32) -> Self {
        Self {
            mantissa,
            divisor: divisor.max(1),
        }
    }

    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / self.divisor as f64
    }

    /// Number of decimal digits when the divisor is a power of ten.
    fn decimal_places(&self) -> Option<usize> {
        let mut d = self.divisor;
        let mut places = 0;
        while d % 10 == 0 {
            d /= 10;
            places += 1;
        }
        (d == 1).then_some(places)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        i128::from(self.mantissa) * i128::from(other.divisor)
            == i128::from(other.mantissa) * i128::from(self.divisor)
    }
}

impl Eq for Decimal {}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decimal_places() {
            Some(0) => write!(f, "{}", self.mantissa),
            Some(places) => {
                let sign = if self.mantissa < 0 { "-" } else { "" };
                let abs = self.mantissa.unsigned_abs();
                let divisor = u64::from(self.divisor);
                write!(
                    f,
                    "{}{}.{:0width$}",
                    sign,
                    abs / divisor,
                    abs % divisor,
                    width = places
                )
            }
            None => write!(f, "{}", self.to_f64()),
        }
    }
}

impl Serialize for Decimal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.to_f64())
    }
} // }}}

// Value {{{
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Decimal(Decimal),
    Label(String),
    Bits(u32),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Decimal(d) => Some(d.to_f64()),
            Self::Bits(b) => Some(f64::from(*b)),
            Self::Label(_) => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Bits(b) => Some(i64::from(*b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::Label(s) => write!(f, "{}", s),
            Self::Bits(b) => write!(f, "{:#06x}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Self::Decimal(d)
    }
} // }}}

// ValueDecoder {{{
/// Turns the raw words of one read block into named physical values.
pub struct ValueDecoder;

impl ValueDecoder {
    pub fn decode(block: &ReadBlock, words: &[u16]) -> Result<BTreeMap<String, Value>, DecodeError> {
        let mut values = BTreeMap::new();

        for spec in &block.registers {
            let offset = spec
                .address
                .checked_sub(block.start)
                .map(usize::from)
                .ok_or_else(|| DecodeError::OutsideBlock {
                    name: spec.name.clone(),
                    address: spec.address,
                    start: block.start,
                })?;
            let end = offset + usize::from(spec.width.max(1));
            let raw = words.get(offset..end).ok_or_else(|| DecodeError::MissingWord {
                name: spec.name.clone(),
                offset: end - 1,
                available: words.len(),
            })?;

            values.insert(spec.name.clone(), Self::decode_one(spec, raw));
        }

        Ok(values)
    }

    /// `raw` must hold exactly `spec.width` words.
    pub fn decode_one(spec: &RegisterSpec, raw: &[u16]) -> Value {
        let unsigned = Self::compose(spec, raw);
        let signed = if spec.width == 2 {
            i64::from(unsigned as i32)
        } else {
            i64::from(unsigned as u16 as i16)
        };

        match &spec.kind {
            ValueKind::Unsigned => Value::Integer(i64::from(unsigned)),
            ValueKind::Signed => Value::Integer(signed),
            ValueKind::Scaled {
                divisor,
                signed: is_signed,
                offset,
            } => {
                let base = if *is_signed { signed } else { i64::from(unsigned) };
                Value::Decimal(Decimal::new(base + offset, *divisor))
            }
            ValueKind::Enum { labels } => match labels.get(&unsigned) {
                Some(label) => Value::Label(label.clone()),
                None => Value::Label(format!("Unknown ({})", unsigned)),
            },
            ValueKind::Bitfield => Value::Bits(unsigned),
        }
    }

    /// Inverse of `decode_one` for numeric kinds; labels are looked up in
    /// the enum table. Returns `None` when the value cannot come from `spec`.
    pub fn encode_one(spec: &RegisterSpec, value: &Value) -> Option<Vec<u16>> {
        let raw: i64 = match (&spec.kind, value) {
            (ValueKind::Unsigned | ValueKind::Signed, Value::Integer(i)) => *i,
            (ValueKind::Bitfield, Value::Bits(b)) => i64::from(*b),
            (ValueKind::Scaled { divisor, offset, .. }, Value::Decimal(d)) => {
                let scaled = i128::from(d.mantissa()) * i128::from(*divisor);
                if scaled % i128::from(d.divisor()) != 0 {
                    return None;
                }
                i64::try_from(scaled / i128::from(d.divisor())).ok()? - offset
            }
            (ValueKind::Enum { labels }, Value::Label(l)) => {
                i64::from(*labels.iter().find(|(_, v)| *v == l)?.0)
            }
            _ => return None,
        };

        let bits = raw as u32;
        Some(match (spec.width, spec.word_order) {
            (2, WordOrder::HighFirst) => vec![(bits >> 16) as u16, bits as u16],
            (2, WordOrder::LowFirst) => vec![bits as u16, (bits >> 16) as u16],
            _ => vec![bits as u16],
        })
    }

    fn compose(spec: &RegisterSpec, raw: &[u16]) -> u32 {
        match (spec.width, spec.word_order) {
            (2, WordOrder::HighFirst) => (u32::from(raw[0]) << 16) | u32::from(raw[1]),
            (2, WordOrder::LowFirst) => (u32::from(raw[1]) << 16) | u32::from(raw[0]),
            _ => u32::from(raw[0]),
        }
    }
} // }}}
