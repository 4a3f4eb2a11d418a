//! Interface for working with Iceberg field values.
//!
//! This module provides [`Value`] which represents a single non-null value of a
//! primitive field, and its
//! [binary single-value serialization](https://iceberg.apache.org/spec/#binary-single-value-serialization)
//! used for column bounds in manifests and for partition values.
use chrono::{NaiveDate, NaiveTime, NaiveDateTime, DateTime, Utc, Timelike};
use uuid::Uuid;

use crate::{IcebergResult, IcebergError};
use crate::schema::PrimitiveType;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Represents a valid value of a primitive Iceberg field.
///
/// Nulls are represented outside of `Value`, as `Option<Value>`.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// A fixed point decimal, as its unscaled value and scale.
    Decimal { unscaled: i128, scale: u8 },
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    String(String),
    Uuid(Uuid),
    Fixed(Vec<u8>),
    Binary(Vec<u8>),
}

/// Days since 1970-01-01.
pub(crate) fn date_to_days(date: &NaiveDate) -> i32 {
    // Every NaiveDate is within i32 days of the epoch.
    (*date - NaiveDate::default()).num_days() as i32
}

pub(crate) fn days_to_date(days: i32) -> IcebergResult<NaiveDate> {
    NaiveDate::default()
        .checked_add_signed(chrono::Duration::days(days as i64))
        .ok_or_else(|| IcebergError::ValueError(format!("date out of range: {days} days")))
}

/// Microseconds since midnight.
pub(crate) fn time_to_micros(time: &NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * MICROS_PER_SECOND
        + (time.nanosecond() / 1_000) as i64
}

pub(crate) fn micros_to_time(micros: i64) -> IcebergResult<NaiveTime> {
    let secs = micros.div_euclid(MICROS_PER_SECOND);
    let nanos = micros.rem_euclid(MICROS_PER_SECOND) * 1_000;
    u32::try_from(secs).ok()
        .and_then(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos as u32))
        .ok_or_else(|| IcebergError::ValueError(format!("time out of range: {micros}us")))
}

/// Microseconds since 1970-01-01T00:00:00.
pub(crate) fn timestamp_to_micros(timestamp: &NaiveDateTime) -> i64 {
    timestamp.and_utc().timestamp_micros()
}

pub(crate) fn micros_to_timestamp(micros: i64) -> IcebergResult<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros)
        .map(|datetime| datetime.naive_utc())
        .ok_or_else(|| IcebergError::ValueError(format!("timestamp out of range: {micros}us")))
}

/// Number of decimal digits in the unscaled value.
fn decimal_digits(unscaled: i128) -> u32 {
    unscaled.unsigned_abs().checked_ilog10().map_or(1, |d| d + 1)
}

fn fixed_bytes<const N: usize>(bytes: &[u8], ptype: &PrimitiveType) -> IcebergResult<[u8; N]> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        IcebergError::ValueError(format!(
            "invalid binary value for type {ptype}: expected {N} bytes, got {}", bytes.len()
        ))
    })
}

impl Value {
    /// Returns the primitive type of this value.
    ///
    /// Decimals report the smallest precision that holds their unscaled value.
    ///
    /// ```rust
    /// use icetable::value::Value;
    /// use icetable::schema::PrimitiveType;
    ///
    /// assert_eq!(Value::Int(0).primitive_type(), PrimitiveType::Int);
    /// ```
    pub fn primitive_type(&self) -> PrimitiveType {
        match self {
            Value::Boolean(_) => PrimitiveType::Boolean,
            Value::Int(_) => PrimitiveType::Int,
            Value::Long(_) => PrimitiveType::Long,
            Value::Float(_) => PrimitiveType::Float,
            Value::Double(_) => PrimitiveType::Double,
            Value::Decimal { unscaled, scale } => PrimitiveType::Decimal {
                precision: decimal_digits(*unscaled) as u8,
                scale: *scale,
            },
            Value::Date(_) => PrimitiveType::Date,
            Value::Time(_) => PrimitiveType::Time,
            Value::Timestamp(_) => PrimitiveType::Timestamp,
            Value::Timestamptz(_) => PrimitiveType::Timestamptz,
            Value::String(_) => PrimitiveType::String,
            Value::Uuid(_) => PrimitiveType::Uuid,
            Value::Fixed(bytes) => PrimitiveType::Fixed(bytes.len() as u64),
            Value::Binary(_) => PrimitiveType::Binary,
        }
    }

    /// Returns `true` if this value can be stored in a field of type `ptype`.
    pub fn matches_type(&self, ptype: &PrimitiveType) -> bool {
        match (self, ptype) {
            (Value::Decimal { unscaled, scale }, PrimitiveType::Decimal { precision: p, scale: s }) => {
                scale == s && decimal_digits(*unscaled) <= *p as u32
            },
            (Value::Fixed(bytes), PrimitiveType::Fixed(len)) => bytes.len() as u64 == *len,
            (value, ptype) => value.primitive_type() == *ptype,
        }
    }

    pub fn is_nan(&self) -> bool {
        match self {
            Value::Float(f) => f.is_nan(),
            Value::Double(d) => d.is_nan(),
            _ => false,
        }
    }

    /// Converts a value read from a column of an older schema to the column's
    /// current, possibly promoted, type.
    pub fn promote(self, target: &PrimitiveType) -> IcebergResult<Value> {
        match (self, target) {
            (Value::Int(i), PrimitiveType::Long) => Ok(Value::Long(i as i64)),
            (Value::Float(f), PrimitiveType::Double) => Ok(Value::Double(f as f64)),
            (value, target) if value.matches_type(target) => Ok(value),
            (value, target) => Err(IcebergError::ValueError(format!(
                "value {value:?} can't be promoted to type {target}"
            ))),
        }
    }

    /// Encodes the value with the Iceberg binary single-value serialization.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Boolean(b) => vec![u8::from(*b)],
            Value::Int(i) => i.to_le_bytes().to_vec(),
            Value::Long(l) => l.to_le_bytes().to_vec(),
            Value::Float(f) => f.to_le_bytes().to_vec(),
            Value::Double(d) => d.to_le_bytes().to_vec(),
            Value::Decimal { unscaled, .. } => {
                // Minimal big-endian two's complement.
                let bytes = unscaled.to_be_bytes();
                let sign = if *unscaled < 0 { 0xff } else { 0x00 };
                let mut start = 0;
                while start < bytes.len() - 1
                    && bytes[start] == sign
                    && (bytes[start + 1] & 0x80) == (sign & 0x80)
                {
                    start += 1;
                }
                bytes[start..].to_vec()
            },
            Value::Date(date) => date_to_days(date).to_le_bytes().to_vec(),
            Value::Time(time) => time_to_micros(time).to_le_bytes().to_vec(),
            Value::Timestamp(ts) => timestamp_to_micros(ts).to_le_bytes().to_vec(),
            Value::Timestamptz(ts) => ts.timestamp_micros().to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Uuid(uuid) => uuid.as_bytes().to_vec(),
            Value::Fixed(bytes) | Value::Binary(bytes) => bytes.clone(),
        }
    }

    /// Decodes a value of type `ptype` from its binary single-value serialization.
    pub fn from_bytes(ptype: &PrimitiveType, bytes: &[u8]) -> IcebergResult<Value> {
        Ok(match ptype {
            PrimitiveType::Boolean => match bytes {
                [0x00] => Value::Boolean(false),
                [0x01] => Value::Boolean(true),
                _ => return Err(IcebergError::ValueError(
                    format!("invalid binary boolean value {bytes:?}")
                )),
            },
            PrimitiveType::Int => Value::Int(i32::from_le_bytes(fixed_bytes(bytes, ptype)?)),
            PrimitiveType::Long => Value::Long(i64::from_le_bytes(fixed_bytes(bytes, ptype)?)),
            PrimitiveType::Float => Value::Float(f32::from_le_bytes(fixed_bytes(bytes, ptype)?)),
            PrimitiveType::Double => Value::Double(f64::from_le_bytes(fixed_bytes(bytes, ptype)?)),
            PrimitiveType::Decimal { scale, .. } => {
                if bytes.is_empty() || bytes.len() > 16 {
                    return Err(IcebergError::ValueError(
                        format!("invalid binary decimal of {} bytes", bytes.len())
                    ));
                }
                let fill = if bytes[0] & 0x80 != 0 { 0xff } else { 0x00 };
                let mut buf = [fill; 16];
                buf[16 - bytes.len()..].copy_from_slice(bytes);
                Value::Decimal { unscaled: i128::from_be_bytes(buf), scale: *scale }
            },
            PrimitiveType::Date => {
                Value::Date(days_to_date(i32::from_le_bytes(fixed_bytes(bytes, ptype)?))?)
            },
            PrimitiveType::Time => {
                Value::Time(micros_to_time(i64::from_le_bytes(fixed_bytes(bytes, ptype)?))?)
            },
            PrimitiveType::Timestamp => {
                Value::Timestamp(micros_to_timestamp(i64::from_le_bytes(fixed_bytes(bytes, ptype)?))?)
            },
            PrimitiveType::Timestamptz => {
                let micros = i64::from_le_bytes(fixed_bytes(bytes, ptype)?);
                Value::Timestamptz(micros_to_timestamp(micros)?.and_utc())
            },
            PrimitiveType::String => {
                Value::String(String::from_utf8(bytes.to_vec()).map_err(|e| {
                    IcebergError::ValueError(format!("invalid utf-8 string value: {e}"))
                })?)
            },
            PrimitiveType::Uuid => Value::Uuid(Uuid::from_bytes(fixed_bytes(bytes, ptype)?)),
            PrimitiveType::Fixed(len) => {
                if bytes.len() as u64 != *len {
                    return Err(IcebergError::ValueError(format!(
                        "invalid binary value for type {ptype}: got {} bytes", bytes.len()
                    )));
                }
                Value::Fixed(bytes.to_vec())
            },
            PrimitiveType::Binary => Value::Binary(bytes.to_vec()),
        })
    }
}

/// Human readable form, as used in partition paths.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal { unscaled, scale } => {
                if *scale == 0 {
                    return write!(f, "{unscaled}");
                }
                let sign = if *unscaled < 0 { "-" } else { "" };
                let digits = format!("{:0>width$}", unscaled.unsigned_abs(), width = *scale as usize + 1);
                let (int, frac) = digits.split_at(digits.len() - *scale as usize);
                write!(f, "{sign}{int}.{frac}")
            },
            Value::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Value::Time(time) => write!(f, "{}", time.format("%H:%M:%S%.6f")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.6f")),
            Value::Timestamptz(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.6f%:z")),
            Value::String(s) => write!(f, "{s}"),
            Value::Uuid(uuid) => write!(f, "{uuid}"),
            Value::Fixed(bytes) | Value::Binary(bytes) => {
                bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Value::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(date: NaiveDate) -> Self {
        Value::Date(date)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(ts: NaiveDateTime) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Uuid> for Value {
    fn from(uuid: Uuid) -> Self {
        Value::Uuid(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_single_value_serialization() {
        assert_eq!(Value::Boolean(true).to_bytes(), vec![0x01]);
        assert_eq!(Value::Boolean(false).to_bytes(), vec![0x00]);
        assert_eq!(Value::Int(1).to_bytes(), vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(Value::Long(-1).to_bytes(), vec![0xff; 8]);
        assert_eq!(
            Value::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()).to_bytes(),
            vec![0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(Value::String("iceberg".to_string()).to_bytes(), b"iceberg".to_vec());

        // Decimals use the minimal number of bytes.
        assert_eq!(Value::Decimal { unscaled: 1234, scale: 2 }.to_bytes(), vec![0x04, 0xd2]);
        assert_eq!(Value::Decimal { unscaled: -1, scale: 2 }.to_bytes(), vec![0xff]);
        assert_eq!(Value::Decimal { unscaled: 128, scale: 0 }.to_bytes(), vec![0x00, 0x80]);
    }

    #[test]
    fn decode_matches_encode() {
        let values = [
            (Value::Boolean(true), PrimitiveType::Boolean),
            (Value::Double(-2.5), PrimitiveType::Double),
            (Value::Decimal { unscaled: -31415, scale: 4 }, PrimitiveType::Decimal { precision: 9, scale: 4 }),
            (Value::Date(NaiveDate::from_ymd_opt(1996, 12, 5).unwrap()), PrimitiveType::Date),
            (Value::Time(NaiveTime::from_hms_micro_opt(22, 31, 8, 123456).unwrap()), PrimitiveType::Time),
            (
                Value::Timestamp(NaiveDate::from_ymd_opt(1969, 7, 20).unwrap()
                    .and_hms_micro_opt(20, 17, 40, 5).unwrap()),
                PrimitiveType::Timestamp
            ),
            (Value::Uuid(Uuid::from_u128(0xf79c3e09_677c_4bbd_a479_3f349cb785e7)), PrimitiveType::Uuid),
            (Value::Fixed(vec![1, 2, 3]), PrimitiveType::Fixed(3)),
        ];

        for (value, ptype) in values {
            assert_eq!(Value::from_bytes(&ptype, &value.to_bytes()).unwrap(), value);
        }

        assert!(Value::from_bytes(&PrimitiveType::Int, &[0x01]).is_err());
        assert!(Value::from_bytes(&PrimitiveType::Fixed(4), &[0x01]).is_err());
    }

    #[test]
    fn type_matching_and_promotion() {
        assert!(Value::Int(1).matches_type(&PrimitiveType::Int));
        assert!(!Value::Int(1).matches_type(&PrimitiveType::Long));
        assert!(Value::Decimal { unscaled: 99999, scale: 2 }
            .matches_type(&PrimitiveType::Decimal { precision: 5, scale: 2 }));
        assert!(!Value::Decimal { unscaled: 100000, scale: 2 }
            .matches_type(&PrimitiveType::Decimal { precision: 5, scale: 2 }));

        assert_eq!(Value::Int(7).promote(&PrimitiveType::Long).unwrap(), Value::Long(7));
        assert_eq!(Value::Float(0.5).promote(&PrimitiveType::Double).unwrap(), Value::Double(0.5));
        assert!(Value::Long(7).promote(&PrimitiveType::Int).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(Value::Decimal { unscaled: 1234, scale: 2 }.to_string(), "12.34");
        assert_eq!(Value::Decimal { unscaled: -5, scale: 2 }.to_string(), "-0.05");
        assert_eq!(Value::Date(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()).to_string(), "2023-01-01");
        assert_eq!(Value::Binary(vec![0x00, 0xff]).to_string(), "00ff");
    }
}
