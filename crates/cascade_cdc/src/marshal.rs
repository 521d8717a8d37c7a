//! Pure conversion between native column values and wire-safe typed values.
//!
//! `encode` and `decode` are total over the closed [`TypeTag`] set and obey
//! `decode(encode(v)) == v` for every representable value. The only lossy rule
//! is time-of-day: the wire carries microseconds, so sub-microsecond nanos are
//! dropped at encode and never recovered by decode.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CdcError;

/// Closed set of logical column types understood by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Text,
    Ascii,
    Boolean,
    Blob,
    Timestamp,
    Time,
    Date,
    Uuid,
    TimeUuid,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    VarInt,
    Decimal,
    Double,
    Float,
    Inet,
    Duration,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Text => "text",
            TypeTag::Ascii => "ascii",
            TypeTag::Boolean => "boolean",
            TypeTag::Blob => "blob",
            TypeTag::Timestamp => "timestamp",
            TypeTag::Time => "time",
            TypeTag::Date => "date",
            TypeTag::Uuid => "uuid",
            TypeTag::TimeUuid => "timeuuid",
            TypeTag::TinyInt => "tinyint",
            TypeTag::SmallInt => "smallint",
            TypeTag::Int => "int",
            TypeTag::BigInt => "bigint",
            TypeTag::VarInt => "varint",
            TypeTag::Decimal => "decimal",
            TypeTag::Double => "double",
            TypeTag::Float => "float",
            TypeTag::Inet => "inet",
            TypeTag::Duration => "duration",
        };
        f.write_str(name)
    }
}

impl FromStr for TypeTag {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(TypeTag::Text),
            "ascii" => Ok(TypeTag::Ascii),
            "boolean" => Ok(TypeTag::Boolean),
            "blob" => Ok(TypeTag::Blob),
            "timestamp" => Ok(TypeTag::Timestamp),
            "time" => Ok(TypeTag::Time),
            "date" => Ok(TypeTag::Date),
            "uuid" => Ok(TypeTag::Uuid),
            "timeuuid" => Ok(TypeTag::TimeUuid),
            "tinyint" => Ok(TypeTag::TinyInt),
            "smallint" => Ok(TypeTag::SmallInt),
            "int" => Ok(TypeTag::Int),
            "bigint" => Ok(TypeTag::BigInt),
            "varint" => Ok(TypeTag::VarInt),
            "decimal" => Ok(TypeTag::Decimal),
            "double" => Ok(TypeTag::Double),
            "float" => Ok(TypeTag::Float),
            "inet" => Ok(TypeTag::Inet),
            "duration" => Ok(TypeTag::Duration),
            other => Err(CdcError::UnsupportedType(other.to_string())),
        }
    }
}

/// Native column value as supplied by the row source or tailing agent.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Text(String),
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    /// Signed epoch milliseconds.
    Timestamp(i64),
    /// Nanoseconds of day.
    Time(i64),
    /// Signed days since the unix epoch.
    Date(i32),
    Uuid(Uuid),
    TimeUuid(Uuid),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    /// Two's-complement big-endian magnitude bytes.
    VarInt(Vec<u8>),
    /// Unscaled two's-complement big-endian bytes plus decimal scale.
    Decimal { unscaled: Vec<u8>, scale: i32 },
    Double(f64),
    Float(f32),
    Inet(IpAddr),
    Duration { months: i32, days: i32, nanos: i64 },
}

/// Wire-schema value. Narrow integers are widened, temporal values are
/// integers, uuids and addresses are text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Text(String),
    Boolean(bool),
    Bytes(Vec<u8>),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    /// Days since epoch shifted by `-i32::MIN` into the unsigned range.
    Date(u32),
    VarInt(Vec<u8>),
    Decimal { unscaled: Vec<u8>, scale: i32 },
    Duration { months: i32, days: i32, nanos: i64 },
}

/// Marshal one native value into its wire representation.
///
/// A tag/value mismatch or an unrepresentable value fails with
/// [`CdcError::UnsupportedType`]; this is fatal for the single column only.
pub fn encode(value: &CqlValue, tag: TypeTag) -> Result<WireValue, CdcError> {
    match (tag, value) {
        (TypeTag::Text, CqlValue::Text(s)) => Ok(WireValue::Text(s.clone())),
        (TypeTag::Ascii, CqlValue::Ascii(s)) => Ok(WireValue::Text(s.clone())),
        (TypeTag::Boolean, CqlValue::Boolean(b)) => Ok(WireValue::Boolean(*b)),
        (TypeTag::Blob, CqlValue::Blob(b)) => Ok(WireValue::Bytes(b.clone())),
        (TypeTag::Timestamp, CqlValue::Timestamp(millis)) => Ok(WireValue::BigInt(*millis)),
        // Sub-microsecond precision is dropped here; decode never recovers it.
        (TypeTag::Time, CqlValue::Time(nanos)) => Ok(WireValue::BigInt(nanos / 1000)),
        (TypeTag::Date, CqlValue::Date(days)) => {
            Ok(WireValue::Date((*days as i64 - i32::MIN as i64) as u32))
        }
        (TypeTag::Uuid, CqlValue::Uuid(u)) => Ok(WireValue::Text(u.to_string())),
        (TypeTag::TimeUuid, CqlValue::TimeUuid(u)) => Ok(WireValue::Text(u.to_string())),
        // The wire schema has no narrow integers.
        (TypeTag::TinyInt, CqlValue::TinyInt(v)) => Ok(WireValue::Int(i32::from(*v))),
        (TypeTag::SmallInt, CqlValue::SmallInt(v)) => Ok(WireValue::Int(i32::from(*v))),
        (TypeTag::Int, CqlValue::Int(v)) => Ok(WireValue::Int(*v)),
        (TypeTag::BigInt, CqlValue::BigInt(v)) => Ok(WireValue::BigInt(*v)),
        (TypeTag::VarInt, CqlValue::VarInt(bytes)) => Ok(WireValue::VarInt(bytes.clone())),
        (TypeTag::Decimal, CqlValue::Decimal { unscaled, scale }) => Ok(WireValue::Decimal {
            unscaled: unscaled.clone(),
            scale: *scale,
        }),
        (TypeTag::Double, CqlValue::Double(v)) => Ok(WireValue::Double(*v)),
        (TypeTag::Float, CqlValue::Float(v)) => Ok(WireValue::Float(*v)),
        (TypeTag::Inet, CqlValue::Inet(addr)) => Ok(WireValue::Text(addr.to_string())),
        (TypeTag::Duration, CqlValue::Duration {
            months,
            days,
            nanos,
        }) => Ok(WireValue::Duration {
            months: *months,
            days: *days,
            nanos: *nanos,
        }),
        (tag, value) => Err(CdcError::UnsupportedType(format!(
            "cannot marshal {value:?} as {tag}"
        ))),
    }
}

/// Unmarshal one wire value back into the native representation for `tag`.
pub fn decode(value: &WireValue, tag: TypeTag) -> Result<CqlValue, CdcError> {
    match (tag, value) {
        (TypeTag::Text, WireValue::Text(s)) => Ok(CqlValue::Text(s.clone())),
        (TypeTag::Ascii, WireValue::Text(s)) => Ok(CqlValue::Ascii(s.clone())),
        (TypeTag::Boolean, WireValue::Boolean(b)) => Ok(CqlValue::Boolean(*b)),
        (TypeTag::Blob, WireValue::Bytes(b)) => Ok(CqlValue::Blob(b.clone())),
        (TypeTag::Timestamp, WireValue::BigInt(millis)) => Ok(CqlValue::Timestamp(*millis)),
        (TypeTag::Time, WireValue::BigInt(micros)) => Ok(CqlValue::Time(micros * 1000)),
        (TypeTag::Date, WireValue::Date(shifted)) => {
            Ok(CqlValue::Date((*shifted as i64 + i32::MIN as i64) as i32))
        }
        (TypeTag::Uuid, WireValue::Text(s)) => Uuid::parse_str(s)
            .map(CqlValue::Uuid)
            .map_err(|err| CdcError::Codec(format!("bad uuid {s:?}: {err}"))),
        (TypeTag::TimeUuid, WireValue::Text(s)) => Uuid::parse_str(s)
            .map(CqlValue::TimeUuid)
            .map_err(|err| CdcError::Codec(format!("bad timeuuid {s:?}: {err}"))),
        (TypeTag::TinyInt, WireValue::Int(v)) => i8::try_from(*v)
            .map(CqlValue::TinyInt)
            .map_err(|_| CdcError::Codec(format!("tinyint out of range: {v}"))),
        (TypeTag::SmallInt, WireValue::Int(v)) => i16::try_from(*v)
            .map(CqlValue::SmallInt)
            .map_err(|_| CdcError::Codec(format!("smallint out of range: {v}"))),
        (TypeTag::Int, WireValue::Int(v)) => Ok(CqlValue::Int(*v)),
        (TypeTag::BigInt, WireValue::BigInt(v)) => Ok(CqlValue::BigInt(*v)),
        (TypeTag::VarInt, WireValue::VarInt(bytes)) => Ok(CqlValue::VarInt(bytes.clone())),
        (TypeTag::Decimal, WireValue::Decimal { unscaled, scale }) => Ok(CqlValue::Decimal {
            unscaled: unscaled.clone(),
            scale: *scale,
        }),
        (TypeTag::Double, WireValue::Double(v)) => Ok(CqlValue::Double(*v)),
        (TypeTag::Float, WireValue::Float(v)) => Ok(CqlValue::Float(*v)),
        (TypeTag::Inet, WireValue::Text(s)) => s
            .parse::<IpAddr>()
            .map(CqlValue::Inet)
            .map_err(|err| CdcError::Codec(format!("bad inet {s:?}: {err}"))),
        (TypeTag::Duration, WireValue::Duration {
            months,
            days,
            nanos,
        }) => Ok(CqlValue::Duration {
            months: *months,
            days: *days,
            nanos: *nanos,
        }),
        (tag, value) => Err(CdcError::UnsupportedType(format!(
            "cannot unmarshal {value:?} as {tag}"
        ))),
    }
}
