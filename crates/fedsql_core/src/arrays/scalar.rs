use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use fedsql_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use super::datatype::DataType;

/// Reference to a large object value.
///
/// The id is what gets handed to clients for requesting chunks of the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LobValue {
    pub id: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    Lob(LobValue),
}

impl ScalarValue {
    pub fn datatype(&self) -> DataType {
        match self {
            Self::Null => DataType::Null,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
            Self::Binary(_) => DataType::Binary,
            Self::Lob(_) => DataType::Lob,
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            Self::Int32(v) => Ok(*v as i64),
            Self::Int64(v) => Ok(*v),
            other => Err(DbError::new(format!("Not an integer: {other}"))),
        }
    }

    /// Try to convert this value to the given type.
    ///
    /// Nulls convert to anything.
    pub fn try_cast(&self, to: DataType) -> Result<ScalarValue> {
        if self.is_null() || self.datatype() == to {
            return Ok(self.clone());
        }

        let cast_err = || DbError::new(format!("Cannot convert '{self}' to {to}"));

        let val = match (self, to) {
            (Self::Int32(v), DataType::Int64) => Self::Int64(*v as i64),
            (Self::Int32(v), DataType::Float64) => Self::Float64(*v as f64),
            (Self::Int64(v), DataType::Int32) => {
                Self::Int32(i32::try_from(*v).map_err(|_| cast_err())?)
            }
            (Self::Int64(v), DataType::Float64) => Self::Float64(*v as f64),
            (Self::Int32(_) | Self::Int64(_) | Self::Float64(_) | Self::Boolean(_), DataType::Utf8) => {
                Self::Utf8(self.to_string())
            }
            (Self::Utf8(s), DataType::Int32) => {
                Self::Int32(s.trim().parse().map_err(|_| cast_err())?)
            }
            (Self::Utf8(s), DataType::Int64) => {
                Self::Int64(s.trim().parse().map_err(|_| cast_err())?)
            }
            (Self::Utf8(s), DataType::Float64) => {
                Self::Float64(s.trim().parse().map_err(|_| cast_err())?)
            }
            (Self::Utf8(s), DataType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Self::Boolean(true),
                "false" | "0" => Self::Boolean(false),
                _ => return Err(cast_err()),
            },
            (Self::Utf8(s), DataType::Binary) => Self::Binary(s.as_bytes().to_vec()),
            (Self::Utf8(s), DataType::Lob) => Self::Lob(LobValue {
                id: uuid::Uuid::new_v4().to_string(),
                data: Bytes::copy_from_slice(s.as_bytes()),
            }),
            (Self::Binary(b), DataType::Lob) => Self::Lob(LobValue {
                id: uuid::Uuid::new_v4().to_string(),
                data: Bytes::copy_from_slice(b),
            }),
            _ => return Err(cast_err()),
        };

        Ok(val)
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            // Bitwise so that equality agrees with hashing.
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Lob(a), Self::Lob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => (),
            Self::Boolean(v) => v.hash(state),
            Self::Int32(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.to_bits().hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Binary(v) => v.hash(state),
            Self::Lob(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
            Self::Binary(v) => {
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Self::Lob(v) => write!(f, "<lob {} ({} bytes)>", v.id, v.data.len()),
        }
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_string_to_int() {
        let v = ScalarValue::from("42").try_cast(DataType::Int32).unwrap();
        assert_eq!(ScalarValue::Int32(42), v);
    }

    #[test]
    fn cast_string_to_int_invalid() {
        ScalarValue::from("abc")
            .try_cast(DataType::Int32)
            .unwrap_err();
    }

    #[test]
    fn cast_null_to_anything() {
        let v = ScalarValue::Null.try_cast(DataType::Boolean).unwrap();
        assert_eq!(ScalarValue::Null, v);
    }

    #[test]
    fn cast_int64_overflow() {
        ScalarValue::Int64(i64::MAX)
            .try_cast(DataType::Int32)
            .unwrap_err();
    }

    #[test]
    fn float_eq_is_bitwise() {
        assert_eq!(ScalarValue::Float64(1.5), ScalarValue::Float64(1.5));
        assert_ne!(ScalarValue::Float64(0.0), ScalarValue::Float64(-0.0));
    }
}
