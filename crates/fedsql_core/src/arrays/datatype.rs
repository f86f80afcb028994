use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
    Binary,
    /// Large object, streamed to clients in chunks.
    Lob,
}

impl DataType {
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Int32 => "integer",
            Self::Int64 => "long",
            Self::Float64 => "double",
            Self::Utf8 => "string",
            Self::Binary => "varbinary",
            Self::Lob => "lob",
        };
        write!(f, "{s}")
    }
}
