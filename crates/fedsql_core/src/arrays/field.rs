use serde::{Deserialize, Serialize};

use super::datatype::DataType;
use super::scalar::ScalarValue;

/// A single row of values.
pub type Row = Vec<ScalarValue>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub datatype: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, datatype: DataType, nullable: bool) -> Self {
        Field {
            name: name.into(),
            datatype,
            nullable,
        }
    }
}

/// Ordered list of typed columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub fields: Vec<Field>,
}

impl ColumnSchema {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Self {
        ColumnSchema {
            fields: fields.into_iter().collect(),
        }
    }

    /// Schema for update counts returned by DML.
    pub fn update_count() -> Self {
        ColumnSchema::new([Field::new("count", DataType::Int64, false)])
    }

    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    pub fn datatypes(&self) -> impl Iterator<Item = DataType> + '_ {
        self.fields.iter().map(|f| f.datatype)
    }
}
