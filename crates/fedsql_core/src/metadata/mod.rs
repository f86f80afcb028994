//! Read-only lookups against the deployed virtual database.

pub mod policy;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::arrays::datatype::DataType;
use crate::arrays::field::ColumnSchema;
use policy::DataPolicy;

/// Name and version identifying a deployed VDB.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VdbKey {
    pub name: String,
    pub version: u32,
}

impl VdbKey {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        VdbKey {
            name: name.into(),
            version,
        }
    }

    pub fn matches(&self, name: &str, version: u32) -> bool {
        self.version == version && self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for VdbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub name: String,
    /// Whether the model may be referenced by user queries.
    pub visible: bool,
    /// Connector binding for physical models.
    pub source_binding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Fully qualified name, `model.group`.
    pub name: String,
    pub model: String,
    pub schema: ColumnSchema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureInfo {
    pub name: String,
    pub model: String,
    pub parameters: Vec<DataType>,
    pub result: ColumnSchema,
}

/// Lookups needed while planning and authorizing commands.
///
/// All name lookups are case insensitive.
pub trait QueryMetadata: fmt::Debug + Sync + Send {
    fn vdb(&self) -> &VdbKey;

    fn model(&self, name: &str) -> Option<&Model>;

    fn group(&self, name: &str) -> Option<&GroupInfo>;

    fn procedure(&self, name: &str) -> Option<&ProcedureInfo>;

    fn data_policies(&self) -> &[DataPolicy];

    fn is_visible(&self, model: &str) -> bool {
        self.model(model).map(|m| m.visible).unwrap_or(false)
    }

    /// Connector binding backing the given model.
    fn source_binding(&self, model: &str) -> Option<&str> {
        self.model(model).and_then(|m| m.source_binding.as_deref())
    }
}

/// A deployed virtual database.
#[derive(Debug, Clone)]
pub struct Vdb {
    key: VdbKey,
    models: Vec<Model>,
    groups: Vec<GroupInfo>,
    procedures: Vec<ProcedureInfo>,
    policies: Vec<DataPolicy>,
}

impl Vdb {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Vdb {
            key: VdbKey::new(name, version),
            models: Vec::new(),
            groups: Vec::new(),
            procedures: Vec::new(),
            policies: Vec::new(),
        }
    }

    pub fn with_model(
        mut self,
        name: impl Into<String>,
        visible: bool,
        source_binding: Option<&str>,
    ) -> Self {
        self.models.push(Model {
            name: name.into(),
            visible,
            source_binding: source_binding.map(|s| s.to_string()),
        });
        self
    }

    /// Add a group to a model. The group name is qualified with the model
    /// name.
    pub fn with_group(mut self, model: &str, name: &str, schema: ColumnSchema) -> Self {
        self.groups.push(GroupInfo {
            name: format!("{model}.{name}"),
            model: model.to_string(),
            schema,
        });
        self
    }

    pub fn with_procedure(
        mut self,
        model: &str,
        name: &str,
        parameters: Vec<DataType>,
        result: ColumnSchema,
    ) -> Self {
        self.procedures.push(ProcedureInfo {
            name: format!("{model}.{name}"),
            model: model.to_string(),
            parameters,
            result,
        });
        self
    }

    pub fn with_data_policy(mut self, policy: DataPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn key(&self) -> &VdbKey {
        &self.key
    }
}

/// In-memory metadata for a single VDB, indexed by lowercased name.
#[derive(Debug)]
pub struct VdbMetadata {
    key: VdbKey,
    models: HashMap<String, Model>,
    groups: HashMap<String, GroupInfo>,
    procedures: HashMap<String, ProcedureInfo>,
    policies: Vec<DataPolicy>,
}

impl VdbMetadata {
    pub fn new(vdb: Vdb) -> Self {
        VdbMetadata {
            key: vdb.key,
            models: vdb
                .models
                .into_iter()
                .map(|m| (m.name.to_lowercase(), m))
                .collect(),
            groups: vdb
                .groups
                .into_iter()
                .map(|g| (g.name.to_lowercase(), g))
                .collect(),
            procedures: vdb
                .procedures
                .into_iter()
                .map(|p| (p.name.to_lowercase(), p))
                .collect(),
            policies: vdb.policies,
        }
    }
}

impl QueryMetadata for VdbMetadata {
    fn vdb(&self) -> &VdbKey {
        &self.key
    }

    fn model(&self, name: &str) -> Option<&Model> {
        self.models.get(&name.to_lowercase())
    }

    fn group(&self, name: &str) -> Option<&GroupInfo> {
        self.groups.get(&name.to_lowercase())
    }

    fn procedure(&self, name: &str) -> Option<&ProcedureInfo> {
        self.procedures.get(&name.to_lowercase())
    }

    fn data_policies(&self) -> &[DataPolicy] {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::field::Field;

    #[test]
    fn case_insensitive_lookups() {
        let vdb = Vdb::new("parts", 1)
            .with_model("PM1", true, Some("oracle"))
            .with_model("vm1", false, None)
            .with_group(
                "PM1",
                "G1",
                ColumnSchema::new([Field::new("e1", DataType::Int32, true)]),
            );
        let md = VdbMetadata::new(vdb);

        assert!(md.group("pm1.g1").is_some());
        assert_eq!(Some("oracle"), md.source_binding("pm1"));
        assert!(md.is_visible("pm1"));
        assert!(!md.is_visible("VM1"));
        assert!(!md.is_visible("missing"));
        assert!(md.vdb().matches("PARTS", 1));
        assert!(!md.vdb().matches("parts", 2));
    }
}
