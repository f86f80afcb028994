use std::fmt;

use crate::arrays::datatype::DataType;
use crate::cache::Determinism;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Query,
    Insert,
    Update,
    Delete,
    Procedure,
    Create,
    Drop,
}

impl CommandKind {
    pub const fn is_update(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::Create | Self::Drop
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Query => "QUERY",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Procedure => "PROCEDURE",
            Self::Create => "CREATE",
            Self::Drop => "DROP",
        };
        write!(f, "{s}")
    }
}

/// A change a command makes to a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataModification {
    pub group: String,
    /// Structural changes invalidate dependent plans, not just data.
    pub major: bool,
}

/// A parsed, and possibly resolved, command.
///
/// Produced by the parser and filled in by the resolver. Everything past
/// the object references is opaque to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sql: String,
    pub kind: CommandKind,
    /// Qualified names of groups referenced by the command.
    pub groups: Vec<String>,
    /// Qualified names of procedures called by the command.
    pub procedures: Vec<String>,
    /// Types of positional parameters in order.
    pub parameter_types: Vec<DataType>,
    pub modification: Option<DataModification>,
    /// Broadest scope the command's result is valid in.
    pub determinism: Determinism,
    pub resolved: bool,
}

impl Command {
    pub fn new(sql: impl Into<String>, kind: CommandKind) -> Self {
        Command {
            sql: sql.into(),
            kind,
            groups: Vec::new(),
            procedures: Vec::new(),
            parameter_types: Vec::new(),
            modification: None,
            determinism: Determinism::Deterministic,
            resolved: false,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_types.len()
    }

    /// All objects this command accesses.
    pub fn accessed_objects(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .chain(self.procedures.iter())
            .map(|s| s.as_str())
    }
}

/// Notes collected while planning a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisRecord {
    pub record_annotations: bool,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub category: String,
    pub message: String,
}

impl AnalysisRecord {
    pub fn new(record_annotations: bool) -> Self {
        AnalysisRecord {
            record_annotations,
            annotations: Vec::new(),
        }
    }

    pub fn add_annotation(&mut self, category: impl Into<String>, message: impl Into<String>) {
        if self.record_annotations {
            self.annotations.push(Annotation {
                category: category.into(),
                message: message.into(),
            });
        }
    }
}
