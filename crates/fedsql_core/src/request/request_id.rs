use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a request within the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub session_id: String,
    pub execution_id: u64,
}

impl RequestId {
    pub fn new(session_id: impl Into<String>, execution_id: u64) -> Self {
        RequestId {
            session_id: session_id.into(),
            execution_id,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.execution_id)
    }
}
