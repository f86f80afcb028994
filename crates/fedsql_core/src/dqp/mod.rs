//! Dispatch of atomic requests to connectors.

pub mod capabilities;
pub mod connector;
pub mod connector_work;
pub mod data_tier;
pub mod limiter;
pub mod registry;

use std::fmt;

use crate::arrays::scalar::ScalarValue;
use crate::request::request_id::RequestId;
use crate::transaction::TransactionSnapshot;

/// Identifies a single connector sub-request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomicRequestId {
    pub request_id: RequestId,
    /// Plan node that issued the request.
    pub node_id: usize,
    /// Distinguishes repeated executions of the same node.
    pub execution_count: u64,
}

impl fmt::Display for AtomicRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.request_id, self.node_id, self.execution_count
        )
    }
}

/// Everything a connector needs to execute a sub-request.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicRequestMessage {
    pub atomic_request_id: AtomicRequestId,
    pub model: String,
    pub connector_binding: String,
    /// Source command text.
    pub command: String,
    pub parameters: Vec<ScalarValue>,
    pub row_limit: Option<usize>,
    pub fetch_size: usize,
    pub user: String,
    pub transaction: Option<TransactionSnapshot>,
    pub partial_results: bool,
}

/// A source failure tolerated because the request allowed partial results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWarning {
    pub model: String,
    pub connector_binding: String,
    pub message: String,
    pub retryable: bool,
}

impl fmt::Display for SourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Source failure for model {} (binding {}): {}",
            self.model, self.connector_binding, self.message
        )
    }
}
