//! Local, request scoped and global (XA) transactions.

pub mod recording;
pub mod server;

use std::fmt;
use std::fmt::Debug;

use fedsql_error::Result;
use serde::{Deserialize, Serialize};

/// Flag values accepted by `start` and `end` of global transactions.
pub mod xa_flags {
    pub const NO_FLAGS: u32 = 0;
    pub const JOIN: u32 = 0x0020_0000;
    pub const RESUME: u32 = 0x0800_0000;
    pub const SUCCESS: u32 = 0x0400_0000;
    pub const FAIL: u32 = 0x2000_0000;
    pub const SUSPEND: u32 = 0x0200_0000;
    pub const START_RECOVERY_SCAN: u32 = 0x0100_0000;
    pub const END_RECOVERY_SCAN: u32 = 0x0080_0000;
}

/// Global transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_id: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_id: impl Into<Vec<u8>>) -> Self {
        Xid {
            format_id,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid<{}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{b:02x}")?;
        }
        write!(f, ":")?;
        for b in &self.branch_id {
            write!(f, "{b:02x}")?;
        }
        write!(f, ">")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionScope {
    /// Started by the client with `begin`.
    Local,
    /// Started by the engine around a single request.
    Request,
    /// XA transaction coordinated outside of the engine.
    Global,
}

impl fmt::Display for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "LOCAL"),
            Self::Request => write!(f, "REQUEST"),
            Self::Global => write!(f, "GLOBAL"),
        }
    }
}

/// Transaction a request runs in, handed down to connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub id: String,
    /// Client thread the transaction belongs to.
    pub thread: String,
    pub scope: TransactionScope,
    pub xid: Option<Xid>,
}

/// Result of preparing a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaVote {
    Ok,
    /// Nothing was written, the transaction is already complete.
    ReadOnly,
}

/// Manages local and request scoped transactions.
pub trait TransactionManager: Debug + Sync + Send {
    /// Begin a new transaction, returning its id.
    fn begin(&self) -> Result<String>;

    fn commit(&self, id: &str) -> Result<()>;

    fn rollback(&self, id: &str) -> Result<()>;
}

/// Completion side of global transactions.
pub trait XaTerminator: Debug + Sync + Send {
    fn prepare(&self, xid: &Xid) -> Result<XaVote>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    fn rollback(&self, xid: &Xid) -> Result<()>;

    fn forget(&self, xid: &Xid) -> Result<()>;

    /// Prepared transactions that have not yet been completed.
    fn recover(&self, flags: u32) -> Result<Vec<Xid>>;
}
