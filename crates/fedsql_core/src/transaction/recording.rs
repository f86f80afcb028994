//! In-memory transaction collaborators that record every call.
//!
//! Used by embedders without a real transaction manager, and by tests to
//! check the order of calls.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{TransactionManager, XaTerminator, XaVote, Xid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Begin(String),
    Commit(String),
    Rollback(String),
}

#[derive(Debug, Default)]
pub struct RecordingTransactionManager {
    events: Mutex<Vec<TransactionEvent>>,
    open: Mutex<BTreeSet<String>>,
}

impl RecordingTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().clone()
    }

    pub fn num_open(&self) -> usize {
        self.open.lock().len()
    }

    fn complete(&self, id: &str, event: TransactionEvent) -> Result<()> {
        if !self.open.lock().remove(id) {
            return Err(DbError::transaction("Unknown transaction").with_field("id", id));
        }
        trace!(?event, "transaction event");
        self.events.lock().push(event);
        Ok(())
    }
}

impl TransactionManager for RecordingTransactionManager {
    fn begin(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.open.lock().insert(id.clone());
        self.events.lock().push(TransactionEvent::Begin(id.clone()));
        Ok(id)
    }

    fn commit(&self, id: &str) -> Result<()> {
        self.complete(id, TransactionEvent::Commit(id.to_string()))
    }

    fn rollback(&self, id: &str) -> Result<()> {
        self.complete(id, TransactionEvent::Rollback(id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaEvent {
    Prepare(Xid),
    Commit { xid: Xid, one_phase: bool },
    Rollback(Xid),
    Forget(Xid),
}

#[derive(Debug, Default)]
pub struct RecordingXaTerminator {
    events: Mutex<Vec<XaEvent>>,
    prepared: Mutex<Vec<Xid>>,
    read_only: AtomicBool,
}

impl RecordingXaTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vote read-only on every prepare.
    pub fn with_read_only_vote(self) -> Self {
        self.read_only.store(true, Ordering::Relaxed);
        self
    }

    pub fn events(&self) -> Vec<XaEvent> {
        self.events.lock().clone()
    }

    fn unprepare(&self, xid: &Xid) {
        self.prepared.lock().retain(|x| x != xid);
    }
}

impl XaTerminator for RecordingXaTerminator {
    fn prepare(&self, xid: &Xid) -> Result<XaVote> {
        self.events.lock().push(XaEvent::Prepare(xid.clone()));
        if self.read_only.load(Ordering::Relaxed) {
            return Ok(XaVote::ReadOnly);
        }
        self.prepared.lock().push(xid.clone());
        Ok(XaVote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.unprepare(xid);
        self.events.lock().push(XaEvent::Commit {
            xid: xid.clone(),
            one_phase,
        });
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        self.unprepare(xid);
        self.events.lock().push(XaEvent::Rollback(xid.clone()));
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        self.unprepare(xid);
        self.events.lock().push(XaEvent::Forget(xid.clone()));
        Ok(())
    }

    fn recover(&self, _flags: u32) -> Result<Vec<Xid>> {
        Ok(self.prepared.lock().clone())
    }
}
