use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fedsql_error::{DbError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::xa_flags::*;
use super::{TransactionManager, TransactionScope, TransactionSnapshot, XaTerminator, XaVote, Xid};

#[derive(Debug)]
struct ThreadTransaction {
    snapshot: TransactionSnapshot,
    rollback_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobalState {
    Active,
    Ended,
    Prepared,
}

#[derive(Debug)]
struct GlobalTransaction {
    id: String,
    xid: Xid,
    /// Thread that started the transaction.
    owner: String,
    state: GlobalState,
    /// Thread currently doing work on the transaction.
    associated: Option<String>,
    /// Threads that suspended their work and may resume it.
    suspended: HashSet<String>,
    rollback_only: bool,
    timeout: Option<Duration>,
}

impl GlobalTransaction {
    fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            id: self.id.clone(),
            thread: self.associated.clone().unwrap_or_else(|| self.owner.clone()),
            scope: TransactionScope::Global,
            xid: Some(self.xid.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    /// Local and request scoped transactions by client thread.
    threads: HashMap<String, ThreadTransaction>,
    globals: HashMap<Xid, GlobalTransaction>,
}

impl ServerState {
    fn associated_global(&self, thread: &str) -> Option<&GlobalTransaction> {
        self.globals
            .values()
            .find(|g| g.associated.as_deref() == Some(thread))
    }

    fn associated_global_mut(&mut self, thread: &str) -> Option<&mut GlobalTransaction> {
        self.globals
            .values_mut()
            .find(|g| g.associated.as_deref() == Some(thread))
    }

    fn global_mut(&mut self, xid: &Xid) -> Result<&mut GlobalTransaction> {
        self.globals.get_mut(xid).ok_or_else(|| not_found(xid))
    }
}

/// Active transaction as reported to administrators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: String,
    pub scope: TransactionScope,
    /// Thread currently associated with the transaction, if any.
    pub thread: Option<String>,
    pub xid: Option<Xid>,
    pub rollback_only: bool,
    /// Timeout requested when a global transaction was started.
    pub timeout: Option<Duration>,
}

fn nesting_error(thread: &str) -> DbError {
    DbError::transaction(
        "Client thread already involved in a transaction. Transaction nesting not supported, the current transaction must be completed first",
    )
    .with_field("thread", thread)
}

fn not_found(xid: &Xid) -> DbError {
    DbError::transaction("No global transaction found").with_field("xid", xid)
}

fn invalid_flags(flags: u32) -> DbError {
    DbError::transaction("Invalid transaction flags").with_field("flags", format!("{flags:#x}"))
}

/// Coordinates transactions for client threads.
///
/// A client thread is associated with at most one transaction at a time,
/// either a local/request transaction or a global one.
#[derive(Debug)]
pub struct TransactionServer {
    manager: Arc<dyn TransactionManager>,
    xa: Arc<dyn XaTerminator>,
    state: Mutex<ServerState>,
}

impl TransactionServer {
    pub fn new(manager: Arc<dyn TransactionManager>, xa: Arc<dyn XaTerminator>) -> Self {
        TransactionServer {
            manager,
            xa,
            state: Mutex::new(ServerState::default()),
        }
    }

    fn check_no_transaction(state: &ServerState, thread: &str) -> Result<()> {
        if state.threads.contains_key(thread) || state.associated_global(thread).is_some() {
            return Err(nesting_error(thread));
        }
        Ok(())
    }

    fn begin_scoped(&self, thread: &str, scope: TransactionScope) -> Result<TransactionSnapshot> {
        let mut state = self.state.lock();
        Self::check_no_transaction(&state, thread)?;

        let id = self.manager.begin()?;
        let snapshot = TransactionSnapshot {
            id,
            thread: thread.to_string(),
            scope,
            xid: None,
        };
        state.threads.insert(
            thread.to_string(),
            ThreadTransaction {
                snapshot: snapshot.clone(),
                rollback_only: false,
            },
        );
        debug!(%thread, %scope, id = %snapshot.id, "began transaction");

        Ok(snapshot)
    }

    fn complete_scoped(&self, thread: &str, scope: TransactionScope, commit: bool) -> Result<()> {
        let tx = {
            let mut state = self.state.lock();
            let matches = state
                .threads
                .get(thread)
                .is_some_and(|tx| tx.snapshot.scope == scope);
            if !matches {
                return Err(DbError::transaction("No transaction found for client thread")
                    .with_field("thread", thread)
                    .with_field("scope", scope));
            }
            match state.threads.remove(thread) {
                Some(tx) => tx,
                None => return Err(DbError::internal("Thread transaction disappeared")),
            }
        };

        let id = &tx.snapshot.id;
        if commit && tx.rollback_only {
            self.manager.rollback(id)?;
            return Err(DbError::transaction(
                "Transaction was marked rollback only and has been rolled back",
            )
            .with_field("thread", thread)
            .with_field("id", id));
        }

        if commit {
            self.manager.commit(id)?;
        } else {
            self.manager.rollback(id)?;
        }
        debug!(%thread, %scope, %id, %commit, "completed transaction");

        Ok(())
    }

    /// Begin a local transaction for the thread.
    pub fn begin(&self, thread: &str) -> Result<TransactionSnapshot> {
        self.begin_scoped(thread, TransactionScope::Local)
    }

    pub fn commit(&self, thread: &str) -> Result<()> {
        self.complete_scoped(thread, TransactionScope::Local, true)
    }

    pub fn rollback(&self, thread: &str) -> Result<()> {
        self.complete_scoped(thread, TransactionScope::Local, false)
    }

    /// Begin a transaction wrapping a single request.
    pub fn begin_request(&self, thread: &str) -> Result<TransactionSnapshot> {
        self.begin_scoped(thread, TransactionScope::Request)
    }

    /// Commit a request scoped transaction.
    pub fn commit_context(&self, snapshot: &TransactionSnapshot) -> Result<()> {
        if snapshot.scope != TransactionScope::Request {
            return Err(DbError::transaction("Only request scoped transactions can be completed by the engine")
                .with_field("scope", snapshot.scope));
        }
        self.complete_scoped(&snapshot.thread, TransactionScope::Request, true)
    }

    /// Roll back a request scoped transaction.
    pub fn rollback_context(&self, snapshot: &TransactionSnapshot) -> Result<()> {
        if snapshot.scope != TransactionScope::Request {
            return Err(DbError::transaction("Only request scoped transactions can be completed by the engine")
                .with_field("scope", snapshot.scope));
        }
        self.complete_scoped(&snapshot.thread, TransactionScope::Request, false)
    }

    /// Associate the thread with a global transaction.
    pub fn start(&self, thread: &str, xid: &Xid, flags: u32, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();

        if state.threads.contains_key(thread) {
            return Err(nesting_error(thread).with_field("xid", xid));
        }
        if let Some(current) = state.associated_global(thread) {
            if &current.xid != xid || flags == NO_FLAGS {
                return Err(nesting_error(thread).with_field("xid", xid));
            }
        }

        match flags {
            NO_FLAGS => {
                if state.globals.contains_key(xid) {
                    return Err(DbError::transaction("Global transaction already exists")
                        .with_field("xid", xid));
                }
                let global = GlobalTransaction {
                    id: Uuid::new_v4().to_string(),
                    xid: xid.clone(),
                    owner: thread.to_string(),
                    state: GlobalState::Active,
                    associated: Some(thread.to_string()),
                    suspended: HashSet::new(),
                    rollback_only: false,
                    timeout,
                };
                debug!(%thread, %xid, ?timeout, "started global transaction");
                state.globals.insert(xid.clone(), global);
            }
            JOIN | RESUME => {
                let global = state.global_mut(xid)?;
                if global.state == GlobalState::Prepared {
                    return Err(DbError::transaction("Global transaction already prepared")
                        .with_field("xid", xid));
                }
                if global.associated.is_some() {
                    return Err(DbError::transaction(
                        "Concurrent enlistment in global transaction is not supported",
                    )
                    .with_field("thread", thread)
                    .with_field("xid", xid));
                }
                // Joining also picks up work the thread suspended.
                let was_suspended = global.suspended.remove(thread);
                if flags == RESUME && !was_suspended {
                    return Err(DbError::transaction(
                        "Cannot resume, the global transaction was not suspended by client thread",
                    )
                    .with_field("thread", thread)
                    .with_field("xid", xid));
                }
                global.associated = Some(thread.to_string());
                global.state = GlobalState::Active;
                debug!(%thread, %xid, %flags, "enlisted in global transaction");
            }
            other => return Err(invalid_flags(other)),
        }

        Ok(())
    }

    /// Disassociate the thread from a global transaction.
    pub fn end(&self, thread: &str, xid: &Xid, flags: u32) -> Result<()> {
        if !matches!(flags, SUCCESS | FAIL | SUSPEND) {
            return Err(invalid_flags(flags));
        }

        let mut state = self.state.lock();
        let global = state.global_mut(xid)?;
        if global.associated.as_deref() != Some(thread) {
            return Err(
                DbError::transaction("Client thread is not currently enlisted in the global transaction")
                    .with_field("thread", thread)
                    .with_field("xid", xid),
            );
        }

        match flags {
            FAIL => global.rollback_only = true,
            SUSPEND => {
                global.suspended.insert(thread.to_string());
            }
            _ => (),
        }
        global.associated = None;
        if global.suspended.is_empty() {
            global.state = GlobalState::Ended;
        }
        debug!(%thread, %xid, %flags, "ended work on global transaction");

        Ok(())
    }

    pub fn prepare(&self, thread: &str, xid: &Xid) -> Result<XaVote> {
        let mut state = self.state.lock();
        let global = state.global_mut(xid)?;

        if !global.suspended.is_empty() {
            return Err(DbError::transaction("Suspended work still exists on the global transaction")
                .with_field("xid", xid));
        }
        if global.associated.is_some() {
            return Err(DbError::transaction("Work is still associated with the global transaction")
                .with_field("xid", xid));
        }
        if global.state == GlobalState::Prepared {
            return Err(DbError::transaction("Global transaction already prepared")
                .with_field("xid", xid));
        }

        if global.rollback_only {
            state.globals.remove(xid);
            self.xa.rollback(xid)?;
            return Err(DbError::transaction(
                "Global transaction was marked rollback only and has been rolled back",
            )
            .with_field("xid", xid));
        }

        let vote = self.xa.prepare(xid)?;
        match vote {
            XaVote::Ok => global.state = GlobalState::Prepared,
            XaVote::ReadOnly => {
                state.globals.remove(xid);
            }
        }
        debug!(%thread, %xid, ?vote, "prepared global transaction");

        Ok(vote)
    }

    /// Commit a global transaction.
    ///
    /// A one phase commit prepares the transaction first. A read only vote
    /// completes the transaction without a commit.
    pub fn commit_global(&self, thread: &str, xid: &Xid, one_phase: bool) -> Result<()> {
        if one_phase {
            if self.prepare(thread, xid)? == XaVote::ReadOnly {
                return Ok(());
            }
        }

        let mut state = self.state.lock();
        let global = state.global_mut(xid)?;
        if global.state != GlobalState::Prepared {
            return Err(DbError::transaction("Global transaction has not been prepared")
                .with_field("xid", xid));
        }

        self.xa.commit(xid, false)?;
        state.globals.remove(xid);
        debug!(%thread, %xid, %one_phase, "committed global transaction");

        Ok(())
    }

    pub fn rollback_global(&self, thread: &str, xid: &Xid) -> Result<()> {
        let mut state = self.state.lock();
        let global = state.global_mut(xid)?;
        if global.associated.as_deref().is_some_and(|t| t != thread) {
            return Err(DbError::transaction(
                "Concurrent enlistment in global transaction is not supported",
            )
            .with_field("thread", thread)
            .with_field("xid", xid));
        }

        self.xa.rollback(xid)?;
        state.globals.remove(xid);
        debug!(%thread, %xid, "rolled back global transaction");

        Ok(())
    }

    pub fn forget(&self, thread: &str, xid: &Xid) -> Result<()> {
        self.xa.forget(xid)?;
        self.state.lock().globals.remove(xid);
        debug!(%thread, %xid, "forgot global transaction");
        Ok(())
    }

    pub fn recover(&self, flags: u32) -> Result<Vec<Xid>> {
        let valid = flags & !(START_RECOVERY_SCAN | END_RECOVERY_SCAN) == 0;
        if !valid {
            return Err(invalid_flags(flags));
        }
        self.xa.recover(flags)
    }

    /// Mark the thread's transaction rollback only.
    ///
    /// Nothing is rolled back here, the transaction fails when it's
    /// completed. Returns true if a transaction was marked.
    pub fn cancel_transactions(&self, thread: &str, request_only: bool) -> bool {
        let mut state = self.state.lock();
        if let Some(tx) = state.threads.get_mut(thread) {
            if !request_only || tx.snapshot.scope == TransactionScope::Request {
                tx.rollback_only = true;
                debug!(%thread, id = %tx.snapshot.id, "marked transaction rollback only");
                return true;
            }
            return false;
        }

        if !request_only {
            if let Some(global) = state.associated_global_mut(thread) {
                global.rollback_only = true;
                debug!(%thread, xid = %global.xid, "marked global transaction rollback only");
                return true;
            }
        }

        false
    }

    /// Transaction the thread is currently associated with.
    pub fn transaction_for_thread(&self, thread: &str) -> Option<TransactionSnapshot> {
        let state = self.state.lock();
        if let Some(tx) = state.threads.get(thread) {
            return Some(tx.snapshot.clone());
        }
        state.associated_global(thread).map(|g| g.snapshot())
    }

    pub fn is_rollback_only(&self, thread: &str) -> bool {
        let state = self.state.lock();
        match state.threads.get(thread) {
            Some(tx) => tx.rollback_only,
            None => state.associated_global(thread).is_some_and(|g| g.rollback_only),
        }
    }

    /// All active transactions.
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        let state = self.state.lock();
        let threads = state.threads.values().map(|tx| TransactionInfo {
            id: tx.snapshot.id.clone(),
            scope: tx.snapshot.scope,
            thread: Some(tx.snapshot.thread.clone()),
            xid: None,
            rollback_only: tx.rollback_only,
            timeout: None,
        });
        let globals = state.globals.values().map(|g| TransactionInfo {
            id: g.id.clone(),
            scope: TransactionScope::Global,
            thread: g.associated.clone(),
            xid: Some(g.xid.clone()),
            rollback_only: g.rollback_only,
            timeout: g.timeout,
        });
        threads.chain(globals).collect()
    }

    /// Release everything the thread holds, e.g. when its session closes.
    ///
    /// Local and request transactions are rolled back. Global transactions
    /// are completed by their coordinator, the thread's work is only marked
    /// failed.
    pub fn terminate_thread(&self, thread: &str) -> Result<()> {
        let local = {
            let mut state = self.state.lock();
            if let Some(global) = state.associated_global_mut(thread) {
                warn!(%thread, xid = %global.xid, "thread terminated while enlisted in global transaction");
                global.associated = None;
                global.rollback_only = true;
                global.state = GlobalState::Ended;
            }
            for global in state.globals.values_mut() {
                global.suspended.remove(thread);
            }
            state.threads.remove(thread)
        };

        if let Some(tx) = local {
            debug!(%thread, id = %tx.snapshot.id, "rolling back transaction of terminated thread");
            self.manager.rollback(&tx.snapshot.id)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fedsql_error::DbErrorKind;

    use super::*;
    use crate::transaction::recording::{
        RecordingTransactionManager,
        RecordingXaTerminator,
        TransactionEvent,
        XaEvent,
    };

    struct Setup {
        server: TransactionServer,
        manager: Arc<RecordingTransactionManager>,
        xa: Arc<RecordingXaTerminator>,
    }

    fn setup_with(xa: RecordingXaTerminator) -> Setup {
        let manager = Arc::new(RecordingTransactionManager::new());
        let xa = Arc::new(xa);
        Setup {
            server: TransactionServer::new(manager.clone(), xa.clone()),
            manager,
            xa,
        }
    }

    fn setup() -> Setup {
        setup_with(RecordingXaTerminator::new())
    }

    fn xid(n: u8) -> Xid {
        Xid::new(0, [n], [1])
    }

    #[test]
    fn global_after_local_is_nesting_error() {
        let s = setup();
        s.server.begin("t1").unwrap();

        let err = s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap_err();
        assert_eq!(DbErrorKind::Transaction, err.kind());
        assert!(err.get_msg().contains("Transaction nesting not supported"));
        assert_eq!(Some("t1"), err.field("thread"));
    }

    #[test]
    fn local_after_global_is_nesting_error() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();

        let err = s.server.begin("t1").unwrap_err();
        assert!(err.get_msg().contains("Transaction nesting not supported"));
        assert_eq!(Some("t1"), err.field("thread"));

        // Other threads are unaffected.
        s.server.begin("t2").unwrap();
    }

    #[test]
    fn duplicate_start() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUCCESS).unwrap();

        let err = s.server.start("t2", &xid(1), NO_FLAGS, None).unwrap_err();
        assert!(err.get_msg().contains("already exists"));
    }

    #[test]
    fn concurrent_join() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();

        let err = s.server.start("t2", &xid(1), JOIN, None).unwrap_err();
        assert!(err.get_msg().contains("Concurrent enlistment"));

        s.server.end("t1", &xid(1), SUCCESS).unwrap();
        s.server.start("t2", &xid(1), JOIN, None).unwrap();
    }

    #[test]
    fn double_suspend() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUSPEND).unwrap();

        let err = s.server.end("t1", &xid(1), SUSPEND).unwrap_err();
        assert!(err.get_msg().contains("not currently enlisted"));
    }

    #[test]
    fn join_clears_suspended_work() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUSPEND).unwrap();

        s.server.start("t1", &xid(1), JOIN, None).unwrap();
        s.server.end("t1", &xid(1), SUCCESS).unwrap();

        // Nothing left to resume.
        let err = s.server.start("t1", &xid(1), RESUME, None).unwrap_err();
        assert!(err.get_msg().contains("not suspended"));

        assert_eq!(XaVote::Ok, s.server.prepare("t1", &xid(1)).unwrap());
    }

    #[test]
    fn resume_from_other_thread() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUSPEND).unwrap();

        let err = s.server.start("t2", &xid(1), RESUME, None).unwrap_err();
        assert_eq!(Some("t2"), err.field("thread"));

        s.server.start("t1", &xid(1), RESUME, None).unwrap();
        assert_eq!(
            TransactionScope::Global,
            s.server.transaction_for_thread("t1").unwrap().scope
        );
    }

    #[test]
    fn invalid_flags_rejected() {
        let s = setup();
        let err = s.server.start("t1", &xid(1), 0x1234, None).unwrap_err();
        assert!(err.get_msg().contains("Invalid transaction flags"));

        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        assert!(s.server.end("t1", &xid(1), JOIN).is_err());
    }

    #[test]
    fn unknown_xid() {
        let s = setup();
        let err = s.server.prepare("t1", &xid(9)).unwrap_err();
        assert!(err.get_msg().contains("No global transaction found"));
        assert!(s.server.start("t1", &xid(9), JOIN, None).is_err());
        assert!(s.server.end("t1", &xid(9), SUCCESS).is_err());
    }

    #[test]
    fn prepare_with_suspended_work() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUSPEND).unwrap();

        let err = s.server.prepare("t1", &xid(1)).unwrap_err();
        assert!(err.get_msg().contains("Suspended work"));
    }

    #[test]
    fn two_phase_commit() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUCCESS).unwrap();

        assert!(s.server.commit_global("t1", &xid(1), false).is_err());

        assert_eq!(XaVote::Ok, s.server.prepare("t1", &xid(1)).unwrap());
        assert_eq!(vec![xid(1)], s.server.recover(NO_FLAGS).unwrap());

        s.server.commit_global("t1", &xid(1), false).unwrap();
        assert!(s.server.transactions().is_empty());
        assert!(s.server.recover(START_RECOVERY_SCAN | END_RECOVERY_SCAN).unwrap().is_empty());
    }

    #[test]
    fn one_phase_commit_prepares_first() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUCCESS).unwrap();
        s.server.commit_global("t1", &xid(1), true).unwrap();

        assert_eq!(
            vec![
                XaEvent::Prepare(xid(1)),
                XaEvent::Commit {
                    xid: xid(1),
                    one_phase: false
                },
            ],
            s.xa.events()
        );
    }

    #[test]
    fn one_phase_read_only_skips_commit() {
        let s = setup_with(RecordingXaTerminator::new().with_read_only_vote());
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), SUCCESS).unwrap();
        s.server.commit_global("t1", &xid(1), true).unwrap();

        assert_eq!(vec![XaEvent::Prepare(xid(1))], s.xa.events());
        assert!(s.server.transactions().is_empty());
    }

    #[test]
    fn failed_work_rolls_back_on_prepare() {
        let s = setup();
        s.server.start("t1", &xid(1), NO_FLAGS, None).unwrap();
        s.server.end("t1", &xid(1), FAIL).unwrap();

        assert!(s.server.prepare("t1", &xid(1)).is_err());
        assert_eq!(vec![XaEvent::Rollback(xid(1))], s.xa.events());
    }

    #[test]
    fn local_commit_and_rollback() {
        let s = setup();
        let tx = s.server.begin("t1").unwrap();
        assert_eq!(TransactionScope::Local, tx.scope);
        s.server.commit("t1").unwrap();

        let tx2 = s.server.begin("t1").unwrap();
        s.server.rollback("t1").unwrap();

        assert_eq!(
            vec![
                TransactionEvent::Begin(tx.id.clone()),
                TransactionEvent::Commit(tx.id),
                TransactionEvent::Begin(tx2.id.clone()),
                TransactionEvent::Rollback(tx2.id),
            ],
            s.manager.events()
        );

        let err = s.server.commit("t1").unwrap_err();
        assert!(err.get_msg().contains("No transaction found"));
    }

    #[test]
    fn cancel_marks_rollback_only() {
        let s = setup();
        let tx = s.server.begin_request("t1").unwrap();

        assert!(s.server.cancel_transactions("t1", true));
        assert!(s.server.is_rollback_only("t1"));
        // Nothing rolled back yet.
        assert_eq!(1, s.manager.num_open());

        let err = s.server.commit_context(&tx).unwrap_err();
        assert!(err.get_msg().contains("rollback only"));
        assert_eq!(TransactionEvent::Rollback(tx.id), s.manager.events()[1]);
        assert!(s.server.transaction_for_thread("t1").is_none());
    }

    #[test]
    fn request_only_cancel_skips_local() {
        let s = setup();
        s.server.begin("t1").unwrap();
        assert!(!s.server.cancel_transactions("t1", true));
        assert!(s.server.cancel_transactions("t1", false));
    }

    #[test]
    fn request_scope_commit() {
        let s = setup();
        let tx = s.server.begin_request("t1").unwrap();
        assert_eq!(1, s.server.transactions().len());
        s.server.commit_context(&tx).unwrap();
        assert!(s.server.transactions().is_empty());
        assert_eq!(0, s.manager.num_open());
    }

    #[test]
    fn terminate_thread_rolls_back() {
        let s = setup();
        let tx = s.server.begin("t1").unwrap();
        s.server.start("t2", &xid(1), NO_FLAGS, None).unwrap();

        s.server.terminate_thread("t1").unwrap();
        s.server.terminate_thread("t2").unwrap();

        assert_eq!(TransactionEvent::Rollback(tx.id), s.manager.events()[1]);
        let infos = s.server.transactions();
        assert_eq!(1, infos.len());
        assert!(infos[0].rollback_only);
        assert_eq!(None, infos[0].thread);
    }
}
