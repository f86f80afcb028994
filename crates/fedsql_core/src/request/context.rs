use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::planner::QueryProcessorFactory;
use super::request_id::RequestId;
use crate::arrays::scalar::ScalarValue;
use crate::cache::Determinism;
use crate::dqp::registry::AtomicRequestRegistry;
use crate::metadata::VdbKey;
use crate::transaction::TransactionSnapshot;

/// Per-execution state handed to plans.
///
/// Cloning shares the accessed object set and determinism with the original
/// since both belong to the same execution. Use [`CommandContext::isolated`]
/// for a sub-evaluation that shouldn't affect the parent.
#[derive(Clone)]
pub struct CommandContext {
    request_id: RequestId,
    vdb: VdbKey,
    session_id: String,
    user: String,
    transaction: Option<TransactionSnapshot>,
    parameters: Arc<[ScalarValue]>,
    partial_results: bool,
    shared: Arc<Mutex<SharedExecutionState>>,
    registry: Arc<AtomicRequestRegistry>,
    factory: Option<Arc<dyn QueryProcessorFactory>>,
}

#[derive(Debug, Clone)]
struct SharedExecutionState {
    accessed: BTreeSet<String>,
    determinism: Determinism,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("request_id", &self.request_id)
            .field("vdb", &self.vdb)
            .field("session_id", &self.session_id)
            .field("user", &self.user)
            .field("transaction", &self.transaction)
            .field("parameters", &self.parameters)
            .field("partial_results", &self.partial_results)
            .finish_non_exhaustive()
    }
}

impl CommandContext {
    pub fn new(
        request_id: RequestId,
        vdb: VdbKey,
        user: impl Into<String>,
        registry: Arc<AtomicRequestRegistry>,
    ) -> Self {
        CommandContext {
            session_id: request_id.session_id.clone(),
            request_id,
            vdb,
            user: user.into(),
            transaction: None,
            parameters: Arc::new([]),
            partial_results: false,
            shared: Arc::new(Mutex::new(SharedExecutionState {
                accessed: BTreeSet::new(),
                determinism: Determinism::Deterministic,
            })),
            registry,
            factory: None,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn vdb(&self) -> &VdbKey {
        &self.vdb
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn transaction(&self) -> Option<&TransactionSnapshot> {
        self.transaction.as_ref()
    }

    pub fn set_transaction(&mut self, transaction: Option<TransactionSnapshot>) {
        self.transaction = transaction;
    }

    pub fn parameters(&self) -> &[ScalarValue] {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: Vec<ScalarValue>) {
        self.parameters = parameters.into();
    }

    /// Clone of this context with different parameter values.
    pub fn with_parameters(&self, parameters: Vec<ScalarValue>) -> Self {
        let mut ctx = self.clone();
        ctx.set_parameters(parameters);
        ctx
    }

    pub fn partial_results(&self) -> bool {
        self.partial_results
    }

    pub fn set_partial_results(&mut self, partial: bool) {
        self.partial_results = partial;
    }

    pub fn registry(&self) -> &Arc<AtomicRequestRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> Option<&Arc<dyn QueryProcessorFactory>> {
        self.factory.as_ref()
    }

    pub fn set_factory(&mut self, factory: Arc<dyn QueryProcessorFactory>) {
        self.factory = Some(factory);
    }

    /// Record that an object was accessed during this execution.
    pub fn add_accessed_object(&self, name: &str) {
        self.shared.lock().accessed.insert(name.to_lowercase());
    }

    pub fn accessed_objects(&self) -> Vec<String> {
        self.shared.lock().accessed.iter().cloned().collect()
    }

    /// Narrow the determinism of this execution. Never widens.
    pub fn set_determinism(&self, determinism: Determinism) {
        let mut shared = self.shared.lock();
        shared.determinism = shared.determinism.min(determinism);
    }

    pub fn determinism(&self) -> Determinism {
        self.shared.lock().determinism
    }

    /// Deep copy that doesn't share execution state with this context.
    pub fn isolated(&self) -> Self {
        let mut ctx = self.clone();
        let state = self.shared.lock().clone();
        ctx.shared = Arc::new(Mutex::new(state));
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CommandContext {
        let id = RequestId::new("s1", 1);
        CommandContext::new(
            id.clone(),
            VdbKey::new("vdb", 1),
            "user",
            Arc::new(AtomicRequestRegistry::new(id, 4)),
        )
    }

    #[test]
    fn clone_shares_accessed_objects() {
        let ctx = context();
        let clone = ctx.clone();
        clone.add_accessed_object("PM1.G1");
        assert_eq!(vec!["pm1.g1".to_string()], ctx.accessed_objects());
    }

    #[test]
    fn isolated_does_not_share() {
        let ctx = context();
        ctx.add_accessed_object("pm1.g1");
        let isolated = ctx.isolated();
        isolated.add_accessed_object("pm1.g2");
        isolated.set_determinism(Determinism::Session);

        assert_eq!(1, ctx.accessed_objects().len());
        assert_eq!(2, isolated.accessed_objects().len());
        assert_eq!(Determinism::Deterministic, ctx.determinism());
    }

    #[test]
    fn determinism_only_narrows() {
        let ctx = context();
        ctx.set_determinism(Determinism::User);
        ctx.set_determinism(Determinism::Vdb);
        assert_eq!(Determinism::User, ctx.determinism());
    }
}
