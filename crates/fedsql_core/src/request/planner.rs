use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fedsql_error::Result;

use super::command::{AnalysisRecord, Command};
use super::context::CommandContext;
use crate::cache::cache_id::ParseInfo;
use crate::dqp::capabilities::CapabilitiesFinder;
use crate::metadata::QueryMetadata;
use crate::processor::ProcessorPlan;

pub trait CommandParser: Debug + Sync + Send {
    fn parse_command(&self, sql: &str, parse_info: &ParseInfo) -> Result<Command>;
}

pub trait CommandResolver: Debug + Sync + Send {
    /// Resolve references in the command against metadata.
    fn resolve_command(&self, command: &mut Command, metadata: &dyn QueryMetadata) -> Result<()>;
}

pub trait CommandRewriter: Debug + Sync + Send {
    fn rewrite(
        &self,
        command: Command,
        metadata: &dyn QueryMetadata,
        context: &CommandContext,
    ) -> Result<Command>;
}

pub trait PlanOptimizer: Debug + Sync + Send {
    fn optimize_plan(
        &self,
        command: &Command,
        metadata: &dyn QueryMetadata,
        ids: &IdGenerator,
        capabilities: &dyn CapabilitiesFinder,
        analysis: &mut AnalysisRecord,
        context: &CommandContext,
    ) -> Result<Box<dyn ProcessorPlan>>;
}

/// Rewriter that leaves commands as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRewriter;

impl CommandRewriter for NoopRewriter {
    fn rewrite(
        &self,
        command: Command,
        _metadata: &dyn QueryMetadata,
        _context: &CommandContext,
    ) -> Result<Command> {
        Ok(command)
    }
}

/// Collaborators that turn command text into a processor plan.
#[derive(Debug, Clone)]
pub struct PlanningServices {
    pub parser: Arc<dyn CommandParser>,
    pub resolver: Arc<dyn CommandResolver>,
    pub rewriter: Arc<dyn CommandRewriter>,
    pub optimizer: Arc<dyn PlanOptimizer>,
}

/// Generates plan node ids unique within a single plan.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicUsize,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Builds plans for commands encountered during execution, e.g. procedure
/// bodies and subqueries.
pub trait QueryProcessorFactory: Debug + Sync + Send {
    fn get_plan(&self, sql: &str, context: &CommandContext) -> Result<Box<dyn ProcessorPlan>>;
}
