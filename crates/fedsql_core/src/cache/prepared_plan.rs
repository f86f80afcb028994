use std::sync::Arc;

use fedsql_error::Result;

use super::access_info::AccessInfo;
use super::cachable::Cachable;
use super::results_store::ResultsStore;
use crate::buffer::buffer_manager::BufferManager;
use crate::processor::ProcessorPlan;
use crate::request::command::{AnalysisRecord, Command};

/// A planned command held in the plan cache.
///
/// The plan is a template. Every execution gets its own copy through
/// [`PreparedPlan::plan`].
#[derive(Debug)]
pub struct PreparedPlan {
    plan: Box<dyn ProcessorPlan>,
    command: Arc<Command>,
    analysis: AnalysisRecord,
    access_info: AccessInfo,
}

impl PreparedPlan {
    pub fn new(
        plan: Box<dyn ProcessorPlan>,
        command: Arc<Command>,
        analysis: AnalysisRecord,
        access_info: AccessInfo,
    ) -> Self {
        PreparedPlan {
            plan,
            command,
            analysis,
            access_info,
        }
    }

    /// Fresh copy of the plan ready to be initialized.
    pub fn plan(&self) -> Box<dyn ProcessorPlan> {
        self.plan.clone_plan()
    }

    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    pub fn analysis(&self) -> &AnalysisRecord {
        &self.analysis
    }
}

impl Cachable for PreparedPlan {
    // Plans hold no buffers, sharing them across sessions only needs the
    // reference.
    fn prepare(&self, _store: &dyn ResultsStore, _buffers: &Arc<BufferManager>) -> Result<()> {
        Ok(())
    }

    fn restore(&self, _store: &dyn ResultsStore, _buffers: &Arc<BufferManager>) -> Result<()> {
        Ok(())
    }

    fn access_info(&self) -> &AccessInfo {
        &self.access_info
    }

    fn data_dependent(&self) -> bool {
        false
    }
}
