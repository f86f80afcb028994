use std::sync::Arc;

use fedsql_error::{DbError, DbErrorKind, Result};
use tracing::{debug, trace};

use super::SessionContext;
use super::command::{AnalysisRecord, Command, CommandKind, DataModification};
use super::context::CommandContext;
use super::message::RequestMessage;
use super::planner::{IdGenerator, PlanningServices, QueryProcessorFactory};
use crate::arrays::scalar::ScalarValue;
use crate::cache::access_info::AccessInfo;
use crate::cache::cache_id::{CacheId, ParseInfo};
use crate::cache::prepared_plan::PreparedPlan;
use crate::cache::session_cache::SessionAwareCache;
use crate::dqp::capabilities::ConnectorCapabilitiesFinder;
use crate::dqp::connector::ConnectorManagerRepository;
use crate::metadata::QueryMetadata;
use crate::processor::ProcessorPlan;
use crate::processor::batched::{BatchedCommand, BatchedUpdatePlan};

/// Services shared by every request for planning commands.
#[derive(Debug, Clone)]
pub struct PlanningEnvironment {
    pub services: PlanningServices,
    pub plan_cache: Arc<SessionAwareCache<PreparedPlan>>,
    pub connectors: Arc<dyn ConnectorManagerRepository>,
}

/// Output of processing a request, ready to be executed.
#[derive(Debug)]
pub struct ProcessedRequest {
    pub plan: Box<dyn ProcessorPlan>,
    pub context: CommandContext,
    /// Commands of the request, more than one for batched updates.
    pub commands: Vec<Arc<Command>>,
    pub analysis: AnalysisRecord,
    /// If every command's plan came from the plan cache.
    pub cache_hit: bool,
}

impl ProcessedRequest {
    /// A single query, as opposed to an update or procedure.
    pub fn is_query(&self) -> bool {
        matches!(self.commands.as_slice(), [command] if command.kind == CommandKind::Query)
    }

    pub fn is_update(&self) -> bool {
        self.commands.iter().any(|c| c.kind.is_update())
    }

    pub fn modifications(&self) -> impl Iterator<Item = &DataModification> {
        self.commands.iter().filter_map(|c| c.modification.as_ref())
    }
}

/// Command that has been resolved and authorized but not yet planned.
enum ResolvedCommand {
    Cached(Arc<PreparedPlan>),
    Fresh {
        command: Command,
        cache_id: CacheId,
        /// Modification version before planning started.
        version: u64,
    },
}

impl ResolvedCommand {
    fn command(&self) -> &Command {
        match self {
            Self::Cached(prepared) => prepared.command(),
            Self::Fresh { command, .. } => command,
        }
    }
}

/// A command planned for a single execution.
struct PlannedCommand {
    plan: Box<dyn ProcessorPlan>,
    command: Arc<Command>,
    analysis: AnalysisRecord,
    cache_hit: bool,
}

/// Runs the planning pipeline for single commands of a session.
#[derive(Debug, Clone)]
struct CommandPlanner {
    env: PlanningEnvironment,
    session: SessionContext,
    parse_info: ParseInfo,
    record_annotations: bool,
}

impl CommandPlanner {
    fn metadata(&self) -> &dyn QueryMetadata {
        self.session.metadata.as_ref()
    }

    /// Parse, resolve and authorize the command, or find it in the plan
    /// cache.
    fn resolve(&self, sql: &str) -> Result<ResolvedCommand> {
        let metadata = self.metadata();
        let cache_id = CacheId::new(
            sql,
            self.parse_info,
            self.session.session_id.clone(),
            self.session.user.clone(),
            metadata.vdb().clone(),
        );

        if let Some(prepared) = self.env.plan_cache.get(&cache_id) {
            // Cached plans may be shared with users with different roles.
            self.session
                .validator
                .validate_access(&self.session.user, prepared.command(), metadata)?;
            trace!(%sql, "plan cache hit");
            return Ok(ResolvedCommand::Cached(prepared));
        }

        let version = self.env.plan_cache.modification_tracker().current_version();

        let mut command = self
            .env
            .services
            .parser
            .parse_command(sql, &self.parse_info)?;
        self.env
            .services
            .resolver
            .resolve_command(&mut command, metadata)?;
        check_visibility(&command, metadata)?;
        self.session
            .validator
            .validate_access(&self.session.user, &command, metadata)?;

        Ok(ResolvedCommand::Fresh {
            command,
            cache_id,
            version,
        })
    }

    /// Produce the plan for a resolved command.
    ///
    /// Freshly planned commands are put in the plan cache if `cache_plan` is
    /// set.
    fn finish(
        &self,
        resolved: ResolvedCommand,
        context: &CommandContext,
        cache_plan: bool,
    ) -> Result<PlannedCommand> {
        let planned = match resolved {
            ResolvedCommand::Cached(prepared) => PlannedCommand {
                plan: prepared.plan(),
                command: prepared.command().clone(),
                analysis: prepared.analysis().clone(),
                cache_hit: true,
            },
            ResolvedCommand::Fresh {
                command,
                cache_id,
                version,
            } => {
                let metadata = self.metadata();
                let command = self.env.services.rewriter.rewrite(command, metadata, context)?;

                let mut analysis = AnalysisRecord::new(self.record_annotations);
                let capabilities = ConnectorCapabilitiesFinder::new(
                    self.env.connectors.clone(),
                    self.session.metadata.clone(),
                );
                let plan = self.env.services.optimizer.optimize_plan(
                    &command,
                    metadata,
                    &IdGenerator::new(),
                    &capabilities,
                    &mut analysis,
                    context,
                )?;

                context.set_determinism(command.determinism);
                let command = Arc::new(command);

                if cache_plan {
                    let access = AccessInfo::new(command.accessed_objects(), version);
                    let prepared = PreparedPlan::new(
                        plan.clone_plan(),
                        command.clone(),
                        analysis.clone(),
                        access,
                    );
                    self.env
                        .plan_cache
                        .put(&cache_id, context.determinism(), Arc::new(prepared), None);
                }

                PlannedCommand {
                    plan,
                    command,
                    analysis,
                    cache_hit: false,
                }
            }
        };

        context.set_determinism(planned.command.determinism);
        for object in planned.command.accessed_objects() {
            context.add_accessed_object(object);
        }

        Ok(planned)
    }
}

fn check_visibility(command: &Command, metadata: &dyn QueryMetadata) -> Result<()> {
    for group in &command.groups {
        let visible = metadata
            .group(group)
            .is_some_and(|info| metadata.is_visible(&info.model));
        if !visible {
            return Err(DbError::with_kind(DbErrorKind::Resolve, "Group does not exist")
                .with_field("group", group));
        }
    }

    for procedure in &command.procedures {
        let visible = metadata
            .procedure(procedure)
            .is_some_and(|info| metadata.is_visible(&info.model));
        if !visible {
            return Err(DbError::with_kind(DbErrorKind::Resolve, "Procedure does not exist")
                .with_field("procedure", procedure));
        }
    }

    Ok(())
}

/// Check and convert parameter values to the types the command expects.
pub fn bind_parameters(command: &Command, values: &[ScalarValue]) -> Result<Vec<ScalarValue>> {
    let expected = command.parameter_count();
    if values.len() != expected {
        return Err(DbError::new(format!(
            "Expected {expected} parameter values but got {}",
            values.len()
        ))
        .with_field("expected", expected)
        .with_field("got", values.len()));
    }

    command
        .parameter_types
        .iter()
        .zip(values)
        .enumerate()
        .map(|(idx, (datatype, value))| {
            value.try_cast(*datatype).map_err(|_| {
                let index = idx + 1;
                DbError::new(format!(
                    "Error converting parameter number {index} with value '{value}' to expected type {datatype}"
                ))
                .with_field("index", index)
                .with_field("value", value)
            })
        })
        .collect()
}

fn require_update(command: &Command) -> Result<()> {
    if !command.kind.is_update() {
        return Err(DbError::new("Only update commands may be batched")
            .with_field("kind", command.kind));
    }
    Ok(())
}

/// Builds plans for commands encountered during execution using the same
/// pipeline as the request that created it.
#[derive(Debug)]
pub struct PlanFactory {
    planner: CommandPlanner,
}

impl QueryProcessorFactory for PlanFactory {
    fn get_plan(&self, sql: &str, context: &CommandContext) -> Result<Box<dyn ProcessorPlan>> {
        let resolved = self.planner.resolve(sql)?;
        let planned = self.planner.finish(resolved, context, true)?;
        Ok(planned.plan)
    }
}

/// Processes plain statements and batches of statements.
#[derive(Debug)]
pub struct Request<'a> {
    planner: CommandPlanner,
    message: &'a RequestMessage,
    context: CommandContext,
}

impl<'a> Request<'a> {
    pub fn new(
        env: &PlanningEnvironment,
        session: &SessionContext,
        message: &'a RequestMessage,
        mut context: CommandContext,
    ) -> Self {
        let planner = CommandPlanner {
            env: env.clone(),
            session: session.clone(),
            parse_info: message.parse_info,
            record_annotations: message.record_annotations,
        };
        context.set_partial_results(message.partial_results);
        context.set_factory(Arc::new(PlanFactory {
            planner: planner.clone(),
        }));

        Request {
            planner,
            message,
            context,
        }
    }

    /// Row limited plans are specific to the request and aren't cached.
    fn cache_plans(&self) -> bool {
        self.message.row_limit.is_none()
    }

    fn apply_row_limit(&self, plan: &mut dyn ProcessorPlan) {
        if let Some(limit) = self.message.row_limit {
            plan.apply_row_limit(limit);
        }
    }

    pub fn process_request(self) -> Result<ProcessedRequest> {
        if !self.message.batched_commands.is_empty() {
            return self.process_batched_statements();
        }

        let resolved = self.planner.resolve(&self.message.sql)?;
        let mut planned = self
            .planner
            .finish(resolved, &self.context, self.cache_plans())?;
        self.apply_row_limit(planned.plan.as_mut());

        debug!(
            request = %self.context.request_id(),
            cache_hit = planned.cache_hit,
            "processed request"
        );

        Ok(ProcessedRequest {
            plan: planned.plan,
            context: self.context,
            commands: vec![planned.command],
            analysis: planned.analysis,
            cache_hit: planned.cache_hit,
        })
    }

    fn process_batched_statements(self) -> Result<ProcessedRequest> {
        let statements = std::iter::once(&self.message.sql).chain(&self.message.batched_commands);

        let mut batch = Vec::new();
        let mut commands = Vec::new();
        let mut analysis = AnalysisRecord::new(self.message.record_annotations);
        let mut cache_hit = true;

        for sql in statements {
            let resolved = self.planner.resolve(sql)?;
            require_update(resolved.command())?;
            let planned = self.planner.finish(resolved, &self.context, true)?;

            cache_hit &= planned.cache_hit;
            analysis.annotations.extend(planned.analysis.annotations);
            commands.push(planned.command);
            batch.push(BatchedCommand {
                plan: planned.plan,
                parameters: Vec::new(),
            });
        }

        debug!(
            request = %self.context.request_id(),
            commands = batch.len(),
            "processed batched statements"
        );

        Ok(ProcessedRequest {
            plan: Box::new(BatchedUpdatePlan::new(batch)),
            context: self.context,
            commands,
            analysis,
            cache_hit,
        })
    }
}

/// Processes prepared and callable statements, binding parameter values.
#[derive(Debug)]
pub struct PreparedStatementRequest<'a> {
    request: Request<'a>,
}

impl<'a> PreparedStatementRequest<'a> {
    pub fn new(
        env: &PlanningEnvironment,
        session: &SessionContext,
        message: &'a RequestMessage,
        context: CommandContext,
    ) -> Self {
        PreparedStatementRequest {
            request: Request::new(env, session, message, context),
        }
    }

    pub fn process_request(self) -> Result<ProcessedRequest> {
        let Request {
            planner,
            message,
            mut context,
        } = self.request;

        let resolved = planner.resolve(&message.sql)?;

        if let Some(sets) = &message.batched_parameter_values {
            require_update(resolved.command())?;
            let bound = sets
                .iter()
                .map(|values| bind_parameters(resolved.command(), values))
                .collect::<Result<Vec<_>>>()?;

            let planned = planner.finish(resolved, &context, true)?;
            let batch = bound
                .into_iter()
                .map(|parameters| BatchedCommand {
                    plan: planned.plan.clone_plan(),
                    parameters,
                })
                .collect();

            debug!(request = %context.request_id(), sets = sets.len(), "processed batched prepared statement");

            return Ok(ProcessedRequest {
                plan: Box::new(BatchedUpdatePlan::new(batch)),
                context,
                commands: vec![planned.command],
                analysis: planned.analysis,
                cache_hit: planned.cache_hit,
            });
        }

        let bound = bind_parameters(resolved.command(), &message.parameter_values)?;
        context.set_parameters(bound);

        let mut planned = planner.finish(resolved, &context, message.row_limit.is_none())?;
        if let Some(limit) = message.row_limit {
            planned.plan.apply_row_limit(limit);
        }

        debug!(
            request = %context.request_id(),
            cache_hit = planned.cache_hit,
            "processed prepared statement"
        );

        Ok(ProcessedRequest {
            plan: planned.plan,
            context,
            commands: vec![planned.command],
            analysis: planned.analysis,
            cache_hit: planned.cache_hit,
        })
    }
}

/// Process a request with the pipeline for its statement type.
pub fn process_request(
    env: &PlanningEnvironment,
    session: &SessionContext,
    message: &RequestMessage,
    context: CommandContext,
) -> Result<ProcessedRequest> {
    if message.is_prepared() {
        PreparedStatementRequest::new(env, session, message, context).process_request()
    } else {
        Request::new(env, session, message, context).process_request()
    }
}
