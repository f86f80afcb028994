//! Fake planning collaborators and connectors for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use fedsql_error::{DbError, DbErrorKind, OptionExt, Result};
use futures::FutureExt;

use crate::arrays::datatype::DataType;
use crate::arrays::field::{ColumnSchema, Field, Row};
use crate::arrays::scalar::ScalarValue;
use crate::buffer::buffer_manager::BufferManager;
use crate::buffer::storage::MemoryStorageManager;
use crate::cache::Determinism;
use crate::cache::access_info::ModificationTracker;
use crate::cache::cache_id::ParseInfo;
use crate::cache::results_store::MemoryResultsStore;
use crate::cache::session_cache::SessionAwareCache;
use crate::config::engine::EngineConfig;
use crate::dqp::AtomicRequestMessage;
use crate::dqp::capabilities::CapabilitiesFinder;
use crate::dqp::connector::{
    ConnectorExecution,
    ConnectorManager,
    ConnectorManagers,
    SourceCapabilities,
};
use crate::engine::future::ResultsFuture;
use crate::engine::{Engine, EngineDependencies};
use crate::metadata::{QueryMetadata, Vdb, VdbMetadata};
use crate::processor::ProcessorPlan;
use crate::processor::access::{AccessNode, AccessPlan};
use crate::request::SessionContext;
use crate::request::command::{AnalysisRecord, Command, CommandKind, DataModification};
use crate::request::context::CommandContext;
use crate::request::message::{RequestMessage, ResultsMessage};
use crate::request::planner::{
    CommandParser,
    CommandResolver,
    IdGenerator,
    NoopRewriter,
    PlanOptimizer,
    PlanningServices,
};
use crate::request::request::PlanningEnvironment;
use crate::request::request_id::RequestId;
use crate::runtime::pool::QueuedWorkPool;
use crate::transaction::recording::{RecordingTransactionManager, RecordingXaTerminator};

pub fn int_schema() -> ColumnSchema {
    ColumnSchema::new([
        Field::new("e1", DataType::Int32, true),
        Field::new("e2", DataType::Utf8, true),
    ])
}

/// Rows `[i, "v{i}"]` for i in 1..=n.
pub fn int_rows(n: usize) -> Vec<Row> {
    (1..=n)
        .map(|i| vec![ScalarValue::Int32(i as i32), ScalarValue::Utf8(format!("v{i}"))])
        .collect()
}

pub fn lob_schema() -> ColumnSchema {
    ColumnSchema::new([
        Field::new("id", DataType::Int32, false),
        Field::new("doc", DataType::Lob, true),
    ])
}

/// VDB with a visible model `pm1` bound to `source1`, and a hidden model.
pub fn test_vdb() -> Vdb {
    Vdb::new("vdb", 1)
        .with_model("pm1", true, Some("source1"))
        .with_model("hidden", false, Some("source1"))
        .with_group("pm1", "g1", int_schema())
        .with_group("pm1", "g2", int_schema())
        .with_group("pm1", "big", int_schema())
        .with_group("pm1", "docs", lob_schema())
        .with_group("hidden", "g1", int_schema())
        .with_procedure("pm1", "sp1", vec![DataType::Int32], int_schema())
}

/// Parses just enough SQL to know which objects a command touches.
///
/// Each `?` is an Int32 parameter. `rand()` makes a command session
/// deterministic, `user()` user deterministic.
#[derive(Debug, Default)]
pub struct FakeParser;

const CLAUSE_KEYWORDS: &[&str] = &["where", "order", "group", "limit", "set", "values"];

fn object_name(token: &str) -> String {
    token
        .split('(')
        .next()
        .unwrap_or(token)
        .trim_matches(|c: char| c == ',' || c == ';')
        .to_string()
}

fn from_list<'a>(tokens: impl Iterator<Item = &'a str>) -> Vec<String> {
    tokens
        .take_while(|t| !CLAUSE_KEYWORDS.contains(t))
        .flat_map(|t| t.split(','))
        .filter(|t| !t.is_empty())
        .map(object_name)
        .collect()
}

impl CommandParser for FakeParser {
    fn parse_command(&self, sql: &str, _parse_info: &ParseInfo) -> Result<Command> {
        let lower = sql.trim().to_lowercase();
        let tokens: Vec<&str> = lower.split_whitespace().collect();
        let parse_err = || DbError::with_kind(DbErrorKind::Parse, "Parsing error").with_field("sql", sql);

        let (kind, groups, procedures) = match tokens.as_slice() {
            ["select", rest @ ..] => {
                let from = rest.iter().position(|t| *t == "from").ok_or_else(parse_err)?;
                let groups = from_list(rest[from + 1..].iter().copied());
                if groups.is_empty() {
                    return Err(parse_err());
                }
                (CommandKind::Query, groups, Vec::new())
            }
            ["insert", "into", group, ..] => (CommandKind::Insert, vec![object_name(group)], Vec::new()),
            ["update", group, ..] => (CommandKind::Update, vec![object_name(group)], Vec::new()),
            ["delete", "from", group, ..] => (CommandKind::Delete, vec![object_name(group)], Vec::new()),
            ["exec", procedure, ..] => (CommandKind::Procedure, Vec::new(), vec![object_name(procedure)]),
            _ => return Err(parse_err()),
        };

        let mut command = Command::new(sql, kind);
        command.modification = match kind {
            CommandKind::Insert | CommandKind::Update => Some(DataModification {
                group: groups[0].clone(),
                major: false,
            }),
            // Deleting everything is treated as a structural change.
            CommandKind::Delete => Some(DataModification {
                group: groups[0].clone(),
                major: !tokens.contains(&"where"),
            }),
            _ => None,
        };
        command.groups = groups;
        command.procedures = procedures;
        command.parameter_types = vec![DataType::Int32; lower.matches('?').count()];
        if lower.contains("rand()") {
            command.determinism = Determinism::Session;
        } else if lower.contains("user()") {
            command.determinism = Determinism::User;
        }

        Ok(command)
    }
}

#[derive(Debug, Default)]
pub struct FakeResolver;

impl CommandResolver for FakeResolver {
    fn resolve_command(&self, command: &mut Command, metadata: &dyn QueryMetadata) -> Result<()> {
        for group in &command.groups {
            if metadata.group(group).is_none() {
                return Err(DbError::with_kind(DbErrorKind::Resolve, "Group does not exist")
                    .with_field("group", group));
            }
        }
        for procedure in &command.procedures {
            if metadata.procedure(procedure).is_none() {
                return Err(DbError::with_kind(DbErrorKind::Resolve, "Procedure does not exist")
                    .with_field("procedure", procedure));
            }
        }
        command.resolved = true;
        Ok(())
    }
}

/// Plans one access node per group or procedure.
#[derive(Debug)]
pub struct FakeOptimizer {
    batch_size: usize,
}

impl FakeOptimizer {
    pub fn new(batch_size: usize) -> Self {
        FakeOptimizer { batch_size }
    }
}

impl PlanOptimizer for FakeOptimizer {
    fn optimize_plan(
        &self,
        command: &Command,
        metadata: &dyn QueryMetadata,
        ids: &IdGenerator,
        capabilities: &dyn CapabilitiesFinder,
        analysis: &mut AnalysisRecord,
        _context: &CommandContext,
    ) -> Result<Box<dyn ProcessorPlan>> {
        let mut nodes = Vec::new();
        let mut schema = None;

        for group in &command.groups {
            let info = metadata.group(group).required("group")?;
            let source_command = if command.kind == CommandKind::Query {
                format!("select * from {group}")
            } else {
                command.sql.clone()
            };
            schema.get_or_insert_with(|| info.schema.clone());
            nodes.push((info.model.clone(), Some(group.clone()), source_command));
        }
        for procedure in &command.procedures {
            let info = metadata.procedure(procedure).required("procedure")?;
            schema.get_or_insert_with(|| info.result.clone());
            nodes.push((info.model.clone(), None, format!("exec {procedure}")));
        }

        let nodes = nodes
            .into_iter()
            .map(|(model, group, source_command)| {
                let caps = capabilities.find_capabilities(&model)?;
                let binding = metadata.source_binding(&model).required("source binding")?;
                analysis.add_annotation(
                    "access",
                    format!("{model} via {binding}, order by pushdown: {}", caps.supports_order_by),
                );
                Ok(AccessNode {
                    node_id: ids.next_id(),
                    model,
                    connector_binding: binding.to_string(),
                    group,
                    command: source_command,
                    limit: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let schema = if command.kind.is_update() {
            ColumnSchema::update_count()
        } else {
            schema.required("output schema")?
        };

        let plan = AccessPlan::new(schema, nodes, self.batch_size)
            .with_ordered(command.sql.to_lowercase().contains("order by"))
            .with_update(command.kind.is_update());

        Ok(Box::new(plan))
    }
}

pub fn planning_services(batch_size: usize) -> PlanningServices {
    PlanningServices {
        parser: Arc::new(FakeParser),
        resolver: Arc::new(FakeResolver),
        rewriter: Arc::new(NoopRewriter),
        optimizer: Arc::new(FakeOptimizer::new(batch_size)),
    }
}

#[derive(Debug, Default)]
pub struct ConnectorStats {
    pub registered: AtomicUsize,
    pub canceled: AtomicUsize,
    pub closed: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

/// In-memory connector serving fixed tables.
///
/// A command reads the first table named by one of its tokens. Insert,
/// update and delete commands return a single update count row equal to the
/// number of rows in the table.
#[derive(Debug)]
pub struct FakeConnector {
    binding: String,
    tables: HashMap<String, Vec<Row>>,
    pending_between_rows: bool,
    failure_after: Option<usize>,
    stats: Arc<ConnectorStats>,
}

impl FakeConnector {
    pub fn new(binding: &str) -> Self {
        FakeConnector {
            binding: binding.to_string(),
            tables: HashMap::new(),
            pending_between_rows: false,
            failure_after: None,
            stats: Arc::new(ConnectorStats::default()),
        }
    }

    pub fn with_table(mut self, name: &str, rows: Vec<Row>) -> Self {
        self.tables.insert(name.to_lowercase(), rows);
        self
    }

    /// Return pending before every row, waking immediately.
    pub fn with_pending_between_rows(mut self) -> Self {
        self.pending_between_rows = true;
        self
    }

    /// Fail after producing `n` rows.
    pub fn with_failure_after(mut self, n: usize) -> Self {
        self.failure_after = Some(n);
        self
    }

    pub fn stats(&self) -> &ConnectorStats {
        &self.stats
    }
}

impl ConnectorManager for FakeConnector {
    fn binding_name(&self) -> &str {
        &self.binding
    }

    fn register_request(&self, message: &AtomicRequestMessage) -> Result<Box<dyn ConnectorExecution>> {
        let command = message.command.to_lowercase();
        let rows = command
            .split_whitespace()
            .find_map(|token| self.tables.get(&object_name(token)))
            .ok_or_else(|| {
                DbError::component("Table not found").with_field("command", &message.command)
            })?;

        let is_update = ["insert", "update", "delete"]
            .iter()
            .any(|kw| command.starts_with(kw));
        let rows: VecDeque<Row> = if is_update {
            VecDeque::from([vec![ScalarValue::Int64(rows.len() as i64)]])
        } else {
            rows.iter().cloned().collect()
        };

        self.stats.registered.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(FakeExecution {
            rows,
            pending_between_rows: self.pending_between_rows,
            pend_next: self.pending_between_rows,
            failure_after: self.failure_after,
            produced: 0,
            stats: self.stats.clone(),
        }))
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }
}

#[derive(Debug)]
struct FakeExecution {
    rows: VecDeque<Row>,
    pending_between_rows: bool,
    pend_next: bool,
    failure_after: Option<usize>,
    produced: usize,
    stats: Arc<ConnectorStats>,
}

impl ConnectorExecution for FakeExecution {
    fn poll_next_row(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>>> {
        if self.pend_next {
            self.pend_next = false;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.pend_next = self.pending_between_rows;

        if self.failure_after == Some(self.produced) {
            return Poll::Ready(Err(DbError::component("Source failure")));
        }

        match self.rows.pop_front() {
            Some(row) => {
                self.produced += 1;
                Poll::Ready(Ok(Some(row)))
            }
            None => Poll::Ready(Ok(None)),
        }
    }

    fn cancel(&mut self) -> Result<()> {
        self.stats.canceled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Planning environment over the test VDB, without an engine.
#[derive(Debug)]
pub struct TestPlanning {
    pub env: PlanningEnvironment,
    pub metadata: Arc<VdbMetadata>,
}

impl TestPlanning {
    pub fn new() -> Self {
        Self::with_vdb(test_vdb())
    }

    pub fn with_vdb(vdb: Vdb) -> Self {
        let buffers = Arc::new(BufferManager::new(16, 64, Arc::new(MemoryStorageManager::new())));
        let plan_cache = SessionAwareCache::new(
            "plans",
            64,
            Arc::new(MemoryResultsStore::new()),
            buffers,
            Arc::new(ModificationTracker::new()),
        );
        let connectors = Arc::new(ConnectorManagers::new());
        connectors.add(Arc::new(FakeConnector::new("source1").with_table("pm1.g1", int_rows(5))));

        TestPlanning {
            env: PlanningEnvironment {
                services: planning_services(16),
                plan_cache: Arc::new(plan_cache),
                connectors,
            },
            metadata: Arc::new(VdbMetadata::new(vdb)),
        }
    }

    pub fn session(&self, session_id: &str, user: &str) -> SessionContext {
        SessionContext::new(session_id, user, self.metadata.clone())
    }
}

/// Config with small batches so that tests exercise batching and pausing.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        batch_size: 10,
        connector_queue_size: 8,
        batches_per_process: 2,
        max_buffered_rows: 20,
        lob_chunk_size: 4,
        ..EngineConfig::default()
    }
}

/// Engine driven by a queued pool over the test VDB.
#[derive(Debug)]
pub struct TestEngine {
    pub engine: Engine,
    pub pool: Arc<QueuedWorkPool>,
    pub connector: Arc<FakeConnector>,
    pub transactions: Arc<RecordingTransactionManager>,
    pub xa: Arc<RecordingXaTerminator>,
    pub metadata: Arc<VdbMetadata>,
}

impl TestEngine {
    pub fn new(connector: FakeConnector) -> Self {
        Self::with_config(connector, small_config())
    }

    pub fn with_config(connector: FakeConnector, config: EngineConfig) -> Self {
        logutil::init_test();

        let connector = Arc::new(connector);
        let connectors = Arc::new(ConnectorManagers::new());
        connectors.add(connector.clone());

        let pool = Arc::new(QueuedWorkPool::new());
        let transactions = Arc::new(RecordingTransactionManager::new());
        let xa = Arc::new(RecordingXaTerminator::new());

        let engine = Engine::try_new(
            config.clone(),
            EngineDependencies {
                planning: planning_services(config.batch_size),
                connectors,
                transaction_manager: transactions.clone(),
                xa_terminator: xa.clone(),
                results_store: Arc::new(MemoryResultsStore::new()),
                pool: pool.clone(),
            },
        )
        .unwrap();

        TestEngine {
            engine,
            pool,
            connector,
            transactions,
            xa,
            metadata: Arc::new(VdbMetadata::new(test_vdb())),
        }
    }

    pub fn session(&self, session_id: &str, user: &str) -> SessionContext {
        SessionContext::new(session_id, user, self.metadata.clone())
    }

    /// Run the pool until the future resolves.
    pub fn wait<T>(&self, mut future: ResultsFuture<T>) -> Result<T> {
        loop {
            if let Some(result) = (&mut future).now_or_never() {
                return result;
            }
            assert!(self.pool.run_until_idle() > 0, "future pending with nothing to run");
        }
    }

    pub fn execute(&self, session: &SessionContext, message: RequestMessage) -> Result<(RequestId, ResultsMessage)> {
        let (id, future) = self.engine.execute_request(session, message)?;
        let results = self.wait(future)?;
        Ok((id, results))
    }

    pub fn fetch(&self, id: &RequestId, begin_row: usize, fetch_size: usize) -> Result<ResultsMessage> {
        let future = self.engine.process_cursor_request(id, begin_row, fetch_size)?;
        self.wait(future)
    }
}
