use crate::arrays::field::{ColumnSchema, Row};
use crate::arrays::scalar::ScalarValue;
use crate::cache::cache_id::ParseInfo;
use crate::config::engine::DEFAULT_BATCH_SIZE;
use crate::dqp::SourceWarning;
use crate::request::request_id::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementType {
    #[default]
    Statement,
    Prepared,
    Callable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    #[default]
    ForwardOnly,
    Scrollable,
}

/// When to wrap a request in its own transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionAutoWrap {
    Off,
    On,
    /// Only if the plan needs one, e.g. it writes to more than one source.
    #[default]
    Detect,
}

/// A request submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub sql: String,
    pub statement_type: StatementType,
    /// Positional parameter values for prepared and callable statements.
    pub parameter_values: Vec<ScalarValue>,
    /// Parameter sets for a batched prepared update. Takes precedence over
    /// `parameter_values` when set.
    pub batched_parameter_values: Option<Vec<Vec<ScalarValue>>>,
    /// Additional commands for a batched statement update. `sql` is the first
    /// command of the batch.
    pub batched_commands: Vec<String>,
    pub row_limit: Option<usize>,
    pub fetch_size: usize,
    pub cursor_type: CursorType,
    pub partial_results: bool,
    pub use_result_set_cache: bool,
    pub auto_wrap: TransactionAutoWrap,
    pub parse_info: ParseInfo,
    pub record_annotations: bool,
}

impl RequestMessage {
    pub fn new(sql: impl Into<String>) -> Self {
        RequestMessage {
            sql: sql.into(),
            statement_type: StatementType::Statement,
            parameter_values: Vec::new(),
            batched_parameter_values: None,
            batched_commands: Vec::new(),
            row_limit: None,
            fetch_size: DEFAULT_BATCH_SIZE,
            cursor_type: CursorType::ForwardOnly,
            partial_results: false,
            use_result_set_cache: false,
            auto_wrap: TransactionAutoWrap::Detect,
            parse_info: ParseInfo::default(),
            record_annotations: false,
        }
    }

    pub fn prepared(sql: impl Into<String>, parameter_values: Vec<ScalarValue>) -> Self {
        RequestMessage {
            statement_type: StatementType::Prepared,
            parameter_values,
            ..Self::new(sql)
        }
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    pub fn with_cursor_type(mut self, cursor_type: CursorType) -> Self {
        self.cursor_type = cursor_type;
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn with_partial_results(mut self, partial: bool) -> Self {
        self.partial_results = partial;
        self
    }

    pub fn with_result_set_cache(mut self, use_cache: bool) -> Self {
        self.use_result_set_cache = use_cache;
        self
    }

    pub fn with_auto_wrap(mut self, auto_wrap: TransactionAutoWrap) -> Self {
        self.auto_wrap = auto_wrap;
        self
    }

    pub fn is_prepared(&self) -> bool {
        self.statement_type != StatementType::Statement
    }

    pub fn is_batched_update(&self) -> bool {
        self.batched_parameter_values.is_some() || !self.batched_commands.is_empty()
    }
}

/// A window of results sent back to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsMessage {
    pub request_id: RequestId,
    pub schema: ColumnSchema,
    pub rows: Vec<Row>,
    /// 1-based row number of the first row in this window.
    pub first_row: usize,
    /// Row number of the last row, one less than `first_row` if the window is
    /// empty.
    pub last_row: usize,
    /// Total number of rows, set once all rows have been produced.
    pub final_row: Option<usize>,
    pub warnings: Vec<SourceWarning>,
    /// Whether the rows came from the result set cache.
    pub from_cache: bool,
}

impl ResultsMessage {
    /// If this window contains the last row of the results.
    pub fn is_last_window(&self) -> bool {
        self.final_row.is_some_and(|f| self.last_row >= f)
    }

    /// Update count of a single update command.
    pub fn update_count(&self) -> Option<i64> {
        match self.rows.first()?.first()? {
            ScalarValue::Int64(v) => Some(*v),
            ScalarValue::Int32(v) => Some(*v as i64),
            _ => None,
        }
    }
}

/// A chunk of a large object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobChunk {
    pub data: bytes::Bytes,
    pub last: bool,
}
