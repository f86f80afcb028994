use std::sync::Arc;
use std::task::{Context, Poll};

use fedsql_error::{DbError, Result};
use tracing::trace;

use super::ProcessorPlan;
use crate::arrays::field::{ColumnSchema, Row};
use crate::dqp::data_tier::{DataTierManager, DataTierTupleSource};
use crate::request::context::CommandContext;

/// A command pushed down to a single source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessNode {
    pub node_id: usize,
    pub model: String,
    pub connector_binding: String,
    /// Group being accessed, recorded on the context when opened.
    pub group: Option<String>,
    /// Command in the source's dialect.
    pub command: String,
    pub limit: Option<usize>,
}

/// Plan reading from one or more access nodes.
///
/// Ordered plans read each node to completion before starting the next.
/// Unordered plans read all nodes concurrently, interleaving rows. Row order
/// within a single node is always preserved.
#[derive(Debug)]
pub struct AccessPlan {
    schema: ColumnSchema,
    nodes: Vec<AccessNode>,
    ordered: bool,
    update: bool,
    limit: Option<usize>,
    batch_size: usize,
    exec: Option<AccessExecution>,
}

#[derive(Debug)]
struct AccessExecution {
    context: CommandContext,
    data_manager: Arc<DataTierManager>,
    /// Open sources, None if not yet opened or already finished.
    sources: Vec<Option<DataTierTupleSource>>,
    finished: Vec<bool>,
    /// Current node for ordered plans.
    current: usize,
    rows_emitted: usize,
}

impl AccessExecution {
    fn open_source(&mut self, nodes: &[AccessNode], idx: usize) {
        if self.sources[idx].is_none() && !self.finished[idx] {
            let node = &nodes[idx];
            if let Some(group) = &node.group {
                self.context.add_accessed_object(group);
            }
            self.sources[idx] = Some(self.data_manager.register_request(&self.context, node));
        }
    }

    fn finish_source(&mut self, idx: usize) {
        if let Some(mut source) = self.sources[idx].take() {
            source.close_source();
        }
        self.finished[idx] = true;
    }

    fn all_finished(&self) -> bool {
        self.finished.iter().all(|f| *f)
    }

    fn close_all(&mut self) {
        for idx in 0..self.sources.len() {
            self.finish_source(idx);
        }
    }
}

impl AccessPlan {
    pub fn new(schema: ColumnSchema, nodes: Vec<AccessNode>, batch_size: usize) -> Self {
        AccessPlan {
            schema,
            nodes,
            ordered: false,
            update: false,
            limit: None,
            batch_size: batch_size.max(1),
            exec: None,
        }
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Mark this plan as writing to its sources.
    pub fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    pub fn nodes(&self) -> &[AccessNode] {
        &self.nodes
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn poll_ordered(
        &mut self,
        cx: &mut Context<'_>,
        batch: &mut Vec<Row>,
    ) -> Poll<Result<()>> {
        let exec = match self.exec.as_mut() {
            Some(exec) => exec,
            None => return Poll::Ready(Err(DbError::internal("Access plan not initialized"))),
        };

        while batch.len() < self.batch_size && !exec.all_finished() {
            if self.limit.is_some_and(|l| exec.rows_emitted >= l) {
                exec.close_all();
                break;
            }

            let idx = exec.current;
            exec.open_source(&self.nodes, idx);
            let source = match exec.sources[idx].as_mut() {
                Some(source) => source,
                None => return Poll::Ready(Err(DbError::internal("Missing source for access node"))),
            };

            match source.poll_next_tuple(cx) {
                Poll::Ready(Ok(Some(row))) => {
                    batch.push(row);
                    exec.rows_emitted += 1;
                }
                Poll::Ready(Ok(None)) => {
                    exec.finish_source(idx);
                    exec.current += 1;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        Poll::Ready(Ok(()))
    }

    fn poll_round_robin(
        &mut self,
        cx: &mut Context<'_>,
        batch: &mut Vec<Row>,
    ) -> Poll<Result<()>> {
        let exec = match self.exec.as_mut() {
            Some(exec) => exec,
            None => return Poll::Ready(Err(DbError::internal("Access plan not initialized"))),
        };

        while batch.len() < self.batch_size && !exec.all_finished() {
            let mut progress = false;

            for idx in 0..exec.sources.len() {
                if self.limit.is_some_and(|l| exec.rows_emitted >= l) {
                    exec.close_all();
                    return Poll::Ready(Ok(()));
                }

                let source = match exec.sources[idx].as_mut() {
                    Some(source) => source,
                    None => continue,
                };

                match source.poll_next_tuple(cx) {
                    Poll::Ready(Ok(Some(row))) => {
                        batch.push(row);
                        exec.rows_emitted += 1;
                        progress = true;
                    }
                    Poll::Ready(Ok(None)) => {
                        exec.finish_source(idx);
                        progress = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => (),
                }
            }

            if !progress {
                return Poll::Pending;
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl ProcessorPlan for AccessPlan {
    fn initialize(&mut self, context: &CommandContext, data_manager: &Arc<DataTierManager>) -> Result<()> {
        self.exec = Some(AccessExecution {
            context: context.clone(),
            data_manager: data_manager.clone(),
            sources: (0..self.nodes.len()).map(|_| None).collect(),
            finished: vec![false; self.nodes.len()],
            current: 0,
            rows_emitted: 0,
        });
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        let exec = self
            .exec
            .as_mut()
            .ok_or_else(|| DbError::internal("Access plan not initialized"))?;

        // Ordered plans open nodes as they're reached so a later node never
        // holds a source permit the current node is waiting on.
        let to_open = if self.ordered {
            self.nodes.len().min(1)
        } else {
            self.nodes.len()
        };
        for idx in 0..to_open {
            exec.open_source(&self.nodes, idx);
        }
        trace!(nodes = self.nodes.len(), ordered = self.ordered, "opened access plan");

        Ok(())
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<Row>>>> {
        let mut batch = Vec::with_capacity(self.batch_size);

        let poll = if self.ordered {
            self.poll_ordered(cx, &mut batch)
        } else {
            self.poll_round_robin(cx, &mut batch)
        };

        match poll {
            Poll::Ready(Ok(())) => {
                if batch.is_empty() {
                    Poll::Ready(Ok(None))
                } else {
                    Poll::Ready(Ok(Some(batch)))
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                // Hand back what we have, we'll be polled again after the
                // rows are buffered.
                if batch.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(Ok(Some(batch)))
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(exec) = self.exec.as_mut() {
            exec.close_all();
        }
        Ok(())
    }

    fn output_schema(&self) -> &ColumnSchema {
        &self.schema
    }

    fn clone_plan(&self) -> Box<dyn ProcessorPlan> {
        Box::new(AccessPlan {
            schema: self.schema.clone(),
            nodes: self.nodes.clone(),
            ordered: self.ordered,
            update: self.update,
            limit: self.limit,
            batch_size: self.batch_size,
            exec: None,
        })
    }

    fn apply_row_limit(&mut self, limit: usize) {
        let limit = self.limit.map(|l| l.min(limit)).unwrap_or(limit);
        self.limit = Some(limit);
        for node in &mut self.nodes {
            node.limit = Some(node.limit.map(|l| l.min(limit)).unwrap_or(limit));
        }
    }

    fn requires_transaction(&self, transactional_reads: bool) -> bool {
        if self.nodes.len() < 2 {
            return false;
        }
        self.update || transactional_reads
    }
}
