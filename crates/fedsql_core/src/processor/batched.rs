use std::sync::Arc;
use std::task::{Context, Poll};

use fedsql_error::{DbError, Result};

use super::ProcessorPlan;
use crate::arrays::field::{ColumnSchema, Row};
use crate::arrays::scalar::ScalarValue;
use crate::dqp::data_tier::DataTierManager;
use crate::request::context::CommandContext;

/// A single command of a batch along with the parameter values bound to it.
#[derive(Debug)]
pub struct BatchedCommand {
    pub plan: Box<dyn ProcessorPlan>,
    pub parameters: Vec<ScalarValue>,
}

/// Executes a list of update commands one after another, producing a single
/// update count row per command.
#[derive(Debug)]
pub struct BatchedUpdatePlan {
    commands: Vec<BatchedCommand>,
    schema: ColumnSchema,
    current: usize,
    current_count: i64,
    current_opened: bool,
}

impl BatchedUpdatePlan {
    pub fn new(commands: Vec<BatchedCommand>) -> Self {
        BatchedUpdatePlan {
            commands,
            schema: ColumnSchema::update_count(),
            current: 0,
            current_count: 0,
            current_opened: false,
        }
    }

    pub fn num_commands(&self) -> usize {
        self.commands.len()
    }
}

impl ProcessorPlan for BatchedUpdatePlan {
    fn initialize(&mut self, context: &CommandContext, data_manager: &Arc<DataTierManager>) -> Result<()> {
        for command in &mut self.commands {
            // Each command sees its own parameter values but shares the
            // request's registry and transaction.
            let context = context.with_parameters(command.parameters.clone());
            command.plan.initialize(&context, data_manager)?;
        }
        self.current = 0;
        self.current_count = 0;
        self.current_opened = false;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        // Commands are opened as they're reached.
        Ok(())
    }

    fn poll_next_batch(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<Row>>>> {
        loop {
            let command = match self.commands.get_mut(self.current) {
                Some(command) => command,
                None => return Poll::Ready(Ok(None)),
            };

            if !self.current_opened {
                if let Err(e) = command.plan.open() {
                    return Poll::Ready(Err(e));
                }
                self.current_opened = true;
            }

            match command.plan.poll_next_batch(cx) {
                Poll::Ready(Ok(Some(rows))) => {
                    for row in rows {
                        let count = match row.first() {
                            Some(value) => value.try_as_i64(),
                            None => Err(DbError::internal("Update command did not produce an update count")),
                        };
                        match count {
                            Ok(count) => self.current_count += count,
                            Err(e) => return Poll::Ready(Err(e)),
                        }
                    }
                }
                Poll::Ready(Ok(None)) => {
                    if let Err(e) = command.plan.close() {
                        return Poll::Ready(Err(e));
                    }
                    let row = vec![ScalarValue::Int64(self.current_count)];
                    self.current += 1;
                    self.current_count = 0;
                    self.current_opened = false;
                    return Poll::Ready(Ok(Some(vec![row])));
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        for command in &mut self.commands {
            command.plan.close()?;
        }
        Ok(())
    }

    fn output_schema(&self) -> &ColumnSchema {
        &self.schema
    }

    fn clone_plan(&self) -> Box<dyn ProcessorPlan> {
        let commands = self
            .commands
            .iter()
            .map(|c| BatchedCommand {
                plan: c.plan.clone_plan(),
                parameters: c.parameters.clone(),
            })
            .collect();
        Box::new(BatchedUpdatePlan::new(commands))
    }

    fn apply_row_limit(&mut self, _limit: usize) {
        // Update counts aren't limited.
    }

    fn requires_transaction(&self, transactional_reads: bool) -> bool {
        self.commands.len() > 1
            || self
                .commands
                .iter()
                .any(|c| c.plan.requires_transaction(transactional_reads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dqp::connector::ConnectorManagers;
    use crate::dqp::registry::AtomicRequestRegistry;
    use crate::metadata::VdbKey;
    use crate::processor::access::{AccessNode, AccessPlan};
    use crate::request::request_id::RequestId;
    use crate::runtime::noop_context;
    use crate::runtime::pool::QueuedWorkPool;
    use crate::testutil::{FakeConnector, int_rows};

    fn update_plan(table: &str) -> Box<dyn ProcessorPlan> {
        let node = AccessNode {
            node_id: 0,
            model: "pm1".to_string(),
            connector_binding: "source1".to_string(),
            group: Some(table.to_string()),
            command: format!("update {table} set e1 = ?"),
            limit: None,
        };
        Box::new(AccessPlan::new(ColumnSchema::update_count(), vec![node], 8).with_update(true))
    }

    #[test]
    fn one_count_per_command() {
        let managers = Arc::new(ConnectorManagers::new());
        managers.add(Arc::new(
            FakeConnector::new("source1")
                .with_table("pm1.g1", int_rows(2))
                .with_table("pm1.g2", int_rows(5)),
        ));
        let pool = Arc::new(QueuedWorkPool::new());
        let dm = Arc::new(DataTierManager::new(managers, pool.clone(), 4));

        let id = RequestId::new("s1", 1);
        let context = CommandContext::new(
            id.clone(),
            VdbKey::new("vdb", 1),
            "user",
            Arc::new(AtomicRequestRegistry::new(id, 4)),
        );

        let mut plan = BatchedUpdatePlan::new(vec![
            BatchedCommand {
                plan: update_plan("pm1.g1"),
                parameters: vec![ScalarValue::Int32(1)],
            },
            BatchedCommand {
                plan: update_plan("pm1.g2"),
                parameters: vec![ScalarValue::Int32(2)],
            },
        ]);
        assert!(plan.requires_transaction(false));

        plan.initialize(&context, &dm).unwrap();
        plan.open().unwrap();

        let mut rows = Vec::new();
        loop {
            match plan.poll_next_batch(&mut noop_context()) {
                Poll::Ready(Ok(Some(batch))) => rows.extend(batch),
                Poll::Ready(Ok(None)) => break,
                Poll::Ready(Err(e)) => panic!("{e}"),
                Poll::Pending => {
                    assert!(pool.run_until_idle() > 0);
                }
            }
        }
        plan.close().unwrap();

        assert_eq!(
            vec![vec![ScalarValue::Int64(2)], vec![ScalarValue::Int64(5)]],
            rows
        );
    }
}
