use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use fedsql_error::{DbError, DbErrorKind, Result};
use parking_lot::Mutex;

use super::connector::{ConnectorManagerRepository, SourceCapabilities};
use crate::metadata::QueryMetadata;

pub trait CapabilitiesFinder: Debug + Sync + Send {
    fn find_capabilities(&self, model: &str) -> Result<SourceCapabilities>;
}

/// Finds capabilities through the model's connector binding.
///
/// Results are remembered for the lifetime of the finder, which is a single
/// planning pass.
#[derive(Debug)]
pub struct ConnectorCapabilitiesFinder {
    repository: Arc<dyn ConnectorManagerRepository>,
    metadata: Arc<dyn QueryMetadata>,
    found: Mutex<HashMap<String, SourceCapabilities>>,
}

impl ConnectorCapabilitiesFinder {
    pub fn new(
        repository: Arc<dyn ConnectorManagerRepository>,
        metadata: Arc<dyn QueryMetadata>,
    ) -> Self {
        ConnectorCapabilitiesFinder {
            repository,
            metadata,
            found: Mutex::new(HashMap::new()),
        }
    }
}

impl CapabilitiesFinder for ConnectorCapabilitiesFinder {
    fn find_capabilities(&self, model: &str) -> Result<SourceCapabilities> {
        let key = model.to_lowercase();
        if let Some(caps) = self.found.lock().get(&key) {
            return Ok(*caps);
        }

        let binding = self.metadata.source_binding(model).ok_or_else(|| {
            DbError::with_kind(DbErrorKind::Resolve, "Model has no source binding")
                .with_field("model", model.to_string())
        })?;

        let caps = match self.repository.connector_manager(binding) {
            Some(manager) => manager.capabilities(),
            // Planning may proceed without the connector being available,
            // execution will fail later if it's still missing.
            None => SourceCapabilities::default(),
        };

        self.found.lock().insert(key, caps);
        Ok(caps)
    }
}
