use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use fedsql_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use crate::arrays::scalar::ScalarValue;

pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_MAX_PLAN_CACHE_ENTRIES: i64 = 512;
pub const DEFAULT_MAX_RESULTS_CACHE_ENTRIES: i64 = 1024;
pub const DEFAULT_USER_REQUEST_SOURCE_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_BUFFERED_ROWS: usize = 2048;
pub const DEFAULT_BATCHES_PER_PROCESS: usize = 16;
pub const DEFAULT_LOB_CHUNK_SIZE: usize = 100 * 1024;
pub const DEFAULT_CONNECTOR_QUEUE_SIZE: usize = 512;
pub const DEFAULT_MAX_IN_MEMORY_BATCHES: usize = 4096;

/// Configuration for the engine.
///
/// Deserializable so that embedders can load it from whatever config format
/// they use. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target number of rows per batch in result buffers.
    pub batch_size: usize,
    /// Max entries in the plan cache. Zero disables, negative is unbounded.
    pub max_plan_cache_entries: i64,
    /// Max entries in the result set cache. Zero disables, negative is
    /// unbounded.
    pub max_results_cache_entries: i64,
    /// Max number of atomic requests of a single user request that may be
    /// executing against sources at once.
    pub user_request_source_concurrency: usize,
    /// Max number of rows buffered ahead of a forward-only client cursor
    /// before processing pauses.
    pub max_buffered_rows: usize,
    /// Number of batches a request pulls from its plan before yielding the
    /// worker thread.
    pub batches_per_process: usize,
    /// Size in bytes of chunks sent for large objects.
    pub lob_chunk_size: usize,
    /// Max rows a connector work item queues before waiting for the consumer.
    pub connector_queue_size: usize,
    /// Max batches held in memory across all buffers before spilling.
    pub max_in_memory_batches: usize,
    /// Directory to spill batches to. Batches are kept in memory (serialized)
    /// if not set.
    pub spill_directory: Option<PathBuf>,
    /// Threads for the threaded work pool. Defaults to number of cpus.
    pub worker_threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            max_plan_cache_entries: DEFAULT_MAX_PLAN_CACHE_ENTRIES,
            max_results_cache_entries: DEFAULT_MAX_RESULTS_CACHE_ENTRIES,
            user_request_source_concurrency: DEFAULT_USER_REQUEST_SOURCE_CONCURRENCY,
            max_buffered_rows: DEFAULT_MAX_BUFFERED_ROWS,
            batches_per_process: DEFAULT_BATCHES_PER_PROCESS,
            lob_chunk_size: DEFAULT_LOB_CHUNK_SIZE,
            connector_queue_size: DEFAULT_CONNECTOR_QUEUE_SIZE,
            max_in_memory_batches: DEFAULT_MAX_IN_MEMORY_BATCHES,
            spill_directory: None,
            worker_threads: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DbError::new("Batch size must be greater than zero"));
        }
        SourceConcurrency::validate_value(self.user_request_source_concurrency)?;
        if self.batches_per_process == 0 {
            return Err(DbError::new(
                "Batches per process must be greater than zero",
            ));
        }
        if self.lob_chunk_size == 0 {
            return Err(DbError::new("LOB chunk size must be greater than zero"));
        }
        if self.connector_queue_size == 0 {
            return Err(DbError::new(
                "Connector queue size must be greater than zero",
            ));
        }
        if self.max_in_memory_batches == 0 {
            return Err(DbError::new(
                "Max in-memory batches must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn set_from_scalar(&mut self, name: &str, value: &ScalarValue) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        (func.set)(value, self)
    }

    pub fn get_as_scalar(&self, name: &str) -> Result<ScalarValue> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| DbError::new(format!("Missing setting for '{name}'")))?;

        Ok((func.get)(self))
    }
}

struct SettingFunctions {
    set: fn(scalar: &ScalarValue, conf: &mut EngineConfig) -> Result<()>,
    get: fn(conf: &EngineConfig) -> ScalarValue,
}

impl SettingFunctions {
    const fn new<S: EngineSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_scalar as _,
            get: S::get_as_scalar as _,
        }
    }
}

fn insert_setting<S: EngineSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<BatchSize>(&mut map);
    insert_setting::<SourceConcurrency>(&mut map);
    insert_setting::<MaxBufferedRows>(&mut map);
    insert_setting::<LobChunkSize>(&mut map);

    map
});

/// A setting that can be changed at runtime by name.
pub trait EngineSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut EngineConfig) -> Result<()>;
    fn get_as_scalar(conf: &EngineConfig) -> ScalarValue;
}

fn scalar_as_usize(scalar: &ScalarValue) -> Result<usize> {
    let v = scalar.try_as_i64()?;
    usize::try_from(v).map_err(|_| DbError::new(format!("Expected a non-negative value, got {v}")))
}

pub struct BatchSize;

impl EngineSetting for BatchSize {
    const NAME: &'static str = "batch_size";
    const DESCRIPTION: &'static str = "Target number of rows per result batch";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut EngineConfig) -> Result<()> {
        let val = scalar_as_usize(scalar)?;
        if val == 0 {
            return Err(DbError::new("Batch size must be greater than zero"));
        }
        conf.batch_size = val;
        Ok(())
    }

    fn get_as_scalar(conf: &EngineConfig) -> ScalarValue {
        ScalarValue::Int64(conf.batch_size as i64)
    }
}

const MIN_SOURCE_CONCURRENCY: usize = 1;
const MAX_SOURCE_CONCURRENCY: usize = 256;

pub struct SourceConcurrency;

impl SourceConcurrency {
    pub fn validate_value(val: usize) -> Result<()> {
        if val < MIN_SOURCE_CONCURRENCY {
            return Err(DbError::new(format!(
                "Source concurrency cannot be less than {MIN_SOURCE_CONCURRENCY}"
            )));
        }
        if val > MAX_SOURCE_CONCURRENCY {
            return Err(DbError::new(format!(
                "Source concurrency cannot be greater than {MAX_SOURCE_CONCURRENCY}"
            )));
        }
        Ok(())
    }
}

impl EngineSetting for SourceConcurrency {
    const NAME: &'static str = "user_request_source_concurrency";
    const DESCRIPTION: &'static str =
        "Max number of source queries of a single request that may execute concurrently";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut EngineConfig) -> Result<()> {
        let val = scalar_as_usize(scalar)?;
        Self::validate_value(val)?;
        conf.user_request_source_concurrency = val;
        Ok(())
    }

    fn get_as_scalar(conf: &EngineConfig) -> ScalarValue {
        ScalarValue::Int64(conf.user_request_source_concurrency as i64)
    }
}

pub struct MaxBufferedRows;

impl EngineSetting for MaxBufferedRows {
    const NAME: &'static str = "max_buffered_rows";
    const DESCRIPTION: &'static str =
        "Max rows buffered ahead of a forward-only cursor before processing pauses";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut EngineConfig) -> Result<()> {
        conf.max_buffered_rows = scalar_as_usize(scalar)?;
        Ok(())
    }

    fn get_as_scalar(conf: &EngineConfig) -> ScalarValue {
        ScalarValue::Int64(conf.max_buffered_rows as i64)
    }
}

pub struct LobChunkSize;

impl EngineSetting for LobChunkSize {
    const NAME: &'static str = "lob_chunk_size";
    const DESCRIPTION: &'static str = "Size in bytes of large object chunks";

    fn set_from_scalar(scalar: &ScalarValue, conf: &mut EngineConfig) -> Result<()> {
        let val = scalar_as_usize(scalar)?;
        if val == 0 {
            return Err(DbError::new("LOB chunk size must be greater than zero"));
        }
        conf.lob_chunk_size = val;
        Ok(())
    }

    fn get_as_scalar(conf: &EngineConfig) -> ScalarValue {
        ScalarValue::Int64(conf.lob_chunk_size as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn set_source_concurrency() {
        let mut conf = EngineConfig::default();
        conf.set_from_scalar("user_request_source_concurrency", &ScalarValue::Int32(1))
            .unwrap();
        assert_eq!(1, conf.user_request_source_concurrency);

        conf.set_from_scalar("user_request_source_concurrency", &ScalarValue::Int32(0))
            .unwrap_err();
        assert_eq!(1, conf.user_request_source_concurrency);
    }

    #[test]
    fn get_missing_setting() {
        let conf = EngineConfig::default();
        conf.get_as_scalar("does_not_exist").unwrap_err();
    }

    #[test]
    fn deserialize_partial() {
        let conf: EngineConfig =
            serde_json::from_str(r#"{"batch_size": 16, "max_plan_cache_entries": -1}"#).unwrap();
        assert_eq!(16, conf.batch_size);
        assert_eq!(-1, conf.max_plan_cache_entries);
        assert_eq!(DEFAULT_LOB_CHUNK_SIZE, conf.lob_chunk_size);
    }
}
