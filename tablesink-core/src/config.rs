use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::storage::{self, Identifier};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_BATCH_WINDOW_TTL_SECS: u64 = 10;

/// Time windows shorter than this do not get a background flush task, size-triggered and
/// shutdown flushes still apply.
pub const MIN_BATCH_WINDOW: Duration = Duration::from_secs(5);

/// Table processor configuration as stored in the processor's property blob. Every field is
/// optional, missing properties keep the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TableProcessorConfig {
    #[serde(alias = "batchSize")]
    pub batch_size: Option<usize>,
    /// Seconds between background flushes.
    #[serde(alias = "batchWindowTtl", alias = "batchWindowTTL")]
    pub batch_window_ttl: Option<u64>,
    #[serde(alias = "includeTimestamp")]
    pub include_timestamp: Option<bool>,
    /// Suffix appended to the destination key to build the table name.
    #[serde(alias = "tableName")]
    pub table_name: Option<String>,
}

impl Default for TableProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: Some(DEFAULT_BATCH_SIZE),
            batch_window_ttl: Some(DEFAULT_BATCH_WINDOW_TTL_SECS),
            include_timestamp: Some(false),
            table_name: None,
        }
    }
}

impl TableProcessorConfig {
    /// Parses the processor properties over the defaults. `None` and JSON `null` yield the
    /// defaults, anything that is not an object is rejected.
    pub fn from_properties(properties: Option<&Value>) -> Result<Self> {
        match properties {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value @ Value::Object(_)) => Self::deserialize(value).map_err(|e| {
                Error::Config(format!("failed to parse table processor config: {e}"))
            }),
            Some(other) => Err(Error::Config(format!(
                "table processor config must be a JSON object, got {other}"
            ))),
        }
    }
}

/// When and how a destination's buffer is flushed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlushPolicy {
    /// Record count that triggers an immediate asynchronous flush, `None` disables it.
    pub batch_size: Option<usize>,
    pub batch_window: Option<Duration>,
    pub include_timestamp: bool,
    pub table_suffix: Option<String>,
}

impl FlushPolicy {
    /// The background flush cadence, only when the window is at least [MIN_BATCH_WINDOW].
    pub fn background_window(&self) -> Option<Duration> {
        self.batch_window.filter(|window| *window >= MIN_BATCH_WINDOW)
    }

    pub(crate) fn size_reached(&self, pending: usize) -> bool {
        self.batch_size.is_some_and(|size| pending >= size)
    }

    pub fn table_name(&self, destination: &str) -> Identifier {
        storage::table_name(destination, self.table_suffix.as_deref())
    }
}

impl From<TableProcessorConfig> for FlushPolicy {
    fn from(config: TableProcessorConfig) -> Self {
        Self {
            batch_size: config.batch_size.filter(|size| *size > 0),
            batch_window: config.batch_window_ttl.map(Duration::from_secs),
            include_timestamp: config.include_timestamp.unwrap_or(false),
            table_suffix: config.table_name.filter(|suffix| !suffix.is_empty()),
        }
    }
}
