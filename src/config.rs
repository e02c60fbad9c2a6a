//! Store configuration loaded from TOML.
//!
//! ```toml
//! store-id = "_root"
//! store-type = "sql"
//! endpoints = ["/var/lib/engine/meta.db"]
//! table = "project_kv"
//! max-connections = 8
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MetaError, Result};
use crate::sqlite::DEFAULT_KV_TABLE;
use crate::store::validate_table_name;

/// Store id used when none is configured.
pub const DEFAULT_STORE_ID: &str = "_default";

/// Endpoint naming a private in-memory SQLite database.
pub const MEMORY_ENDPOINT: &str = ":memory:";

/// Backend kind of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StoreType {
    /// SQLite through an `sqlx` pool.
    Sql,
    /// In-process maps, not durable.
    Memory,
}

impl StoreType {
    /// Lower-case tag used in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::Sql => "sql",
            StoreType::Memory => "memory",
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(StoreType::Sql),
            "memory" => Ok(StoreType::Memory),
            other => Err(MetaError::InvalidConfig(format!(
                "unknown store type '{}', expected \"sql\" or \"memory\"",
                other
            ))),
        }
    }
}

impl TryFrom<String> for StoreType {
    type Error = MetaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StoreType> for String {
    fn from(value: StoreType) -> Self {
        value.as_str().to_string()
    }
}

/// Configuration of one metastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    /// Identifier of the store, for logging.
    #[serde(default = "default_store_id")]
    pub store_id: String,
    /// Backend kind.
    #[serde(default = "default_store_type")]
    pub store_type: StoreType,
    /// Database file of a SQL store, or [`MEMORY_ENDPOINT`].
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// KV table scope. Empty selects the default table.
    #[serde(default)]
    pub table: String,
    /// Pool size of a file-backed SQL store.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Bound on opening the store and initializing its schema.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_store_id() -> String {
    DEFAULT_STORE_ID.to_string()
}

fn default_store_type() -> StoreType {
    StoreType::Sql
}

fn default_endpoints() -> Vec<String> {
    vec![MEMORY_ENDPOINT.to_string()]
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_id: default_store_id(),
            store_type: default_store_type(),
            endpoints: default_endpoints(),
            table: String::new(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MetaError::InvalidConfig(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the settings are usable for the configured backend.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(MetaError::InvalidConfig(
                "max-connections must be greater than 0".to_string(),
            ));
        }
        if !self.table.is_empty() {
            validate_table_name(&self.table)
                .map_err(|e| MetaError::InvalidConfig(e.to_string()))?;
        }
        if self.store_type == StoreType::Sql && self.endpoints.len() != 1 {
            return Err(MetaError::InvalidConfig(format!(
                "sql store '{}' needs exactly one endpoint, got {}",
                self.store_id,
                self.endpoints.len()
            )));
        }
        Ok(())
    }

    /// Table scope, with the default applied.
    pub fn table(&self) -> &str {
        if self.table.is_empty() {
            DEFAULT_KV_TABLE
        } else {
            &self.table
        }
    }

    /// `busy-timeout-ms` as a duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// `connect-timeout-ms` as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
