//! Load manifest handling (tabseed.yml)
//!
//! The manifest lists the tables of a run in load order, the data directory
//! holding their input files, the reconciliation policy and the engine
//! tuning. Table names may be literal or read from an environment variable,
//! so the same manifest works across stages with different `.env` files.
//!
//! ```yaml
//! data_dir: ./data
//! policy: append
//! write:
//!   max_workers: 10
//! tables:
//!   - file: locales.json
//!     table_env: TABLE_LOCALES
//!     partition_key: local_id
//!   - table: tokens
//!     partition_key: token
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabseed_common::{ReconciliationPolicy, TableDescriptor};
use tracing::warn;

use crate::engine::{RetryPolicy, WriteSettings};
use crate::error::{LoaderError, Result};
use crate::provision::ProvisionSettings;
use crate::store::MAX_BATCH_ITEMS;

/// Default manifest file name
pub const DEFAULT_MANIFEST: &str = "tabseed.yml";

// ============================================================================
// Manifest
// ============================================================================

/// Tabseed manifest file (tabseed.yml)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Directory holding the input files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// What to do with existing table contents
    #[serde(default)]
    pub policy: ReconciliationPolicy,

    #[serde(default)]
    pub write: WriteConfig,

    #[serde(default)]
    pub provision: ProvisionConfig,

    /// Tables in load order
    #[serde(default)]
    pub tables: Vec<TableEntry>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Batch write engine tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WriteConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    pub max_retries: u32,
    pub progress_interval: usize,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_ITEMS,
            max_workers: 10,
            max_retries: 5,
            progress_interval: 500,
            backoff_base_ms: 1000,
            backoff_jitter_ms: 1000,
        }
    }
}

impl WriteConfig {
    pub fn to_settings(&self) -> WriteSettings {
        WriteSettings {
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            progress_interval: self.progress_interval,
            retry: self.retry_policy(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }
}

/// Table creation polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    pub poll_interval_ms: u64,
    pub active_timeout_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            active_timeout_secs: 300,
        }
    }
}

impl ProvisionConfig {
    pub fn to_settings(&self) -> ProvisionSettings {
        ProvisionSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            active_timeout: Duration::from_secs(self.active_timeout_secs),
        }
    }
}

/// One table of the run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TableEntry {
    /// Input file relative to `data_dir`; absent for create-only tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Literal table name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// Environment variable holding the table name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_env: Option<String>,

    pub partition_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
}

impl TableEntry {
    /// Human-readable label used before the name is resolved
    pub fn label(&self) -> String {
        self.table
            .clone()
            .or_else(|| self.table_env.as_ref().map(|var| format!("${var}")))
            .or_else(|| self.file.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }

    fn resolve_name(&self, lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
        if let Some(name) = &self.table {
            return Some(name.clone());
        }
        self.table_env
            .as_deref()
            .and_then(lookup)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }
}

/// A table ready to run: resolved descriptor plus its input file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    pub descriptor: TableDescriptor,
    pub file: Option<String>,
}

impl Manifest {
    /// Load a manifest from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoaderError::config(format!(
                "manifest '{}' not found",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|source| LoaderError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `TABSEED_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (keyed like the environment variables)
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("TABSEED_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("TABSEED_BATCH_SIZE") {
            self.write.batch_size = parse_number("TABSEED_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("TABSEED_MAX_WORKERS") {
            self.write.max_workers = parse_number("TABSEED_MAX_WORKERS", &value)?;
        }
        if let Some(value) = lookup("TABSEED_MAX_RETRIES") {
            self.write.max_retries = parse_number("TABSEED_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("TABSEED_PROGRESS_INTERVAL") {
            self.write.progress_interval = parse_number("TABSEED_PROGRESS_INTERVAL", &value)?;
        }
        Ok(self)
    }

    /// Validate the manifest structure
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(LoaderError::config("no tables declared"));
        }
        if self.write.batch_size == 0 || self.write.batch_size > MAX_BATCH_ITEMS {
            return Err(LoaderError::config(format!(
                "write.batch_size must be between 1 and {MAX_BATCH_ITEMS}, got {}",
                self.write.batch_size
            )));
        }
        if self.write.max_workers == 0 {
            return Err(LoaderError::config("write.max_workers must be at least 1"));
        }
        if self.write.progress_interval == 0 {
            return Err(LoaderError::config("write.progress_interval must be at least 1"));
        }

        let mut names = HashSet::new();
        for entry in &self.tables {
            if entry.table.is_none() && entry.table_env.is_none() {
                return Err(LoaderError::config(format!(
                    "table entry '{}' needs 'table' or 'table_env'",
                    entry.label()
                )));
            }
            if let Some(name) = &entry.table {
                if !names.insert(name.as_str()) {
                    return Err(LoaderError::config(format!("table '{name}' is declared twice")));
                }
            }
            // Key layout checks are shared with the descriptor
            let name = entry.table.clone().unwrap_or_else(|| entry.label());
            TableDescriptor::new(name, entry.partition_key.as_str(), entry.sort_key.as_deref())?;
        }
        Ok(())
    }

    /// Resolve table names from the environment
    pub fn resolve_tables(&self) -> Result<Vec<TablePlan>> {
        self.resolve_tables_with(|key| std::env::var(key).ok())
    }

    /// Resolve table names through `lookup`.
    ///
    /// Entries whose environment variable is unset or empty are skipped with
    /// a warning; the run continues with the rest.
    pub fn resolve_tables_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Vec<TablePlan>> {
        let mut plans = Vec::with_capacity(self.tables.len());
        let mut seen = HashSet::new();

        for entry in &self.tables {
            let Some(name) = entry.resolve_name(&lookup) else {
                warn!(
                    entry = %entry.label(),
                    "Table name is not set in the environment, skipping"
                );
                continue;
            };
            if !seen.insert(name.clone()) {
                return Err(LoaderError::config(format!("table '{name}' is declared twice")));
            }

            let descriptor =
                TableDescriptor::new(name, entry.partition_key.as_str(), entry.sort_key.as_deref())?;
            plans.push(TablePlan {
                descriptor,
                file: entry.file.clone(),
            });
        }
        Ok(plans)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoaderError::config(format!("{key} must be a non-negative integer, got '{value}'")))
}
