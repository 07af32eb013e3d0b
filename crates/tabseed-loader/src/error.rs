//! Error types for the tabseed loader
//!
//! Two layers:
//!
//! - [`StoreError`] is what a [`TableStore`](crate::store::TableStore) backend
//!   returns. The engine only cares whether it is a throttling signal.
//! - [`LoaderError`] covers everything around the store: the manifest, the
//!   input files, provisioning and purging. The coordinator turns these into
//!   a failed table in the run summary rather than propagating them.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Failures reported by a store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store rejected the request for lack of capacity.
    ///
    /// `accepted` is how many items of the request were applied before the
    /// rejection (non-zero for a partially processed bulk write).
    #[error("Request throttled ({accepted} item(s) accepted): {message}")]
    Throttled { accepted: usize, message: String },

    #[error("Table '{0}' does not exist")]
    TableNotFound(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    /// A single item could not be encoded for the store
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// A value the store returned has no JSON counterpart
    #[error("Unsupported attribute value: {0}")]
    Unsupported(String),

    /// Any other service or transport fault
    #[error("Store error [{code}]: {message}")]
    Service { code: String, message: String },
}

impl StoreError {
    pub fn throttled(accepted: usize, message: impl Into<String>) -> Self {
        Self::Throttled {
            accepted,
            message: message.into(),
        }
    }

    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True for the capacity signal that warrants a backoff and retry
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

/// Errors raised by the loader around the store
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Manifest (tabseed.yml) could not be read or is invalid
    #[error("Invalid manifest: {0}")]
    Config(String),

    #[error("Failed to parse manifest YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Common(#[from] tabseed_common::CommonError),

    #[error("Input file not found: '{}'", .0.display())]
    MissingFile(PathBuf),

    #[error("Failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode JSON in '{}': {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{}' must contain a JSON array of records", .0.display())]
    NotRecordList(PathBuf),

    #[error("Failed to provision table '{table}': {source}")]
    Provision {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Table '{table}' did not become active within {waited_secs}s")]
    ProvisionTimeout { table: String, waited_secs: u64 },

    #[error("Failed to purge table '{table}': {source}")]
    Purge {
        table: String,
        #[source]
        source: StoreError,
    },

}

impl LoaderError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
