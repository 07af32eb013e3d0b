//! Record sources
//!
//! A source turns a table's input name into its full, ordered record list.
//! [`JsonFileSource`] reads `<data_dir>/<file>` holding a JSON array of
//! objects. Numbers are kept as their literal decimal text (serde_json's
//! `arbitrary_precision`), so no value passes through `f64` on its way to the
//! store.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tabseed_common::Record;
use tracing::debug;

use crate::error::{LoaderError, Result};

/// Supplies the records of one table
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn load(&self, name: &str) -> Result<Vec<Record>>;
}

/// Reads JSON array files from a data directory
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    data_dir: PathBuf,
}

impl JsonFileSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

/// Decode a JSON document that must be an array of objects
pub fn parse_records(bytes: &[u8], path: &Path) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_slice(bytes).map_err(|source| LoaderError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    let Value::Array(items) = value else {
        return Err(LoaderError::NotRecordList(path.to_path_buf()));
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            _ => Err(LoaderError::NotRecordList(path.to_path_buf())),
        })
        .collect()
}

#[async_trait]
impl RecordSource for JsonFileSource {
    async fn load(&self, name: &str) -> Result<Vec<Record>> {
        let path = self.path_for(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoaderError::MissingFile(path))
            },
            Err(source) => return Err(LoaderError::Read { path, source }),
        };

        let records = parse_records(&bytes, &path)?;
        debug!(path = %path.display(), records = records.len(), "Loaded input file");
        Ok(records)
    }
}
