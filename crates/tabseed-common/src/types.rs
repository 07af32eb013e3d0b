//! Shared model types for tabseed
//!
//! Records are loosely typed: a record is an ordered JSON object whose only
//! contract is that it carries the table's key attributes. That contract is
//! checked lazily, at write time, by [`TableDescriptor::check_keys`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommonError, Result};

/// A single item destined for the store.
///
/// Field order is preserved and numbers keep their literal decimal text, so
/// nothing passes through binary floating point on its way to the store.
pub type Record = serde_json::Map<String, Value>;

// ============================================================================
// Table Descriptor
// ============================================================================

/// Name and key layout of one target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDescriptor {
    table_name: String,
    partition_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort_key: Option<String>,
}

impl TableDescriptor {
    /// Build a descriptor, rejecting empty names and a sort key that repeats
    /// the partition key.
    pub fn new(
        table_name: impl Into<String>,
        partition_key: impl Into<String>,
        sort_key: Option<impl Into<String>>,
    ) -> Result<Self> {
        let table_name = table_name.into();
        let partition_key = partition_key.into();
        let sort_key = sort_key.map(Into::into);

        if table_name.trim().is_empty() {
            return Err(CommonError::invalid_descriptor("table name cannot be empty"));
        }
        if partition_key.trim().is_empty() {
            return Err(CommonError::invalid_descriptor(format!(
                "table '{}' has an empty partition key",
                table_name
            )));
        }
        if let Some(sk) = &sort_key {
            if sk.trim().is_empty() {
                return Err(CommonError::invalid_descriptor(format!(
                    "table '{}' has an empty sort key",
                    table_name
                )));
            }
            if *sk == partition_key {
                return Err(CommonError::invalid_descriptor(format!(
                    "table '{}' uses '{}' as both partition and sort key",
                    table_name, sk
                )));
            }
        }

        Ok(Self {
            table_name,
            partition_key,
            sort_key,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn sort_key(&self) -> Option<&str> {
        self.sort_key.as_deref()
    }

    /// Key attribute names, partition key first
    pub fn key_attributes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.partition_key.as_str()).chain(self.sort_key.as_deref())
    }

    /// Check that a record carries every key attribute as a usable scalar.
    ///
    /// Keys must be non-empty strings or numbers; anything else (missing,
    /// null, boolean, list, map, empty string) is a [`KeyViolation`].
    pub fn check_keys(&self, record: &Record) -> std::result::Result<(), KeyViolation> {
        for key in self.key_attributes() {
            match record.get(key) {
                None | Some(Value::Null) => return Err(KeyViolation::Missing(key.to_string())),
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(KeyViolation::Empty(key.to_string()))
                },
                Some(Value::String(_)) | Some(Value::Number(_)) => {},
                Some(_) => return Err(KeyViolation::NotScalar(key.to_string())),
            }
        }
        Ok(())
    }

    /// Project a record down to its key attributes.
    ///
    /// Returns `None` when a key attribute is absent.
    pub fn key_of(&self, record: &Record) -> Option<Record> {
        let mut key = Record::new();
        for name in self.key_attributes() {
            key.insert(name.to_string(), record.get(name)?.clone());
        }
        Some(key)
    }
}

impl std::fmt::Display for TableDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sort_key {
            Some(sk) => write!(f, "{} (PK={}, SK={})", self.table_name, self.partition_key, sk),
            None => write!(f, "{} (PK={})", self.table_name, self.partition_key),
        }
    }
}

/// Why a record cannot be written under a table's key layout
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyViolation {
    #[error("missing key attribute '{0}'")]
    Missing(String),

    #[error("key attribute '{0}' is an empty string")]
    Empty(String),

    #[error("key attribute '{0}' must be a string or number")]
    NotScalar(String),
}

// ============================================================================
// Reconciliation Policy
// ============================================================================

/// What to do with rows already present in a table before loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationPolicy {
    /// Keep existing rows and upsert the new ones
    #[default]
    Append,
    /// Delete every existing row first
    Replace,
}

impl std::str::FromStr for ReconciliationPolicy {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "append" | "keep" => Ok(ReconciliationPolicy::Append),
            "replace" | "purge" => Ok(ReconciliationPolicy::Replace),
            _ => Err(CommonError::InvalidPolicy(s.to_string())),
        }
    }
}

impl std::fmt::Display for ReconciliationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationPolicy::Append => write!(f, "append"),
            ReconciliationPolicy::Replace => write!(f, "replace"),
        }
    }
}

// ============================================================================
// Write accounting
// ============================================================================

/// Result of processing one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WriteOutcome {
    pub success: usize,
    pub errors: usize,
}

impl WriteOutcome {
    pub fn new(success: usize, errors: usize) -> Self {
        Self { success, errors }
    }

    /// Every item of a batch of `len` counted as an error
    pub fn failed(len: usize) -> Self {
        Self {
            success: 0,
            errors: len,
        }
    }
}

/// Success/error accounting for one table's load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunTally {
    pub success_count: usize,
    pub error_count: usize,
    /// Number of records handed to the engine
    pub total: usize,
    /// Throttling retries performed across all batches
    pub throttle_retries: usize,
}

impl RunTally {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, outcome: WriteOutcome) {
        self.success_count += outcome.success;
        self.error_count += outcome.errors;
    }

    /// Items with a known outcome so far
    pub fn accounted(&self) -> usize {
        self.success_count + self.error_count
    }

    pub fn is_complete(&self) -> bool {
        self.accounted() >= self.total
    }

    /// A load passes when no item failed
    pub fn passed(&self) -> bool {
        self.error_count == 0
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.accounted() as f64 / self.total as f64) * 100.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(TableDescriptor::new("locales", "local_id", None::<String>).is_ok());
        assert!(TableDescriptor::new("", "local_id", None::<String>).is_err());
        assert!(TableDescriptor::new("locales", " ", None::<String>).is_err());

        let err = TableDescriptor::new("pedidos", "local_id", Some("local_id")).unwrap_err();
        assert!(matches!(err, CommonError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_key_attributes_order() {
        let d = TableDescriptor::new("pedidos", "local_id", Some("pedido_id")).unwrap();
        let keys: Vec<&str> = d.key_attributes().collect();
        assert_eq!(keys, vec!["local_id", "pedido_id"]);
    }

    #[test]
    fn test_check_keys() {
        let d = TableDescriptor::new("pedidos", "local_id", Some("pedido_id")).unwrap();

        assert!(d
            .check_keys(&record(json!({"local_id": "L1", "pedido_id": 7})))
            .is_ok());
        assert_eq!(
            d.check_keys(&record(json!({"local_id": "L1"}))),
            Err(KeyViolation::Missing("pedido_id".into()))
        );
        assert_eq!(
            d.check_keys(&record(json!({"local_id": "", "pedido_id": "p"}))),
            Err(KeyViolation::Empty("local_id".into()))
        );
        assert_eq!(
            d.check_keys(&record(json!({"local_id": ["x"], "pedido_id": "p"}))),
            Err(KeyViolation::NotScalar("local_id".into()))
        );
    }

    #[test]
    fn test_key_of_projects_keys() {
        let d = TableDescriptor::new("resenas", "pk", Some("resena_id")).unwrap();
        let r = record(json!({"pk": "LOCAL#1#EMP#2", "resena_id": "r1", "texto": "bien"}));

        let key = d.key_of(&r).unwrap();
        assert_eq!(key.len(), 2);
        assert_eq!(key["pk"], "LOCAL#1#EMP#2");
        assert!(d.key_of(&record(json!({"pk": "x"}))).is_none());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("append".parse::<ReconciliationPolicy>().unwrap(), ReconciliationPolicy::Append);
        assert_eq!("REPLACE".parse::<ReconciliationPolicy>().unwrap(), ReconciliationPolicy::Replace);
        assert!("merge".parse::<ReconciliationPolicy>().is_err());
    }

    #[test]
    fn test_tally_accounting() {
        let mut tally = RunTally::new(30);
        tally.merge(WriteOutcome::new(25, 0));
        assert!(!tally.is_complete());
        tally.merge(WriteOutcome::failed(5));
        assert!(tally.is_complete());
        assert_eq!(tally.accounted(), 30);
        assert!(!tally.passed());
        assert_eq!(RunTally::new(0).percent_complete(), 100.0);
    }
}
