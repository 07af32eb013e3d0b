//! Store boundary
//!
//! [`TableStore`] is the narrow surface the loader needs from a partitioned
//! key-value store: bulk put/delete of up to [`MAX_BATCH_ITEMS`] items, a
//! paginated key scan, and the table administration calls used by the
//! provisioner. Two backends implement it:
//!
//! - [`DynamoStore`]: Amazon DynamoDB (or DynamoDB Local) via `aws-sdk-dynamodb`
//! - [`MemoryStore`]: in-process tables for dry runs and tests

use async_trait::async_trait;
use serde::Serialize;
use tabseed_common::{Record, TableDescriptor};

use crate::error::StoreResult;

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

/// Hard per-request item limit of a bulk write
pub const MAX_BATCH_ITEMS: usize = 25;

/// Lifecycle state of a table as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TableStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    Other(String),
}

impl TableStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TableStatus::Active)
    }
}

/// Item-level rejection inside an otherwise successful bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFault {
    /// Position of the item within the submitted batch
    pub index: usize,
    pub reason: String,
}

/// Result of one bulk put
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutReport {
    /// Items the store accepted
    pub written: usize,
    /// Items rejected individually; the rest of the batch still went through
    pub rejected: Vec<ItemFault>,
}

impl PutReport {
    pub fn all_written(written: usize) -> Self {
        Self {
            written,
            rejected: Vec::new(),
        }
    }
}

/// One page of a key scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    /// Key projections of the items on this page
    pub keys: Vec<Record>,
    /// Continuation cursor; `None` on the last page
    pub next: Option<Record>,
}

/// Operations the loader needs from a table store
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Cheap round trip proving the store is reachable and credentials work
    async fn ping(&self) -> StoreResult<()>;

    /// Current status of `table`, or [`StoreError::TableNotFound`](crate::error::StoreError::TableNotFound)
    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus>;

    /// Create a table with the descriptor's key schema and on-demand capacity.
    ///
    /// Returns once the request is accepted; the table may still be creating.
    async fn create_table(&self, descriptor: &TableDescriptor) -> StoreResult<()>;

    /// Upsert up to [`MAX_BATCH_ITEMS`] items in one request
    async fn put_batch(
        &self,
        descriptor: &TableDescriptor,
        items: &[Record],
    ) -> StoreResult<PutReport>;

    /// Delete up to [`MAX_BATCH_ITEMS`] items by key; returns how many keys were applied
    async fn delete_batch(&self, descriptor: &TableDescriptor, keys: &[Record])
        -> StoreResult<usize>;

    /// Read one page of key projections, starting after `start`
    async fn scan_keys(
        &self,
        descriptor: &TableDescriptor,
        limit: Option<usize>,
        start: Option<Record>,
    ) -> StoreResult<ScanPage>;
}
