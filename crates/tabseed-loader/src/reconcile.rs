//! Reconciliation of existing table contents
//!
//! Under [`ReconciliationPolicy::Replace`] every existing item is removed
//! before loading: scan all key projections page by page, then delete them
//! in bulk batches. The scan is not a snapshot, so items written by someone
//! else while the purge runs may survive it.

use serde::Serialize;
use std::sync::Arc;
use tabseed_common::{Record, ReconciliationPolicy, TableDescriptor};
use tracing::{debug, info};

use crate::engine::{retry_throttled, RetryPolicy};
use crate::error::{LoaderError, Result, StoreError, StoreResult};
use crate::store::{TableStore, MAX_BATCH_ITEMS};

/// What a purge removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub scanned: usize,
    pub deleted: usize,
}

pub struct Reconciler {
    store: Arc<dyn TableStore>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TableStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            batch_size: MAX_BATCH_ITEMS,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_ITEMS);
        self
    }

    /// Apply `policy` to the table. `Append` leaves it untouched.
    pub async fn apply_policy(
        &self,
        descriptor: &TableDescriptor,
        policy: ReconciliationPolicy,
    ) -> Result<PurgeReport> {
        match policy {
            ReconciliationPolicy::Append => {
                debug!(table = descriptor.table_name(), "Append policy, keeping existing items");
                Ok(PurgeReport::default())
            },
            ReconciliationPolicy::Replace => self.purge(descriptor).await.map_err(|source| {
                LoaderError::Purge {
                    table: descriptor.table_name().to_string(),
                    source,
                }
            }),
        }
    }

    /// Delete every item in the table. A missing table counts as empty.
    pub async fn purge(&self, descriptor: &TableDescriptor) -> StoreResult<PurgeReport> {
        let table = descriptor.table_name();

        let keys = match self.scan_all(descriptor).await {
            Ok(keys) => keys,
            Err(StoreError::TableNotFound(_)) => {
                info!(table, "Table does not exist yet, nothing to purge");
                return Ok(PurgeReport::default());
            },
            Err(err) => return Err(err),
        };

        if keys.is_empty() {
            info!(table, "Table is already empty");
            return Ok(PurgeReport::default());
        }

        info!(table, items = keys.len(), "Purging existing items");
        let mut report = PurgeReport {
            scanned: keys.len(),
            deleted: 0,
        };

        for chunk in keys.chunks(self.batch_size) {
            let attempted = retry_throttled(&self.retry, table, || {
                self.store.delete_batch(descriptor, chunk)
            })
            .await;
            report.deleted += attempted.result?;
        }

        info!(table, deleted = report.deleted, "Purge complete");
        Ok(report)
    }

    /// Collect every key, following continuation cursors to the end
    async fn scan_all(&self, descriptor: &TableDescriptor) -> StoreResult<Vec<Record>> {
        let table = descriptor.table_name();

        // A one-item first page avoids a full scan of an empty table
        let first_page = retry_throttled(&self.retry, table, || {
            self.store.scan_keys(descriptor, Some(1), None)
        })
        .await
        .result?;
        if first_page.keys.is_empty() && first_page.next.is_none() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut cursor: Option<Record> = None;
        let mut pages = 0usize;
        loop {
            let start = cursor.take();
            let page = retry_throttled(&self.retry, table, || {
                self.store.scan_keys(descriptor, None, start.clone())
            })
            .await
            .result?;

            pages += 1;
            keys.extend(page.keys);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(table, pages, items = keys.len(), "Scan complete");
        Ok(keys)
    }
}
