//! Batch write engine
//!
//! [`BatchWriter::write_all`] loads one table's records:
//!
//! 1. Split the records, in order, into batches of at most `batch_size`
//!    (never more than the store's [`MAX_BATCH_ITEMS`]).
//! 2. Run the batches on tokio tasks, at most `min(max_workers, batches)`
//!    in flight, with no ordering between batches.
//! 3. Each batch goes through [`process_batch_with_retry`]: a throttled bulk
//!    write is re-sent whole after an exponential backoff, up to the retry
//!    ceiling. Writes are upserts, so re-sending already stored items is
//!    harmless.
//! 4. Batch outcomes are merged into a [`SharedTally`] under its lock, which
//!    also drives progress notifications.
//!
//! No error escapes `write_all`. Every record ends up counted as a success or
//! an error, including records of a batch whose task panicked.

use futures::future;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tabseed_common::{Record, RunTally, TableDescriptor, WriteOutcome};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::progress::{LogProgress, ProgressObserver};
use crate::store::{TableStore, MAX_BATCH_ITEMS};

pub mod retry;
pub mod tally;

pub use retry::{retry_throttled, Attempted, RetryPolicy};
pub use tally::SharedTally;

/// Item-level error messages logged per batch; the rest are only counted
const MAX_ERROR_SAMPLES: usize = 2;

/// Tuning for [`BatchWriter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSettings {
    pub batch_size: usize,
    pub max_workers: usize,
    /// Successes between progress notifications
    pub progress_interval: usize,
    pub retry: RetryPolicy,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_ITEMS,
            max_workers: 10,
            progress_interval: 500,
            retry: RetryPolicy::default(),
        }
    }
}

/// Split `records` into consecutive batches of `batch_size` (the last may
/// be shorter), preserving order.
pub fn partition(records: Vec<Record>, batch_size: usize) -> Vec<Vec<Record>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

/// Batches in flight: never more than the cap, never more than the batches
pub fn worker_count(max_workers: usize, batches: usize) -> usize {
    max_workers.max(1).min(batches)
}

/// Outcome of one batch plus the throttling retries it took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub outcome: WriteOutcome,
    pub retries: u32,
}

fn log_item_error(table: &str, samples: &mut usize, reason: &dyn std::fmt::Display) {
    if *samples < MAX_ERROR_SAMPLES {
        warn!(table, "Item rejected: {}", reason);
    }
    *samples += 1;
}

/// Write one batch, re-sending it whole while the store throttles.
///
/// - Records without usable key attributes are counted as errors and not sent.
/// - Items the store rejects individually are counted as errors; the rest of
///   the batch still counts as written.
/// - When the retries run out, the last attempt's accepted items count as
///   written and the remainder as errors.
/// - Any other store failure counts the whole batch as errors.
pub async fn process_batch_with_retry(
    store: &dyn TableStore,
    descriptor: &TableDescriptor,
    batch: Vec<Record>,
    policy: &RetryPolicy,
) -> BatchResult {
    let table = descriptor.table_name();
    let batch_len = batch.len();
    let mut samples = 0;
    let mut errors = 0;

    let mut valid = Vec::with_capacity(batch_len);
    for record in batch {
        match descriptor.check_keys(&record) {
            Ok(()) => valid.push(record),
            Err(violation) => {
                errors += 1;
                log_item_error(table, &mut samples, &violation);
            },
        }
    }

    if valid.is_empty() {
        return BatchResult {
            outcome: WriteOutcome::new(0, errors),
            retries: 0,
        };
    }

    let attempted = retry_throttled(policy, table, || store.put_batch(descriptor, &valid)).await;

    let outcome = match attempted.result {
        Ok(report) => {
            for fault in &report.rejected {
                log_item_error(table, &mut samples, &format!("item {}: {}", fault.index, fault.reason));
            }
            let written = report.written.min(valid.len());
            WriteOutcome::new(written, errors + valid.len() - written)
        },
        Err(StoreError::Throttled { accepted, message }) => {
            let accepted = accepted.min(valid.len());
            warn!(
                table,
                retries = attempted.retries,
                accepted,
                abandoned = valid.len() - accepted,
                "Batch still throttled after retry limit: {}",
                message
            );
            WriteOutcome::new(accepted, errors + valid.len() - accepted)
        },
        Err(err) => {
            error!(table, items = batch_len, "Batch write failed: {}", err);
            WriteOutcome::failed(batch_len)
        },
    };

    if samples > MAX_ERROR_SAMPLES {
        debug!(table, suppressed = samples - MAX_ERROR_SAMPLES, "Further item errors not logged");
    }

    BatchResult {
        outcome,
        retries: attempted.retries,
    }
}

/// Parallel bulk loader for one table at a time
pub struct BatchWriter {
    store: Arc<dyn TableStore>,
    settings: WriteSettings,
    observer: Arc<dyn ProgressObserver>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn TableStore>, settings: WriteSettings) -> Self {
        Self {
            store,
            settings,
            observer: Arc::new(LogProgress),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn batch_size(&self) -> usize {
        self.settings.batch_size.clamp(1, MAX_BATCH_ITEMS)
    }

    /// Write every record to `descriptor`'s table and return the tally.
    ///
    /// `success_count + error_count` always equals the number of records.
    pub async fn write_all(&self, descriptor: &TableDescriptor, records: Vec<Record>) -> RunTally {
        let table = descriptor.table_name();
        let total = records.len();
        if total == 0 {
            debug!(table, "No records to write");
            return RunTally::new(0);
        }

        let batches = partition(records, self.batch_size());
        let batch_count = batches.len();
        let workers = worker_count(self.settings.max_workers, batch_count);
        info!(table, records = total, batches = batch_count, workers, "Writing records");

        self.observer.on_start(table, total);
        let tally = SharedTally::new(
            table,
            total,
            self.settings.progress_interval,
            Arc::clone(&self.observer),
        );

        stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| {
                let len = batch.len();
                let store = Arc::clone(&self.store);
                let descriptor = descriptor.clone();
                let policy = self.settings.retry.clone();
                let handle = tokio::spawn(async move {
                    process_batch_with_retry(store.as_ref(), &descriptor, batch, &policy).await
                });
                async move { (index, len, handle.await) }
            })
            .buffer_unordered(workers)
            .for_each(|(index, len, joined)| {
                match joined {
                    Ok(result) => {
                        tally.add_retries(result.retries);
                        tally.record(result.outcome);
                    },
                    Err(err) => {
                        error!(table, batch = index, items = len, "Batch task failed: {}", err);
                        tally.record(WriteOutcome::failed(len));
                    },
                }
                future::ready(())
            })
            .await;

        let unaccounted = tally.settle();
        if unaccounted > 0 {
            warn!(table, unaccounted, "Records without an outcome counted as errors");
        }

        let result = tally.snapshot();
        self.observer.on_finish(table, &result);
        info!(
            table,
            written = result.success_count,
            errors = result.error_count,
            throttle_retries = result.throttle_retries,
            "Finished writing records"
        );
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| match json!({"local_id": format!("L{i:04}"), "nombre": "Sede"}) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_partition_sizes() {
        for (n, b) in [(0, 25), (1, 25), (25, 25), (26, 25), (1000, 25), (7, 3)] {
            let batches = partition(records(n), b);
            assert_eq!(batches.len(), n.div_ceil(b), "n={n} b={b}");
            if let Some((last, full)) = batches.split_last() {
                assert!(full.iter().all(|batch| batch.len() == b));
                assert!(!last.is_empty() && last.len() <= b);
            }
        }
    }

    #[test]
    fn test_partition_keeps_order() {
        let batches = partition(records(30), 25);
        assert_eq!(batches[0][0]["local_id"], "L0000");
        assert_eq!(batches[1][0]["local_id"], "L0025");
        assert_eq!(batches[1][4]["local_id"], "L0029");
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(10, 2), 2);
        assert_eq!(worker_count(10, 40), 10);
        assert_eq!(worker_count(0, 3), 1);
        assert_eq!(worker_count(10, 0), 0);
    }

    #[tokio::test]
    async fn test_invalid_keys_count_as_errors() {
        let store = MemoryStore::new();
        let d = TableDescriptor::new("locales", "local_id", None::<String>).unwrap();
        store.create_table(&d).await.unwrap();

        let mut batch = records(5);
        batch[1].remove("local_id");
        batch[3].insert("local_id".into(), json!(""));

        let result = process_batch_with_retry(&store, &d, batch, &RetryPolicy::immediate(5)).await;
        assert_eq!(result.outcome, WriteOutcome::new(3, 2));
        assert_eq!(store.item_count("locales"), 3);
    }

    #[tokio::test]
    async fn test_missing_table_fails_whole_batch() {
        let store = MemoryStore::new();
        let d = TableDescriptor::new("fantasma", "local_id", None::<String>).unwrap();

        let result = process_batch_with_retry(&store, &d, records(10), &RetryPolicy::immediate(5)).await;
        assert_eq!(result.outcome, WriteOutcome::failed(10));
        assert_eq!(result.retries, 0);
    }

    #[tokio::test]
    async fn test_write_all_empty_is_noop() {
        let store: Arc<dyn TableStore> = Arc::new(MemoryStore::new());
        let writer = BatchWriter::new(store, WriteSettings::default());
        let d = TableDescriptor::new("locales", "local_id", None::<String>).unwrap();

        let tally = writer.write_all(&d, Vec::new()).await;
        assert_eq!(tally, RunTally::new(0));
    }
}
