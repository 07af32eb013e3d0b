//! Shared helpers for tabseed-loader integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabseed_common::{Record, ReconciliationPolicy, RunTally, TableDescriptor};
use tabseed_loader::engine::{RetryPolicy, WriteSettings};
use tabseed_loader::error::{StoreError, StoreResult};
use tabseed_loader::progress::ProgressObserver;
use tabseed_loader::provision::{ProvisionSettings, Provisioner};
use tabseed_loader::reconcile::Reconciler;
use tabseed_loader::source::JsonFileSource;
use tabseed_loader::store::{MemoryStore, PutReport, ScanPage, TableStatus, TableStore};
use tabseed_loader::{BatchWriter, Coordinator};

/// How a matching batch is throttled
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    /// Attempts to reject before letting the batch through
    pub times: u32,
    /// Leading items applied by each rejected attempt
    pub accepted: usize,
}

impl Throttle {
    pub fn times(times: u32) -> Self {
        Self { times, accepted: 0 }
    }

    pub fn forever(accepted: usize) -> Self {
        Self {
            times: u32::MAX,
            accepted,
        }
    }
}

type ThrottleRule = Box<dyn Fn(&[Record]) -> Option<Throttle> + Send + Sync>;

/// [`MemoryStore`] with scripted faults
pub struct ScriptedStore {
    pub inner: MemoryStore,
    pub put_calls: AtomicUsize,
    pub scan_calls: AtomicUsize,
    throttle: ThrottleRule,
    attempts: Mutex<HashMap<String, u32>>,
    panic_on: Option<String>,
    fail_create: bool,
    fail_scan: bool,
}

/// Identity of a batch: the partition key text of its first item
pub fn batch_id(items: &[Record]) -> String {
    items
        .first()
        .and_then(|r| r.get("local_id"))
        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .unwrap_or_default()
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            put_calls: AtomicUsize::new(0),
            scan_calls: AtomicUsize::new(0),
            throttle: Box::new(|_| None),
            attempts: Mutex::new(HashMap::new()),
            panic_on: None,
            fail_create: false,
            fail_scan: false,
        }
    }

    pub fn throttle_when(
        mut self,
        rule: impl Fn(&[Record]) -> Option<Throttle> + Send + Sync + 'static,
    ) -> Self {
        self.throttle = Box::new(rule);
        self
    }

    /// Panic while writing the batch whose id is `batch`
    pub fn panic_on(mut self, batch: &str) -> Self {
        self.panic_on = Some(batch.to_string());
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_scan(mut self) -> Self {
        self.fail_scan = true;
        self
    }

    pub fn with_table(self, descriptor: &TableDescriptor, items: Vec<Record>) -> Self {
        self.inner.seed(descriptor, items);
        self
    }

    pub fn puts(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableStore for ScriptedStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus> {
        self.inner.describe_table(table).await
    }

    async fn create_table(&self, descriptor: &TableDescriptor) -> StoreResult<()> {
        if self.fail_create {
            return Err(StoreError::service("LimitExceededException", "too many tables"));
        }
        self.inner.create_table(descriptor).await
    }

    async fn put_batch(
        &self,
        descriptor: &TableDescriptor,
        items: &[Record],
    ) -> StoreResult<PutReport> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let id = batch_id(items);

        if self.panic_on.as_deref() == Some(id.as_str()) {
            panic!("injected fault in batch {id}");
        }

        if let Some(throttle) = (self.throttle)(items) {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let seen = attempts.entry(id).or_insert(0);
                *seen += 1;
                *seen
            };
            if attempt <= throttle.times {
                let accepted = throttle.accepted.min(items.len());
                if accepted > 0 {
                    self.inner.put_batch(descriptor, &items[..accepted]).await?;
                }
                return Err(StoreError::throttled(accepted, "injected throttle"));
            }
        }

        self.inner.put_batch(descriptor, items).await
    }

    async fn delete_batch(
        &self,
        descriptor: &TableDescriptor,
        keys: &[Record],
    ) -> StoreResult<usize> {
        self.inner.delete_batch(descriptor, keys).await
    }

    async fn scan_keys(
        &self,
        descriptor: &TableDescriptor,
        limit: Option<usize>,
        start: Option<Record>,
    ) -> StoreResult<ScanPage> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_scan {
            return Err(StoreError::service("InternalServerError", "scan failed"));
        }
        self.inner.scan_keys(descriptor, limit, start).await
    }
}

/// Records progress notifications
#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<RunTally>>,
    pub finished: Mutex<Vec<(String, RunTally)>>,
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, _table: &str, tally: &RunTally) {
        self.progress.lock().unwrap().push(*tally);
    }

    fn on_finish(&self, table: &str, tally: &RunTally) {
        self.finished.lock().unwrap().push((table.to_string(), *tally));
    }
}

pub fn locales() -> TableDescriptor {
    TableDescriptor::new("locales", "local_id", None::<String>).unwrap()
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// `n` records keyed `<prefix>-0000`, `<prefix>-0001`, ...
pub fn records(prefix: &str, n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            record(json!({
                "local_id": format!("{prefix}-{i:04}"),
                "nombre": format!("Sede {i}"),
                "activo": i % 2 == 0
            }))
        })
        .collect()
}

/// Sequence number of a batch id produced by [`records`]
pub fn record_index(id: &str) -> usize {
    id.rsplit('-').next().and_then(|n| n.parse().ok()).unwrap_or(0)
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_millis(1),
        max_jitter: Duration::from_millis(1),
    }
}

pub fn fast_settings(max_workers: usize) -> WriteSettings {
    WriteSettings {
        batch_size: 25,
        max_workers,
        progress_interval: 500,
        retry: fast_retry(),
    }
}

pub fn writer(store: Arc<ScriptedStore>, max_workers: usize) -> BatchWriter {
    BatchWriter::new(store, fast_settings(max_workers))
}

pub fn write_json(dir: &Path, name: &str, value: &Value) {
    std::fs::write(dir.join(name), serde_json::to_vec(value).unwrap()).unwrap();
}

pub fn coordinator(
    store: Arc<ScriptedStore>,
    data_dir: &Path,
    policy: ReconciliationPolicy,
) -> Coordinator {
    let provision = ProvisionSettings {
        poll_interval: Duration::from_millis(1),
        active_timeout: Duration::from_millis(100),
    };
    Coordinator::new(
        Provisioner::new(store.clone(), provision),
        Reconciler::new(store.clone(), fast_retry()),
        BatchWriter::new(store, fast_settings(4)),
        Arc::new(JsonFileSource::new(data_dir)),
        policy,
    )
}
