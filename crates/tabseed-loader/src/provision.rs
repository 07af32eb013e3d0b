//! Table provisioning
//!
//! Makes sure a table exists before it is loaded: describe it, create it
//! with on-demand capacity when missing, then poll until it is active.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabseed_common::TableDescriptor;
use tracing::{debug, error, info, warn};

use crate::error::{LoaderError, Result, StoreError};
use crate::store::{TableStatus, TableStore};

/// Polling schedule while waiting for a table to become active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSettings {
    pub poll_interval: Duration,
    pub active_timeout: Duration,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            active_timeout: Duration::from_secs(300),
        }
    }
}

/// Whether the table was there before this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    AlreadyExisted,
    Created,
}

pub struct Provisioner {
    store: Arc<dyn TableStore>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(store: Arc<dyn TableStore>, settings: ProvisionSettings) -> Self {
        Self { store, settings }
    }

    /// Ensure the table exists and is active, creating it if needed
    pub async fn provision(&self, descriptor: &TableDescriptor) -> Result<TableState> {
        let table = descriptor.table_name();

        match self.store.describe_table(table).await {
            Ok(TableStatus::Active) => {
                info!(table, "Table already exists");
                Ok(TableState::AlreadyExisted)
            },
            Ok(TableStatus::Deleting) => Err(LoaderError::Provision {
                table: table.to_string(),
                source: StoreError::service("TableDeleting", "table is being deleted"),
            }),
            Ok(status) => {
                debug!(table, ?status, "Table exists but is not active yet");
                self.wait_until_active(table).await?;
                Ok(TableState::AlreadyExisted)
            },
            Err(StoreError::TableNotFound(_)) => {
                info!(table = %descriptor, "Creating table");
                let state = match self.store.create_table(descriptor).await {
                    Ok(()) => TableState::Created,
                    // Someone else created it between describe and create,
                    // so it may already hold items
                    Err(StoreError::TableExists(_)) => {
                        warn!(table, "Table appeared while creating it");
                        TableState::AlreadyExisted
                    },
                    Err(source) => {
                        return Err(LoaderError::Provision {
                            table: table.to_string(),
                            source,
                        })
                    },
                };
                self.wait_until_active(table).await?;
                if state == TableState::Created {
                    info!(table, "Table created");
                }
                Ok(state)
            },
            Err(source) => Err(LoaderError::Provision {
                table: table.to_string(),
                source,
            }),
        }
    }

    /// [`provision`](Self::provision) reduced to a yes/no; failures are logged
    pub async fn ensure_table(&self, descriptor: &TableDescriptor) -> bool {
        match self.provision(descriptor).await {
            Ok(_) => true,
            Err(err) => {
                error!(table = descriptor.table_name(), "{}", err);
                false
            },
        }
    }

    async fn wait_until_active(&self, table: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.store.describe_table(table).await {
                Ok(TableStatus::Active) => return Ok(()),
                Ok(status) => debug!(table, ?status, "Waiting for table"),
                // Freshly created tables can take a moment to become visible
                Err(StoreError::TableNotFound(_)) => debug!(table, "Table not visible yet"),
                Err(source) => {
                    return Err(LoaderError::Provision {
                        table: table.to_string(),
                        source,
                    })
                },
            }

            if started.elapsed() >= self.settings.active_timeout {
                return Err(LoaderError::ProvisionTimeout {
                    table: table.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::StoreResult;
    use crate::store::{MemoryStore, PutReport, ScanPage};
    use tabseed_common::Record;

    fn settings() -> ProvisionSettings {
        ProvisionSettings {
            poll_interval: Duration::from_millis(1),
            active_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_creates_missing_table() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Provisioner::new(store.clone(), settings());
        let d = TableDescriptor::new("usuarios", "email", None::<String>).unwrap();

        assert_eq!(provisioner.provision(&d).await.unwrap(), TableState::Created);
        assert!(store.has_table("usuarios"));
        assert_eq!(provisioner.provision(&d).await.unwrap(), TableState::AlreadyExisted);
    }

    /// A table that never leaves CREATING
    struct StuckStore;

    #[async_trait::async_trait]
    impl TableStore for StuckStore {
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn describe_table(&self, _table: &str) -> StoreResult<TableStatus> {
            Ok(TableStatus::Creating)
        }

        async fn create_table(&self, _descriptor: &TableDescriptor) -> StoreResult<()> {
            Ok(())
        }

        async fn put_batch(&self, _d: &TableDescriptor, _items: &[Record]) -> StoreResult<PutReport> {
            Ok(PutReport::default())
        }

        async fn delete_batch(&self, _d: &TableDescriptor, _keys: &[Record]) -> StoreResult<usize> {
            Ok(0)
        }

        async fn scan_keys(
            &self,
            _d: &TableDescriptor,
            _limit: Option<usize>,
            _start: Option<Record>,
        ) -> StoreResult<ScanPage> {
            Ok(ScanPage::default())
        }
    }

    #[tokio::test]
    async fn test_times_out_waiting_for_active() {
        let provisioner = Provisioner::new(Arc::new(StuckStore), settings());
        let d = TableDescriptor::new("pedidos", "local_id", Some("pedido_id")).unwrap();

        let err = provisioner.provision(&d).await.unwrap_err();
        assert!(matches!(err, LoaderError::ProvisionTimeout { .. }));
        assert!(!provisioner.ensure_table(&d).await);
    }

    /// Reports the table missing, then loses the create race to another writer
    #[derive(Default)]
    struct RacedStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl TableStore for RacedStore {
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn describe_table(&self, table: &str) -> StoreResult<TableStatus> {
            self.inner.describe_table(table).await
        }

        async fn create_table(&self, descriptor: &TableDescriptor) -> StoreResult<()> {
            let mut existing = Record::new();
            existing.insert("local_id".into(), serde_json::json!("L999"));
            self.inner.seed(descriptor, vec![existing]);
            Err(StoreError::TableExists(descriptor.table_name().to_string()))
        }

        async fn put_batch(&self, d: &TableDescriptor, items: &[Record]) -> StoreResult<PutReport> {
            self.inner.put_batch(d, items).await
        }

        async fn delete_batch(&self, d: &TableDescriptor, keys: &[Record]) -> StoreResult<usize> {
            self.inner.delete_batch(d, keys).await
        }

        async fn scan_keys(
            &self,
            d: &TableDescriptor,
            limit: Option<usize>,
            start: Option<Record>,
        ) -> StoreResult<ScanPage> {
            self.inner.scan_keys(d, limit, start).await
        }
    }

    #[tokio::test]
    async fn test_lost_create_race_counts_as_existing() {
        let store = Arc::new(RacedStore::default());
        let provisioner = Provisioner::new(store.clone(), settings());
        let d = TableDescriptor::new("locales", "local_id", None::<String>).unwrap();

        assert_eq!(provisioner.provision(&d).await.unwrap(), TableState::AlreadyExisted);
        assert_eq!(store.inner.item_count("locales"), 1);
    }

    #[tokio::test]
    async fn test_ensure_table_reports_success() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Provisioner::new(store, settings());
        let d = TableDescriptor::new("tokens", "token", None::<String>).unwrap();
        assert!(provisioner.ensure_table(&d).await);
    }
}
