//! In-memory table store
//!
//! Tables are created active immediately and keep their items ordered by
//! key, so scans paginate deterministically. Used by `tabseed load --dry-run`
//! and as the base of the fault-injecting store in the integration tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tabseed_common::{Record, TableDescriptor};

use super::{ItemFault, PutReport, ScanPage, TableStatus, TableStore, MAX_BATCH_ITEMS};
use crate::error::{StoreError, StoreResult};

#[derive(Debug)]
struct MemoryTable {
    descriptor: TableDescriptor,
    /// Items keyed by the JSON text of their key projection
    items: BTreeMap<String, Record>,
}

impl MemoryTable {
    fn key_text(&self, record: &Record) -> Option<String> {
        self.descriptor
            .key_of(record)
            .map(|key| serde_json::Value::Object(key).to_string())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `descriptor`'s table (if needed) holding `items`
    pub fn seed(&self, descriptor: &TableDescriptor, items: impl IntoIterator<Item = Record>) {
        let mut tables = self.tables();
        let table = tables
            .entry(descriptor.table_name().to_string())
            .or_insert_with(|| MemoryTable {
                descriptor: descriptor.clone(),
                items: BTreeMap::new(),
            });
        for item in items {
            if let Some(key) = table.key_text(&item) {
                table.items.insert(key, item);
            }
        }
    }

    /// Snapshot of a table's items in key order
    pub fn items(&self, table: &str) -> Vec<Record> {
        self.tables()
            .get(table)
            .map(|t| t.items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn item_count(&self, table: &str) -> usize {
        self.tables().get(table).map_or(0, |t| t.items.len())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables().contains_key(table)
    }
}

fn check_batch_len(len: usize) -> StoreResult<()> {
    if len > MAX_BATCH_ITEMS {
        return Err(StoreError::service(
            "ValidationException",
            format!("batch of {len} exceeds the {MAX_BATCH_ITEMS} item limit"),
        ));
    }
    Ok(())
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus> {
        if self.has_table(table) {
            Ok(TableStatus::Active)
        } else {
            Err(StoreError::TableNotFound(table.to_string()))
        }
    }

    async fn create_table(&self, descriptor: &TableDescriptor) -> StoreResult<()> {
        let mut tables = self.tables();
        if tables.contains_key(descriptor.table_name()) {
            return Err(StoreError::TableExists(descriptor.table_name().to_string()));
        }
        tables.insert(
            descriptor.table_name().to_string(),
            MemoryTable {
                descriptor: descriptor.clone(),
                items: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn put_batch(
        &self,
        descriptor: &TableDescriptor,
        items: &[Record],
    ) -> StoreResult<PutReport> {
        check_batch_len(items.len())?;
        let table = descriptor.table_name();

        let mut tables = self.tables();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;

        let mut report = PutReport::default();
        for (index, item) in items.iter().enumerate() {
            match target.key_text(item) {
                Some(key) => {
                    target.items.insert(key, item.clone());
                    report.written += 1;
                },
                None => report.rejected.push(ItemFault {
                    index,
                    reason: "item is missing a key attribute".to_string(),
                }),
            }
        }
        Ok(report)
    }

    async fn delete_batch(
        &self,
        descriptor: &TableDescriptor,
        keys: &[Record],
    ) -> StoreResult<usize> {
        check_batch_len(keys.len())?;
        let table = descriptor.table_name();

        let mut tables = self.tables();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;

        let mut applied = 0;
        for key in keys {
            let text = target
                .key_text(key)
                .ok_or_else(|| StoreError::InvalidItem("delete key is incomplete".to_string()))?;
            // Deleting an absent key is a successful no-op, as in DynamoDB
            target.items.remove(&text);
            applied += 1;
        }
        Ok(applied)
    }

    async fn scan_keys(
        &self,
        descriptor: &TableDescriptor,
        limit: Option<usize>,
        start: Option<Record>,
    ) -> StoreResult<ScanPage> {
        let tables = self.tables();
        let table = tables
            .get(descriptor.table_name())
            .ok_or_else(|| StoreError::TableNotFound(descriptor.table_name().to_string()))?;

        let lower = match start.as_ref().and_then(|s| table.key_text(s)) {
            Some(text) => Bound::Excluded(text),
            None => Bound::Unbounded,
        };
        let limit = limit.unwrap_or(usize::MAX);

        let mut page = ScanPage::default();
        let mut remaining = table.items.range((lower, Bound::Unbounded));
        for (_, item) in remaining.by_ref().take(limit) {
            if let Some(key) = descriptor.key_of(item) {
                page.keys.push(key);
            }
        }
        if remaining.next().is_some() {
            page.next = page.keys.last().cloned();
        }
        Ok(page)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("productos", "local_id", Some("nombre")).unwrap()
    }

    fn item(local: &str, nombre: &str) -> Record {
        match json!({"local_id": local, "nombre": nombre, "precio": 12.50}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_create_and_describe() {
        let store = MemoryStore::new();
        let d = descriptor();

        assert!(matches!(
            store.describe_table("productos").await,
            Err(StoreError::TableNotFound(_))
        ));
        store.create_table(&d).await.unwrap();
        assert_eq!(store.describe_table("productos").await.unwrap(), TableStatus::Active);
        assert!(matches!(store.create_table(&d).await, Err(StoreError::TableExists(_))));
    }

    #[tokio::test]
    async fn test_put_is_an_upsert() {
        let store = MemoryStore::new();
        let d = descriptor();
        store.create_table(&d).await.unwrap();

        let report = store
            .put_batch(&d, &[item("L1", "pan"), item("L1", "pan"), item("L2", "pan")])
            .await
            .unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(store.item_count("productos"), 2);
    }

    #[tokio::test]
    async fn test_put_rejects_keyless_item() {
        let store = MemoryStore::new();
        let d = descriptor();
        store.create_table(&d).await.unwrap();

        let mut keyless = item("L1", "pan");
        keyless.remove("nombre");
        let report = store.put_batch(&d, &[item("L1", "pan"), keyless]).await.unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_refused() {
        let store = MemoryStore::new();
        let d = descriptor();
        store.create_table(&d).await.unwrap();
        let items: Vec<Record> = (0..26).map(|i| item("L1", &format!("p{i}"))).collect();
        assert!(store.put_batch(&d, &items).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_paginates_then_delete() {
        let store = MemoryStore::new();
        let d = descriptor();
        store.seed(&d, (0..5).map(|i| item("L1", &format!("p{i}"))));

        let first = store.scan_keys(&d, Some(2), None).await.unwrap();
        assert_eq!(first.keys.len(), 2);
        assert_eq!(first.keys[0].len(), 2);
        assert!(first.next.is_some());

        let mut all = first.keys.clone();
        let mut cursor = first.next;
        while let Some(start) = cursor {
            let page = store.scan_keys(&d, Some(2), Some(start)).await.unwrap();
            all.extend(page.keys);
            cursor = page.next;
        }
        assert_eq!(all.len(), 5);

        assert_eq!(store.delete_batch(&d, &all).await.unwrap(), 5);
        assert_eq!(store.item_count("productos"), 0);
    }
}
