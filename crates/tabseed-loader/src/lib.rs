//! Tabseed Loader Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Bulk-loads JSON record files into DynamoDB tables, creating the tables on
//! demand.
//!
//! # Overview
//!
//! - **Engine**: batched, parallel, throttling-aware writes ([`engine`])
//! - **Provisioning**: create missing tables and wait until active ([`provision`])
//! - **Reconciliation**: optional purge of existing items ([`reconcile`])
//! - **Coordinator**: the per-table pipeline and run summary ([`coordinator`])
//! - **Stores**: DynamoDB and in-memory backends behind [`store::TableStore`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabseed_common::TableDescriptor;
//! use tabseed_loader::engine::{BatchWriter, WriteSettings};
//! use tabseed_loader::source::{JsonFileSource, RecordSource};
//! use tabseed_loader::store::{DynamoStore, TableStore};
//! use tabseed_loader::store::dynamo::DynamoSettings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store: Arc<dyn TableStore> = Arc::new(DynamoStore::connect(&DynamoSettings::default()).await);
//!     let descriptor = TableDescriptor::new("locales", "local_id", None::<String>)?;
//!     let records = JsonFileSource::new("./data").load("locales.json").await?;
//!
//!     let tally = BatchWriter::new(store, WriteSettings::default())
//!         .write_all(&descriptor, records)
//!         .await;
//!     println!("{} written, {} failed", tally.success_count, tally.error_count);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod progress;
pub mod provision;
pub mod reconcile;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use coordinator::{Coordinator, RunSummary, TableReport};
pub use engine::{BatchWriter, WriteSettings};
pub use error::{LoaderError, Result, StoreError};
