//! Tabseed Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared model types, error handling and logging for the tabseed workspace.
//!
//! # Overview
//!
//! - **Types**: table descriptors, records, the reconciliation policy and
//!   the per-table write accounting ([`types::RunTally`])
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use tabseed_common::types::TableDescriptor;
//!
//! fn main() -> tabseed_common::Result<()> {
//!     let descriptor = TableDescriptor::new("productos", "local_id", Some("nombre"))?;
//!     assert_eq!(descriptor.sort_key(), Some("nombre"));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{Record, ReconciliationPolicy, RunTally, TableDescriptor, WriteOutcome};
