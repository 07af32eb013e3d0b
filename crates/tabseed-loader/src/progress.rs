//! Progress reporting for table loads
//!
//! The engine reports through [`ProgressObserver`]. [`LogProgress`] emits
//! `tracing` events; [`BarProgress`] drives an `indicatif` bar for
//! interactive runs.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, PoisonError};
use tabseed_common::RunTally;
use tracing::info;

/// Receives load milestones for one table at a time
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, _table: &str, _total: usize) {}

    /// Called under the tally lock; keep it cheap
    fn on_progress(&self, table: &str, tally: &RunTally);

    fn on_finish(&self, _table: &str, _tally: &RunTally) {}
}

/// Logs progress lines
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressObserver for LogProgress {
    fn on_start(&self, table: &str, total: usize) {
        info!(table, total, "Loading records");
    }

    fn on_progress(&self, table: &str, tally: &RunTally) {
        info!(
            table,
            written = tally.success_count,
            errors = tally.error_count,
            total = tally.total,
            "Progress: {}/{} ({:.1}%)",
            tally.success_count,
            tally.total,
            tally.percent_complete()
        );
    }
}

/// Progress bar per table
#[derive(Default)]
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Create a progress bar for a table load
pub fn create_load_progress(total: u64, table: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(table.to_string());
    pb
}

impl ProgressObserver for BarProgress {
    fn on_start(&self, table: &str, total: usize) {
        let mut bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        *bar = Some(create_load_progress(total as u64, table));
    }

    fn on_progress(&self, _table: &str, tally: &RunTally) {
        let bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = bar.as_ref() {
            pb.set_position(tally.accounted() as u64);
        }
    }

    fn on_finish(&self, table: &str, tally: &RunTally) {
        let mut bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = bar.take() {
            pb.set_position(tally.accounted() as u64);
            pb.finish_with_message(format!(
                "{table}: {} written, {} failed",
                tally.success_count, tally.error_count
            ));
        }
    }
}
