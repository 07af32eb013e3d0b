//! Run tally shared by the batch workers of one table

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tabseed_common::{RunTally, WriteOutcome};

use crate::progress::ProgressObserver;

/// [`RunTally`] behind a single lock.
///
/// The merge of a batch outcome and the progress check happen under the same
/// lock, so concurrent completions neither lose counts nor report the same
/// milestone twice.
pub struct SharedTally {
    table: String,
    progress_interval: usize,
    observer: Arc<dyn ProgressObserver>,
    inner: Mutex<RunTally>,
}

impl SharedTally {
    pub fn new(
        table: impl Into<String>,
        total: usize,
        progress_interval: usize,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            table: table.into(),
            progress_interval: progress_interval.max(1),
            observer,
            inner: Mutex::new(RunTally::new(total)),
        }
    }

    // A worker that panicked mid-merge must not take the counts down with it
    fn lock(&self) -> MutexGuard<'_, RunTally> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge one batch outcome, notifying the observer when the success
    /// count crosses a multiple of the progress interval or every item is
    /// accounted for.
    pub fn record(&self, outcome: WriteOutcome) {
        let mut tally = self.lock();
        let before = tally.success_count / self.progress_interval;
        tally.merge(outcome);
        let after = tally.success_count / self.progress_interval;

        if before != after || tally.is_complete() {
            self.observer.on_progress(&self.table, &tally);
        }
    }

    pub fn add_retries(&self, retries: u32) {
        self.lock().throttle_retries += retries as usize;
    }

    /// Count every item without an outcome yet as an error.
    ///
    /// Returns how many items were filled in.
    pub fn settle(&self) -> usize {
        let mut tally = self.lock();
        let missing = tally.total.saturating_sub(tally.accounted());
        if missing > 0 {
            tally.merge(WriteOutcome::failed(missing));
            self.observer.on_progress(&self.table, &tally);
        }
        missing
    }

    pub fn snapshot(&self) -> RunTally {
        *self.lock()
    }
}
