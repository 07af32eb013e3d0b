//! Run coordinator
//!
//! Runs the tables of a load one after another:
//!
//! ```text
//! provision -> purge (replace policy, pre-existing tables) -> read input -> write
//! ```
//!
//! A failure at any step marks that table failed and moves on to the next.
//! Nothing below this level aborts the run.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tabseed_common::{ReconciliationPolicy, RunTally};
use tracing::{error, info, warn};

use crate::config::TablePlan;
use crate::engine::BatchWriter;
use crate::provision::{Provisioner, TableState};
use crate::reconcile::{PurgeReport, Reconciler};
use crate::source::RecordSource;

/// Outcome of one table's pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TableState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge: Option<PurgeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<RunTally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl TableReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            passed: false,
            state: None,
            purge: None,
            tally: None,
            failure: None,
        }
    }

    fn fail(mut self, reason: impl Into<String>) -> Self {
        self.passed = false;
        self.failure = Some(reason.into());
        self
    }
}

/// Per-table results of a run, in execution order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub policy: ReconciliationPolicy,
    pub tables: Vec<TableReport>,
    pub duration_seconds: f64,
}

impl RunSummary {
    pub fn passed_count(&self) -> usize {
        self.tables.iter().filter(|t| t.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.tables.len() - self.passed_count()
    }

    pub fn all_passed(&self) -> bool {
        self.tables.iter().all(|t| t.passed)
    }

    pub fn get(&self, table: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Log one line per table plus the totals
    pub fn log(&self) {
        for report in &self.tables {
            let (written, errors) = report
                .tally
                .map_or((0, 0), |t| (t.success_count, t.error_count));
            if report.passed {
                info!(table = %report.table, written, errors, "PASS");
            } else {
                warn!(
                    table = %report.table,
                    written,
                    errors,
                    reason = report.failure.as_deref().unwrap_or("item errors"),
                    "FAIL"
                );
            }
        }
        info!(
            passed = self.passed_count(),
            failed = self.failed_count(),
            duration_secs = self.duration_seconds,
            "Load finished"
        );
    }
}

pub struct Coordinator {
    provisioner: Provisioner,
    reconciler: Reconciler,
    writer: BatchWriter,
    source: Arc<dyn RecordSource>,
    policy: ReconciliationPolicy,
}

impl Coordinator {
    pub fn new(
        provisioner: Provisioner,
        reconciler: Reconciler,
        writer: BatchWriter,
        source: Arc<dyn RecordSource>,
        policy: ReconciliationPolicy,
    ) -> Self {
        Self {
            provisioner,
            reconciler,
            writer,
            source,
            policy,
        }
    }

    /// Run every table in order and summarise
    pub async fn run(&self, plans: &[TablePlan]) -> RunSummary {
        let started = Instant::now();
        info!(tables = plans.len(), policy = %self.policy, "Starting load");

        let mut tables = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            info!(
                "[{}/{}] {}",
                index + 1,
                plans.len(),
                plan.descriptor
            );
            tables.push(self.run_table(plan).await);
        }

        RunSummary {
            policy: self.policy,
            tables,
            duration_seconds: started.elapsed().as_secs_f64(),
        }
    }

    /// Provision, reconcile and load one table
    pub async fn run_table(&self, plan: &TablePlan) -> TableReport {
        let descriptor = &plan.descriptor;
        let table = descriptor.table_name();
        let mut report = TableReport::new(table);

        let state = match self.provisioner.provision(descriptor).await {
            Ok(state) => state,
            Err(err) => {
                error!(table, "Skipping table: {}", err);
                return report.fail(err.to_string());
            },
        };
        report.state = Some(state);

        // Create-only tables keep whatever they hold, whatever the policy
        let Some(file) = &plan.file else {
            info!(table, "No input file, table provisioned only");
            report.passed = true;
            return report;
        };

        // A table created by this run is known to be empty
        if state == TableState::AlreadyExisted {
            match self.reconciler.apply_policy(descriptor, self.policy).await {
                Ok(purge) => report.purge = Some(purge),
                Err(err) => {
                    error!(table, "Skipping table: {}", err);
                    return report.fail(err.to_string());
                },
            }
        }

        let records = match self.source.load(file).await {
            Ok(records) => records,
            Err(err) => {
                error!(table, "Skipping table: {}", err);
                return report.fail(err.to_string());
            },
        };

        let tally = self.writer.write_all(descriptor, records).await;
        report.passed = tally.passed();
        report.tally = Some(tally);
        report
    }
}
