use crate::{
    catalog::{DiscoveryError, FetchError, SourceCatalog},
    config::RunOptions,
    destination::{DestinationStore, UploadError},
    models::{TransferOutcome, TransferUnit},
    planner::MigrationPlanner,
    scope::Scope,
};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that stop a run before any artifact is processed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Errors confined to a single unit.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
}

/// Enough context to retry a failed unit by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub ordinal: usize,
    pub source_path: String,
    pub name: String,
    pub destination_path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub total: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub failures: Vec<FailedUnit>,
}

impl MigrationSummary {
    fn record(
        &mut self,
        ordinal: usize,
        unit: &TransferUnit,
        result: Result<TransferOutcome, TransferError>,
    ) {
        let total = self.total;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(
                    ordinal,
                    total,
                    source_path = %unit.record.source_path,
                    name = %unit.record.name,
                    error = %error,
                    "artifact transfer failed"
                );
                self.failures.push(FailedUnit {
                    ordinal,
                    source_path: unit.record.source_path.clone(),
                    name: unit.record.name.clone(),
                    destination_path: unit.destination_path.clone(),
                    error: error.to_string(),
                });
                TransferOutcome::Failed
            }
        };

        match outcome {
            TransferOutcome::Skipped => {
                self.skipped += 1;
                info!(ordinal, total, path = %unit.destination_path, "artifact already migrated, skipped");
            }
            TransferOutcome::Succeeded => {
                self.succeeded += 1;
                info!(
                    ordinal,
                    total,
                    path = %unit.destination_path,
                    size = unit.record.size,
                    "artifact migrated"
                );
            }
            TransferOutcome::Failed => self.failed += 1,
        }
    }
}

/// Drives one migration job: discovery, then every unit in discovery order.
pub struct MigrationRunner<'a, S, D> {
    catalog: &'a S,
    destination: &'a D,
    planner: MigrationPlanner,
    options: RunOptions,
}

impl<'a, S, D> MigrationRunner<'a, S, D>
where
    S: SourceCatalog,
    D: DestinationStore,
{
    pub fn new(
        catalog: &'a S,
        destination: &'a D,
        planner: MigrationPlanner,
        options: RunOptions,
    ) -> Self {
        Self {
            catalog,
            destination,
            planner,
            options,
        }
    }

    /// Runs the job. Only discovery can fail the run; unit failures are
    /// counted in the summary.
    ///
    /// Up to `options.concurrency` units are in flight at once. Results are
    /// consumed in discovery order by this task alone, so the tally is never
    /// shared.
    pub async fn run(&self, scope: &Scope) -> Result<MigrationSummary, RunError> {
        let started_at = Instant::now();

        let discovery = self.catalog.list_records(scope).await?;
        if !discovery.failed_queries.is_empty() {
            warn!(
                failed_queries = discovery.failed_queries.len(),
                "continuing with partial discovery"
            );
        }

        let mut summary = MigrationSummary {
            total: discovery.records.len(),
            ..MigrationSummary::default()
        };
        info!(total = summary.total, overwrite = self.options.overwrite, "discovery finished");

        let units = discovery
            .records
            .into_iter()
            .map(|record| self.planner.normalize(record))
            .enumerate();

        let mut results = stream::iter(units)
            .map(|(index, unit)| async move {
                let result = self.process(&unit).await;
                (index + 1, unit, result)
            })
            .buffered(self.options.concurrency.max(1));

        while let Some((ordinal, unit, result)) = results.next().await {
            summary.record(ordinal, &unit, result);
        }

        summary.elapsed = started_at.elapsed();
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "migration finished"
        );

        Ok(summary)
    }

    async fn process(&self, unit: &TransferUnit) -> Result<TransferOutcome, TransferError> {
        if !self
            .planner
            .needs_transfer(unit, self.options.overwrite, self.destination)
            .await
        {
            return Ok(TransferOutcome::Skipped);
        }

        self.transfer(unit).await?;
        Ok(TransferOutcome::Succeeded)
    }

    async fn transfer(&self, unit: &TransferUnit) -> Result<(), TransferError> {
        let properties = self.catalog.fetch_properties(&unit.record).await?;
        // The content is owned by the upload from here on and dropped, which
        // closes the source connection, however the upload ends.
        let content = self.catalog.fetch_content(&unit.record).await?;
        self.destination.upload(unit, content, &properties).await?;
        Ok(())
    }
}
