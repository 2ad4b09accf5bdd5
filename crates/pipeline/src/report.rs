use crate::{
    config::Environment,
    runner::{FailedUnit, MigrationSummary},
};
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use thiserror::Error;

const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Machine-readable record of a finished run.
#[derive(Debug, Serialize)]
pub struct MigrationReport<'a> {
    schema_version: u32,
    project: &'a str,
    environment: Environment,
    overwrite: bool,
    total: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    elapsed_ms: u64,
    failures: &'a [FailedUnit],
}

impl<'a> MigrationReport<'a> {
    pub fn new(
        project: &'a str,
        environment: Environment,
        overwrite: bool,
        summary: &'a MigrationSummary,
    ) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            project,
            environment,
            overwrite,
            total: summary.total,
            succeeded: summary.succeeded,
            skipped: summary.skipped,
            failed: summary.failed,
            elapsed_ms: u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            failures: &summary.failures,
        }
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
