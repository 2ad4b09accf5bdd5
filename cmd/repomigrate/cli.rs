use std::path::PathBuf;

use clap::{ArgAction, Parser as ClapParser};
use eyre::{Result, WrapErr};
use repomigrate_pipeline::{
    catalog::ArtifactoryCatalog,
    config::{Environment, EnvironmentConfig, RunOptions},
    destination::{BkRepoStore, NamespaceBootstrap},
    planner::MigrationPlanner,
    report::MigrationReport,
    runner::{MigrationRunner, MigrationSummary},
    scope::Scope,
};
use tracing::{Level, info, warn};

const MAX_CONCURRENCY: u64 = 32;

#[derive(ClapParser, Debug, Clone)]
#[command(
    name = "repomigrate",
    version,
    about = "Migrate artifacts and their metadata from the source artifact store into a destination project"
)]
pub struct Options {
    #[arg(
        long = "project",
        value_name = "PROJECT",
        help = "Project to migrate. Also names the destination project and the job log file.",
        help_heading = "Job options",
        env = "REPOMIGRATE_PROJECT"
    )]
    pub project: String,
    #[arg(
        long = "env",
        value_name = "ENVIRONMENT",
        value_parser = clap::value_parser!(Environment),
        help = "Environment whose endpoints and credentials are used.",
        long_help = "Possible values: test, prod. Endpoints are read from REPOMIGRATE_<ENV>_* variables.",
        help_heading = "Job options",
        env = "REPOMIGRATE_ENV"
    )]
    pub environment: Environment,
    #[arg(
        long = "overwrite",
        action = ArgAction::SetTrue,
        help = "Re-send artifacts the destination already holds.",
        help_heading = "Job options",
        env = "REPOMIGRATE_OVERWRITE"
    )]
    pub overwrite: bool,
    #[arg(
        long = "scope-file",
        value_name = "SCOPE_FILE",
        help = "JSON file restricting the job to explicit paths and nodes.",
        long_help = "Format: {\"paths\": [..], \"nodes\": [..], \"whole_project\": false}. Without it the whole project is migrated.",
        help_heading = "Job options",
        env = "REPOMIGRATE_SCOPE_FILE"
    )]
    pub scope_file: Option<PathBuf>,
    #[arg(
        long = "operator",
        value_name = "USER",
        default_value = "admin",
        help = "Actor used for administrative calls on the destination.",
        help_heading = "Job options",
        env = "REPOMIGRATE_OPERATOR"
    )]
    pub operator: String,
    #[arg(
        long = "concurrency",
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..=MAX_CONCURRENCY),
        help = "Artifacts transferred at the same time (1-32).",
        help_heading = "Job options",
        env = "REPOMIGRATE_CONCURRENCY"
    )]
    pub concurrency: u64,
    #[arg(
        long = "report-file",
        value_name = "REPORT_FILE",
        help = "Write a JSON summary of the run to this file.",
        help_heading = "Job options",
        env = "REPOMIGRATE_REPORT_FILE"
    )]
    pub report_file: Option<PathBuf>,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Log options",
        env = "REPOMIGRATE_LOG_LEVEL"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.dir",
        value_name = "LOG_DIR",
        default_value = "logs",
        help = "Directory holding the per-project job logs.",
        help_heading = "Log options",
        env = "REPOMIGRATE_LOG_DIR"
    )]
    pub log_dir: PathBuf,
}

impl Options {
    pub fn load_scope(&self) -> Result<Scope> {
        match &self.scope_file {
            Some(path) => Scope::from_file(path)
                .wrap_err_with(|| format!("failed to load scope file {}", path.display())),
            None => Ok(Scope::whole_project()),
        }
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            overwrite: self.overwrite,
            concurrency: usize::try_from(self.concurrency).unwrap_or(1),
        }
    }
}

/// Bootstraps the destination namespace and runs the migration. Errors are
/// run-fatal; artifact-level failures only show up in the summary.
pub async fn run(opts: &Options) -> Result<MigrationSummary> {
    let config = EnvironmentConfig::from_env(opts.environment)
        .wrap_err_with(|| format!("failed to load {} environment", opts.environment))?
        .into_migration_config(&opts.project);
    let scope = opts.load_scope()?;

    let catalog = ArtifactoryCatalog::new(config.source.clone(), config.request_timeout)
        .wrap_err("failed to build source client")?;
    let store = BkRepoStore::new(
        config.destination.clone(),
        opts.operator.clone(),
        config.request_timeout,
    )
    .wrap_err("failed to build destination client")?;

    info!(
        project = %opts.project,
        environment = %opts.environment,
        source = %config.source.base_url,
        destination = %config.destination.base_url,
        "starting migration"
    );

    store
        .ensure_namespace()
        .await
        .wrap_err("failed to bootstrap destination namespace")?;

    let run_options = opts.run_options();
    let runner = MigrationRunner::new(
        &catalog,
        &store,
        MigrationPlanner::new(&config.source.root),
        run_options,
    );
    let summary = runner.run(&scope).await?;

    if let Some(path) = &opts.report_file {
        let report =
            MigrationReport::new(&opts.project, opts.environment, run_options.overwrite, &summary);
        match report.write_to(path) {
            Ok(()) => info!(path = %path.display(), "report written"),
            Err(error) => warn!(path = %path.display(), error = %error, "failed to write report"),
        }
    }

    Ok(summary)
}
