use std::{
    fs,
    io::IsTerminal,
    path::{Path, PathBuf},
};

use eyre::{Result, WrapErr};
use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::cli::Options;

/// Installs stdout logging plus the persistent job log under
/// `<log.dir>/<project>.log`. The returned guard flushes the job log when
/// dropped and must outlive the run.
pub fn init_tracing(opts: &Options) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_ansi(std::io::stdout().is_terminal());

    if !opts.log_dir.exists() {
        fs::create_dir_all(&opts.log_dir).wrap_err_with(|| {
            format!("failed to create log directory {}", opts.log_dir.display())
        })?;
    }
    let log_file = job_log_path(&opts.log_dir, &opts.project);
    let file = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&log_file)
        .wrap_err_with(|| format!("failed to open log file {}", log_file.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_target(include_target)
        .with_ansi(false)
        .with_writer(non_blocking);

    let subscriber = Registry::default().with(fmt_layer.and_then(file_layer).with_filter(log_filter));
    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("setting default subscriber failed")?;

    Ok(guard)
}

/// One log file per project; re-runs append to it.
pub fn job_log_path(log_dir: &Path, project: &str) -> PathBuf {
    let file_name: String = project
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
        .collect();
    log_dir.join(format!("{file_name}.log"))
}
