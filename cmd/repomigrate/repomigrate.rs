use clap::Parser;
use repomigrate::{
    cli::{Options, run},
    initializers::init_tracing,
};
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let opts = Options::parse();

    let guard = match init_tracing(&opts) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {error:?}");
            std::process::exit(1);
        }
    };

    match run(&opts).await {
        Ok(summary) => {
            if summary.failed > 0 {
                warn!(
                    failed = summary.failed,
                    "some artifacts were not migrated; re-run the job to retry them"
                );
            }
        }
        Err(error) => {
            error!(error = ?error, "migration aborted");
            drop(guard);
            std::process::exit(1);
        }
    }
}
