mod cli;

use std::process::ExitCode;

use clap::Parser;
use fragdb::VecDist;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let level = if cli.global.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let distance = VecDist::default();
    let result = cli::run(cli, distance.clone());
    distance.stats().log();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fragdb failed");
            ExitCode::FAILURE
        }
    }
}
