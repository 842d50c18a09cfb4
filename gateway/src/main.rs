mod config;
mod logging;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "gateway")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the multi-cluster aggregation API
    Aggregator(AggregatorArgs),
}

#[derive(Args)]
struct AggregatorArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Metrics(#[from] shared::metrics::MetricsError),
    #[error(transparent)]
    Aggregator(#[from] aggregator::RunError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Aggregator(args) => run_aggregator(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The subscriber may not be installed yet if config loading failed.
            eprintln!("error: {e}");
            tracing::error!(error = %e, "Exiting");
            ExitCode::FAILURE
        }
    }
}

fn run_aggregator(args: AggregatorArgs) -> Result<(), CliError> {
    let config = config::Config::from_file(&args.config_file_path)?;
    let _sentry = logging::init(&config.logging);

    if let Some(metrics) = &config.metrics {
        shared::metrics::install_statsd(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!("Starting aggregator");
    runtime.block_on(aggregator::run(config.aggregator, config.registry))?;
    Ok(())
}
