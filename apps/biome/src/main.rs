use biome_client_core::telemetry::logging;
use biome_client_core::terminal::app;
use biome_client_core::terminal::cli::Cli;
use biome_client_core::terminal::error::CliError;
use clap::Parser;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    let _logs = logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    app::run(cli).await
}
