use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use get_app_token::cli::{self, Cli};
use get_app_token::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            cli::report_error(&e, cli.is_action());
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; stdout is reserved for the token and workflow commands
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!("Starting get-app-token v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cli.config {
        tracing::info!("Loaded configuration from {}", path.display());
    }

    match cli::run_command(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Failed to generate app token");
            cli::report_error(&e, cli.is_action());
            ExitCode::FAILURE
        }
    }
}
