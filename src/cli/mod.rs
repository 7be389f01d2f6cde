//! Command-line interface for get-app-token.
//!
//! - no subcommand - print an installation access token on stdout
//! - `for-gh-action` - mask the token and publish it as the `app_token` step output

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{AppConfig, Config, RawInputs};
use crate::github::redaction::{ActionsMaskSink, NoopSink, SecretKind, SecretSink};
use crate::github::build_broker;

/// Name of the step output written in action mode.
pub const OUTPUT_NAME: &str = "app_token";

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "get-app-token")]
#[command(author, version, about = "Generate a GitHub App installation access token", long_about = None)]
pub struct Cli {
    /// GitHub App ID
    #[arg(short, long, global = true, env = "APP_ID")]
    pub app_id: Option<String>,

    /// GitHub App private key in PEM format
    #[arg(
        short,
        long,
        global = true,
        env = "PRIVATE_KEY",
        hide_env_values = true,
        conflicts_with = "private_key_file"
    )]
    pub private_key: Option<String>,

    /// Path to the GitHub App private key file
    #[arg(short = 'f', long, global = true, env = "PRIVATE_KEY_FILE")]
    pub private_key_file: Option<PathBuf>,

    /// Repository the app is installed on, as owner/name
    #[arg(short, long, global = true, env = "GITHUB_REPOSITORY")]
    pub repository: Option<String>,

    /// GitHub API base URL (for GitHub Enterprise Server)
    #[arg(long, global = true, env = "GITHUB_API_URL")]
    pub api_url: Option<String>,

    /// Path to an optional configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Subcommand to run (if none, prints the token)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Generate a token for use in a GitHub Actions step and set the `app_token` output
    ForGhAction,
}

impl Cli {
    pub fn is_action(&self) -> bool {
        matches!(self.command, Some(Commands::ForGhAction))
    }

    pub fn raw_inputs(&self) -> RawInputs {
        RawInputs {
            app_id: self.app_id.clone(),
            private_key: self.private_key.clone(),
            private_key_file: self.private_key_file.clone(),
            repository: self.repository.clone(),
            api_url: self.api_url.clone(),
        }
    }
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, file_config: &Config) -> Result<()> {
    let sink: Arc<dyn SecretSink> = if cli.is_action() {
        Arc::new(ActionsMaskSink::stdout())
    } else {
        Arc::new(NoopSink)
    };

    let config = AppConfig::resolve(&cli.raw_inputs(), file_config)?;
    sink.mask(SecretKind::PrivateKey, &config.private_key);
    debug!(?config, "Resolved configuration");

    let broker = build_broker(&config, sink)?;
    let token = broker.get_app_token().await?;

    match cli.command {
        Some(Commands::ForGhAction) => cmd_for_gh_action(&token),
        None => {
            println!("{}", token);
            Ok(())
        }
    }
}

/// Publish the token as a step output
fn cmd_for_gh_action(token: &str) -> Result<()> {
    match std::env::var_os("GITHUB_OUTPUT") {
        Some(path) if !path.is_empty() => set_output(Path::new(&path), OUTPUT_NAME, token)?,
        _ => debug!("GITHUB_OUTPUT not set, skipping step output"),
    }

    info!("Token generated successfully");
    println!("Token generated successfully: 🔑");
    Ok(())
}

/// Append `name=value` to a GitHub Actions output file using the multi-line
/// delimiter syntax.
pub fn set_output(path: &Path, name: &str, value: &str) -> Result<()> {
    let delimiter = format!("ghadelimiter_{}", uuid::Uuid::new_v4());

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open output file: {}", path.display()))?;

    write!(file, "{}<<{}\n{}\n{}\n", name, delimiter, value, delimiter)
        .with_context(|| format!("Failed to write output file: {}", path.display()))?;

    Ok(())
}

/// Render an error for the terminal, as a workflow command in action mode.
pub fn format_error(err: &anyhow::Error, action: bool) -> String {
    if action {
        let message = format!("{:#}", err)
            .replace('%', "%25")
            .replace('\r', "%0D")
            .replace('\n', "%0A");
        format!("::error::{}", message)
    } else {
        format!("Error: {:#}", err)
    }
}

/// Print an error where the user will see it. The Actions runner reads workflow
/// commands from stdout.
pub fn report_error(err: &anyhow::Error, action: bool) {
    if action {
        println!("{}", format_error(err, true));
    } else {
        eprintln!("{}", format_error(err, false));
    }
}
