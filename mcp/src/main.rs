use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pyrus_mcp_runtime::{DEFAULT_API_URL, RuntimeConfig, run};

#[derive(Parser)]
#[command(
    name = "pyrus-mcp",
    version,
    about = "Pyrus MCP server — task-management tools over stdio"
)]
struct Cli {
    /// Pyrus API base URL
    #[arg(long, env = "PYRUS_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Path to the accounts configuration file
    #[arg(long, env = "PYRUS_MCP_ACCOUNTS")]
    accounts: Option<PathBuf>,

    /// Log file path (stdout carries the MCP protocol, so logs go to a file)
    #[arg(long, env = "PYRUS_MCP_LOG")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_file);

    let config = RuntimeConfig {
        accounts_path: cli
            .accounts
            .unwrap_or_else(pyrus_mcp_runtime::default_accounts_path),
        api_url: cli.api_url,
    };
    let code = run(config).await;
    std::process::exit(code);
}

fn init_logging(log_file: Option<PathBuf>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let path = log_file.unwrap_or_else(pyrus_mcp_runtime::default_log_path);

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        Err(err) => {
            // Stderr is free; only stdout belongs to the protocol.
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::io::stderr),
                )
                .init();
            tracing::warn!("could not open log file {}: {err}", path.display());
        }
    }
}
