use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crm_bridge_service::config::{Config, LogFormat};
use crm_bridge_service::{build_bridge_state, connect_store, run_resync, serve};
use serde::Serialize;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "crm-bridge", about = "Cache-first CRM contact bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the drain and refresh loops until interrupted.
    Serve {
        /// Push writes to an in-process directory instead of the remote CRM.
        #[arg(long)]
        offline: bool,
    },
    /// Create the cache and queue tables.
    Migrate,
    /// Rebuild the cache from a full walk of the remote directory.
    Resync,
    /// Print cache freshness and queue statistics.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("load crm bridge config")?;
    init_tracing(config.log_format);

    match cli.command {
        Command::Serve { offline } => serve(config, offline).await,
        Command::Migrate => {
            if config.db_url.is_none() {
                anyhow::bail!("DB_URL or DATABASE_URL is required for migrate");
            }
            connect_store(&config).await?;
            print_json(&json!({"status": "ok", "schema": "applied"}))
        }
        Command::Resync => {
            let runtime = build_bridge_state(&config, false).await?;
            let report = run_resync(&config, &runtime).await?;
            print_json(&report)
        }
        Command::Status => {
            let runtime = build_bridge_state(&config, true).await?;
            let cache = runtime.bridge.cache_info().await?;
            let queue = runtime.bridge.queue_status().await?;
            print_json(&json!({
                "store": runtime.store.backend_name(),
                "cache": cache,
                "queue": queue,
            }))
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[allow(clippy::print_stdout, reason = "command output is the CLI's contract")]
fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("render command output")?;
    println!("{rendered}");
    Ok(())
}
