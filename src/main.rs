//! EmberKV - An In-Memory Key-Value Server
//!
//! This is the main entry point for the EmberKV server.
//! It loads the snapshot, binds the TCP listener and serves until Ctrl+C.

use anyhow::{bail, Context};
use clap::Parser;
use emberkv::{Server, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// EmberKV - An In-Memory Key-Value Server
#[derive(Parser, Debug)]
#[command(name = "emberkv", version, about, long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = emberkv::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = emberkv::DEFAULT_PORT)]
    port: u16,

    /// Maximum number of connections served at the same time
    #[arg(short, long, default_value_t = emberkv::DEFAULT_MAX_WORKERS)]
    workers: usize,

    /// Snapshot file
    #[arg(long, default_value = emberkv::DEFAULT_SNAPSHOT_FILE)]
    dbfilename: PathBuf,

    /// Save in the background every SECONDS if at least CHANGES keys changed
    #[arg(long, num_args = 2, value_names = ["SECONDS", "CHANGES"])]
    save: Option<Vec<u64>>,
}

impl Args {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_workers: self.workers,
            snapshot_path: self.dbfilename.clone(),
            ..Default::default()
        }
    }

    fn save_schedule(&self) -> anyhow::Result<Option<(Duration, u64)>> {
        match self.save.as_deref() {
            None => Ok(None),
            Some(&[seconds, changes]) => {
                if seconds == 0 {
                    bail!("--save interval must be greater than zero");
                }
                Ok(Some((Duration::from_secs(seconds), changes)))
            }
            Some(_) => bail!("--save takes exactly two values: <SECONDS> <CHANGES>"),
        }
    }
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
EmberKV v{} - In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Server started on {}
Snapshot file: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        emberkv::VERSION,
        config.bind_address(),
        config.snapshot_path.display()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = args.to_config();
    let schedule = args.save_schedule()?;
    let server = Server::new(config);

    // A bad snapshot is not fatal; whatever loaded before the error stays.
    if let Err(e) = server.persistence().load().await {
        warn!(error = %e, "Continuing with partially loaded data");
    }

    let listener = TcpListener::bind(server.config().bind_address())
        .await
        .with_context(|| format!("failed to bind {}", server.config().bind_address()))?;

    print_banner(server.config());

    if let Some((interval, changes)) = schedule {
        server
            .persistence()
            .start_background_save(interval, changes)
            .await
            .context("failed to start background save loop")?;
    }

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    server.run(listener, shutdown).await;
    info!(keys = server.storage().len(), "Goodbye");
    Ok(())
}
