//! Server Module
//!
//! Wires the storage engine, persistence manager and connection handling
//! into one runnable server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │  spawn task per client │
//!           └────────────┬───────────┘
//!                        │ acquire worker permit (max_workers)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use emberkv::{Server, ServerConfig};
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> std::io::Result<()> {
//! let server = Server::new(ServerConfig::default());
//! let _ = server.persistence().load().await;
//!
//! let listener = TcpListener::bind(server.config().bind_address()).await?;
//! server.run(listener, async { let _ = tokio::signal::ctrl_c().await; }).await;
//! # Ok(())
//! # }
//! ```

mod listener;

use crate::commands::CommandHandler;
use crate::config::ServerConfig;
use crate::connection::ConnectionStats;
use crate::persistence::Persistence;
use crate::storage::StorageEngine;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::info;

/// A configured server and its shared state.
pub struct Server {
    config: ServerConfig,
    storage: Arc<StorageEngine>,
    persistence: Arc<Persistence>,
    stats: Arc<ConnectionStats>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let storage = Arc::new(StorageEngine::new());
        let persistence = Arc::new(Persistence::new(
            Arc::clone(&storage),
            config.snapshot_path.clone(),
        ));

        Self {
            config,
            storage,
            persistence,
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Serves connections from `listener` until `shutdown` completes.
    ///
    /// On shutdown the accept loop stops and open connections are told to
    /// close. Persistence then refuses new background work, joins the save
    /// loop and awaits in-flight `BGSAVE` tasks.
    pub async fn run(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let handler = CommandHandler::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.persistence),
            self.config.expiry.clone(),
        );
        let workers = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Ok(addr) = listener.local_addr() {
            info!(
                addr = %addr,
                max_workers = self.config.max_workers,
                "Listening for connections"
            );
        }

        tokio::select! {
            _ = listener::accept_loop(
                listener,
                handler,
                workers,
                Arc::clone(&self.stats),
                shutdown_rx,
            ) => {}
            _ = shutdown => {
                info!("Shutdown signal received, stopping server...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.persistence.shutdown().await;
        self.stats.log_summary();
        info!("Server shutdown complete");
    }
}
