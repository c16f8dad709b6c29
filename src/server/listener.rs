//! Accept loop and bounded worker pool

use crate::commands::CommandHandler;
use crate::connection::{handle_connection, ConnectionStats};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error};

/// Accepts connections forever, handing each to its own task.
///
/// A task waits for a permit from `workers` before it touches the socket,
/// so at most `workers` connections are served at once while the rest
/// queue. The loop itself never waits on a permit. Every connection gets a
/// clone of `shutdown` and closes once it reads true.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    handler: CommandHandler,
    workers: Arc<Semaphore>,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                let stats = Arc::clone(&stats);
                let workers = Arc::clone(&workers);
                let shutdown = shutdown.clone();

                if workers.available_permits() == 0 {
                    debug!(client = %addr, "All workers busy, connection queued");
                }

                tokio::spawn(async move {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return;
                    };
                    handle_connection(stream, addr, handler, stats, shutdown).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
