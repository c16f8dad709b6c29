//! # EmberKV - An In-Memory Key-Value Server
//!
//! EmberKV speaks the Redis wire protocol (RESP), keeps string and list values
//! in memory, expires keys by TTL and can snapshot the whole keyspace to disk.
//!
//! ## Features
//!
//! - **RESP**: Works with `redis-cli` and ordinary Redis client libraries
//! - **TTL Support**: Passive expiry on access plus a sampled active cycle
//! - **Snapshots**: `SAVE`, `BGSAVE` and a dirty-triggered background loop
//! - **Async I/O**: Tokio tasks, capped by a fixed-size worker pool
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              EmberKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                          ┌────────────────────┼──────────────┐          │
//! │                          ▼                                   ▼          │
//! │  ┌─────────────┐    ┌──────────────────────┐    ┌──────────────────┐   │
//! │  │   RESP      │    │    StorageEngine     │<───│   Persistence    │   │
//! │  │   Parser    │    │  Mutex<Keyspace>     │    │  snapshot file   │   │
//! │  └─────────────┘    └──────────────────────┘    └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use emberkv::{Server, ServerConfig};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(ServerConfig::default());
//!     let _ = server.persistence().load().await;
//!
//!     let listener = TcpListener::bind(server.config().bind_address()).await?;
//!     server
//!         .run(listener, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING`, `ECHO message`
//! - `SET key value [EX seconds | PX milliseconds]`
//! - `GET key`, `DEL key [key ...]`, `EXISTS key [key ...]`
//! - `INCR key`, `DECR key`
//! - `LPUSH key value [value ...]`, `RPUSH key value [value ...]`
//! - `SAVE`, `SAVE seconds changes`, `BGSAVE`
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP request parser and reply types
//! - [`storage`]: The keyspace and its expiration rules
//! - [`commands`]: Command dispatch
//! - [`persistence`]: Snapshot format, save/load and background saving
//! - [`connection`]: Client connection management
//! - [`server`]: Accept loop and worker pool

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{CommandError, CommandHandler};
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use persistence::{Persistence, PersistenceError};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::Server;
pub use storage::{ExpiryConfig, StorageEngine};

/// The default port EmberKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host EmberKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Connections served concurrently by default
pub const DEFAULT_MAX_WORKERS: usize = 50;

/// Default snapshot file name
pub const DEFAULT_SNAPSHOT_FILE: &str = "dump.rdb";

/// Version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
