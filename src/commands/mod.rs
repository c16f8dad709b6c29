//! Command Handler Module
//!
//! Receives decoded commands, executes them against the storage engine (or
//! the persistence manager) and returns RESP replies.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Expire       │
//! │  - Dispatch     │
//! │  - Validate     │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `PING`, `ECHO`
//! - `SET`, `GET`, `DEL`, `EXISTS`, `INCR`, `DECR`
//! - `LPUSH`, `RPUSH`
//! - `SAVE`, `BGSAVE`

pub mod handler;

pub use handler::{CommandError, CommandHandler, CommandResult};
