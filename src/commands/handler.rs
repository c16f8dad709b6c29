//! Command Handler Module
//!
//! Dispatches decoded commands to the storage engine and the persistence
//! manager.
//!
//! ## Supported Commands
//!
//! - `PING` - Test connection
//! - `ECHO message` - Echo message
//! - `SET key value [EX|PX n]` - Set a key, optionally with a TTL
//! - `GET key` - Get a key's value
//! - `DEL key [key ...]` - Delete keys
//! - `EXISTS key [key ...]` - Count existing keys
//! - `INCR key` / `DECR key` - Add or subtract one
//! - `LPUSH key value [value ...]` - Push values to the head of a list
//! - `RPUSH key value [value ...]` - Push values to the tail of a list
//! - `SAVE` - Write a snapshot now
//! - `SAVE seconds changes` - Start the background save loop
//! - `BGSAVE` - Write a snapshot in the background
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ expiry cycle│───>│  dispatch() │───>│  cmd_*()    │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                          │         │        │
//! │                                          ▼         ▼        │
//! │                                 StorageEngine  Persistence  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::persistence::{Persistence, PersistenceError};
use crate::protocol::RespValue;
use crate::storage::{now_ms, ExpiryConfig, StorageEngine, StorageError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors a command can report back to the client.
///
/// The `Display` text is the exact RESP error line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR no command specified")]
    NoCommand,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR invalid number format")]
    InvalidNumber,

    #[error("ERR invalid save parameters")]
    InvalidSaveParameters,

    #[error("ERR snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("ERR server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type CommandResult = Result<RespValue, CommandError>;

impl From<PersistenceError> for CommandError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::Closed => CommandError::ShuttingDown,
            other => CommandError::SnapshotFailed(other.to_string()),
        }
    }
}

/// Handles commands by dispatching them to the appropriate handlers.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    persistence: Arc<Persistence>,
    expiry: ExpiryConfig,
}

impl CommandHandler {
    pub fn new(
        storage: Arc<StorageEngine>,
        persistence: Arc<Persistence>,
        expiry: ExpiryConfig,
    ) -> Self {
        Self {
            storage,
            persistence,
            expiry,
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Executes a command and returns the response.
    ///
    /// `args[0]` is the command name. Before dispatch an active expiry cycle
    /// may run. Command errors become RESP error replies; they never end the
    /// connection.
    pub async fn execute(&self, args: &[Bytes]) -> RespValue {
        self.storage.maybe_expire_cycle(&self.expiry);

        match self.dispatch(args).await {
            Ok(reply) => reply,
            Err(e) => RespValue::error(e.to_string()),
        }
    }

    /// Dispatches a command to its handler.
    async fn dispatch(&self, args: &[Bytes]) -> CommandResult {
        let Some(name) = args.first() else {
            return Err(CommandError::NoCommand);
        };
        let cmd = String::from_utf8_lossy(name).to_uppercase();

        match cmd.as_str() {
            "PING" => self.cmd_ping(args),
            "ECHO" => self.cmd_echo(args),

            "SET" => self.cmd_set(args),
            "GET" => self.cmd_get(args),
            "DEL" => self.cmd_del(args),
            "EXISTS" => self.cmd_exists(args),
            "INCR" => self.cmd_incr(args),
            "DECR" => self.cmd_decr(args),

            "LPUSH" => self.cmd_lpush(args),
            "RPUSH" => self.cmd_rpush(args),

            "SAVE" => self.cmd_save(args).await,
            "BGSAVE" => self.cmd_bgsave(args),

            _ => Err(CommandError::UnknownCommand(cmd)),
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn check_arity(args: &[Bytes], ok: bool) -> Result<(), CommandError> {
        if ok {
            Ok(())
        } else {
            let name = String::from_utf8_lossy(&args[0]).to_lowercase();
            Err(CommandError::WrongArity(name))
        }
    }

    /// Parses a base-10 signed 64-bit integer argument.
    fn parse_integer(arg: &[u8]) -> Option<i64> {
        std::str::from_utf8(arg).ok()?.parse().ok()
    }

    // ========================================================================
    // Connection Commands
    // ========================================================================

    /// PING
    fn cmd_ping(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 1)?;
        Ok(RespValue::pong())
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 2)?;
        Ok(RespValue::bulk_string(args[1].clone()))
    }

    // ========================================================================
    // String Commands
    // ========================================================================

    /// SET key value [unit amount]
    ///
    /// A unit containing `EX` (or the `EAXT` spelling) means seconds, anything
    /// else means milliseconds. The amount is relative to now; zero or
    /// negative values produce a key that is already expired.
    fn cmd_set(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 3 || args.len() == 5)?;

        let expires_at = if args.len() == 5 {
            let amount = Self::parse_integer(&args[4]).ok_or(StorageError::NotAnInteger)?;
            let unit = String::from_utf8_lossy(&args[3]).to_uppercase();
            let ttl_ms = if unit.contains("EX") || unit.contains("EAXT") {
                amount.saturating_mul(1000)
            } else {
                amount
            };
            Some(now_ms().saturating_add(ttl_ms))
        } else {
            None
        };

        self.storage
            .set(args[1].clone(), args[2].clone(), expires_at);
        Ok(RespValue::ok())
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 2)?;

        Ok(match self.storage.get(&args[1])? {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        })
    }

    /// DEL key [key ...]
    fn cmd_del(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() >= 2)?;
        let deleted = self.storage.delete(&args[1..]);
        Ok(RespValue::integer(deleted as i64))
    }

    /// EXISTS key [key ...]
    fn cmd_exists(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() >= 2)?;
        let count = self.storage.exists(&args[1..]);
        Ok(RespValue::integer(count as i64))
    }

    /// INCR key
    fn cmd_incr(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 2)?;
        Ok(RespValue::integer(self.storage.incr(&args[1])?))
    }

    /// DECR key
    fn cmd_decr(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 2)?;
        Ok(RespValue::integer(self.storage.decr(&args[1])?))
    }

    // ========================================================================
    // List Commands
    // ========================================================================

    /// LPUSH key value [value ...]
    fn cmd_lpush(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() >= 3)?;
        let len = self.storage.lpush(&args[1], &args[2..])?;
        Ok(RespValue::integer(len as i64))
    }

    /// RPUSH key value [value ...]
    fn cmd_rpush(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() >= 3)?;
        let len = self.storage.rpush(&args[1], &args[2..])?;
        Ok(RespValue::integer(len as i64))
    }

    // ========================================================================
    // Persistence Commands
    // ========================================================================

    /// SAVE | SAVE seconds changes
    async fn cmd_save(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 1 || args.len() == 3)?;

        if args.len() == 1 {
            self.persistence.save().await?;
            return Ok(RespValue::ok());
        }

        let interval = Self::parse_integer(&args[1]).ok_or(CommandError::InvalidNumber)?;
        let changes = Self::parse_integer(&args[2]).ok_or(CommandError::InvalidNumber)?;
        if interval <= 0 || changes < 0 {
            return Err(CommandError::InvalidSaveParameters);
        }

        self.persistence
            .start_background_save(Duration::from_secs(interval as u64), changes as u64)
            .await?;
        Ok(RespValue::ok())
    }

    /// BGSAVE
    fn cmd_bgsave(&self, args: &[Bytes]) -> CommandResult {
        Self::check_arity(args, args.len() == 1)?;
        self.persistence.bgsave()?;
        Ok(RespValue::simple_string("Background saving started"))
    }
}
