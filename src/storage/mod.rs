//! Storage Engine Module
//!
//! The keyspace and its expiration rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               StorageEngine                 │
//! │   Mutex<Keyspace>: entries, expires, dirty  │
//! └─────────────────────────────────────────────┘
//!          ▲                        ▲
//!          │ per command            │ on save
//!  ┌───────┴────────┐      ┌────────┴────────┐
//!  │ active expiry  │      │  persistence    │
//!  │ (sampling)     │      │  (image/restore)│
//!  └────────────────┘      └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::{now_ms, StorageEngine};
//! use bytes::Bytes;
//!
//! let engine = StorageEngine::new();
//! engine.set(Bytes::from("session"), Bytes::from("token"), Some(now_ms() - 1));
//! assert_eq!(engine.get(b"session"), Ok(None));
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{KeyspaceImage, StorageEngine, StorageError, StorageResult, StorageStats, Value};
pub use expiry::{now_ms, ExpireCycleStats, ExpiryConfig};
