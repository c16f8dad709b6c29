//! RESP Protocol Implementation
//!
//! Requests arrive as arrays of bulk strings and are decoded by [`RespParser`]
//! into plain argument vectors. Replies are built as [`RespValue`]s and
//! serialized back onto the socket.
//!
//! ## Example
//!
//! ```
//! use emberkv::protocol::{parse_command, RespValue};
//! use bytes::Bytes;
//!
//! let (args, _) = parse_command(b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n").unwrap().unwrap();
//! let reply = RespValue::bulk_string(args[1].clone());
//! assert_eq!(reply.serialize(), b"$5\r\nhello\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_command, ParseError, ParseResult, RespParser};
pub use types::RespValue;
