//! Connection Handler Module
//!
//! Each client gets its own handler task that runs in a loop, reading
//! commands and sending responses.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Worker permit acquired, handler created
//!        │
//!        ▼
//! 2. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  Read bytes from socket      │
//!    │              │               │
//!    │              ▼               │
//!    │  Parse every complete frame  │──── framing error ──> reply, close
//!    │              │               │
//!    │              ▼               │
//!    │  Execute, queue replies      │
//!    │              │               │
//!    │              ▼               │
//!    │  Flush, loop back            │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 3. Client disconnects / error / server shutdown, handler task ends
//! ```
//!
//! ## Buffer Management
//!
//! TCP is a stream protocol: one read may carry half a command, or several
//! commands back to back. Bytes accumulate in a `BytesMut` until the parser
//! finds a complete frame. Replies are serialized into one reusable write
//! buffer, and replies to pipelined commands are flushed together.

use crate::commands::CommandHandler;
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Default maximum size for the read buffer (64 MB). Larger than the biggest
/// bulk string the parser accepts, so a legal frame always fits.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Logs the current totals at info level.
    pub fn log_summary(&self) {
        info!(
            connections = self.connections_accepted.load(Ordering::Relaxed),
            active = self.active_connections.load(Ordering::Relaxed),
            commands = self.commands_processed.load(Ordering::Relaxed),
            bytes_read = self.bytes_read.load(Ordering::Relaxed),
            bytes_written = self.bytes_written.load(Ordering::Relaxed),
            "Connection statistics"
        );
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Limit on buffered unparsed input
    max_buffer: usize,

    /// Scratch buffer each reply is serialized into
    write_buf: BytesMut,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    parser: RespParser,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,

    /// Flips to true when the server stops
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            max_buffer: MAX_BUFFER_SIZE,
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::new(),
            stats,
            shutdown,
        }
    }

    /// Overrides the limit on buffered unparsed input.
    pub fn with_max_buffer_size(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Runs the main connection loop until the client disconnects or an
    /// error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::ServerShutdown => {
                    debug!(client = %self.addr, "Closing connection for shutdown")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let mut replied = false;

            loop {
                let args = match self.try_parse_command() {
                    Ok(Some(args)) => args,
                    Ok(None) => break,
                    Err(e) => {
                        // The stream position is lost; report and hang up.
                        let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                        self.queue_response(&reply).await?;
                        self.stream.flush().await?;
                        return Err(e.into());
                    }
                };

                let response = self.command_handler.execute(&args).await;
                self.stats.command_processed();
                self.queue_response(&response).await?;
                replied = true;
            }

            if replied {
                self.stream.flush().await?;
            }

            self.read_more_data().await?;
        }
    }

    /// Attempts to parse one command from the buffer.
    fn try_parse_command(&mut self) -> Result<Option<Vec<Bytes>>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse_command(&self.buffer) {
            Ok(Some((args, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Ok(Some(args))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete command, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Protocol error");
                Err(e)
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= self.max_buffer {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        if *self.shutdown.borrow() {
            return Err(ConnectionError::ServerShutdown);
        }

        let n = tokio::select! {
            result = self.stream.get_mut().read_buf(&mut self.buffer) => result?,
            // A dropped sender means the server is gone too.
            _ = self.shutdown.changed() => return Err(ConnectionError::ServerShutdown),
        };

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                // Partial command in buffer
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Writes a response into the outgoing buffer without flushing.
    async fn queue_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        response.serialize_into(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;

        let len = self.write_buf.len();
        self.stats.bytes_written(len);
        trace!(client = %self.addr, bytes = len, "Queued response");
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed request frame
    #[error("Protocol error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// The server is stopping
    #[error("Server shutting down")]
    ServerShutdown,
}

/// Creates a ConnectionHandler and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, shutdown);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected | ConnectionError::ServerShutdown => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
