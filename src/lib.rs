//! roma-server: a single-threaded Redis-style server core.
//!
//! One reactor thread owns every client and runs all command processing.
//! Socket reads can optionally be spread over worker threads, joined by a
//! barrier before any parsing happens.
//!
//! # Architecture
//!
//! - `reactor`: descriptor event loop with timers over a pluggable poller (mio)
//! - `protocol`: incremental RESP multibulk / inline request parsing
//! - `network`: per-client query and reply buffers
//! - `io`: the parallel read dispatcher
//! - `server`: accept, read, write and close wiring

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Event loop, pollers and timers
pub mod reactor;

/// Redis protocol (RESP) implementation
pub mod protocol;

/// Per-client connection state
pub mod network;

/// Client table and pending queues
pub mod client_registry;

/// Parallel socket reads
pub mod io;

/// Core server implementation
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use network::{Client, ClientId};
pub use protocol::{BasicCommands, CommandHandler};
pub use reactor::{EventLoop, StopHandle};
pub use server::{EventSource, Server, ServerLoop};
