//! Per-client connection state and its I/O.

mod client;
mod reply_buffer;

pub use client::{Client, ClientFlags, ClientId, ReadOutcome};
pub use reply_buffer::{ReplyBuffer, REPLY_BLOCK_LEN, REPLY_INLINE_LEN};

use std::io::{Read, Write};
use std::os::fd::AsRawFd;

/// A non-blocking byte stream a client can be served over.
pub trait Stream: Read + Write + AsRawFd + Send + 'static {}

impl<T: Read + Write + AsRawFd + Send + 'static> Stream for T {}
