//! Request framing (multibulk + inline), reply encoding and the command
//! dispatch boundary.

pub mod command;
pub mod reply;
pub mod request;

pub use command::{BasicCommands, CommandHandler};
pub use reply::RespValue;
pub use request::{Parsed, RequestKind, RequestParser};

use thiserror::Error;

/// Default size of one socket read.
pub const IO_BUF_LEN: usize = 16 * 1024;

/// Longest header or inline line accepted before a terminator shows up.
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Bulk arguments at least this large get a dedicated buffer.
pub const BIG_ARG: usize = 32 * 1024;

/// Largest accepted multibulk element count.
pub const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;

/// Largest accepted bulk argument.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// A malformed request. The display text is what the client receives after
/// `-ERR Protocol error: `.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("too big mbulk count string")]
    TooBigMultibulkCount,

    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("too big bulk count string")]
    TooBigBulkCount,

    #[error("expected '$', got '{0}'")]
    ExpectedBulk(char),

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("too big inline request")]
    TooBigInline,

    #[error("query buffer exceeded {0} bytes")]
    QueryBufferOverflow(usize),
}
