use crate::protocol::ProtocolError;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("fd {fd} out of range (event loop set size is {set_size})")]
    FdOutOfRange { fd: RawFd, set_size: usize },

    #[error("file event mask must contain READABLE and/or WRITABLE")]
    EmptyMask,

    #[error("no timer with id {0}")]
    TimerNotFound(u64),

    #[error("max number of clients reached")]
    MaxClients,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convert error to Redis error response
    pub fn to_resp(&self) -> Vec<u8> {
        match self {
            Error::Protocol(e) => format!("-ERR Protocol error: {}\r\n", e).into_bytes(),
            Error::MaxClients => b"-ERR max number of clients reached\r\n".to_vec(),
            _ => format!("-ERR {}\r\n", self).into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_render_as_resp_errors() {
        let err = Error::from(ProtocolError::InvalidMultibulkLength);
        assert_eq!(
            err.to_resp(),
            b"-ERR Protocol error: invalid multibulk length\r\n".to_vec()
        );
    }

    #[test]
    fn max_clients_has_redis_wording() {
        assert_eq!(
            Error::MaxClients.to_resp(),
            b"-ERR max number of clients reached\r\n".to_vec()
        );
    }
}
