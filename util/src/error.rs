use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// ErrClosed indicates an operation on a transport that was
    /// already shut down.
    #[error("transport is closed")]
    ErrClosed,

    /// ErrTimeout indicates an i/o deadline was reached before the
    /// operation completed.
    #[error("i/o timeout")]
    ErrTimeout,

    /// ErrBufferTooShort indicates the caller-supplied buffer could
    /// not hold a complete datagram.
    #[error("buffer too short")]
    ErrBufferTooShort,

    /// ErrNoRemoteAddress indicates `send` was called on an
    /// unconnected transport.
    #[error("no remote address set")]
    ErrNoRemoteAddress,

    #[error("address not found for {0}")]
    ErrAddressNotFound(String),

    #[error("stream message exceeds maximum size: {0}")]
    ErrStreamMessageTooLarge(usize),

    #[error("unexpected end of stream from {0}")]
    ErrStreamClosed(SocketAddr),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}
