//! Error types shared by the runtime and the HTTP layer.
//!
//! Low-level layers (buffers, sockets, fibers) return these as plain
//! `Result` values. The HTTP connection is the boundary that decides whether
//! an error closes the socket silently or becomes an error response.

use std::io;

use crate::http::parser::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A deadline passed before the operation could complete
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed request framing. The peer is treated as compromised.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// A configured size limit was exceeded
    #[error("limit exceeded: {0}")]
    Limit(&'static str),

    /// The global fiber count limit was reached
    #[error("too many fibers (limit {0})")]
    TooManyFibers(usize),

    /// A fiber's future is larger than the configured stack size
    #[error("fiber frame of {size} bytes exceeds stack size {limit}")]
    StackSize { size: usize, limit: usize },

    #[error("cannot connect: {0}")]
    CantConnect(String),

    #[error("tls: {0}")]
    Tls(String),

    /// WebSocket protocol violation; a close frame has been sent
    #[error("websocket: {0}")]
    WebSocket(&'static str),

    #[error("bad state: {0}")]
    BadState(&'static str),

    #[error("bad argument: {0}")]
    BadArgs(String),
}

impl Error {
    /// True when the transport is unusable and no response should be attempted.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Closed | Error::Io(_) | Error::Protocol(_) | Error::Tls(_) | Error::WebSocket(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
