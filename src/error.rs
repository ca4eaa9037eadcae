use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

/// Errors surfaced by the server core.
///
/// Transient conditions (`WouldBlock`, `Interrupted`) are handled inline at
/// the I/O call sites and never appear here. A `NetError` reaching a caller
/// means a boundary was refused or a connection is beyond recovery; none of
/// these stop the server loop on their own.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection limit reached, rejecting {0}")]
    ConnectionLimit(SocketAddr),

    #[error("command table full, refusing to register `{0}`")]
    CommandTableFull(String),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
