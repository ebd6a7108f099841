use std::io;

use thiserror::Error;

/// Central error type for server startup and teardown.
///
/// Per-connection faults never travel through this type; they are verdicts
/// recorded in the connection state and answered on the wire.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid listen address: {0}")]
    Addr(String),

    #[error("credential store: {0}")]
    Credentials(String),

    #[error("startup: {0}")]
    Startup(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
