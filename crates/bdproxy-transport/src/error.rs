//! Transport setup/teardown errors. Per-request I/O failures are not
//! modeled here — those become wire `errno` values in `bdproxy-protocol`.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("a transport of this kind is not available on this platform: {0}")]
    Unsupported(String),

    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("a server is already bound to this name")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, TransportError>;
