//! Shared error types for the block device proxy.

use thiserror::Error;

/// The main error type for bdproxy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error against the backing store or a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or unrecognized image structure (VHD footer/header, MBR/EBR).
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Footer, header, or partition table checksum did not verify.
    #[error("checksum verification failed: {0}")]
    ChecksumVerification(String),

    /// Format signature ("conectix", "cxsparse", 0x55AA) did not match.
    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    /// Requested feature or image variant is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Referenced partition number does not exist on this disk.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path is malformed or escapes an allowed directory.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Requested operation is invalid given the current device/session state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Operation would touch memory/storage beyond a configured safety limit.
    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    /// Generic error with a custom message.
    #[error("{0}")]
    Custom(String),
}

/// Result type alias for bdproxy operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Error::Custom(msg.into())
    }

    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Error::InvalidImage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Error::InvalidPath(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Error::LimitExceeded(msg.into())
    }
}

/// POSIX-style errno values surfaced over the wire protocol.
///
/// The wire protocol reports failures as a plain `u64` errno rather than a
/// rich error type, so every failure path eventually collapses to one of
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Errno {
    /// Success / no error.
    Success = 0,
    /// Bad file descriptor — used for read-only violations.
    EBadF = 9,
    /// No such device — unknown request code, missing backing device.
    ENoDev = 19,
    /// Argument list/object too big — oversized request length.
    E2Big = 7,
    /// Generic I/O error.
    EIo = 5,
}

impl Errno {
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Map a backing-store I/O failure onto the closest errno.
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind::*;
        match kind {
            PermissionDenied => Errno::EBadF,
            NotFound => Errno::ENoDev,
            _ => Errno::EIo,
        }
    }
}
