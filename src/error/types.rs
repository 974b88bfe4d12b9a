//! Error types
//!
//! Defines domain-specific error types for the control engine, the data
//! channel codec and the server-side command handlers.

use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Data channel framing errors
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("{0} is closed")]
    Closed(&'static str),
    #[error("End Of RawOutputStream")]
    EndOfStream,
    #[error("data channel timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FramingError> for io::Error {
    fn from(error: FramingError) -> Self {
        match error {
            FramingError::Io(e) => e,
            FramingError::TimedOut => io::Error::new(io::ErrorKind::TimedOut, error.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Errors raised while parsing or formatting PORT/EPRT/PASV/EPSV addresses
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("expected 6 comma separated tokens, got {0}")]
    WrongTokenCount(usize),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("no parenthesised address in reply: {0}")]
    MissingParens(String),
    #[error("malformed extended address: {0}")]
    MalformedExtended(String),
    #[error("unsupported network protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid port: {0}")]
    InvalidPort(i64),
}

/// Client-side failures, grouped the way callers need to branch on them
#[derive(Debug, Error)]
pub enum FtpError {
    /// Malformed reply, unexpected code or failed negotiation.
    #[error("{0}")]
    Protocol(String),
    /// Terminal for the current login attempt.
    #[error("{0}")]
    Login(String),
    /// Socket failure, timeout or a `550` surfaced by the server.
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
}

impl From<AddressError> for FtpError {
    fn from(error: AddressError) -> Self {
        FtpError::Protocol(error.to_string())
    }
}

/// Authentication module errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid username: {0}")]
    InvalidUsername(String),
    #[error("Login incorrect")]
    InvalidCredentials,
    #[error("User not logged in")]
    NotLoggedIn,
}

/// Storage module errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No such file or directory")]
    NotFound(String),
    #[error("Permission denied")]
    PermissionDenied(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("File exists")]
    AlreadyExists(String),
    #[error("Not a directory")]
    NotADirectory(String),
    #[error("Not a plain file")]
    NotAFile(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Classifies an I/O error raised for `path`.
    pub fn from_io(path: &str, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
            _ => StorageError::Io(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Transfer module errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Data channel not initialized")]
    DataChannelNotInitialized,
    #[error("Failed to bind to {0}: {1}")]
    PortBindingFailed(SocketAddr, io::Error),
    #[error("No available port for data connection")]
    NoAvailablePort,
    #[error("Timeout waiting for {0}")]
    ConnectionTimeout(String),
    #[error("Invalid PORT command: {0}")]
    InvalidPortCommand(String),
    #[error("IP mismatch: expected {expected}, got {provided}")]
    IpMismatch { expected: IpAddr, provided: IpAddr },
    #[error("Invalid port {0}: below the allowed client port range")]
    InvalidPortRange(u16),
    #[error("Rejected data connection from {0}")]
    ForeignPeer(SocketAddr),
    #[error("incorrect file size: expected {expected} bytes, transferred {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("file too large (max {0} bytes)")]
    FileTooLarge(u64),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Transfer failed: {0}")]
    TransferFailed(#[from] io::Error),
}

/// Server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
