//! Error types for paqet
//!
//! This module defines the custom error types used throughout the
//! application.

use std::io;
use thiserror::Error;

/// Main error type for paqet operations
#[derive(Error, Debug)]
pub enum PaqetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// In-band protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Raw socket error
    #[error("Socket error: {0}")]
    Socket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Errors produced while encoding or decoding in-band protocol frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame type byte
    #[error("unknown protocol type: 0x{0:02x}")]
    UnknownType(u8),

    /// Unknown address type byte in a PTCP/PUDP frame
    #[error("unknown address type: 0x{0:02x}")]
    UnknownAddrType(u8),

    /// Frame requires an address but none was supplied
    #[error("addr is nil")]
    NilAddr,

    /// Hostname longer than the 255-byte wire limit
    #[error("hostname too long: {0} bytes")]
    HostnameTooLong(usize),

    /// IO error while reading or writing a frame
    #[error("frame IO: {0}")]
    Io(#[from] io::Error),
}

impl From<PaqetError> for io::Error {
    fn from(err: PaqetError) -> Self {
        match err {
            PaqetError::Io(e) => e,
            PaqetError::Timeout(m) => io::Error::new(io::ErrorKind::TimedOut, m),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
