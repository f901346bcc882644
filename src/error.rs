//! Error types for the IPC$ packet layer.
//!
//! Transport and resource failures are `ServerError`s and end the call that
//! hit them. Protocol problems are `SmbStatus` values that become an error
//! response on the wire.

use crate::smb::status::SmbStatus;
use std::fmt;

/// Top-level server error type.
#[derive(Debug)]
pub enum ServerError {
    /// An I/O error from the underlying transport.
    Io(std::io::Error),
    /// Connection closed by peer.
    ConnectionClosed,
    /// The session header was cut short; carries the bytes actually read.
    InvalidHeader(usize),
    /// No pooled buffer could be found for the requested size, and an
    /// unpooled allocation was not allowed.
    NoPooledMemory(usize),
    /// A protocol-level error with a specific status.
    Protocol(SmbStatus),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::InvalidHeader(len) => write!(f, "Invalid header, len={}", len),
            Self::NoPooledMemory(size) => write!(f, "No pooled memory, request size {}", size),
            Self::Protocol(s) => write!(f, "Protocol error: {:?}", s),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ServerError::ConnectionClosed,
            _ => ServerError::Io(e),
        }
    }
}

impl From<SmbStatus> for ServerError {
    fn from(s: SmbStatus) -> Self {
        ServerError::Protocol(s)
    }
}

/// Map a `ServerError` that happened while a reply was being built to the
/// status sent back to the client.
pub fn error_to_status(e: &ServerError) -> SmbStatus {
    match e {
        ServerError::NoPooledMemory(_) => SmbStatus::SrvNoResources,
        ServerError::Protocol(s) => *s,
        _ => SmbStatus::SrvNotSupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_connection_closed() {
        let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(ServerError::from(e), ServerError::ConnectionClosed));

        let e = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(ServerError::from(e), ServerError::Io(_)));
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(
            error_to_status(&ServerError::NoPooledMemory(1 << 20)),
            SmbStatus::SrvNoResources
        );
        assert_eq!(
            error_to_status(&ServerError::Protocol(SmbStatus::DosInvalidHandle)),
            SmbStatus::DosInvalidHandle
        );
        assert_eq!(
            error_to_status(&ServerError::ConnectionClosed),
            SmbStatus::SrvNotSupported
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ServerError::InvalidHeader(2).to_string(), "Invalid header, len=2");
        assert_eq!(
            ServerError::NoPooledMemory(200000).to_string(),
            "No pooled memory, request size 200000"
        );
    }
}
