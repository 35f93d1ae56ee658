//! Error types for the transport.

use std::fmt;

/// Error type for transport operations.
///
/// Protocol-level failures (lost peers, timed-out messages) are not errors;
/// they surface as `OpState::Failed` through the polling contract. This type
/// covers driver I/O problems and invalid caller input.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying packet device.
    Io(std::io::Error),
    /// A received datagram could not be parsed as a protocol packet.
    InvalidPacket,
    /// Unrecognized opcode byte in a packet header.
    InvalidOpcode(u8),
    /// Message payload would exceed the protocol maximum.
    MessageTooLarge { size: usize, max: usize },
    /// A wire address could not be decoded.
    InvalidAddress,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidPacket => write!(f, "Invalid packet received"),
            Error::InvalidOpcode(op) => write!(f, "Invalid opcode: {:#x}", op),
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", size, max)
            }
            Error::InvalidAddress => write!(f, "Invalid wire address"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
