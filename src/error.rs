//! # Error Types
//!
//! Error handling for the session networking stack.
//!
//! Every failure that can occur while framing, decoding, authenticating or
//! routing traffic is represented by [`ProtocolError`]. Each variant maps to
//! one [`ErrorCategory`], and the category decides how the engine reacts.
//!
//! ## Error Categories
//! - **Transport**: socket, TLS or framing failures. The affected connection is torn down.
//! - **Protocol**: unknown message type or truncated fields. The message is dropped.
//! - **Integrity**: HMAC verification failure, or key material that cannot be produced. The message is dropped.
//! - **Authorization**: wrong auth token or claimed id. The request is ignored.
//! - **Capacity**: no free slot. The new connection is refused.
//! - **Configuration**: invalid settings detected at startup.
//!
//! ## Example Usage
//! ```rust
//! use session_net::core::packet::Packet;
//! use session_net::error::{ErrorCategory, Result};
//!
//! fn first_int(bytes: &[u8]) -> Result<i32> {
//!     let mut packet = Packet::from_bytes(bytes);
//!     packet.read::<i32>()
//! }
//!
//! let err = first_int(&[1, 2]).unwrap_err();
//! assert_eq!(err.category(), ErrorCategory::Protocol);
//! ```

use std::io;
use thiserror::Error;

/// Static error messages shared by the crate.
pub mod constants {
    /// Dispatch queue errors
    pub const ERR_DISPATCHER_LOCK: &str = "Failed to acquire dispatch queue lock";

    /// Security errors
    pub const ERR_INTEGRITY_FAILURE: &str = "HMAC verification failed";
    pub const ERR_MISSING_HMAC: &str = "Packet is too short to carry an HMAC tag";
    pub const ERR_TOKEN_MISMATCH: &str = "Auth token does not match";
    pub const ERR_ID_MISMATCH: &str = "Claimed client id does not match connection slot";
    pub const ERR_EMPTY_PASSWORD: &str =
        "certificate_password must not be empty; leave it unset for an unencrypted key";

    /// Capacity errors
    pub const ERR_SERVER_FULL: &str = "Server is full";
}

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Integrity,
    Authorization,
    Capacity,
    Configuration,
}

// ProtocolError is the primary error type for all session operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {field} needs {needed} bytes, {available} available")]
    Decode {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Invalid length for {0}: {1}")]
    InvalidLength(&'static str, i32),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("Invalid enum value for {0}: {1}")]
    InvalidEnumValue(&'static str, i32),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid frame length")]
    InvalidFrameLength,

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(&'static str),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server is full ({0} slots in use)")]
    CapacityExceeded(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_)
            | Self::OversizedPacket(_)
            | Self::InvalidFrameLength
            | Self::ConnectionClosed
            | Self::NotConnected
            | Self::QueueFull
            | Self::HandshakeError(_)
            | Self::Timeout
            | Self::TlsError(_) => ErrorCategory::Transport,
            Self::Decode { .. }
            | Self::InvalidLength(..)
            | Self::InvalidUtf8
            | Self::UnknownMessageType(_)
            | Self::InvalidEnumValue(..)
            | Self::InvalidTransition { .. }
            | Self::UnexpectedMessage(_)
            | Self::Custom(_) => ErrorCategory::Protocol,
            Self::IntegrityFailure(_) | Self::SecurityError(_) => ErrorCategory::Integrity,
            Self::Unauthorized(_) => ErrorCategory::Authorization,
            Self::CapacityExceeded(_) => ErrorCategory::Capacity,
            Self::ConfigError(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether the connection that produced this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
