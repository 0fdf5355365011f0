//! Error types for pacerpc.

use thiserror::Error;

use crate::sm::SmStatus;

/// Error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad argument: zero-length buffer, oversized request, wrong role.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Session window is full.
    #[error("no free request slot in session {0}")]
    NoFreeSlot(u16),

    /// Session not found.
    #[error("session {0} not found")]
    SessionNotFound(u16),

    /// Session is not connected yet.
    #[error("session {0} is not connected")]
    SessionNotConnected(u16),

    /// Session left the connected state before the operation completed.
    #[error("session {0} is disconnected")]
    SessionDisconnected(u16),

    /// Remote endpoint is not registered with the remote Nexus.
    #[error("remote endpoint {0} not registered")]
    InvalidRemote(u8),

    /// Remote endpoint has no free session slot.
    #[error("remote endpoint has no free sessions")]
    NoSessions,

    /// Endpoints disagree on the transport type.
    #[error("transport mismatch: local type {local}, remote type {remote}")]
    TransportMismatch { local: u8, remote: u8 },

    /// Local endpoint was destroyed while work was in flight.
    #[error("endpoint {0} is gone")]
    EndpointGone(u8),

    /// Message larger than the configured cap.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Malformed packet received or constructed.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Invalid magic number in a packet header.
    #[error("invalid magic: expected {expected:#x}, got {got:#x}")]
    InvalidMagic { expected: u8, got: u8 },

    /// Buffer too small for the requested operation.
    #[error("buffer too small: required {required} bytes, available {available} bytes")]
    BufferTooSmall { required: usize, available: usize },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error from the transport or the management socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map a non-ok management reply status to the matching error.
    pub fn from_sm_status(status: SmStatus, remote_endpoint_id: u8) -> Self {
        match status {
            SmStatus::Ok => Error::InvalidArgument("ok status is not an error".into()),
            SmStatus::InvalidRemote => Error::InvalidRemote(remote_endpoint_id),
            SmStatus::NoSessions => Error::NoSessions,
            SmStatus::TransportMismatch => Error::TransportMismatch { local: 0, remote: 0 },
        }
    }
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
