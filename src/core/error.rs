//! Error types for bus operations.
//!
//! Every failure of the client is returned to the immediate caller; nothing is
//! retried internally and nothing terminates the process.

use std::io;

use thiserror::Error;

/// Main error type for all bus client operations.
#[derive(Debug, Error)]
pub enum CanbusError {
    /// Bad configuration, including an interface name that cannot be resolved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `connect` called on a client whose handle is already open.
    #[error("Already connected to CAN interface {interface}")]
    AlreadyConnected {
        /// Interface the client is bound to.
        interface: String,
    },

    /// The client's synchronization primitives are unusable.
    #[error("Lock initialization failed: {0}")]
    LockInit(String),

    /// The raw CAN socket could not be created.
    #[error("Failed to create CAN socket: {0}")]
    SocketCreate(#[source] io::Error),

    /// Binding the socket to the interface failed.
    #[error("Failed to bind CAN socket to {interface}: {source}")]
    SocketBind {
        /// Interface name.
        interface: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Setting a socket option failed.
    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        /// Option name (e.g. `CAN_RAW_ERR_FILTER`).
        option: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Read or write attempted while the client is not connected.
    #[error("CAN socket not connected")]
    NotConnected,

    /// The transport reported a read failure.
    #[error("CAN read error: {0}")]
    TransportRead(#[source] io::Error),

    /// The transport returned fewer bytes than one frame record.
    #[error("Received incomplete CAN frame ({received} of {expected} bytes)")]
    IncompleteFrame {
        /// Bytes actually read.
        received: usize,
        /// Size of one frame record.
        expected: usize,
    },

    /// The transport reported a write failure.
    #[error("CAN write error: {0}")]
    TransportWrite(#[source] io::Error),

    /// Closing the transport handle failed. Reported only; `close` still completes.
    #[error("Error closing CAN socket: {0}")]
    Close(#[source] io::Error),

    /// A frame violates the frame model (payload too long, bad length byte).
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The capture thread could not be started.
    #[error("Capture error: {0}")]
    Capture(String),
}

impl CanbusError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-frame error.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// True when the read failed because a receive timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::TransportRead(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// True when the caller may reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::NotConnected | Self::IncompleteFrame { .. } => true,
            Self::TransportRead(_) => self.is_timeout(),
            _ => false,
        }
    }
}

/// Result type alias using `CanbusError`.
pub type Result<T> = std::result::Result<T, CanbusError>;
