//! Core traits and shared state types.
//!
//! ```text
//! ConnectionState   // CLOSED -> CONNECTING -> CONNECTED -> CLOSING -> CLOSED
//! Diagnostics       // statistics snapshot of a client
//! FrameSink         // consumer of captured frames (printer, recorder, decoder)
//! ```

use serde::{Deserialize, Serialize};

use crate::core::frame::CapturedFrame;

/// Lifecycle state of a bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport handle is open.
    #[default]
    Closed,

    /// `connect` is opening and configuring the transport.
    Connecting,

    /// Transport is bound and I/O is permitted.
    Connected,

    /// `close` is releasing the transport.
    Closing,
}

impl ConnectionState {
    /// Check if I/O is permitted.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a transport handle may be live (being opened, open, or being torn down).
    #[inline]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
        };
        write!(f, "{}", s)
    }
}

/// Statistics snapshot of a bus client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    /// CAN interface name.
    pub interface: String,

    /// Connection state at the time of the snapshot.
    pub connection_state: ConnectionState,

    /// Number of frames read.
    pub read_count: u64,

    /// Number of frames written.
    pub write_count: u64,

    /// Number of errors.
    pub error_count: u64,

    /// Last error message.
    pub last_error: Option<String>,
}

/// Consumer of frames produced by a capture thread.
///
/// Called from the capture thread; implementations must not block for long.
pub trait FrameSink: Send + Sync {
    /// Handle one accepted frame.
    fn on_frame(&self, frame: &CapturedFrame);

    /// Handle a connection state change observed by the capture thread.
    fn on_connection_changed(&self, _state: ConnectionState) {}

    /// Handle a read error.
    fn on_error(&self, _error: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Closed.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Closing.is_connected());

        assert!(!ConnectionState::Closed.is_open());
        assert!(ConnectionState::Connecting.is_open());
        assert!(ConnectionState::Closing.is_open());
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
    }

    #[test]
    fn test_connection_state_serde() {
        let json = serde_json::to_string(&ConnectionState::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        assert_eq!(ConnectionState::Closing.to_string(), "Closing");
    }
}
