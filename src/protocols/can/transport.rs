//! Transport abstraction underneath the bus client.
//!
//! A [`Connector`] performs the connect sequence (create socket, resolve the
//! interface, bind, set options) and yields a [`Transport`] that moves exactly
//! one fixed-size frame record per call.

use std::io;

use crate::core::error::Result;
use crate::core::frame::FRAME_SIZE;

use super::config::CanConfig;

/// One open bus socket.
///
/// `recv` and `send` take `&self`: the client calls them from several threads
/// at once and serializes them with its own locks.
pub trait Transport: Send + Sync + 'static {
    /// Read one frame record. Returns the number of bytes read.
    fn recv(&self, record: &mut [u8; FRAME_SIZE]) -> io::Result<usize>;

    /// Write one frame record. Returns the number of bytes written.
    fn send(&self, record: &[u8; FRAME_SIZE]) -> io::Result<usize>;

    /// Release the socket, reporting any close-time error.
    fn close(self) -> io::Result<()>;

    /// OS descriptor for diagnostics, if there is one.
    fn descriptor(&self) -> Option<i32> {
        None
    }
}

/// Opens transports for a configuration.
pub trait Connector: Send + Sync + 'static {
    /// Transport produced by this connector.
    type Transport: Transport;

    /// Run the full connect sequence.
    ///
    /// Each step failure maps to its own error variant: `SocketCreate`,
    /// `Config` (interface resolution), `SocketBind`, `SocketOption`.
    /// A partially opened socket is released before the error is returned.
    fn open(&self, config: &CanConfig) -> Result<Self::Transport>;
}
