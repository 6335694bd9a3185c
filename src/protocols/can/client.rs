//! CAN bus client.
//!
//! One [`BusClient`] owns at most one open connection and is shared between
//! threads through `Arc`. The lifecycle is
//!
//! ```text
//! Closed --connect--> Connecting --ok--> Connected --close--> Closing --> Closed
//!                         |
//!                         +--err--> Closed
//! ```
//!
//! Locking:
//! - `state` (the state lock) guards every transition and is held only for the
//!   assignment, never across socket I/O.
//! - Each connection carries its own write lock, held for the duration of one
//!   `send` so records from concurrent writers are never interleaved, and its
//!   own read lock doing the same for readers. A reader still blocked on a
//!   detached connection therefore never holds up I/O after a reconnect.
//! - `connection` holds the current connection. I/O clones the `Arc` out of
//!   it, so `close` can detach it while a read is blocked; the transport is
//!   then released when that last in-flight call returns, never underneath it.
//!
//! Lock order is state, then connection.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::core::error::{CanbusError, Result};
use crate::core::frame::{Frame, FRAME_SIZE};
use crate::core::logging::{ErrorContext, LogContext, PacketDirection};
use crate::core::traits::{ConnectionState, Diagnostics};

use super::config::CanConfig;
use super::transport::{Connector, Transport};

// ============================================================================
// Statistics
// ============================================================================

/// Counters shared between a client and its connections.
#[derive(Default)]
struct ClientStats {
    read_count: AtomicU64,
    write_count: AtomicU64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ClientStats {
    fn record_error(&self, log: &LogContext, err: &CanbusError, context: ErrorContext) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let message = err.to_string();
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
        log.log_error(message, context);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One open transport plus the locks that serialize I/O on it.
///
/// Every successful `connect` builds a fresh one. Dropping the last reference
/// closes the transport and records any close-time error.
struct Connection<T: Transport> {
    transport: Option<T>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    stats: Arc<ClientStats>,
    log: LogContext,
}

impl<T: Transport> Connection<T> {
    fn new(transport: T, stats: Arc<ClientStats>, log: LogContext) -> Self {
        Self {
            transport: Some(transport),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            stats,
            log,
        }
    }

    fn recv(&self, record: &mut [u8; FRAME_SIZE]) -> io::Result<usize> {
        let transport = self.open_transport()?;
        let _guard = self.read_lock.lock().unwrap_or_else(PoisonError::into_inner);
        transport.recv(record)
    }

    fn send(&self, record: &[u8; FRAME_SIZE]) -> io::Result<usize> {
        let transport = self.open_transport()?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        transport.send(record)
    }

    fn descriptor(&self) -> Option<i32> {
        self.transport.as_ref().and_then(Transport::descriptor)
    }

    fn open_transport(&self) -> io::Result<&T> {
        self.transport
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Close the transport now. Later calls and the drop are no-ops.
    fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };

        transport.close().map_err(|e| {
            let err = CanbusError::Close(e);
            #[cfg(feature = "tracing-support")]
            tracing::error!("{}", err);
            self.stats.record_error(&self.log, &err, ErrorContext::Close);
            err
        })
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        // Errors are recorded in the client statistics by `release`.
        let _ = self.release();
    }
}

// ============================================================================
// BusClient
// ============================================================================

/// Thread-safe client for one CAN bus connection.
pub struct BusClient<C: Connector> {
    config: CanConfig,
    connector: C,

    // Connection state
    state: Mutex<ConnectionState>,
    connection: RwLock<Option<Arc<Connection<C::Transport>>>>,
    // Bumped under the state lock by every connect
    connect_attempt: AtomicU64,

    stats: Arc<ClientStats>,
    log: LogContext,
}

/// Client over a real SocketCAN interface.
#[cfg(all(feature = "can", target_os = "linux"))]
pub type CanClient = BusClient<super::socket::SocketCanConnector>;

#[cfg(all(feature = "can", target_os = "linux"))]
impl BusClient<super::socket::SocketCanConnector> {
    /// Create a SocketCAN client. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: CanConfig) -> Self {
        Self::with_connector(config, super::socket::SocketCanConnector)
    }
}

impl<C: Connector> BusClient<C> {
    /// Create a client over an arbitrary connector.
    pub fn with_connector(config: CanConfig, connector: C) -> Self {
        let log = LogContext::new(config.can_interface.clone());
        Self {
            config,
            connector,
            state: Mutex::new(ConnectionState::Closed),
            connection: RwLock::new(None),
            connect_attempt: AtomicU64::new(0),
            stats: Arc::new(ClientStats::default()),
            log,
        }
    }

    /// Attach a log context. Call before sharing the client.
    #[must_use]
    pub fn with_logging(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    /// Client configuration.
    pub fn config(&self) -> &CanConfig {
        &self.config
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// Open, bind, and configure the transport.
    ///
    /// Fails with `AlreadyConnected` (and no side effects) unless the client is
    /// `Closed`. On any other failure the client is left `Closed` with no
    /// connection; the error identifies the failing step.
    pub fn connect(&self) -> Result<()> {
        let started = Instant::now();

        let attempt = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| CanbusError::LockInit("state lock poisoned".to_string()))?;
            if state.is_open() {
                #[cfg(feature = "tracing-support")]
                tracing::error!("already connected to CAN ({})", self.config.can_interface);

                return Err(CanbusError::AlreadyConnected {
                    interface: self.config.can_interface.clone(),
                });
            }
            *state = ConnectionState::Connecting;
            self.connect_attempt.fetch_add(1, Ordering::Relaxed) + 1
        };
        self.log
            .log_state_changed(ConnectionState::Closed, ConnectionState::Connecting);

        let transport = match self.connector.open(&self.config) {
            Ok(t) => t,
            Err(e) => return Err(self.abort_connect(e, attempt)),
        };
        let connection = Connection::new(transport, Arc::clone(&self.stats), self.log.clone());

        {
            let mut state = self.lock_state();
            if *state != ConnectionState::Connecting
                || self.connect_attempt.load(Ordering::Relaxed) != attempt
            {
                // close() ran while the socket was being opened. Dropping the
                // connection closes it and records any close error.
                drop(state);
                drop(connection);

                #[cfg(feature = "tracing-support")]
                tracing::debug!("CAN connect to {} superseded by close", self.config.can_interface);

                return Err(CanbusError::NotConnected);
            }
            *self.connection_slot_mut() = Some(Arc::new(connection));
            *state = ConnectionState::Connected;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.log
            .log_state_changed(ConnectionState::Connecting, ConnectionState::Connected);
        self.log.log_connected(duration_ms);

        #[cfg(feature = "tracing-support")]
        tracing::info!(
            "CAN interface {} connected ({}ms)",
            self.config.can_interface,
            duration_ms
        );

        Ok(())
    }

    /// True when a connection is open and the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        let connected = self.lock_state().is_connected();
        connected && self.connection_slot().is_some()
    }

    /// Read exactly one frame into `frame`. Returns the byte count (`FRAME_SIZE`).
    ///
    /// Blocks until a frame arrives or the configured receive timeout elapses.
    /// Concurrent readers are serialized. No retry is attempted.
    pub fn read(&self, frame: &mut Frame) -> Result<usize> {
        let connection = self.connected(ErrorContext::Read)?;

        let mut record = [0u8; FRAME_SIZE];
        let nbytes = match connection.recv(&mut record) {
            Ok(n) => n,
            Err(e) => {
                let err = CanbusError::TransportRead(e);
                if !err.is_timeout() {
                    #[cfg(feature = "tracing-support")]
                    tracing::error!("CAN read failed: {}", err);
                    self.record_error(&err, ErrorContext::Read);
                }
                return Err(err);
            }
        };

        if nbytes < FRAME_SIZE {
            let err = CanbusError::IncompleteFrame {
                received: nbytes,
                expected: FRAME_SIZE,
            };
            #[cfg(feature = "tracing-support")]
            tracing::error!("{}", err);
            self.record_error(&err, ErrorContext::Read);
            return Err(err);
        }

        *frame = Frame::from_record(&record).inspect_err(|e| {
            self.record_error(e, ErrorContext::Read);
        })?;
        self.stats.read_count.fetch_add(1, Ordering::Relaxed);
        self.log.log_frame(PacketDirection::Receive, frame);

        #[cfg(feature = "tracing-support")]
        tracing::trace!("read {} byte CAN frame: {}", nbytes, frame);

        Ok(nbytes)
    }

    /// Read exactly one frame and return it.
    pub fn read_frame(&self) -> Result<Frame> {
        let mut frame = Frame::default();
        self.read(&mut frame)?;
        Ok(frame)
    }

    /// Write exactly one frame. Returns the byte count written.
    ///
    /// A transport failure is returned but leaves the connection state alone.
    pub fn write(&self, frame: &Frame) -> Result<usize> {
        let connection = self.connected(ErrorContext::Write)?;

        match connection.send(&frame.to_record()) {
            Ok(nbytes) => {
                self.stats.write_count.fetch_add(1, Ordering::Relaxed);
                self.log.log_frame(PacketDirection::Send, frame);

                #[cfg(feature = "tracing-support")]
                tracing::trace!("wrote {} byte CAN frame: {}", nbytes, frame);

                Ok(nbytes)
            }
            Err(e) => {
                let err = CanbusError::TransportWrite(e);
                #[cfg(feature = "tracing-support")]
                tracing::error!("CAN write failed: {}", err);
                self.record_error(&err, ErrorContext::Write);
                Err(err)
            }
        }
    }

    /// Release the transport and return to `Closed`.
    ///
    /// Always completes the transition to `Closed`, even when closing the
    /// socket fails; that failure is returned as `CanbusError::Close` for the
    /// caller to report. Calling `close` on a client that never connected, or
    /// a second time, only performs the state transitions.
    ///
    /// When another thread is still inside a read or write, the connection is
    /// detached here and its transport is closed as soon as that call returns.
    pub fn close(&self) -> Result<()> {
        let old_state = {
            let mut state = self.lock_state();
            std::mem::replace(&mut *state, ConnectionState::Closing)
        };
        self.log
            .log_state_changed(old_state, ConnectionState::Closing);

        let detached = self.connection_slot_mut().take();
        let outcome = match detached.map(Arc::try_unwrap) {
            None => Ok(()),
            Some(Ok(connection)) => connection.close(),
            Some(Err(_in_flight)) => {
                #[cfg(feature = "tracing-support")]
                tracing::debug!("CAN socket busy; released when in-flight I/O returns");
                Ok(())
            }
        };

        *self.lock_state() = ConnectionState::Closed;

        self.log
            .log_state_changed(ConnectionState::Closing, ConnectionState::Closed);
        self.log
            .log_disconnected(outcome.as_ref().err().map(ToString::to_string));

        #[cfg(feature = "tracing-support")]
        tracing::debug!("CAN connection {} closed", self.config.can_interface);

        outcome
    }

    /// Statistics snapshot.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            interface: self.config.can_interface.clone(),
            connection_state: self.state(),
            read_count: self.stats.read_count.load(Ordering::Relaxed),
            write_count: self.stats.write_count.load(Ordering::Relaxed),
            error_count: self.stats.error_count.load(Ordering::Relaxed),
            last_error: self
                .stats
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_slot(&self) -> RwLockReadGuard<'_, Option<Arc<Connection<C::Transport>>>> {
        self.connection.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_slot_mut(&self) -> RwLockWriteGuard<'_, Option<Arc<Connection<C::Transport>>>> {
        self.connection.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection for I/O, or `NotConnected` without touching the transport.
    fn connected(&self, context: ErrorContext) -> Result<Arc<Connection<C::Transport>>> {
        let connected = self.lock_state().is_connected();
        let connection = if connected {
            self.connection_slot().as_ref().map(Arc::clone)
        } else {
            None
        };

        connection.ok_or_else(|| {
            #[cfg(feature = "tracing-support")]
            tracing::error!("CAN {} while socket not connected", context);

            let err = CanbusError::NotConnected;
            self.log.log_error(err.to_string(), context);
            err
        })
    }

    /// Put the state back to `Closed` after a failed connect, unless a
    /// `close` or a newer `connect` has taken over.
    fn abort_connect(&self, err: CanbusError, attempt: u64) -> CanbusError {
        {
            let mut state = self.lock_state();
            if *state == ConnectionState::Connecting
                && self.connect_attempt.load(Ordering::Relaxed) == attempt
            {
                *state = ConnectionState::Closed;
            }
        }

        #[cfg(feature = "tracing-support")]
        tracing::error!(
            "CAN connect to {} failed: {}",
            self.config.can_interface,
            err
        );

        self.record_error(&err, ErrorContext::Connect);
        self.log
            .log_state_changed(ConnectionState::Connecting, ConnectionState::Closed);
        err
    }

    fn record_error(&self, err: &CanbusError, context: ErrorContext) {
        self.stats.record_error(&self.log, err, context);
    }
}

impl<C: Connector> std::fmt::Debug for BusClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("interface", &self.config.can_interface)
            .field("state", &self.state())
            .field(
                "descriptor",
                &self.connection_slot().as_ref().and_then(|c| c.descriptor()),
            )
            .finish()
    }
}

impl<C: Connector> Drop for BusClient<C> {
    fn drop(&mut self) {
        if self.connection_slot().is_some() {
            let _ = self.close();
        }
    }
}
