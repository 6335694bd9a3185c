//! Bus event logging.
//!
//! A client reports lifecycle transitions, frames, and errors as [`BusLogEvent`]s
//! to an optional [`BusLogHandler`]. Which events reach the handler is decided by
//! [`BusLogConfig`]. Handlers are called synchronously on the thread that
//! produced the event.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use canbus::core::logging::{BusLogConfig, LogContext, PrintLogHandler};
//!
//! let ctx = LogContext::new("vcan0")
//!     .with_handler(Arc::new(PrintLogHandler::with_prefix("bus ")))
//!     .with_config(BusLogConfig::all());
//! assert!(ctx.config().should_log_frames());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::frame::Frame;
use crate::core::traits::ConnectionState;

// ============================================================================
// Frame Direction
// ============================================================================

/// Direction of a frame relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketDirection {
    /// Frame written to the bus.
    Send,
    /// Frame read from the bus.
    Receive,
}

impl std::fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, ">>>"),
            Self::Receive => write!(f, "<<<"),
        }
    }
}

/// Operation during which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    /// Opening, binding, or configuring the socket.
    Connect,
    /// Reading a frame.
    Read,
    /// Writing a frame.
    Write,
    /// Releasing the socket.
    Close,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Close => write!(f, "close"),
        }
    }
}

// ============================================================================
// Bus Log Event
// ============================================================================

/// Event emitted by a bus client.
#[derive(Debug, Clone)]
pub enum BusLogEvent {
    /// Socket bound and configured.
    Connected {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Interface name.
        interface: String,
        /// Time spent in `connect`, in milliseconds.
        duration_ms: u64,
    },

    /// Socket released.
    Disconnected {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Close-time error, if any.
        reason: Option<String>,
    },

    /// Lifecycle transition.
    StateChanged {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Previous state.
        old_state: ConnectionState,
        /// New state.
        new_state: ConnectionState,
    },

    /// Frame read or written.
    Frame {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Direction.
        direction: PacketDirection,
        /// The frame.
        frame: Frame,
    },

    /// Operation failed.
    Error {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Error message.
        error: String,
        /// Operation that failed.
        context: ErrorContext,
    },
}

impl BusLogEvent {
    /// Get the event timestamp.
    pub fn timestamp(&self) -> SystemTime {
        match self {
            Self::Connected { timestamp, .. }
            | Self::Disconnected { timestamp, .. }
            | Self::StateChanged { timestamp, .. }
            | Self::Frame { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type.
    pub fn event_type(&self) -> LogEventType {
        match self {
            Self::Connected { .. } => LogEventType::Connected,
            Self::Disconnected { .. } => LogEventType::Disconnected,
            Self::StateChanged { .. } => LogEventType::StateChanged,
            Self::Frame { .. } => LogEventType::Frame,
            Self::Error { .. } => LogEventType::Error,
        }
    }
}

// ============================================================================
// Log Event Type (for filtering)
// ============================================================================

/// Log event type for filtering configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    /// Connection events.
    Connected,
    /// Disconnection events.
    Disconnected,
    /// State change events.
    StateChanged,
    /// Frame events (high frequency).
    Frame,
    /// Error events.
    Error,
}

impl LogEventType {
    /// Get all event types.
    pub fn all() -> HashSet<LogEventType> {
        use LogEventType::*;
        [Connected, Disconnected, StateChanged, Frame, Error]
            .into_iter()
            .collect()
    }

    /// Get default event types (excludes per-frame events).
    pub fn default_set() -> HashSet<LogEventType> {
        use LogEventType::*;
        [Connected, Disconnected, StateChanged, Error]
            .into_iter()
            .collect()
    }
}

// ============================================================================
// Bus Log Config
// ============================================================================

/// Controls which events reach the handler.
#[derive(Debug, Clone)]
pub struct BusLogConfig {
    enabled_events: HashSet<LogEventType>,
    log_received: bool,
    log_sent: bool,
}

impl Default for BusLogConfig {
    fn default() -> Self {
        Self {
            enabled_events: LogEventType::default_set(),
            log_received: false,
            log_sent: true,
        }
    }
}

impl BusLogConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log everything, including every frame in both directions.
    pub fn all() -> Self {
        Self {
            enabled_events: LogEventType::all(),
            log_received: true,
            log_sent: true,
        }
    }

    /// Log nothing.
    pub fn disabled() -> Self {
        Self {
            enabled_events: HashSet::new(),
            log_received: false,
            log_sent: false,
        }
    }

    /// Enable a specific event type.
    #[must_use]
    pub fn enable_event(mut self, event_type: LogEventType) -> Self {
        self.enabled_events.insert(event_type);
        self
    }

    /// Disable a specific event type.
    #[must_use]
    pub fn disable_event(mut self, event_type: LogEventType) -> Self {
        self.enabled_events.remove(&event_type);
        self
    }

    /// Set whether received frames are logged. Enables frame events when set.
    #[must_use]
    pub fn with_received_frames(mut self, enable: bool) -> Self {
        self.log_received = enable;
        if enable {
            self.enabled_events.insert(LogEventType::Frame);
        }
        self
    }

    /// Set whether sent frames are logged. Enables frame events when set.
    #[must_use]
    pub fn with_sent_frames(mut self, enable: bool) -> Self {
        self.log_sent = enable;
        if enable {
            self.enabled_events.insert(LogEventType::Frame);
        }
        self
    }

    /// Check if an event type is enabled.
    pub fn is_enabled(&self, event_type: LogEventType) -> bool {
        self.enabled_events.contains(&event_type)
    }

    /// Check if any frame events would be logged.
    pub fn should_log_frames(&self) -> bool {
        self.is_enabled(LogEventType::Frame) && (self.log_received || self.log_sent)
    }

    /// Decide whether an event should be passed to the handler.
    pub fn should_log(&self, event: &BusLogEvent) -> bool {
        if let BusLogEvent::Frame { direction, .. } = event {
            let wanted = match direction {
                PacketDirection::Receive => self.log_received,
                PacketDirection::Send => self.log_sent,
            };
            if !wanted {
                return false;
            }
        }
        self.is_enabled(event.event_type())
    }
}

// ============================================================================
// Bus Log Handler Trait
// ============================================================================

/// Receiver of bus events.
pub trait BusLogHandler: Send + Sync {
    /// Handle a log event.
    fn on_log(&self, interface: &str, event: BusLogEvent);
}

// ============================================================================
// Built-in Log Handlers
// ============================================================================

/// Handler that drops every event.
pub struct NoopLogHandler;

impl BusLogHandler for NoopLogHandler {
    fn on_log(&self, _interface: &str, _event: BusLogEvent) {}
}

/// Handler that prints one line per event to stdout.
pub struct PrintLogHandler {
    prefix: String,
}

impl PrintLogHandler {
    /// Create a print handler.
    pub fn new() -> Self {
        Self {
            prefix: String::new(),
        }
    }

    /// Create a print handler with a line prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Format one event as a line (without trailing newline).
    pub fn format_event(&self, interface: &str, event: &BusLogEvent) -> String {
        match event {
            BusLogEvent::Connected { duration_ms, .. } => {
                format!("{}[{}] connected ({}ms)", self.prefix, interface, duration_ms)
            }
            BusLogEvent::Disconnected { reason, .. } => {
                let reason_str = reason.as_deref().unwrap_or("intentional");
                format!("{}[{}] disconnected reason={}", self.prefix, interface, reason_str)
            }
            BusLogEvent::StateChanged {
                old_state,
                new_state,
                ..
            } => format!("{}[{}] {} -> {}", self.prefix, interface, old_state, new_state),
            BusLogEvent::Frame {
                direction, frame, ..
            } => format!("{}[{}] {} {}", self.prefix, interface, direction, frame),
            BusLogEvent::Error { error, context, .. } => {
                format!("{}[{}] error [{}] {}", self.prefix, interface, context, error)
            }
        }
    }
}

impl Default for PrintLogHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl BusLogHandler for PrintLogHandler {
    fn on_log(&self, interface: &str, event: BusLogEvent) {
        println!("{}", self.format_event(interface, &event));
    }
}

/// Handler that fans events out to several handlers.
pub struct CompositeLogHandler {
    handlers: Vec<Arc<dyn BusLogHandler>>,
}

impl CompositeLogHandler {
    /// Create an empty composite handler.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler (builder style).
    #[must_use]
    pub fn add(mut self, handler: Arc<dyn BusLogHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add a handler.
    pub fn add_handler(&mut self, handler: Arc<dyn BusLogHandler>) {
        self.handlers.push(handler);
    }
}

impl Default for CompositeLogHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl BusLogHandler for CompositeLogHandler {
    fn on_log(&self, interface: &str, event: BusLogEvent) {
        for handler in &self.handlers {
            handler.on_log(interface, event.clone());
        }
    }
}

/// Handler that forwards events to `tracing`.
#[cfg(feature = "tracing-support")]
pub struct TracingLogHandler;

#[cfg(feature = "tracing-support")]
impl BusLogHandler for TracingLogHandler {
    fn on_log(&self, interface: &str, event: BusLogEvent) {
        use tracing::{debug, error, info, trace, warn};

        match &event {
            BusLogEvent::Connected { duration_ms, .. } => {
                info!(
                    interface = %interface,
                    duration_ms = duration_ms,
                    "CAN bus connected"
                );
            }
            BusLogEvent::Disconnected { reason, .. } => {
                if let Some(reason) = reason {
                    warn!(interface = %interface, reason = %reason, "CAN bus disconnected");
                } else {
                    info!(interface = %interface, "CAN bus disconnected");
                }
            }
            BusLogEvent::StateChanged {
                old_state,
                new_state,
                ..
            } => {
                debug!(
                    interface = %interface,
                    old_state = %old_state,
                    new_state = %new_state,
                    "Connection state changed"
                );
            }
            BusLogEvent::Frame {
                direction, frame, ..
            } => {
                trace!(
                    interface = %interface,
                    direction = %direction,
                    frame = %frame,
                    "CAN frame"
                );
            }
            BusLogEvent::Error { error, context, .. } => {
                error!(
                    interface = %interface,
                    context = %context,
                    error = %error,
                    "CAN bus error"
                );
            }
        }
    }
}

// ============================================================================
// Log Context
// ============================================================================

/// Handler plus configuration, owned by a client.
#[derive(Clone)]
pub struct LogContext {
    interface: String,
    handler: Option<Arc<dyn BusLogHandler>>,
    config: BusLogConfig,
}

impl LogContext {
    /// Create a context without a handler.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            handler: None,
            config: BusLogConfig::default(),
        }
    }

    /// Create with a handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn BusLogHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Create with a configuration.
    #[must_use]
    pub fn with_config(mut self, config: BusLogConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the current configuration.
    pub fn config(&self) -> &BusLogConfig {
        &self.config
    }

    /// True when a handler is installed.
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Pass an event to the handler if the configuration allows it.
    pub fn log(&self, event: BusLogEvent) {
        if let Some(handler) = &self.handler {
            if self.config.should_log(&event) {
                handler.on_log(&self.interface, event);
            }
        }
    }

    /// Log a connected event.
    pub fn log_connected(&self, duration_ms: u64) {
        self.log(BusLogEvent::Connected {
            timestamp: SystemTime::now(),
            interface: self.interface.clone(),
            duration_ms,
        });
    }

    /// Log a disconnected event.
    pub fn log_disconnected(&self, reason: Option<String>) {
        self.log(BusLogEvent::Disconnected {
            timestamp: SystemTime::now(),
            reason,
        });
    }

    /// Log a state change.
    pub fn log_state_changed(&self, old_state: ConnectionState, new_state: ConnectionState) {
        self.log(BusLogEvent::StateChanged {
            timestamp: SystemTime::now(),
            old_state,
            new_state,
        });
    }

    /// Log a frame.
    pub fn log_frame(&self, direction: PacketDirection, frame: &Frame) {
        if self.handler.is_none() {
            return;
        }
        self.log(BusLogEvent::Frame {
            timestamp: SystemTime::now(),
            direction,
            frame: *frame,
        });
    }

    /// Log an error.
    pub fn log_error(&self, error: impl Into<String>, context: ErrorContext) {
        self.log(BusLogEvent::Error {
            timestamp: SystemTime::now(),
            error: error.into(),
            context,
        });
    }
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("interface", &self.interface)
            .field("has_handler", &self.handler.is_some())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<BusLogEvent>>,
    }

    impl BusLogHandler for RecordingHandler {
        fn on_log(&self, _interface: &str, event: BusLogEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_log_config() {
        let config = BusLogConfig::new();
        assert!(config.is_enabled(LogEventType::StateChanged));
        assert!(!config.is_enabled(LogEventType::Frame));
        assert!(!config.should_log_frames());

        let config = BusLogConfig::all();
        assert!(config.should_log_frames());

        let config = BusLogConfig::disabled();
        assert!(!config.is_enabled(LogEventType::Error));
    }

    #[test]
    fn test_frame_direction_filter() {
        let config = BusLogConfig::new().with_sent_frames(true);
        let frame = Frame::new(0x100, &[1]).unwrap();

        let sent = BusLogEvent::Frame {
            timestamp: SystemTime::now(),
            direction: PacketDirection::Send,
            frame,
        };
        let received = BusLogEvent::Frame {
            timestamp: SystemTime::now(),
            direction: PacketDirection::Receive,
            frame,
        };
        assert!(config.should_log(&sent));
        assert!(!config.should_log(&received));
    }

    #[test]
    fn test_log_context_dispatch() {
        let handler = Arc::new(RecordingHandler::default());
        let ctx = LogContext::new("vcan0")
            .with_handler(handler.clone())
            .with_config(BusLogConfig::all());

        ctx.log_state_changed(ConnectionState::Closed, ConnectionState::Connecting);
        ctx.log_error("boom", ErrorContext::Read);
        ctx.log_frame(PacketDirection::Receive, &Frame::new(0x1, &[]).unwrap());

        let events = handler.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type(), LogEventType::StateChanged);
        assert_eq!(events[1].event_type(), LogEventType::Error);
        assert_eq!(events[2].event_type(), LogEventType::Frame);
    }

    #[test]
    fn test_print_format() {
        let handler = PrintLogHandler::with_prefix("> ");
        let event = BusLogEvent::Frame {
            timestamp: SystemTime::now(),
            direction: PacketDirection::Send,
            frame: Frame::new(0x100, &[0xDE, 0xAD, 0x00]).unwrap(),
        };
        assert_eq!(
            handler.format_event("vcan0", &event),
            "> [vcan0] >>> 0100: [3] de ad 00"
        );
    }

    #[test]
    fn test_composite_handler() {
        let a = Arc::new(RecordingHandler::default());
        let b = Arc::new(RecordingHandler::default());
        let composite = CompositeLogHandler::new().add(a.clone()).add(b.clone());

        composite.on_log(
            "vcan0",
            BusLogEvent::Disconnected {
                timestamp: SystemTime::now(),
                reason: None,
            },
        );

        assert_eq!(a.events.lock().unwrap().len(), 1);
        assert_eq!(b.events.lock().unwrap().len(), 1);
    }
}
