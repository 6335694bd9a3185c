//! Background frame capture.
//!
//! A [`CaptureLogger`] runs one thread that reads from a shared [`BusClient`],
//! applies acceptance filters, stamps accepted frames, and hands them to a
//! [`FrameSink`]. Other threads may keep writing through the same client.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{CanbusError, Result};
use crate::core::frame::{CapturedFrame, Frame, CAN_EFF_FLAG, CAN_EFF_MASK, CAN_SFF_MASK};
use crate::core::traits::FrameSink;

use super::client::BusClient;
use super::transport::Connector;

/// Maximum number of acceptance filters per logger.
pub const MAX_FILTERS: usize = 10;

/// Pause after a read error before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Filters
// ============================================================================

/// Acceptance filter: a frame matches when `frame_id & mask == id & mask`.
///
/// The comparison uses the full identifier word, so a mask that includes
/// `CAN_EFF_FLAG` also separates standard from extended frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFilter {
    /// Identifier to match.
    pub id: u32,
    /// Bits of the identifier that take part in the comparison.
    pub mask: u32,
}

impl FrameFilter {
    /// Create a filter.
    pub const fn new(id: u32, mask: u32) -> Self {
        Self { id, mask }
    }

    /// Match one standard identifier exactly. Extended frames never match.
    pub const fn standard(id: u32) -> Self {
        Self::new(id & CAN_SFF_MASK, CAN_SFF_MASK | CAN_EFF_FLAG)
    }

    /// Match one extended identifier exactly. Standard frames never match.
    pub const fn extended(id: u32) -> Self {
        Self::new((id & CAN_EFF_MASK) | CAN_EFF_FLAG, CAN_EFF_MASK | CAN_EFF_FLAG)
    }

    /// Check a frame against this filter.
    #[inline]
    pub fn matches(&self, frame: &Frame) -> bool {
        frame.id() & self.mask == self.id & self.mask
    }
}

impl FromStr for FrameFilter {
    type Err = CanbusError;

    /// Parse `<id>:<mask>` in hex, e.g. `123:7FF`. A bare `<id>` matches exactly.
    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            u32::from_str_radix(part.trim(), 16)
                .map_err(|e| CanbusError::config(format!("invalid filter {:?}: {}", s, e)))
        };

        match s.split_once(':') {
            Some((id, mask)) => Ok(Self::new(parse(id)?, parse(mask)?)),
            None => {
                let id = parse(s)?;
                if id > CAN_SFF_MASK {
                    Ok(Self::extended(id))
                } else {
                    Ok(Self::standard(id))
                }
            }
        }
    }
}

/// Which special frame kinds the logger delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureFlags(u8);

impl CaptureFlags {
    /// Deliver nothing but plain data frames.
    pub const NONE: Self = Self(0);
    /// Deliver protocol error frames.
    pub const ERROR_FRAMES: Self = Self(0x01);
    /// Deliver remote request frames.
    pub const REMOTE_FRAMES: Self = Self(0x02);

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild from raw bits, ignoring unknown ones.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & (Self::ERROR_FRAMES.0 | Self::REMOTE_FRAMES.0))
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for CaptureFlags {
    fn default() -> Self {
        Self::ERROR_FRAMES | Self::REMOTE_FRAMES
    }
}

impl std::ops::BitOr for CaptureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Capture statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Frames delivered to the sink.
    pub frames_captured: u64,
    /// Frames read but rejected by filters or flags.
    pub frames_dropped: u64,
    /// Read errors other than timeouts.
    pub error_count: u64,
    /// Last read error message.
    pub last_error: Option<String>,
    /// Whether the capture thread is running.
    pub running: bool,
}

/// State shared with the capture thread.
#[derive(Default)]
struct CaptureShared {
    running: AtomicBool,
    filters: RwLock<Vec<FrameFilter>>,
    flags: AtomicU8,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl CaptureShared {
    fn accepts(&self, frame: &Frame) -> bool {
        let flags = CaptureFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed));

        // Error frames are not subject to identifier filters.
        if frame.is_error() {
            return flags.contains(CaptureFlags::ERROR_FRAMES);
        }
        if frame.is_remote() && !flags.contains(CaptureFlags::REMOTE_FRAMES) {
            return false;
        }

        let filters = self.filters.read().unwrap_or_else(PoisonError::into_inner);
        filters.is_empty() || filters.iter().any(|f| f.matches(frame))
    }

    fn record_error(&self, err: &CanbusError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }
}

// ============================================================================
// CaptureLogger
// ============================================================================

/// Reads frames from a shared client on a background thread.
///
/// `stop` waits for the thread to notice the request, which happens after the
/// current read returns. Configure a receive timeout on the client so that
/// happens promptly on a quiet bus.
pub struct CaptureLogger<C: Connector> {
    client: Arc<BusClient<C>>,
    sink: Arc<dyn FrameSink>,
    shared: Arc<CaptureShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> CaptureLogger<C> {
    /// Create a logger. Nothing runs until [`start`](Self::start).
    pub fn new(client: Arc<BusClient<C>>, sink: Arc<dyn FrameSink>) -> Self {
        let shared = CaptureShared::default();
        shared
            .flags
            .store(CaptureFlags::default().bits(), Ordering::Relaxed);

        Self {
            client,
            sink,
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }

    /// The client being read.
    pub fn client(&self) -> &Arc<BusClient<C>> {
        &self.client
    }

    /// Install an acceptance filter.
    pub fn add_filter(&self, filter: FrameFilter) -> Result<()> {
        let mut filters = self
            .shared
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if filters.len() >= MAX_FILTERS {
            return Err(CanbusError::config(format!(
                "at most {} capture filters are supported",
                MAX_FILTERS
            )));
        }
        filters.push(filter);
        Ok(())
    }

    /// Remove all filters; every frame is accepted again.
    pub fn clear_filters(&self) {
        self.shared
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Installed filters.
    pub fn filters(&self) -> Vec<FrameFilter> {
        self.shared
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set which special frame kinds are delivered. Takes effect immediately.
    pub fn set_flags(&self, flags: CaptureFlags) {
        self.shared.flags.store(flags.bits(), Ordering::Relaxed);
    }

    /// Current flags.
    pub fn flags(&self) -> CaptureFlags {
        CaptureFlags::from_bits_truncate(self.shared.flags.load(Ordering::Relaxed))
    }

    /// True while the capture thread runs.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Spawn the capture thread. The client must already be connected.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);

        if self.shared.running.load(Ordering::Acquire) {
            return Err(CanbusError::Capture("capture already running".to_string()));
        }
        if !self.client.is_connected() {
            return Err(CanbusError::NotConnected);
        }

        // Reap a thread that ended on its own (client closed).
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }

        self.shared.running.store(true, Ordering::Release);

        let client = Arc::clone(&self.client);
        let shared = Arc::clone(&self.shared);
        let sink = Arc::clone(&self.sink);
        let name = format!("canbus-capture-{}", client.config().can_interface);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || capture_loop(&client, &shared, sink.as_ref()))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                CanbusError::Capture(format!("failed to spawn capture thread: {}", e))
            })?;
        *worker = Some(handle);

        #[cfg(feature = "tracing-support")]
        tracing::debug!(
            "capture started on {}",
            self.client.config().can_interface
        );

        Ok(())
    }

    /// Ask the capture thread to stop and wait for it.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                #[cfg(feature = "tracing-support")]
                tracing::error!("capture thread panicked");
            }
        }
    }

    /// Statistics snapshot.
    pub fn diagnostics(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            error_count: self.shared.error_count.load(Ordering::Relaxed),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            running: self.is_running(),
        }
    }
}

impl<C: Connector> Drop for CaptureLogger<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<C: Connector>(client: &BusClient<C>, shared: &CaptureShared, sink: &dyn FrameSink) {
    sink.on_connection_changed(client.state());

    while shared.running.load(Ordering::Acquire) {
        match client.read_frame() {
            Ok(frame) => {
                if shared.accepts(&frame) {
                    shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                    sink.on_frame(&CapturedFrame::now(frame));
                } else {
                    shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) if e.is_timeout() => {}
            Err(CanbusError::NotConnected) => {
                #[cfg(feature = "tracing-support")]
                tracing::debug!("capture ending: client closed");

                sink.on_connection_changed(client.state());
                break;
            }
            Err(e) => {
                #[cfg(feature = "tracing-support")]
                tracing::warn!("capture read failed: {}", e);

                shared.record_error(&e);
                sink.on_error(&e.to_string());
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    shared.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::CAN_ERR_FLAG;
    use crate::core::traits::ConnectionState;
    use crate::protocols::can::config::CanConfig;
    use crate::protocols::can::mock::{MockBus, MockConnector, ReadScript};
    use std::io;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
        errors: Mutex<Vec<String>>,
        states: Mutex<Vec<ConnectionState>>,
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&self, frame: &CapturedFrame) {
            self.frames.lock().unwrap().push(frame.frame);
        }

        fn on_connection_changed(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }

        fn on_error(&self, error: &str) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn connected(bus: &Arc<MockBus>) -> Arc<BusClient<MockConnector>> {
        let client = Arc::new(BusClient::with_connector(
            CanConfig::new("vcan0"),
            MockConnector::new(Arc::clone(bus)),
        ));
        client.connect().unwrap();
        client
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_filter_matching() {
        let frame = Frame::new(0x123, &[1]).unwrap();
        assert!(FrameFilter::standard(0x123).matches(&frame));
        assert!(!FrameFilter::standard(0x124).matches(&frame));
        assert!(FrameFilter::new(0x120, 0x7F0).matches(&frame));
        assert!(FrameFilter::new(0, 0).matches(&frame));

        let ext = Frame::with_extended_id(0x18DAF110, &[]).unwrap();
        assert!(FrameFilter::new(0x18DAF100, 0x1FFFFF00).matches(&ext));
        assert!(!FrameFilter::standard(0x110).matches(&ext));
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(
            "123:7FF".parse::<FrameFilter>().unwrap(),
            FrameFilter::new(0x123, 0x7FF)
        );
        assert_eq!("7e8".parse::<FrameFilter>().unwrap(), FrameFilter::standard(0x7E8));
        assert_eq!(
            "18DAF110".parse::<FrameFilter>().unwrap(),
            FrameFilter::extended(0x18DAF110)
        );
        assert!("12x:7FF".parse::<FrameFilter>().is_err());
        assert!("".parse::<FrameFilter>().is_err());
    }

    #[test]
    fn test_capture_flags() {
        let flags = CaptureFlags::default();
        assert!(flags.contains(CaptureFlags::ERROR_FRAMES));
        assert!(flags.contains(CaptureFlags::REMOTE_FRAMES));
        assert!(!CaptureFlags::NONE.contains(CaptureFlags::REMOTE_FRAMES));
        assert_eq!(CaptureFlags::from_bits_truncate(0xFF), flags);
    }

    #[test]
    fn test_filter_limit() {
        let bus = MockBus::new();
        let logger = CaptureLogger::new(connected(&bus), Arc::new(RecordingSink::default()));
        for id in 0..MAX_FILTERS as u32 {
            logger.add_filter(FrameFilter::standard(id)).unwrap();
        }
        let err = logger.add_filter(FrameFilter::standard(0x7FF)).unwrap_err();
        assert!(matches!(err, CanbusError::Config(_)));

        logger.clear_filters();
        assert!(logger.filters().is_empty());
    }

    #[test]
    fn test_start_requires_connection() {
        let bus = MockBus::new();
        let client = Arc::new(BusClient::with_connector(
            CanConfig::new("vcan0"),
            MockConnector::new(Arc::clone(&bus)),
        ));
        let logger = CaptureLogger::new(client, Arc::new(RecordingSink::default()));
        assert!(matches!(logger.start(), Err(CanbusError::NotConnected)));
        assert!(!logger.is_running());
    }

    #[test]
    fn test_capture_applies_filters_and_flags() {
        let bus = MockBus::new();
        let sink = Arc::new(RecordingSink::default());
        let logger = CaptureLogger::new(connected(&bus), sink.clone());
        logger.add_filter(FrameFilter::new(0x100, 0x700)).unwrap();
        logger.set_flags(CaptureFlags::ERROR_FRAMES);

        bus.push_frame(Frame::new(0x123, &[1]).unwrap());
        bus.push_frame(Frame::new(0x200, &[2]).unwrap());
        bus.push_frame(Frame::remote(0x123, 2).unwrap());
        bus.push_frame(Frame::new(CAN_ERR_FLAG | 0x004, &[0; 8]).unwrap());
        bus.push_frame(Frame::new(0x1FF, &[3]).unwrap());

        logger.start().unwrap();
        assert!(matches!(logger.start(), Err(CanbusError::Capture(_))));

        wait_for(|| {
            let stats = logger.diagnostics();
            stats.frames_captured + stats.frames_dropped == 5
        });
        logger.stop();
        assert!(!logger.is_running());

        let ids: Vec<u32> = sink.frames.lock().unwrap().iter().map(Frame::id).collect();
        assert_eq!(ids, vec![0x123, CAN_ERR_FLAG | 0x004, 0x1FF]);

        let stats = logger.diagnostics();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.error_count, 0);
    }

    #[test]
    fn test_capture_counts_errors_and_continues() {
        let bus = MockBus::new();
        let sink = Arc::new(RecordingSink::default());
        let logger = CaptureLogger::new(connected(&bus), sink.clone());

        bus.push_read(ReadScript::Error(io::ErrorKind::ConnectionReset));
        bus.push_frame(Frame::new(0x42, &[0xAA]).unwrap());

        logger.start().unwrap();
        wait_for(|| logger.diagnostics().frames_captured == 1);
        logger.stop();

        let stats = logger.diagnostics();
        assert_eq!(stats.error_count, 1);
        assert!(stats.last_error.unwrap().contains("CAN read error"));
        assert_eq!(sink.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_capture_ends_when_client_closes() {
        let bus = MockBus::new();
        let client = connected(&bus);
        let sink = Arc::new(RecordingSink::default());
        let logger = CaptureLogger::new(Arc::clone(&client), sink.clone());

        logger.start().unwrap();
        client.close().unwrap();
        wait_for(|| !logger.is_running());

        let states = sink.states.lock().unwrap().clone();
        assert!(!states.last().unwrap().is_connected());

        // Restart after reconnect.
        client.connect().unwrap();
        logger.start().unwrap();
        assert!(logger.is_running());
        logger.stop();
    }

    #[test]
    fn test_capture_alongside_writer() {
        let bus = MockBus::new();
        let client = connected(&bus);
        let sink = Arc::new(RecordingSink::default());
        let logger = CaptureLogger::new(Arc::clone(&client), sink.clone());
        logger.start().unwrap();

        for i in 0..20u8 {
            client.write(&Frame::new(0x300, &[i]).unwrap()).unwrap();
            bus.push_frame(Frame::new(0x301, &[i]).unwrap());
        }
        wait_for(|| logger.diagnostics().frames_captured == 20);
        logger.stop();

        assert_eq!(bus.records().len(), 20);
        let payloads: Vec<u8> = sink.frames.lock().unwrap().iter().map(|f| f.data()[0]).collect();
        assert_eq!(payloads, (0..20).collect::<Vec<u8>>());
    }
}
