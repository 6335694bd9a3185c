//! In-memory transport for tests.
//!
//! Written records are appended to a shared byte log one byte at a time with a
//! yield between bytes, so unserialized concurrent writers would interleave.
//! Reads are served from a scripted queue. [`Gate`]s hold a thread inside
//! `open` or `recv` so tests can race `close` against it.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::error::{CanbusError, Result};
use crate::core::frame::{Frame, FRAME_SIZE};

use super::config::CanConfig;
use super::transport::{Connector, Transport};

/// Connect step to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStep {
    Create,
    Resolve,
    Bind,
    ErrorFilter,
    RecvOwnMsgs,
}

/// Scripted read outcome.
#[derive(Debug)]
pub enum ReadScript {
    Frame(Frame),
    Raw([u8; FRAME_SIZE]),
    Short(usize),
    Error(io::ErrorKind),
}

/// Blocks threads passing through it while armed.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    armed: bool,
    waiting: usize,
}

impl Gate {
    /// Make the next callers block.
    pub fn arm(&self) {
        self.state.lock().unwrap().armed = true;
    }

    /// Let blocked and future callers through.
    pub fn open(&self) {
        self.state.lock().unwrap().armed = false;
        self.changed.notify_all();
    }

    /// Called from the mock; blocks while armed.
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.armed {
            return;
        }
        state.waiting += 1;
        self.changed.notify_all();
        while state.armed {
            state = self.changed.wait(state).unwrap();
        }
        state.waiting -= 1;
    }

    /// Wait until some thread is blocked in the gate.
    pub fn wait_blocked(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.state.lock().unwrap();
        while state.waiting == 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "no thread reached the gate");
            state = self.changed.wait_timeout(state, left).unwrap().0;
        }
    }
}

/// State shared between the connector, its transports, and the test.
#[derive(Default)]
pub struct MockBus {
    pub written: Mutex<Vec<u8>>,
    pub send_calls: AtomicUsize,
    pub recv_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub opens: AtomicUsize,
    pub fail_step: Mutex<Option<FailStep>>,
    pub fail_close: Mutex<bool>,
    pub fail_send: Mutex<bool>,
    pub open_gate: Gate,
    pub recv_gate: Gate,
    /// Index of the transport whose reads go through `recv_gate`.
    pub gated_transport: Mutex<Option<usize>>,
    reads: Mutex<VecDeque<ReadScript>>,
    reads_ready: Condvar,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_read(&self, script: ReadScript) {
        self.reads.lock().unwrap().push_back(script);
        self.reads_ready.notify_all();
    }

    pub fn push_frame(&self, frame: Frame) {
        self.push_read(ReadScript::Frame(frame));
    }

    pub fn fail_at(&self, step: FailStep) {
        *self.fail_step.lock().unwrap() = Some(step);
    }

    /// Written bytes split into records.
    pub fn records(&self) -> Vec<[u8; FRAME_SIZE]> {
        let written = self.written.lock().unwrap();
        written
            .chunks(FRAME_SIZE)
            .map(|chunk| {
                let mut record = [0u8; FRAME_SIZE];
                record[..chunk.len()].copy_from_slice(chunk);
                record
            })
            .collect()
    }
}

/// Connector backed by a [`MockBus`].
#[derive(Clone)]
pub struct MockConnector {
    pub bus: Arc<MockBus>,
}

impl MockConnector {
    pub fn new(bus: Arc<MockBus>) -> Self {
        Self { bus }
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn open(&self, config: &CanConfig) -> Result<MockTransport> {
        config.validate()?;
        let fail = *self.bus.fail_step.lock().unwrap();
        let os_err = || io::Error::from(io::ErrorKind::Other);

        match fail {
            Some(FailStep::Create) => return Err(CanbusError::SocketCreate(os_err())),
            Some(FailStep::Resolve) => {
                return Err(CanbusError::config(format!(
                    "unable to find CAN interface {}",
                    config.can_interface
                )))
            }
            Some(FailStep::Bind) => {
                return Err(CanbusError::SocketBind {
                    interface: config.can_interface.clone(),
                    source: os_err(),
                })
            }
            Some(FailStep::ErrorFilter) => {
                return Err(CanbusError::SocketOption {
                    option: "CAN_RAW_ERR_FILTER",
                    source: os_err(),
                })
            }
            Some(FailStep::RecvOwnMsgs) => {
                return Err(CanbusError::SocketOption {
                    option: "CAN_RAW_RECV_OWN_MSGS",
                    source: os_err(),
                })
            }
            None => {}
        }

        self.bus.open_gate.pass();

        let index = self.bus.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockTransport {
            bus: Arc::clone(&self.bus),
            index,
        })
    }
}

/// Transport backed by a [`MockBus`].
pub struct MockTransport {
    bus: Arc<MockBus>,
    index: usize,
}

impl Transport for MockTransport {
    fn recv(&self, record: &mut [u8; FRAME_SIZE]) -> io::Result<usize> {
        self.bus.recv_calls.fetch_add(1, Ordering::SeqCst);
        let gated = *self.bus.gated_transport.lock().unwrap() == Some(self.index);
        if gated {
            self.bus.recv_gate.pass();
        }

        let mut reads = self.bus.reads.lock().unwrap();
        loop {
            if let Some(script) = reads.pop_front() {
                return match script {
                    ReadScript::Frame(frame) => {
                        *record = frame.to_record();
                        Ok(FRAME_SIZE)
                    }
                    ReadScript::Raw(raw) => {
                        *record = raw;
                        Ok(FRAME_SIZE)
                    }
                    ReadScript::Short(n) => Ok(n),
                    ReadScript::Error(kind) => Err(io::Error::from(kind)),
                };
            }
            let (guard, timeout) = self
                .bus
                .reads_ready
                .wait_timeout(reads, Duration::from_millis(20))
                .unwrap();
            reads = guard;
            if timeout.timed_out() && reads.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
        }
    }

    fn send(&self, record: &[u8; FRAME_SIZE]) -> io::Result<usize> {
        self.bus.send_calls.fetch_add(1, Ordering::SeqCst);
        if *self.bus.fail_send.lock().unwrap() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        for byte in record {
            self.bus.written.lock().unwrap().push(*byte);
            thread::yield_now();
        }
        Ok(FRAME_SIZE)
    }

    fn close(self) -> io::Result<()> {
        self.bus.close_calls.fetch_add(1, Ordering::SeqCst);
        if *self.bus.fail_close.lock().unwrap() {
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        Ok(())
    }
}
