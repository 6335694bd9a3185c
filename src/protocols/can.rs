//! CAN bus client over SocketCAN.
//!
//! - [`BusClient`] owns one raw CAN socket and is shared between threads
//!   through `Arc`. Reads, writes, and lifecycle changes are safe to call
//!   concurrently.
//! - [`CaptureLogger`] reads from a shared client on a background thread and
//!   delivers filtered, timestamped frames to a [`FrameSink`](crate::core::FrameSink).
//! - [`Connector`] and [`Transport`] separate the client from the socket layer.
//!
//! ## Dependencies
//!
//! This module uses:
//! - [`socketcan`](https://crates.io/crates/socketcan) for the raw socket options (Linux only)
//! - [`libc`](https://crates.io/crates/libc) for socket creation, bind, and record I/O
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use canbus::protocols::can::{CanClient, CanConfig};
//! use canbus::core::Frame;
//!
//! let client = Arc::new(CanClient::new(CanConfig::new("vcan0")));
//! client.connect()?;
//!
//! client.write(&Frame::new(0x100, &[0xDE, 0xAD, 0x00])?)?;
//! let frame = client.read_frame()?;
//! println!("{}", frame.render());
//!
//! client.close()?;
//! ```

mod capture;
mod client;
mod config;
mod transport;

#[cfg(all(feature = "can", target_os = "linux"))]
mod socket;

#[cfg(test)]
mod mock;

pub use capture::{CaptureFlags, CaptureLogger, CaptureStats, FrameFilter, MAX_FILTERS};
pub use client::BusClient;
#[cfg(all(feature = "can", target_os = "linux"))]
pub use client::CanClient;
pub use config::{CanChannelParamsConfig, CanConfig, EXAMPLE_CONFIG, IFNAMSIZ};
#[cfg(all(feature = "can", target_os = "linux"))]
pub use socket::{CanSocketTransport, SocketCanConnector};
pub use transport::{Connector, Transport};
