//! # canbus
//!
//! Thread-safe CAN bus client over Linux SocketCAN.
//!
//! ## Features
//!
//! - **Shared client**: one [`BusClient`] per interface, used from many threads
//! - **Serialized I/O**: concurrent writes never interleave on the wire
//! - **Explicit lifecycle**: `Closed -> Connecting -> Connected -> Closing -> Closed`
//! - **Background capture**: filtered, timestamped frame delivery via [`CaptureLogger`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use canbus::prelude::*;
//!
//! let client = Arc::new(CanClient::new(CanConfig::new("vcan0")));
//! client.connect()?;
//!
//! let frame = Frame::new(0x100, &[0xDE, 0xAD, 0x00])?;
//! client.write(&frame)?;
//! assert_eq!(frame.render(), "0100: [3] de ad 00");
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `can` | yes | SocketCAN connector (Linux only) |
//! | `tracing-support` | yes | Diagnostics through `tracing` |

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod protocols;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        error::{CanbusError, Result},
        frame::*,
        logging::{BusLogConfig, BusLogHandler, LogContext},
        traits::*,
    };
    pub use crate::protocols::can::{
        BusClient, CanConfig, CaptureFlags, CaptureLogger, Connector, FrameFilter, Transport,
    };
    #[cfg(all(feature = "can", target_os = "linux"))]
    pub use crate::protocols::can::{CanClient, SocketCanConnector};
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{CanbusError, Result};
pub use crate::core::frame::{CapturedFrame, Frame, FRAME_SIZE};
pub use crate::core::traits::{ConnectionState, Diagnostics, FrameSink};
pub use crate::protocols::can::{BusClient, CanConfig, CaptureLogger};
