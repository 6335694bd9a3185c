//! Core abstractions: the frame model, errors, lifecycle state, and logging.

pub mod error;
pub mod frame;
pub mod logging;
pub mod traits;

pub use error::{CanbusError, Result};
pub use frame::*;
pub use traits::*;
