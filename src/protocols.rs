//! Bus protocol implementations.

pub mod can;
