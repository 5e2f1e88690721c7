//! Shared types for the multiplexer

pub mod error;

pub use error::{MuxError, Result};
