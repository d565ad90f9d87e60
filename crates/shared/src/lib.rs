//! # Shared
//! Ambient components of the backup binaries: logging and test helpers.
//!

#![warn(missing_docs)]

mod logger;
#[cfg(feature = "test")]
pub mod test;

pub use logger::{LoggerError, init_logger};
