//! Process initialization.
//!
//! This module provides logger setup for the CLI and for embedding
//! applications that want the crate's log format.

mod logger;

// Re-export public API
pub use logger::init_logger_with;
