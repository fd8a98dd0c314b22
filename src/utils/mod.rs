//! Utility functions.
//!
//! This module provides:
//! - Lossy decoding of fetched bytes (`sanitize`)

pub mod sanitize;

pub use sanitize::decode_lossy;
