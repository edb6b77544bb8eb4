//! # Taproot Observability
//!
//! Tracing subscriber setup shared by the binary and the tests.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, parse_log_level, LogConfig, LogFormat};
