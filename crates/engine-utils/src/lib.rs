//! Shared utilities for the analysis engine workspace
//!
//! Binaries call one of the `init_tracing*` helpers once at startup;
//! library crates only emit through `tracing` macros.

pub mod logging;

pub use logging::{DEFAULT_FILTER, init_tracing, init_tracing_json, init_tracing_with};
