//! Logging and request tracing for the Lyquor dev backend.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   selected by `[general]` in the config file
//! - **Tracing**: `X-Request-Id` middleware plus span helpers for terminal
//!   sessions and transport connections

pub mod logging;
pub mod tracing_setup;
