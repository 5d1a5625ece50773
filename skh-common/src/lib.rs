//! Shared library for the skill-hub E2E harness.
//!
//! Everything a test needs to drive the `skill-hub` binary as a black box:
//! configuration, the error taxonomy, logging setup and the [`e2e`] toolkit.

#![forbid(unsafe_code)]

pub mod config;
pub mod e2e;
pub mod errors;
pub mod logging;
pub mod testing;

pub use config::{BINARY_NAME, BINARY_OVERRIDE_VAR, HarnessConfig};
pub use errors::{HarnessError, HarnessResult};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
