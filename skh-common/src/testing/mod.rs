//! Test support shared by unit and integration tests.

pub mod log;

pub use log::{TestPhase, find_target_dir, init_global_test_logging};
