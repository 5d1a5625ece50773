//! Black-box E2E harness for the `skill-hub` CLI.
//!
//! - [`runner`]: locate the binary and run it with timeouts and retries
//! - [`sandbox`]: isolated home/project directories with preserve-on-failure
//! - [`validate`]: rule engine plus file and YAML validators
//! - [`diagnostics`]: environment capture, snapshots, directory analysis
//! - [`fixtures`]: hub layout, state inspection, seeded skills
//! - [`logging`]: per-sandbox invocation artifacts
//! - [`network`]: reachability probe for remote scenarios

pub mod diagnostics;
pub mod fixtures;
pub mod logging;
pub mod network;
pub mod runner;
pub mod sandbox;
pub mod validate;

pub use diagnostics::{
    EnvironmentInfo, FailureInfo, TestCaseResult, capture_environment, create_snapshot,
    create_test_report, find_pattern_in_directory,
};
pub use fixtures::{HubLayout, ProjectConfig, SkillFixture, StateFile};
pub use logging::{ArtifactRecorder, InvocationRecord};
pub use network::{is_network_available, require_network};
pub use runner::{
    AttemptOutcome, BinaryLocator, CommandRunner, CommandRunnerBuilder, Invocation,
    InvocationResult, RetryPolicy, RetryReport,
};
pub use sandbox::{
    Disposition, EnvSnapshot, Location, Outcome, Sandbox, SandboxBuilder, SandboxGuard,
    cleanup_stale_sandboxes,
};
pub use validate::{ExpectedStructure, FileValidator, ValidationOutcome, YamlValidator};
