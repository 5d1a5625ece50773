//! Harness configuration.
//!
//! Values come from [`HarnessConfig::default`], are overlaid by
//! `SKH_*` environment variables through [`EnvParser`], and can be further
//! overridden by the runner/sandbox builders.

pub mod env;

pub use env::{EnvError, EnvParser};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{HarnessError, HarnessResult};

/// Environment variable naming an explicit skill-hub binary.
pub const BINARY_OVERRIDE_VAR: &str = "SKILL_HUB_BIN";

/// Name of the executable under test.
pub const BINARY_NAME: &str = "skill-hub";

/// Configuration for the harness
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Base directory under which sandboxes are created
    pub temp_dir: PathBuf,
    /// Default timeout for each invocation
    pub default_timeout: Duration,
    /// Attempts made by `run_with_retry` (including the first)
    pub retry_attempts: u32,
    /// Pause between failed attempts
    pub retry_delay: Duration,
    /// Whether a failed test leaves its sandbox on disk
    pub keep_on_failure: bool,
    /// Verbose harness logging
    pub debug: bool,
    /// Explicit binary path (highest precedence during resolution)
    pub binary_override: Option<PathBuf>,
    /// Directories searched for a locally built binary, in order
    pub local_bin_dirs: Vec<PathBuf>,
    /// Environment variables set for all invocations
    pub env_vars: HashMap<String, String>,
    /// Log level for harness tracing output
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        // Local builds are resolved relative to the workspace root, not the
        // sandbox the child runs in.
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")));
        let manifest_dir = manifest_dir.canonicalize().unwrap_or(manifest_dir);
        let workspace_root = manifest_dir
            .parent()
            .unwrap_or(manifest_dir.as_path())
            .to_path_buf();
        let cargo_target = std::env::var("CARGO_TARGET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("target"));
        let cargo_target = if cargo_target.is_absolute() {
            cargo_target
        } else {
            workspace_root.join(cargo_target)
        };

        Self {
            temp_dir: std::env::temp_dir().join("skh_e2e_tests"),
            default_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            keep_on_failure: true,
            debug: false,
            binary_override: None,
            local_bin_dirs: vec![
                workspace_root.clone(),
                cargo_target.join("debug"),
                cargo_target.join("release"),
            ],
            env_vars: HashMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Overlay `SKH_*` variables and `SKILL_HUB_BIN` from the process environment.
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_parser(&mut EnvParser::new())
    }

    /// Overlay values read through `parser` on top of the defaults.
    ///
    /// All parse errors are collected and reported together.
    pub fn from_parser(parser: &mut EnvParser) -> HarnessResult<Self> {
        let defaults = Self::default();

        let timeout_secs = parser.get_u64_range(
            "TIMEOUT_SECS",
            defaults.default_timeout.as_secs(),
            1,
            3600,
        );
        let retry_attempts = parser.get_u32_range("RETRY_ATTEMPTS", defaults.retry_attempts, 1, 20);
        let retry_delay_ms = parser.get_u64_range(
            "RETRY_DELAY_MS",
            defaults.retry_delay.as_millis() as u64,
            0,
            60_000,
        );
        let keep_on_failure = parser.get_bool("KEEP_ON_FAILURE", defaults.keep_on_failure);
        let debug = parser.get_bool("DEBUG", defaults.debug);
        let log_level = parser.get_log_level(
            "LOG_LEVEL",
            if debug { "debug" } else { &defaults.log_level },
        );
        let temp_dir = parser
            .get_optional_path("TEMP_DIR")
            .unwrap_or(defaults.temp_dir.clone());
        // Existence is checked by the binary locator so the failure surfaces
        // as ExecutableNotFound at runner construction.
        let binary_override = parser.get_raw_path(BINARY_OVERRIDE_VAR, false);

        let errors = parser.take_errors();
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HarnessError::EnvironmentSetup(format!(
                "invalid harness configuration: {joined}"
            )));
        }

        Ok(Self {
            temp_dir,
            default_timeout: Duration::from_secs(timeout_secs),
            retry_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            keep_on_failure,
            debug,
            binary_override,
            log_level,
            ..defaults
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> HarnessResult<HarnessConfig> {
        let mut parser = EnvParser::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        HarnessConfig::from_parser(&mut parser)
    }

    #[test]
    fn test_defaults_when_environment_empty() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert!(config.keep_on_failure);
        assert!(config.binary_override.is_none());
        assert_eq!(config.local_bin_dirs.len(), 3);
    }

    #[test]
    fn test_overrides_applied() {
        let config = config_from(&[
            ("SKH_TIMEOUT_SECS", "5"),
            ("SKH_RETRY_ATTEMPTS", "7"),
            ("SKH_RETRY_DELAY_MS", "10"),
            ("SKH_KEEP_ON_FAILURE", "false"),
            ("SKH_DEBUG", "1"),
            ("SKH_TEMP_DIR", "/tmp/skh-custom"),
            ("SKILL_HUB_BIN", "/opt/skill-hub"),
        ])
        .unwrap();
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_attempts, 7);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert!(!config.keep_on_failure);
        assert!(config.debug);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/skh-custom"));
        assert_eq!(config.binary_override, Some(PathBuf::from("/opt/skill-hub")));
    }

    #[test]
    fn test_invalid_values_reported_together() {
        let err = config_from(&[("SKH_TIMEOUT_SECS", "0"), ("SKH_DEBUG", "sometimes")])
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("SKH_TIMEOUT_SECS"));
        assert!(message.contains("SKH_DEBUG"));
    }
}
