//! Pre-flight checks for running the E2E suite on this machine.

use std::fs;
use std::time::Duration;

use serde::Serialize;
use skh_common::HarnessConfig;
use skh_common::e2e::CommandRunnerBuilder;
use skh_common::e2e::network::network_status;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    fn symbol(self) -> &'static str {
        match self {
            Self::Pass => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    fn new(name: &'static str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name,
            status,
            message: message.into(),
        }
    }
}

/// Run every check. Network problems only warn: network scenarios skip.
pub fn run_checks(config: &HarnessConfig, network_timeout: Duration) -> Vec<CheckResult> {
    let mut results = Vec::new();

    match CommandRunnerBuilder::new(config).build() {
        Ok(runner) => {
            results.push(CheckResult::new(
                "skill-hub binary",
                CheckStatus::Pass,
                runner.executable().display().to_string(),
            ));
            results.push(match runner.version() {
                Some(version) => CheckResult::new("skill-hub version", CheckStatus::Pass, version),
                None => CheckResult::new(
                    "skill-hub version",
                    CheckStatus::Warn,
                    "`--version` produced no output",
                ),
            });
        }
        Err(err) => {
            results.push(CheckResult::new(
                "skill-hub binary",
                CheckStatus::Fail,
                err.to_string(),
            ));
        }
    }

    results.push(check_temp_dir(config));

    let network = network_status(network_timeout);
    results.push(if network.available {
        CheckResult::new(
            "network",
            CheckStatus::Pass,
            format!("reachable: {}", network.reachable.join(", ")),
        )
    } else if network.forced_offline {
        CheckResult::new("network", CheckStatus::Warn, "offline mode forced")
    } else {
        CheckResult::new(
            "network",
            CheckStatus::Warn,
            "no probe target reachable, network scenarios will be skipped",
        )
    });

    results
}

fn check_temp_dir(config: &HarnessConfig) -> CheckResult {
    let probe = config.temp_dir.join(".skh_write_probe");
    let outcome = fs::create_dir_all(&config.temp_dir)
        .and_then(|()| fs::write(&probe, b"probe"))
        .and_then(|()| fs::remove_file(&probe));
    match outcome {
        Ok(()) => CheckResult::new(
            "temp dir writable",
            CheckStatus::Pass,
            config.temp_dir.display().to_string(),
        ),
        Err(err) => {
            debug!(dir = %config.temp_dir.display(), error = %err, "Temp dir probe failed");
            CheckResult::new(
                "temp dir writable",
                CheckStatus::Fail,
                format!("{}: {err}", config.temp_dir.display()),
            )
        }
    }
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.status != CheckStatus::Fail)
}

pub fn render(results: &[CheckResult]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!(
            "{:>4}  {:<20} {}\n",
            result.status.symbol(),
            result.name,
            result.message
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = HarnessConfig {
            temp_dir: dir.path().join("base"),
            binary_override: Some(dir.path().join("nope")),
            ..HarnessConfig::default()
        };

        let results = run_checks(&config, Duration::from_millis(50));
        let binary = results
            .iter()
            .find(|r| r.name == "skill-hub binary")
            .unwrap();
        assert_eq!(binary.status, CheckStatus::Fail);
        assert!(binary.message.contains("nope"));
        assert!(results.iter().all(|r| r.name != "skill-hub version"));

        let temp = results
            .iter()
            .find(|r| r.name == "temp dir writable")
            .unwrap();
        assert_eq!(temp.status, CheckStatus::Pass);
        assert!(results.iter().any(|r| r.name == "network"));

        assert!(!all_passed(&results));
        assert!(render(&results).contains("FAIL  skill-hub binary"));
    }

    #[test]
    fn test_warnings_still_pass() {
        let results = vec![CheckResult::new("network", CheckStatus::Warn, "offline")];
        assert!(all_passed(&results));
    }
}
