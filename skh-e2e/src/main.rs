//! skill-hub E2E harness - operator CLI
//!
//! Environment checks, skill/YAML validation, snapshots and sandbox cleanup
//! for the black-box test suite.

#![forbid(unsafe_code)]

mod checks;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use skh_common::e2e::diagnostics::analyze_directory;
use skh_common::e2e::{
    CommandRunnerBuilder, FileValidator, Outcome, Sandbox, TestCaseResult, YamlValidator,
    capture_environment, cleanup_stale_sandboxes, create_snapshot, create_test_report,
    find_pattern_in_directory,
};
use skh_common::{HarnessConfig, LogConfig, init_logging};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "skh-e2e")]
#[command(author, version, about = "skill-hub E2E harness tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that this machine can run the suite
    Check {
        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Per-target network probe timeout in seconds
        #[arg(long, default_value = "3")]
        network_timeout_secs: u64,
    },

    /// Validate a skill directory (SKILL.md structure and front matter)
    ValidateSkill {
        /// Skill directory containing SKILL.md
        dir: PathBuf,

        /// Expected skill name (mismatch is a warning)
        #[arg(long)]
        name: Option<String>,
    },

    /// Compare two YAML files key by key
    CompareYaml {
        first: PathBuf,
        second: PathBuf,

        /// Keys ignored at any depth (repeatable)
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },

    /// Copy a directory into a diagnostic snapshot
    Snapshot {
        /// Directory to capture
        dir: PathBuf,

        /// Snapshot name
        #[arg(long, default_value = "manual")]
        name: String,

        /// Where snapshots are written (defaults to <temp dir>/snapshots)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Describe a directory tree with small-file previews (JSON)
    Analyze {
        dir: PathBuf,

        #[arg(long, default_value = "3")]
        max_depth: usize,
    },

    /// Search files under a directory for a case-insensitive pattern (JSON)
    Find {
        dir: PathBuf,
        pattern: String,

        /// Only files whose names end with this suffix
        #[arg(long, default_value = ".md")]
        suffix: String,
    },

    /// Remove preserved sandboxes older than the given age
    Cleanup {
        /// Maximum age in hours
        #[arg(long, default_value = "24")]
        max_age_hours: u64,
    },

    /// Acquire a sandbox, run `status` in its project and release it
    Smoke {
        /// Write test_report.md for the run into this directory
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = HarnessConfig::from_env()?;

    match cli.command {
        Commands::Check {
            json,
            network_timeout_secs,
        } => {
            let results = checks::run_checks(&config, Duration::from_secs(network_timeout_secs));
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print!("{}", checks::render(&results));
            }
            if !checks::all_passed(&results) {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::ValidateSkill { dir, name } => {
            let structure_ok = FileValidator::new(false).assert_skill_structure(&dir)?;
            let outcome = YamlValidator::new(false)
                .validate_skill_front_matter(&dir.join("SKILL.md"), name.as_deref())?;
            for error in &outcome.errors {
                println!("error: {error}");
            }
            for warning in &outcome.warnings {
                println!("warning: {warning}");
            }
            if structure_ok && outcome.valid {
                println!("{}: valid", dir.display());
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Commands::CompareYaml {
            first,
            second,
            ignore,
        } => {
            let ignore: Vec<&str> = ignore.iter().map(String::as_str).collect();
            let comparison = YamlValidator::default().compare_files(&first, &second, &ignore)?;
            if comparison.equal {
                println!("equal");
                return Ok(());
            }
            for difference in &comparison.differences {
                println!("{difference}");
            }
            std::process::exit(1);
        }
        Commands::Snapshot { dir, name, output } => {
            let base = output.unwrap_or_else(|| config.temp_dir.join("snapshots"));
            let environment = match CommandRunnerBuilder::new(&config).build() {
                Ok(runner) => capture_environment(&config)
                    .with_skill_hub(runner.executable(), runner.version()),
                Err(err) => {
                    warn!(error = %err, "skill-hub not resolved, snapshot without version");
                    capture_environment(&config)
                }
            };
            let path = create_snapshot(&base, &name, &dir, &environment, None)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Analyze { dir, max_depth } => {
            let report = analyze_directory(&dir, max_depth)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Find {
            dir,
            pattern,
            suffix,
        } => {
            let found = find_pattern_in_directory(&dir, &pattern, &suffix)?;
            println!("{}", serde_json::to_string_pretty(&found)?);
            Ok(())
        }
        Commands::Cleanup { max_age_hours } => {
            let removed = cleanup_stale_sandboxes(
                &config.temp_dir,
                Duration::from_secs(max_age_hours.saturating_mul(3600)),
            );
            println!("Removed {removed} stale sandbox(es) from {}", config.temp_dir.display());
            Ok(())
        }
        Commands::Smoke { report } => run_smoke(&config, report.as_deref()),
    }
}

fn run_smoke(config: &HarnessConfig, report_dir: Option<&Path>) -> Result<()> {
    let start = Instant::now();
    let mut sandbox = Sandbox::acquire("smoke", config)?;
    let result = match sandbox.runner().and_then(|runner| runner.run("status", [] as [&str; 0])) {
        Ok(result) => result,
        Err(err) => {
            sandbox.fail(&err);
            sandbox.release(Outcome::Fail);
            if let Some(dir) = report_dir {
                write_smoke_report(dir, start, Some(err.to_string()), None)?;
            }
            return Err(err.into());
        }
    };

    info!(exit_code = result.exit_code, "Smoke invocation finished");
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);

    let failure = (!result.success()).then(|| format!("status exited {}", result.exit_code));
    let outcome = match &failure {
        Some(reason) => {
            sandbox.mark_failed(reason);
            Outcome::Fail
        }
        None => Outcome::Pass,
    };
    let disposition = sandbox.release(outcome);
    println!("smoke: {outcome:?} ({disposition:?})");
    if let Some(dir) = report_dir {
        let path = write_smoke_report(dir, start, failure, Some(format!("{disposition:?}")))?;
        println!("report: {}", path.display());
    }
    if outcome == Outcome::Fail {
        std::process::exit(1);
    }
    Ok(())
}

fn write_smoke_report(
    dir: &Path,
    start: Instant,
    error: Option<String>,
    debug_info: Option<String>,
) -> Result<PathBuf> {
    let result = TestCaseResult {
        name: "smoke: status".to_string(),
        passed: error.is_none(),
        duration: start.elapsed(),
        error,
        debug_info,
    };
    Ok(create_test_report(&[result], dir)?)
}
