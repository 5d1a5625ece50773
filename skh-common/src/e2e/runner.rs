//! Subprocess execution of the tested program.
//!
//! [`CommandRunner`] resolves the `skill-hub` executable once, at
//! construction, then spawns it per [`Invocation`] with an explicit
//! environment override map. The ambient process environment is inherited
//! but never modified, so any number of runners (and sandboxes) can coexist.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::{BINARY_NAME, HarnessConfig};
use crate::e2e::logging::{ArtifactRecorder, InvocationRecord};
use crate::errors::{HarnessError, HarnessResult};
use crate::testing::TestPhase;

/// Poll interval while waiting on a child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for the `--version` probe made at construction.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Binary resolution
// ============================================================================

/// Locates the tested executable.
///
/// Precedence: explicit override, then a locally built binary in one of the
/// configured directories, then `PATH`.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    name: String,
    override_path: Option<PathBuf>,
    local_dirs: Vec<PathBuf>,
}

impl BinaryLocator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            override_path: None,
            local_dirs: Vec::new(),
        }
    }

    /// Locator for `skill-hub` using the override and local directories of `config`.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            name: BINARY_NAME.to_string(),
            override_path: config.binary_override.clone(),
            local_dirs: config.local_bin_dirs.clone(),
        }
    }

    pub fn with_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.override_path = Some(path.into());
        self
    }

    pub fn with_local_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.local_dirs = dirs;
        self
    }

    /// Resolve the executable path.
    ///
    /// An override that does not exist is an error even if the program is
    /// available elsewhere.
    pub fn resolve(&self) -> HarnessResult<PathBuf> {
        if let Some(path) = &self.override_path {
            if path.is_file() {
                debug!(path = %path.display(), "Using explicit skill-hub override");
                return Ok(path.clone());
            }
            return Err(HarnessError::ExecutableNotFound(format!(
                "override {} does not exist",
                path.display()
            )));
        }

        let file_name = format!("{}{}", self.name, std::env::consts::EXE_SUFFIX);
        for dir in &self.local_dirs {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "Using locally built skill-hub");
                return Ok(candidate);
            }
        }

        match which::which(&self.name) {
            Ok(path) => {
                debug!(path = %path.display(), "Using skill-hub from PATH");
                Ok(path)
            }
            Err(err) => {
                let searched = self
                    .local_dirs
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(HarnessError::ExecutableNotFound(format!(
                    "{} not in [{searched}] and not on PATH ({err})",
                    self.name
                )))
            }
        }
    }
}

// ============================================================================
// Invocation and result types
// ============================================================================

/// A single request to run the tested program.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    subcommand: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdin: Option<String>,
    timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Per-call environment override, applied after the runner's bound overrides.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, text: impl Into<String>) -> Self {
        self.stdin = Some(text.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn subcommand(&self) -> &str {
        &self.subcommand
    }
}

/// Observable outcome of one completed invocation.
///
/// A non-zero exit code is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Full argv, executable first.
    pub command: Vec<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

impl InvocationResult {
    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Check if stdout contains a pattern
    pub fn stdout_contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }

    /// Check if stderr contains a pattern
    pub fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr.contains(pattern)
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Shell-escaped command line.
    pub fn command_line(&self) -> String {
        render_command(&self.command)
    }

    /// Fail with `ValidationMismatch` unless the exit code is 0.
    pub fn assert_success(&self) -> HarnessResult<&Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HarnessError::ValidationMismatch(format!(
                "expected `{}` to succeed, exit code {}\nstdout:\n{}\nstderr:\n{}",
                self.command_line(),
                self.exit_code,
                self.stdout,
                self.stderr
            )))
        }
    }

    /// Fail with `ValidationMismatch` if the exit code is 0.
    pub fn assert_failure(&self) -> HarnessResult<&Self> {
        if self.success() {
            Err(HarnessError::ValidationMismatch(format!(
                "expected `{}` to fail, but it exited 0\nstdout:\n{}",
                self.command_line(),
                self.stdout
            )))
        } else {
            Ok(self)
        }
    }
}

pub(crate) fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|part| shell_escape::escape(Cow::from(part.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded retry policy with a fixed pause between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Pause after each failed attempt that is followed by another.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Classified result of one attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Completed with exit code 0.
    Succeeded(InvocationResult),
    /// Completed with a non-zero exit code.
    Failed(InvocationResult),
    /// Killed after exceeding its timeout.
    TimedOut(HarnessError),
    /// Could not be run at all.
    Errored(HarnessError),
}

impl AttemptOutcome {
    pub fn classify(result: HarnessResult<InvocationResult>) -> Self {
        match result {
            Ok(res) if res.success() => Self::Succeeded(res),
            Ok(res) => Self::Failed(res),
            Err(err @ HarnessError::ExecutionTimeout { .. }) => Self::TimedOut(err),
            Err(err) => Self::Errored(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timed_out",
            Self::Errored(_) => "errored",
        }
    }

    /// Completed attempts become `Ok`, even when they failed.
    pub fn into_result(self) -> HarnessResult<InvocationResult> {
        match self {
            Self::Succeeded(res) | Self::Failed(res) => Ok(res),
            Self::TimedOut(err) | Self::Errored(err) => Err(err),
        }
    }
}

/// Final state of a retry loop.
#[derive(Debug)]
pub struct RetryReport {
    /// Number of attempts actually made.
    pub attempts: u32,
    /// Outcome of the last attempt.
    pub last: AttemptOutcome,
}

// ============================================================================
// Runner
// ============================================================================

/// Builder for [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct CommandRunnerBuilder {
    locator: BinaryLocator,
    default_timeout: Duration,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    recorder: Option<ArtifactRecorder>,
    probe_version: bool,
    known_version: Option<String>,
    debug: bool,
}

impl CommandRunnerBuilder {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            locator: BinaryLocator::from_config(config),
            default_timeout: config.default_timeout,
            cwd: None,
            env: config
                .env_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            recorder: None,
            probe_version: true,
            known_version: None,
            debug: config.debug,
        }
    }

    /// Use this executable instead of searching.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.locator = self.locator.with_override(path);
        self
    }

    pub fn locator(mut self, locator: BinaryLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Working directory used when an invocation does not name one.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn recorder(mut self, recorder: ArtifactRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Skip the `--version` probe.
    pub fn without_version_probe(mut self) -> Self {
        self.probe_version = false;
        self
    }

    /// Reuse a version probed earlier instead of running `--version` again.
    pub fn known_version(mut self, version: Option<String>) -> Self {
        self.probe_version = false;
        self.known_version = version;
        self
    }

    /// Resolve the executable and build the runner.
    pub fn build(self) -> HarnessResult<CommandRunner> {
        let executable = self.locator.resolve()?;
        let mut runner = CommandRunner {
            executable,
            version: self.known_version,
            default_timeout: self.default_timeout,
            cwd: self.cwd,
            env: self.env,
            recorder: self.recorder,
            debug: self.debug,
        };
        if self.probe_version {
            runner.version = runner.probe_version();
        }
        info!(
            executable = %runner.executable.display(),
            version = runner.version.as_deref().unwrap_or("unknown"),
            "Command runner ready"
        );
        Ok(runner)
    }
}

/// Executes the tested program.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    executable: PathBuf,
    version: Option<String>,
    default_timeout: Duration,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    recorder: Option<ArtifactRecorder>,
    debug: bool,
}

impl CommandRunner {
    pub fn builder(config: &HarnessConfig) -> CommandRunnerBuilder {
        CommandRunnerBuilder::new(config)
    }

    /// Runner with the configuration read from the environment.
    pub fn from_env() -> HarnessResult<Self> {
        CommandRunnerBuilder::new(&HarnessConfig::from_env()?).build()
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// First line of `--version` output, if the probe succeeded.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Overrides applied to every invocation.
    pub fn bound_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn recorder(&self) -> Option<&ArtifactRecorder> {
        self.recorder.as_ref()
    }

    /// Run `skill-hub <subcommand> [args...]` with runner defaults.
    pub fn run<I, S>(&self, subcommand: &str, args: I) -> HarnessResult<InvocationResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_with(&Invocation::new(subcommand).args(args))
    }

    /// Run a fully specified invocation.
    pub fn run_with(&self, invocation: &Invocation) -> HarnessResult<InvocationResult> {
        let argv = self.argv(invocation);
        let command_line = render_command(&argv);
        let timeout = invocation.timeout.unwrap_or(self.default_timeout);
        let cwd = invocation.cwd.clone().or_else(|| self.cwd.clone());

        debug!(
            command = %command_line,
            cwd = ?cwd,
            timeout_ms = timeout.as_millis() as u64,
            stdin = invocation.stdin.is_some(),
            "Executing"
        );

        let mut cmd = Command::new(&self.executable);
        cmd.arg(&invocation.subcommand)
            .args(&invocation.args)
            .envs(&self.env)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can take down grandchildren too.
            cmd.process_group(0);
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let mut child = cmd
            .spawn()
            .map_err(|source| HarnessError::ExecutionFailure {
                command: command_line.clone(),
                source,
            })?;

        if let (Some(mut pipe), Some(text)) = (child.stdin.take(), invocation.stdin.clone()) {
            // Written off-thread so a child that never reads cannot block us.
            let _writer = thread::spawn(move || {
                let _ = pipe.write_all(text.as_bytes());
            });
        }
        let stdout_rx = spawn_reader(child.stdout.take());
        let stderr_rx = spawn_reader(child.stderr.take());

        let status = loop {
            let polled = match child.try_wait() {
                Ok(polled) => polled,
                Err(source) => {
                    kill_process_tree(&mut child);
                    return Err(HarnessError::ExecutionFailure {
                        command: command_line,
                        source,
                    });
                }
            };
            if let Some(status) = polled {
                break Some(status);
            }
            if Instant::now() >= deadline {
                kill_process_tree(&mut child);
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        // The child may be gone while a background grandchild still holds
        // the pipes; output collection shares the invocation deadline.
        let output = match status {
            Some(status) => match (
                collect_output(stdout_rx, deadline),
                collect_output(stderr_rx, deadline),
            ) {
                (Some(stdout), Some(stderr)) => Some((status, stdout, stderr)),
                _ => {
                    kill_process_tree(&mut child);
                    None
                }
            },
            None => None,
        };
        let duration = start.elapsed();

        let Some((status, stdout, stderr)) = output else {
            warn!(
                command = %command_line,
                timeout_ms = timeout.as_millis() as u64,
                "Invocation timed out, process group killed"
            );
            self.record(&command_line, cwd.as_deref(), None, duration, true, "", "");
            return Err(HarnessError::ExecutionTimeout {
                command: command_line,
                timeout,
            });
        };

        let result = InvocationResult {
            exit_code: exit_code(status),
            stdout,
            stderr,
            command: argv,
            duration,
        };

        if result.success() {
            debug!(
                command = %command_line,
                exit_code = result.exit_code,
                duration_ms = duration.as_millis() as u64,
                "Command completed"
            );
        } else {
            warn!(
                command = %command_line,
                exit_code = result.exit_code,
                duration_ms = duration.as_millis() as u64,
                "Command exited non-zero"
            );
        }
        if self.debug {
            for line in result.stdout.lines() {
                trace!(stream = "stdout", "{line}");
            }
            for line in result.stderr.lines() {
                trace!(stream = "stderr", "{line}");
            }
        }

        self.record(
            &command_line,
            cwd.as_deref(),
            Some(result.exit_code),
            duration,
            false,
            &result.stdout,
            &result.stderr,
        );
        Ok(result)
    }

    /// Retry with the given policy until an attempt succeeds.
    ///
    /// On exhaustion the last completed result is returned, or the last
    /// infrastructure error is raised.
    pub fn run_with_retry(
        &self,
        invocation: &Invocation,
        policy: &RetryPolicy,
    ) -> HarnessResult<InvocationResult> {
        self.retry_report(invocation, policy).last.into_result()
    }

    /// Retry loop returning the attempt count alongside the last outcome.
    pub fn retry_report(&self, invocation: &Invocation, policy: &RetryPolicy) -> RetryReport {
        let max_attempts = policy.attempts();
        let subcommand = invocation.subcommand();
        let mut attempt = 1;

        loop {
            debug!(subcommand, attempt, max_attempts, "Starting attempt");
            let outcome = AttemptOutcome::classify(self.run_with(invocation));

            if outcome.is_success() {
                if attempt > 1 {
                    info!(subcommand, attempt, "Attempt succeeded after retry");
                }
                return RetryReport {
                    attempts: attempt,
                    last: outcome,
                };
            }
            if attempt >= max_attempts {
                warn!(
                    subcommand,
                    attempt,
                    outcome = outcome.label(),
                    "Retries exhausted"
                );
                return RetryReport {
                    attempts: attempt,
                    last: outcome,
                };
            }

            warn!(
                subcommand,
                attempt,
                outcome = outcome.label(),
                delay_ms = policy.delay.as_millis() as u64,
                "Attempt failed, retrying"
            );
            thread::sleep(policy.delay);
            attempt += 1;
        }
    }

    fn argv(&self, invocation: &Invocation) -> Vec<String> {
        let mut argv = Vec::with_capacity(invocation.args.len() + 2);
        argv.push(self.executable.display().to_string());
        argv.push(invocation.subcommand.clone());
        argv.extend(invocation.args.iter().cloned());
        argv
    }

    fn probe_version(&self) -> Option<String> {
        let invocation = Invocation::new("--version")
            .timeout(self.default_timeout.min(VERSION_PROBE_TIMEOUT));
        match self.run_with(&invocation) {
            Ok(res) if res.success() => res
                .stdout
                .lines()
                .next()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty()),
            Ok(res) => {
                debug!(exit_code = res.exit_code, "Version probe exited non-zero");
                None
            }
            Err(err) => {
                debug!(error = %err, "Version probe failed");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        command_line: &str,
        cwd: Option<&Path>,
        exit_code: Option<i32>,
        duration: Duration,
        timed_out: bool,
        stdout: &str,
        stderr: &str,
    ) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let sequence = recorder.next_sequence();
        let prefix = format!("{sequence:04}");
        let mut artifact_paths = Vec::new();

        let trace_payload = serde_json::json!({
            "command": command_line,
            "cwd": cwd,
            "exit_code": exit_code,
            "duration_ms": duration.as_millis() as u64,
            "timed_out": timed_out,
            "stdout_len_bytes": stdout.len(),
            "stderr_len_bytes": stderr.len(),
        });
        if let Ok(path) = recorder.capture_json(&format!("{prefix}_trace"), &trace_payload) {
            artifact_paths.push(path);
        }
        if !stdout.is_empty()
            && let Ok(path) = recorder.capture_text(&format!("{prefix}_stdout"), stdout)
        {
            artifact_paths.push(path);
        }
        if !stderr.is_empty()
            && let Ok(path) = recorder.capture_text(&format!("{prefix}_stderr"), stderr)
        {
            artifact_paths.push(path);
        }

        let record = InvocationRecord {
            timestamp: chrono::Utc::now(),
            sequence,
            phase: TestPhase::Execute,
            command: command_line.to_string(),
            cwd: cwd.map(Path::to_path_buf),
            exit_code,
            duration_ms: duration.as_millis(),
            timed_out,
            stdout_len_bytes: stdout.len(),
            stderr_len_bytes: stderr.len(),
            artifact_paths,
        };
        if let Err(err) = recorder.append(&record) {
            warn!(error = %err, "Failed to append invocation record");
        }
    }
}

fn read_to_string<R: Read>(reader: &mut R) -> String {
    let mut buffer = Vec::new();
    if reader.read_to_end(&mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).to_string()
    } else {
        String::new()
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<mpsc::Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(read_to_string(&mut pipe));
        });
        rx
    })
}

/// `None` when the stream is still open at `deadline`.
fn collect_output(rx: Option<mpsc::Receiver<String>>, deadline: Instant) -> Option<String> {
    let Some(rx) = rx else {
        return Some(String::new());
    };
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(text) => Some(text),
        Err(mpsc::RecvTimeoutError::Disconnected) => Some(String::new()),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
    }
}

/// Kill the child's process group (unix) and the child itself, then reap it.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32) -> InvocationResult {
        InvocationResult {
            exit_code,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            command: vec!["skill-hub".to_string(), "status".to_string()],
            duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_success_tracks_exit_code() {
        assert!(result(0).success());
        assert!(!result(1).success());
        assert!(!result(-1).success());
    }

    #[test]
    fn test_result_assertions() {
        assert!(result(0).assert_success().is_ok());
        assert!(result(0).assert_failure().is_err());
        let err = result(2).assert_success().unwrap_err();
        assert!(matches!(err, HarnessError::ValidationMismatch(_)));
        assert!(err.to_string().contains("exit code 2"));
        assert!(result(2).assert_failure().is_ok());
    }

    #[test]
    fn test_combined_output() {
        let res = result(0);
        assert_eq!(res.combined_output(), "out\nerr");
        assert!(res.stdout_contains("ou"));
        assert!(res.stderr_contains("rr"));
    }

    #[test]
    fn test_command_line_escapes_arguments() {
        let mut res = result(0);
        res.command.push("two words".to_string());
        assert_eq!(res.command_line(), "skill-hub status 'two words'");
    }

    #[test]
    fn test_result_serializes_duration_as_millis() {
        let json = serde_json::to_value(result(0)).unwrap();
        assert_eq!(json["duration_ms"], 3);
        assert_eq!(json["exit_code"], 0);
    }

    #[test]
    fn test_attempt_outcome_classification() {
        assert!(AttemptOutcome::classify(Ok(result(0))).is_success());
        assert_eq!(AttemptOutcome::classify(Ok(result(3))).label(), "failed");

        let timeout = AttemptOutcome::classify(Err(HarnessError::ExecutionTimeout {
            command: "skill-hub update".to_string(),
            timeout: Duration::from_secs(1),
        }));
        assert_eq!(timeout.label(), "timed_out");
        assert!(timeout.into_result().is_err());

        let errored = AttemptOutcome::classify(Err(HarnessError::EnvironmentSetup(
            "boom".to_string(),
        )));
        assert_eq!(errored.label(), "errored");
    }

    #[test]
    fn test_failed_attempt_is_data() {
        let res = AttemptOutcome::classify(Ok(result(4))).into_result().unwrap();
        assert_eq!(res.exit_code, 4);
    }

    #[test]
    fn test_collect_output_respects_deadline() {
        let (tx, rx) = mpsc::channel::<String>();
        let start = Instant::now();
        assert_eq!(
            collect_output(Some(rx), start + Duration::from_millis(50)),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(tx);

        let (tx, rx) = mpsc::channel();
        tx.send("done".to_string()).unwrap();
        assert_eq!(
            collect_output(Some(rx), Instant::now()).as_deref(),
            Some("done")
        );
        assert_eq!(collect_output(None, Instant::now()).as_deref(), Some(""));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_process_tree_reaps_group() {
        use std::os::unix::process::CommandExt;

        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30"])
            .process_group(0)
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let start = Instant::now();
        kill_process_tree(&mut child);
        assert!(child.try_wait().unwrap().is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_minimum_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 3);
    }

    #[test]
    fn test_locator_missing_override_fails() {
        let locator = BinaryLocator::new("skill-hub")
            .with_override("/definitely/not/here/skill-hub");
        let err = locator.resolve().unwrap_err();
        assert!(matches!(err, HarnessError::ExecutableNotFound(_)));
    }

    #[test]
    fn test_locator_unknown_name_fails() {
        let locator = BinaryLocator::new("skh-no-such-program-4f1c")
            .with_local_dirs(vec![PathBuf::from("/definitely/not/here")]);
        assert!(matches!(
            locator.resolve(),
            Err(HarnessError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_locator_prefers_local_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let name = "skh-local-probe";
        let file = dir
            .path()
            .join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
        std::fs::write(&file, "").unwrap();
        let locator = BinaryLocator::new(name).with_local_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(locator.resolve().unwrap(), file);
    }

    #[test]
    fn test_invocation_builder() {
        let inv = Invocation::new("use")
            .arg("alpha")
            .args(["--target", "cursor"])
            .env("SKILL_HUB_TEST_DEBUG", "1")
            .stdin("y\n")
            .timeout(Duration::from_secs(2));
        assert_eq!(inv.subcommand(), "use");
        assert_eq!(inv.args, vec!["alpha", "--target", "cursor"]);
        assert_eq!(inv.env.get("SKILL_HUB_TEST_DEBUG").map(String::as_str), Some("1"));
        assert_eq!(inv.stdin.as_deref(), Some("y\n"));
        assert_eq!(inv.timeout, Some(Duration::from_secs(2)));
    }
}
