//! Isolated per-test filesystem and environment.
//!
//! A [`Sandbox`] owns a fresh directory tree:
//!
//! ```text
//! <temp_dir>/<name>_<timestamp>_<random>/
//! ├── environment_info.json
//! ├── invocations.jsonl      (once something ran)
//! ├── artifacts/
//! ├── home/                  (HOME for the tested program)
//! └── project/               (default working directory)
//! ```
//!
//! Isolation is expressed as an override map handed to each spawned process.
//! The harness process environment is only read, never written, so sandboxes
//! may be nested or used from several threads at once.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::HarnessConfig;
use crate::e2e::diagnostics::{self, FailureInfo};
use crate::e2e::fixtures::HubLayout;
use crate::e2e::logging::{ArtifactRecorder, INVOCATION_LOG, sanitize_artifact_component};
use crate::e2e::runner::{CommandRunner, CommandRunnerBuilder};
use crate::errors::{HarnessError, HarnessResult};

/// Debug flag understood by the tested program.
pub const DEBUG_ENV_VAR: &str = "SKILL_HUB_TEST_DEBUG";

/// Keys whose values a sandbox overrides for the tested program.
pub const SCOPED_ENV_KEYS: [&str; 2] = ["HOME", DEBUG_ENV_VAR];

/// Metadata written into every sandbox root.
pub const ENVIRONMENT_INFO_FILE: &str = "environment_info.json";

/// Report written into a preserved sandbox root.
pub const FAILURE_INFO_FILE: &str = "failure_info.json";

/// How a test ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Unknown,
}

/// What release did with the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Deleted,
    Preserved(PathBuf),
    /// Deletion was attempted and failed; the error was logged.
    DeleteFailed(PathBuf),
}

/// Directory a relative path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Root,
    Home,
    Project,
}

/// Values of the scoped keys in the harness process at acquisition time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EnvSnapshot {
    values: BTreeMap<String, Option<String>>,
}

impl EnvSnapshot {
    /// Record the current value (or absence) of each key.
    pub fn capture<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = keys
            .into_iter()
            .map(|key| {
                let key = key.as_ref().to_string();
                let value = std::env::var(&key).ok();
                (key, value)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_deref())
    }

    /// Keys whose current value differs from the snapshot.
    pub fn drifted(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(key, value)| std::env::var(key).ok() != **value)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Builder for [`Sandbox`].
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    name: String,
    config: HarnessConfig,
    keep_on_failure: Option<bool>,
    env: BTreeMap<String, String>,
}

impl SandboxBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HarnessConfig::default(),
            keep_on_failure: None,
            env: BTreeMap::new(),
        }
    }

    pub fn config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn keep_on_failure(mut self, keep: bool) -> Self {
        self.keep_on_failure = Some(keep);
        self
    }

    /// Extra override for every invocation in this sandbox.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn acquire(self) -> HarnessResult<Sandbox> {
        let keep_on_failure = self.keep_on_failure.unwrap_or(self.config.keep_on_failure);
        Sandbox::create(self.name, self.config, keep_on_failure, self.env)
    }
}

/// Isolated directory tree and environment overrides for one test.
#[derive(Debug)]
pub struct Sandbox {
    name: String,
    root_dir: PathBuf,
    home_dir: PathBuf,
    project_dir: PathBuf,
    keep_on_failure: bool,
    outcome: Outcome,
    failure: Option<FailureInfo>,
    overrides: BTreeMap<String, String>,
    snapshot: EnvSnapshot,
    config: HarnessConfig,
    recorder: ArtifactRecorder,
    executable: Option<PathBuf>,
    version: Option<String>,
    released: bool,
}

impl Sandbox {
    pub fn builder(name: impl Into<String>) -> SandboxBuilder {
        SandboxBuilder::new(name)
    }

    /// Create a sandbox using `config`.
    pub fn acquire(name: &str, config: &HarnessConfig) -> HarnessResult<Self> {
        SandboxBuilder::new(name).config(config.clone()).acquire()
    }

    /// Run `body` in a fresh sandbox, releasing it as passed on `Ok` and as
    /// failed on `Err`.
    pub fn scope<T, F>(name: &str, config: &HarnessConfig, body: F) -> HarnessResult<T>
    where
        F: FnOnce(&mut Sandbox) -> HarnessResult<T>,
    {
        let mut sandbox = Self::acquire(name, config)?;
        let result = body(&mut sandbox);
        match &result {
            Ok(_) => sandbox.mark_passed(),
            Err(err) => sandbox.fail(err),
        }
        let outcome = sandbox.outcome;
        sandbox.release(outcome);
        result
    }

    fn create(
        name: String,
        config: HarnessConfig,
        keep_on_failure: bool,
        extra_env: BTreeMap<String, String>,
    ) -> HarnessResult<Self> {
        let snapshot = EnvSnapshot::capture(SCOPED_ENV_KEYS);

        fs::create_dir_all(&config.temp_dir).map_err(|err| {
            HarnessError::EnvironmentSetup(format!(
                "cannot create {}: {err}",
                config.temp_dir.display()
            ))
        })?;
        let prefix = format!(
            "{}_{}_",
            sanitize_artifact_component(&name.replace("::", "_")),
            chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f")
        );
        // Removed on drop until setup has fully succeeded.
        let root = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&config.temp_dir)
            .map_err(|err| {
                HarnessError::EnvironmentSetup(format!("cannot create sandbox root: {err}"))
            })?;

        let home_dir = root.path().join("home");
        let project_dir = root.path().join("project");
        for dir in [&home_dir, &project_dir] {
            fs::create_dir_all(dir).map_err(|err| {
                HarnessError::EnvironmentSetup(format!("cannot create {}: {err}", dir.display()))
            })?;
        }

        let mut overrides = BTreeMap::new();
        overrides.insert("HOME".to_string(), home_dir.display().to_string());
        overrides.insert(DEBUG_ENV_VAR.to_string(), "1".to_string());
        overrides.extend(extra_env);

        // Resolved and probed once; runners from this sandbox reuse the result.
        let (executable, version) = match CommandRunnerBuilder::new(&config)
            .cwd(&project_dir)
            .envs(overrides.clone())
            .build()
        {
            Ok(runner) => (
                Some(runner.executable().to_path_buf()),
                runner.version().map(str::to_string),
            ),
            Err(err) => {
                debug!(sandbox = %name, error = %err, "skill-hub not resolved for sandbox");
                (None, None)
            }
        };
        let mut environment = diagnostics::capture_environment(&config);
        if let Some(path) = &executable {
            environment = environment.with_skill_hub(path, version.as_deref());
        }

        let info = serde_json::json!({
            "sandbox": {
                "name": name,
                "root_dir": root.path(),
                "home_dir": home_dir,
                "project_dir": project_dir,
                "keep_on_failure": keep_on_failure,
                "overrides": overrides,
                "ambient": snapshot,
            },
            "environment": environment,
        });
        let rendered = serde_json::to_string_pretty(&info)
            .map_err(|err| HarnessError::EnvironmentSetup(err.to_string()))?;
        fs::write(root.path().join(ENVIRONMENT_INFO_FILE), rendered).map_err(|err| {
            HarnessError::EnvironmentSetup(format!("cannot write {ENVIRONMENT_INFO_FILE}: {err}"))
        })?;

        let root_dir = root.keep();
        info!(
            sandbox = %name,
            root = %root_dir.display(),
            version = version.as_deref().unwrap_or("unknown"),
            "Sandbox acquired"
        );
        Ok(Self {
            name,
            recorder: ArtifactRecorder::new(&root_dir),
            root_dir,
            home_dir,
            project_dir,
            keep_on_failure,
            outcome: Outcome::Unknown,
            failure: None,
            overrides,
            snapshot,
            config,
            executable,
            version,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn keep_on_failure(&self) -> bool {
        self.keep_on_failure
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Ambient values of the scoped keys recorded at acquisition.
    pub fn snapshot(&self) -> &EnvSnapshot {
        &self.snapshot
    }

    /// Overrides applied to every invocation made through [`Sandbox::runner`].
    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.overrides
    }

    pub fn recorder(&self) -> &ArtifactRecorder {
        &self.recorder
    }

    /// Runner builder bound to this sandbox (project cwd, overrides, artifacts).
    pub fn runner_builder(&self) -> CommandRunnerBuilder {
        let builder = CommandRunnerBuilder::new(&self.config)
            .cwd(&self.project_dir)
            .envs(self.overrides.clone())
            .recorder(self.recorder.clone());
        match &self.executable {
            Some(path) => builder
                .executable(path.clone())
                .known_version(self.version.clone()),
            None => builder,
        }
    }

    /// Version reported by `--version` when the sandbox was acquired.
    pub fn skill_hub_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Runner bound to this sandbox.
    pub fn runner(&self) -> HarnessResult<CommandRunner> {
        self.runner_builder().build()
    }

    /// The `~/.skill-hub` layout inside the sandbox home.
    pub fn hub(&self) -> HubLayout {
        HubLayout::new(&self.home_dir)
    }

    pub fn hub_dir(&self) -> PathBuf {
        self.hub().hub_dir()
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.hub().repo_dir()
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.hub().skills_dir()
    }

    pub fn state_file(&self) -> PathBuf {
        self.hub().state_file()
    }

    pub fn mark_passed(&mut self) {
        self.outcome = Outcome::Pass;
        self.failure = None;
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.outcome = Outcome::Fail;
        self.failure = Some(FailureInfo::new(&self.name, "TestFailure", reason));
    }

    /// Mark failed with the kind and message of `error`.
    pub fn fail(&mut self, error: &HarnessError) {
        if error.is_infrastructure() {
            warn!(
                sandbox = %self.name,
                kind = error.kind(),
                error = %error,
                "Harness infrastructure error"
            );
        }
        self.outcome = Outcome::Fail;
        self.failure = Some(FailureInfo::from_error(&self.name, error));
    }

    /// Resolve `rel` against `location`, rejecting escapes from the sandbox.
    pub fn path(&self, rel: impl AsRef<Path>, location: Location) -> HarnessResult<PathBuf> {
        let rel = rel.as_ref();
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(HarnessError::EnvironmentSetup(format!(
                "path must stay inside the sandbox: {}",
                rel.display()
            )));
        }
        let base = match location {
            Location::Root => &self.root_dir,
            Location::Home => &self.home_dir,
            Location::Project => &self.project_dir,
        };
        Ok(base.join(rel))
    }

    /// Write a file under the project directory, creating parents.
    pub fn create_project_file(
        &self,
        rel: impl AsRef<Path>,
        content: &str,
    ) -> HarnessResult<PathBuf> {
        self.create_file(rel, content, Location::Project)
    }

    /// Write a file under the sandbox home, creating parents.
    pub fn create_home_file(&self, rel: impl AsRef<Path>, content: &str) -> HarnessResult<PathBuf> {
        self.create_file(rel, content, Location::Home)
    }

    fn create_file(
        &self,
        rel: impl AsRef<Path>,
        content: &str,
        location: Location,
    ) -> HarnessResult<PathBuf> {
        let path = self.path(rel, location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        debug!(path = %path.display(), bytes = content.len(), "Created sandbox file");
        Ok(path)
    }

    pub fn read_file(&self, rel: impl AsRef<Path>, location: Location) -> HarnessResult<String> {
        let path = self.path(rel, location)?;
        Ok(fs::read_to_string(path)?)
    }

    /// Sorted file paths below `rel`, relative to `rel`.
    ///
    /// A missing directory lists as empty.
    pub fn list_files(&self, rel: impl AsRef<Path>, location: Location) -> HarnessResult<Vec<PathBuf>> {
        let dir = self.path(rel, location)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = entry.map_err(|err| HarnessError::Io(std::io::Error::other(err)))?;
            if entry.file_type().is_file()
                && let Ok(relative) = entry.path().strip_prefix(&dir)
            {
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Release with `outcome`.
    ///
    /// The root is deleted on pass, or on fail when `keep_on_failure` is off.
    /// Otherwise it is preserved with `failure_info.json` and inspection
    /// commands are printed. Deletion errors are logged, never raised.
    pub fn release(mut self, outcome: Outcome) -> Disposition {
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Outcome) -> Disposition {
        self.released = true;
        self.outcome = outcome;

        let drifted = self.snapshot.drifted();
        if !drifted.is_empty() {
            warn!(
                sandbox = %self.name,
                keys = ?drifted,
                "Ambient environment changed while sandbox was active"
            );
        }

        let delete = match outcome {
            Outcome::Pass => true,
            Outcome::Fail => !self.keep_on_failure,
            Outcome::Unknown => false,
        };

        if delete {
            return match fs::remove_dir_all(&self.root_dir) {
                Ok(()) => {
                    debug!(sandbox = %self.name, "Sandbox deleted");
                    Disposition::Deleted
                }
                Err(err) => {
                    warn!(
                        sandbox = %self.name,
                        root = %self.root_dir.display(),
                        error = %err,
                        "Failed to delete sandbox"
                    );
                    Disposition::DeleteFailed(self.root_dir.clone())
                }
            };
        }

        self.preserve();
        Disposition::Preserved(self.root_dir.clone())
    }

    fn preserve(&mut self) {
        let failure = self.failure.take().unwrap_or_else(|| match self.outcome {
            Outcome::Unknown => FailureInfo::new(
                &self.name,
                "Unknown",
                "sandbox released without a recorded outcome",
            ),
            _ => FailureInfo::new(&self.name, "TestFailure", "test failed"),
        });
        if let Err(err) = diagnostics::write_failure_report(&self.root_dir, &failure) {
            warn!(sandbox = %self.name, error = %err, "Failed to write failure report");
        }

        let root = shell_escape::escape(Cow::from(self.root_dir.display().to_string())).into_owned();
        let mut commands = vec![
            format!("cd {root}"),
            format!("ls -la {root}"),
            format!("cat {root}/{ENVIRONMENT_INFO_FILE}"),
            format!("cat {root}/{FAILURE_INFO_FILE}"),
        ];
        if self.root_dir.join(INVOCATION_LOG).exists() {
            commands.push(format!("cat {root}/{INVOCATION_LOG}"));
        }

        warn!(
            sandbox = %self.name,
            root = %self.root_dir.display(),
            kind = %failure.kind,
            "Sandbox preserved for inspection"
        );
        eprintln!("[e2e::sandbox] Preserved {} at {}", self.name, self.root_dir.display());
        eprintln!("[e2e::sandbox] Inspect with:");
        for command in commands {
            eprintln!("    {command}");
        }
    }

    /// Wrap in a guard that releases as passed unless the thread is panicking.
    pub fn guard(self) -> SandboxGuard {
        SandboxGuard { sandbox: Some(self) }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if std::thread::panicking() && self.outcome != Outcome::Fail {
            self.mark_failed("test panicked");
        }
        let outcome = self.outcome;
        self.finish(outcome);
    }
}

/// Releases its sandbox on every exit path.
///
/// Dropping during a panic releases as failed, otherwise as passed unless a
/// failure was recorded.
#[derive(Debug)]
pub struct SandboxGuard {
    sandbox: Option<Sandbox>,
}

impl SandboxGuard {
    /// Release now, using the outcome the guard would use on drop.
    pub fn finish(mut self) -> Option<Disposition> {
        self.sandbox.take().map(|sandbox| {
            let outcome = guard_outcome(&sandbox);
            sandbox.release(outcome)
        })
    }
}

fn guard_outcome(sandbox: &Sandbox) -> Outcome {
    if std::thread::panicking() {
        Outcome::Fail
    } else if sandbox.outcome == Outcome::Unknown {
        Outcome::Pass
    } else {
        sandbox.outcome
    }
}

impl Deref for SandboxGuard {
    type Target = Sandbox;

    fn deref(&self) -> &Sandbox {
        // Only `finish` and `drop` empty the option, and both consume the guard.
        match &self.sandbox {
            Some(sandbox) => sandbox,
            None => unreachable!("sandbox guard used after release"),
        }
    }
}

impl DerefMut for SandboxGuard {
    fn deref_mut(&mut self) -> &mut Sandbox {
        match &mut self.sandbox {
            Some(sandbox) => sandbox,
            None => unreachable!("sandbox guard used after release"),
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if let Some(mut sandbox) = self.sandbox.take() {
            let outcome = guard_outcome(&sandbox);
            if outcome == Outcome::Fail && sandbox.failure.is_none() {
                sandbox.mark_failed("test panicked");
            }
            sandbox.release(outcome);
        }
    }
}

/// Remove sandbox roots under `base_dir` last modified more than `max_age` ago.
///
/// Returns the number of directories removed.
pub fn cleanup_stale_sandboxes(base_dir: &Path, max_age: Duration) -> usize {
    if !base_dir.exists() {
        return 0;
    }

    let now = SystemTime::now();
    let mut cleaned = 0;

    if let Ok(entries) = fs::read_dir(base_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let is_stale = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|modified| {
                    now.duration_since(modified)
                        .map(|age| age > max_age)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            if is_stale {
                match fs::remove_dir_all(&path) {
                    Ok(()) => cleaned += 1,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Failed to remove stale sandbox")
                    }
                }
            }
        }
    }

    if cleaned > 0 {
        info!(
            base = %base_dir.display(),
            removed = cleaned,
            "Removed stale sandboxes"
        );
    }
    cleaned
}
