//! Failure diagnostics: environment capture, failure reports, snapshots and
//! directory analysis.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::HarnessConfig;
use crate::e2e::logging::sanitize_artifact_component;
use crate::e2e::runner::BinaryLocator;
use crate::errors::{HarnessError, HarnessResult};

/// Files larger than this get no preview in [`analyze_directory`].
const PREVIEW_MAX_FILE_BYTES: u64 = 10 * 1024;

/// Characters kept in a file preview.
const PREVIEW_CHARS: usize = 500;

/// Characters of each differing line shown by [`compare_files`].
const DIFF_LINE_CHARS: usize = 100;

/// Entries of `PATH` kept in [`EnvironmentInfo`].
const PATH_ENTRIES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub cwd: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    pub home: Option<String>,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillHubInfo {
    pub installed: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

/// Snapshot of the machine and process the harness runs in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub timestamp: DateTime<Utc>,
    pub harness_version: String,
    pub system: SystemInfo,
    pub process: ProcessInfo,
    pub skill_hub: SkillHubInfo,
}

impl EnvironmentInfo {
    /// Record the executable actually used and its version.
    pub fn with_skill_hub(mut self, path: &Path, version: Option<&str>) -> Self {
        self.skill_hub = SkillHubInfo {
            installed: true,
            path: Some(path.to_path_buf()),
            version: version.map(str::to_string),
        };
        self
    }
}

/// Capture environment metadata. Does not run the tested program.
///
/// The skill-hub path is resolved the way a runner built from `config`
/// would resolve it; the version stays unset until [`EnvironmentInfo::with_skill_hub`].
pub fn capture_environment(config: &HarnessConfig) -> EnvironmentInfo {
    let skill_hub_path = BinaryLocator::from_config(config).resolve().ok();
    EnvironmentInfo {
        timestamp: Utc::now(),
        harness_version: env!("CARGO_PKG_VERSION").to_string(),
        system: SystemInfo {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: current_user(),
        },
        process: ProcessInfo {
            cwd: std::env::current_dir().ok(),
            executable: std::env::current_exe().ok(),
            home: std::env::var("HOME").ok(),
            path: std::env::var_os("PATH")
                .map(|path| {
                    std::env::split_paths(&path)
                        .take(PATH_ENTRIES)
                        .map(|p| p.display().to_string())
                        .collect()
                })
                .unwrap_or_default(),
        },
        skill_hub: SkillHubInfo {
            installed: skill_hub_path.is_some(),
            path: skill_hub_path,
            version: None,
        },
    }
}

#[cfg(unix)]
fn current_user() -> Option<String> {
    whoami::username().ok()
}

#[cfg(not(unix))]
fn current_user() -> Option<String> {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .ok()
}

/// Why a test failed, as written to `failure_info.json` / `exception.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub test: String,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureInfo {
    pub fn new(test: &str, kind: &str, message: &str) -> Self {
        Self {
            test: test.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(test: &str, error: &HarnessError) -> Self {
        Self::new(test, error.kind(), &error.to_string())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    fs::write(path, rendered)
}

/// Write `failure_info.json` into `dir`.
pub fn write_failure_report(dir: &Path, failure: &FailureInfo) -> std::io::Result<PathBuf> {
    let path = dir.join(crate::e2e::sandbox::FAILURE_INFO_FILE);
    write_json(&path, failure)?;
    Ok(path)
}

/// Copy `source_dir` into a new snapshot directory under `base` together with
/// `environment.json` (from `environment`), `exception.json` (when `failure` is given) and a
/// `README.md` describing how to inspect it.
pub fn create_snapshot(
    base: &Path,
    name: &str,
    source_dir: &Path,
    environment: &EnvironmentInfo,
    failure: Option<&FailureInfo>,
) -> HarnessResult<PathBuf> {
    fs::create_dir_all(base)?;
    let snapshot_dir = tempfile::Builder::new()
        .prefix(&format!("snapshot_{}_", sanitize_artifact_component(name)))
        .tempdir_in(base)?
        .keep();

    if source_dir.exists() {
        let dest = snapshot_dir.join("test_environment");
        if let Err(err) = copy_tree(source_dir, &dest) {
            warn!(
                source = %source_dir.display(),
                error = %err,
                "Failed to copy tree into snapshot"
            );
        }
    }

    write_json(&snapshot_dir.join("environment.json"), environment)?;
    if let Some(failure) = failure {
        write_json(&snapshot_dir.join("exception.json"), failure)?;
    }
    fs::write(
        snapshot_dir.join("README.md"),
        snapshot_readme(name, &snapshot_dir, source_dir),
    )?;

    info!(snapshot = %snapshot_dir.display(), "Debug snapshot created");
    Ok(snapshot_dir)
}

fn snapshot_readme(name: &str, snapshot_dir: &Path, source_dir: &Path) -> String {
    let dir = snapshot_dir.display();
    format!(
        "# Debug snapshot: {name}\n\
         \n\
         - Created: {created}\n\
         - Snapshot: {dir}\n\
         - Source: {source}\n\
         \n\
         ## Contents\n\
         \n\
         1. `test_environment/`: copy of the sandbox at snapshot time\n\
         2. `environment.json`: system and process metadata\n\
         3. `exception.json`: failure details (when present)\n\
         \n\
         ## Inspect\n\
         \n\
         ```bash\n\
         ls -la {dir}\n\
         cat {dir}/environment.json\n\
         cat {dir}/exception.json 2>/dev/null || echo \"no exception recorded\"\n\
         find {dir} -name .skill-hub -type d | head -1 | xargs ls -la\n\
         ```\n\
         \n\
         Delete the snapshot directory when done.\n",
        created = Utc::now().to_rfc3339(),
        source = source_dir.display(),
    )
}

/// Recursively copy `src` into `dest`. Symlinks are skipped.
pub fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(copied)
}

/// One file in a [`DirectoryReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Leading text of files under 10 KiB.
    pub preview: Option<String>,
}

/// Directory tree with small-file previews.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryReport {
    pub path: PathBuf,
    pub files: Vec<FileEntry>,
    pub directories: BTreeMap<String, DirectoryReport>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub depth_exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Describe `dir` down to `max_depth` levels.
pub fn analyze_directory(dir: &Path, max_depth: usize) -> HarnessResult<DirectoryReport> {
    if !dir.is_dir() {
        return Err(HarnessError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("directory does not exist: {}", dir.display()),
        )));
    }
    Ok(scan_dir(dir, 0, max_depth))
}

fn scan_dir(dir: &Path, depth: usize, max_depth: usize) -> DirectoryReport {
    let mut report = DirectoryReport {
        path: dir.to_path_buf(),
        ..DirectoryReport::default()
    };
    if depth > max_depth {
        report.depth_exceeded = true;
        return report;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            report.error = Some(err.to_string());
            return report;
        }
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            report
                .directories
                .insert(name, scan_dir(&path, depth + 1, max_depth));
            continue;
        }
        let metadata = entry.metadata().ok();
        let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
        let modified = metadata
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        let preview = (size < PREVIEW_MAX_FILE_BYTES).then(|| preview(&path));
        report.files.push(FileEntry {
            name,
            size,
            modified,
            preview,
        });
    }
    report
}

fn preview(path: &Path) -> String {
    match fs::read(path).map(String::from_utf8) {
        Ok(Ok(content)) => {
            let mut chars = content.chars();
            let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
            if chars.next().is_some() {
                format!("{head}...")
            } else {
                head
            }
        }
        _ => "[binary or unreadable]".to_string(),
    }
}

/// Matches kept per file by [`find_pattern_in_directory`].
const MATCHES_PER_FILE: usize = 5;

/// One regex match; offsets are byte offsets into the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Files under a directory matching a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMatches {
    pub file: PathBuf,
    /// The first few matches only.
    pub matches: Vec<PatternMatch>,
    pub match_count: usize,
}

/// Search files under `dir` whose names end with `suffix` for `pattern`
/// (case-insensitive). Files that are not valid UTF-8 are skipped.
pub fn find_pattern_in_directory(
    dir: &Path,
    pattern: &str,
    suffix: &str,
) -> HarnessResult<Vec<FileMatches>> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| {
            HarnessError::EnvironmentSetup(format!("invalid pattern {pattern:?}: {err}"))
        })?;

    let mut results = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name().into_iter().flatten() {
        if !entry.file_type().is_file()
            || !entry.file_name().to_string_lossy().ends_with(suffix)
        {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            debug!(path = %entry.path().display(), "Skipping unreadable file");
            continue;
        };
        let found: Vec<_> = regex.find_iter(&content).collect();
        if found.is_empty() {
            continue;
        }
        results.push(FileMatches {
            file: entry.path().to_path_buf(),
            matches: found
                .iter()
                .take(MATCHES_PER_FILE)
                .map(|m| PatternMatch {
                    text: m.as_str().to_string(),
                    start: m.start(),
                    end: m.end(),
                })
                .collect(),
            match_count: found.len(),
        });
    }
    Ok(results)
}

/// Outcome of one test, as listed by [`create_test_report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub passed: bool,
    #[serde(with = "duration_secs")]
    pub duration: std::time::Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Write `test_report.md` summarizing `results` into `output_dir`.
pub fn create_test_report(results: &[TestCaseResult], output_dir: &Path) -> HarnessResult<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let pass_rate = if total == 0 {
        "n/a".to_string()
    } else {
        format!("{:.1}%", passed as f64 / total as f64 * 100.0)
    };

    let mut report = format!(
        "# Test report\n\
         \n\
         ## Summary\n\
         - Generated: {generated}\n\
         - Total: {total}\n\
         - Passed: {passed}\n\
         - Failed: {failed}\n\
         - Pass rate: {pass_rate}\n\
         \n\
         ## Results\n\
         \n",
        generated = Utc::now().to_rfc3339(),
        failed = total - passed,
    );
    for (index, result) in results.iter().enumerate() {
        let status = if result.passed { "PASS" } else { "FAIL" };
        report.push_str(&format!("### {}. {}\n", index + 1, result.name));
        report.push_str(&format!("- Status: {status}\n"));
        report.push_str(&format!("- Duration: {:.2}s\n", result.duration.as_secs_f64()));
        if !result.passed {
            let error = result.error.as_deref().unwrap_or("unknown error");
            report.push_str(&format!("- Error: {error}\n"));
        }
        if let Some(info) = &result.debug_info {
            report.push_str(&format!("- Debug info: {info}\n"));
        }
        report.push('\n');
    }

    let path = output_dir.join("test_report.md");
    fs::write(&path, report)?;
    info!(report = %path.display(), total, passed, "Test report written");
    Ok(path)
}

/// Result of [`compare_files`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileComparison {
    pub file1: PathBuf,
    pub file2: PathBuf,
    pub exists1: bool,
    pub exists2: bool,
    pub equal: bool,
    pub differences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Compare two files by size and line by line.
pub fn compare_files(file1: &Path, file2: &Path) -> FileComparison {
    let mut result = FileComparison {
        file1: file1.to_path_buf(),
        file2: file2.to_path_buf(),
        exists1: file1.exists(),
        exists2: file2.exists(),
        equal: false,
        differences: Vec::new(),
        error: None,
    };
    if !result.exists1 || !result.exists2 {
        return result;
    }

    let (content1, content2) = match (fs::read_to_string(file1), fs::read_to_string(file2)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(err), _) | (_, Err(err)) => {
            result.error = Some(format!("failed to read files: {err}"));
            return result;
        }
    };

    if content1.len() != content2.len() {
        result.differences.push(format!(
            "size differs: {} != {}",
            content1.len(),
            content2.len()
        ));
    }
    if content1 == content2 {
        result.equal = true;
        return result;
    }

    let lines1: Vec<&str> = content1.lines().collect();
    let lines2: Vec<&str> = content2.lines().collect();
    for (index, (line1, line2)) in lines1.iter().zip(lines2.iter()).enumerate() {
        if line1 != line2 {
            result.differences.push(format!(
                "line {} differs:\n  file1: {}\n  file2: {}",
                index + 1,
                truncate(line1),
                truncate(line2)
            ));
        }
    }
    if lines1.len() != lines2.len() {
        result.differences.push(format!(
            "line count differs: {} != {}",
            lines1.len(),
            lines2.len()
        ));
    }
    result
}

fn truncate(line: &str) -> String {
    if line.chars().count() > DIFF_LINE_CHARS {
        format!("{}...", line.chars().take(DIFF_LINE_CHARS).collect::<String>())
    } else {
        line.to_string()
    }
}
