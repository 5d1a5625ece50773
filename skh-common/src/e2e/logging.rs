//! Per-sandbox artifact recording.
//!
//! Every invocation made through a sandbox-bound runner leaves a JSON trace,
//! its stdout/stderr as text files under `<root>/artifacts/`, and one line in
//! `<root>/invocations.jsonl`. A preserved sandbox therefore carries the full
//! history of what the tested program was asked to do.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::testing::TestPhase;

/// Directory (relative to the sandbox root) holding captured artifacts.
pub const ARTIFACT_DIR: &str = "artifacts";

/// JSONL file (relative to the sandbox root) with one line per invocation.
pub const INVOCATION_LOG: &str = "invocations.jsonl";

/// One line of `invocations.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub timestamp: DateTime<Utc>,
    pub sequence: u32,
    pub phase: TestPhase,
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// `None` when the invocation did not complete.
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    pub timed_out: bool,
    pub stdout_len_bytes: usize,
    pub stderr_len_bytes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_paths: Vec<PathBuf>,
}

/// Writes invocation artifacts for one sandbox.
///
/// Cloning shares the sequence counter so artifacts from clones of the same
/// runner never collide.
#[derive(Debug, Clone)]
pub struct ArtifactRecorder {
    root: PathBuf,
    sequence: Arc<AtomicU32>,
}

impl ArtifactRecorder {
    pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            root: sandbox_root.into(),
            sequence: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join(ARTIFACT_DIR)
    }

    pub fn invocation_log(&self) -> PathBuf {
        self.root.join(INVOCATION_LOG)
    }

    /// Reserve the next invocation sequence number (1-based).
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Persist a text artifact.
    pub fn capture_text(&self, artifact_name: &str, content: &str) -> std::io::Result<PathBuf> {
        let dir = self.artifact_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.txt", sanitize_artifact_component(artifact_name)));
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Persist a JSON artifact.
    pub fn capture_json<T: Serialize>(
        &self,
        artifact_name: &str,
        value: &T,
    ) -> std::io::Result<PathBuf> {
        let serialized = serde_json::to_string_pretty(value).map_err(|error| {
            std::io::Error::other(format!("failed to serialize artifact json: {error}"))
        })?;
        let dir = self.artifact_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", sanitize_artifact_component(artifact_name)));
        fs::write(&path, serialized)?;
        Ok(path)
    }

    /// Append one record to `invocations.jsonl`.
    pub fn append(&self, record: &InvocationRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record).map_err(|error| {
            std::io::Error::other(format!("failed to serialize invocation record: {error}"))
        })?;
        fs::create_dir_all(&self.root)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.invocation_log())?;
        writeln!(file, "{line}")
    }

    /// Read back every record written so far.
    pub fn records(&self) -> std::io::Result<Vec<InvocationRecord>> {
        read_records(&self.invocation_log())
    }
}

/// Parse an `invocations.jsonl` file, skipping lines that do not decode.
pub fn read_records(path: &Path) -> std::io::Result<Vec<InvocationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

pub(crate) fn sanitize_artifact_component(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            cleaned.push(ch);
        } else {
            cleaned.push('_');
        }
    }
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(sequence: u32) -> InvocationRecord {
        InvocationRecord {
            timestamp: Utc::now(),
            sequence,
            phase: TestPhase::Execute,
            command: "skill-hub status".to_string(),
            cwd: None,
            exit_code: Some(0),
            duration_ms: 12,
            timed_out: false,
            stdout_len_bytes: 5,
            stderr_len_bytes: 0,
            artifact_paths: Vec::new(),
        }
    }

    #[test]
    fn test_sanitize_artifact_component() {
        assert_eq!(sanitize_artifact_component("0001 status/--json"), "0001_status_--json");
        assert_eq!(sanitize_artifact_component(""), "artifact");
    }

    #[test]
    fn test_capture_and_append() {
        let dir = TempDir::new().unwrap();
        let recorder = ArtifactRecorder::new(dir.path());

        let text = recorder.capture_text("0001_status_stdout", "hello").unwrap();
        assert_eq!(std::fs::read_to_string(text).unwrap(), "hello");

        let json = recorder
            .capture_json("0001_status_trace", &serde_json::json!({"exit_code": 0}))
            .unwrap();
        assert!(json.starts_with(recorder.artifact_dir()));

        recorder.append(&record(1)).unwrap();
        recorder.append(&record(2)).unwrap();
        let records = recorder.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence, 2);
    }

    #[test]
    fn test_clones_share_sequence() {
        let dir = TempDir::new().unwrap();
        let recorder = ArtifactRecorder::new(dir.path());
        let clone = recorder.clone();
        assert_eq!(recorder.next_sequence(), 1);
        assert_eq!(clone.next_sequence(), 2);
    }

    #[test]
    fn test_records_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let recorder = ArtifactRecorder::new(dir.path().join("nope"));
        assert!(recorder.records().unwrap().is_empty());
    }
}
