//! Assertions on files and directory trees.

use std::fs;
use std::path::Path;

use serde_yaml_ng::Value;
use similar::TextDiff;
use tracing::warn;

use super::rules::{
    Check, EvalMode, FieldRule, Kind, PathNode, Rule, Schema, Severity, YamlNode, evaluate,
    evaluate_rules,
};
use super::yaml::{YamlValidator, split_front_matter};
use crate::errors::{HarnessError, HarnessResult};

/// Unified line diff of `expected` against `actual`. Empty when equal.
pub fn unified_diff(expected: &str, actual: &str) -> String {
    if expected == actual {
        return String::new();
    }
    TextDiff::from_lines(expected, actual)
        .unified_diff()
        .context_radius(3)
        .header("expected", "actual")
        .to_string()
}

/// What must (or must not) exist under a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    File,
    Absent,
    Directory(ExpectedStructure),
}

/// Expected directory contents, checked in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedStructure {
    entries: Vec<(String, Expectation)>,
}

impl ExpectedStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` must be a file.
    pub fn file(mut self, name: impl Into<String>) -> Self {
        self.entries.push((name.into(), Expectation::File));
        self
    }

    /// `name` must not exist.
    pub fn absent(mut self, name: impl Into<String>) -> Self {
        self.entries.push((name.into(), Expectation::Absent));
        self
    }

    /// `name` must be a directory with `children`.
    pub fn dir(mut self, name: impl Into<String>, children: ExpectedStructure) -> Self {
        self.entries
            .push((name.into(), Expectation::Directory(children)));
        self
    }

    pub fn entries(&self) -> &[(String, Expectation)] {
        &self.entries
    }

    /// Read the mapping form: `true` for a file, `false` for absent, a
    /// nested mapping for a directory. Key order is preserved.
    pub fn from_yaml(value: &Value) -> HarnessResult<Self> {
        let Some(mapping) = value.as_mapping() else {
            return Err(HarnessError::ValidationMismatch(
                "expected structure must be a mapping".to_string(),
            ));
        };
        let mut structure = Self::new();
        for (key, expectation) in mapping {
            let Some(name) = key.as_str() else {
                return Err(HarnessError::ValidationMismatch(format!(
                    "expected structure key must be a string, found {key:?}"
                )));
            };
            structure = match expectation {
                Value::Bool(true) => structure.file(name),
                Value::Bool(false) => structure.absent(name),
                Value::Mapping(_) => structure.dir(name, Self::from_yaml(expectation)?),
                other => {
                    return Err(HarnessError::ValidationMismatch(format!(
                        "expectation for {name} must be true, false or a mapping, found {other:?}"
                    )));
                }
            };
        }
        Ok(structure)
    }

    /// Equivalent schema for the rule evaluator.
    pub fn to_schema(&self) -> Schema {
        self.entries
            .iter()
            .fold(Schema::new(), |schema, (name, expectation)| {
                let field = FieldRule::new(name.as_str());
                let field = match expectation {
                    Expectation::File => field
                        .rule(
                            Rule::error(Check::Present).with_message("expected file, found nothing"),
                        )
                        .error(Check::Kind(Kind::File)),
                    Expectation::Absent => field.error(Check::Absent),
                    Expectation::Directory(children) => field
                        .rule(
                            Rule::error(Check::Present)
                                .with_message("expected directory, found nothing"),
                        )
                        .error(Check::Kind(Kind::Directory))
                        .error(Check::Nested(children.to_schema())),
                };
                schema.field(field)
            })
    }
}

/// File and directory assertions.
///
/// In strict mode a failed assertion returns `ValidationMismatch`; otherwise
/// it is logged and reported as `Ok(false)`.
#[derive(Debug, Clone, Copy)]
pub struct FileValidator {
    strict: bool,
}

impl Default for FileValidator {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl FileValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn fail(&self, message: String) -> HarnessResult<bool> {
        if self.strict {
            Err(HarnessError::ValidationMismatch(message))
        } else {
            warn!(%message, "File assertion failed");
            Ok(false)
        }
    }

    pub fn assert_file_exists(&self, path: &Path) -> HarnessResult<bool> {
        if path.is_file() {
            Ok(true)
        } else if path.exists() {
            self.fail(format!("not a file: {}", path.display()))
        } else {
            self.fail(format!("file does not exist: {}", path.display()))
        }
    }

    pub fn assert_directory_exists(&self, path: &Path) -> HarnessResult<bool> {
        if path.is_dir() {
            Ok(true)
        } else if path.exists() {
            self.fail(format!("not a directory: {}", path.display()))
        } else {
            self.fail(format!("directory does not exist: {}", path.display()))
        }
    }

    /// Content must equal `expected` exactly; the failure carries a unified diff.
    pub fn assert_file_content_exact(&self, path: &Path, expected: &str) -> HarnessResult<bool> {
        let actual = match read(path) {
            Ok(content) => content,
            Err(message) => return self.fail(message),
        };
        if actual == expected {
            return Ok(true);
        }
        self.fail(format!(
            "content mismatch: {}\n{}",
            path.display(),
            unified_diff(expected, &actual)
        ))
    }

    pub fn assert_file_contains(&self, path: &Path, text: &str) -> HarnessResult<bool> {
        match read(path) {
            Ok(content) if content.contains(text) => Ok(true),
            Ok(_) => self.fail(format!(
                "file does not contain expected text: {}\nexpected: {text}",
                path.display()
            )),
            Err(message) => self.fail(message),
        }
    }

    pub fn assert_file_not_contains(&self, path: &Path, text: &str) -> HarnessResult<bool> {
        match read(path) {
            Ok(content) if content.contains(text) => self.fail(format!(
                "file contains unexpected text: {}\ntext: {text}",
                path.display()
            )),
            Ok(_) => Ok(true),
            Err(message) => self.fail(message),
        }
    }

    /// Check `root` against `expected`, stopping at the first violation.
    pub fn assert_directory_structure(
        &self,
        root: &Path,
        expected: &ExpectedStructure,
    ) -> HarnessResult<bool> {
        let Some(node) = PathNode::open(root).filter(|n| n.path().is_dir()) else {
            return self.fail(format!("directory does not exist: {}", root.display()));
        };
        let findings = evaluate(&node, &expected.to_schema(), EvalMode::FailFast);
        match findings.iter().find(|f| f.severity == Severity::Error) {
            Some(finding) => self.fail(format!(
                "directory structure mismatch under {}: {finding}",
                root.display()
            )),
            None => Ok(true),
        }
    }

    /// `SKILL.md` must exist, open with a `---` front matter block and
    /// declare `name:` and `description:` inside it.
    pub fn assert_skill_structure(&self, skill_dir: &Path) -> HarnessResult<bool> {
        let Some(node) = PathNode::open(skill_dir).filter(|n| n.path().is_dir()) else {
            return self.fail(format!("skill directory does not exist: {}", skill_dir.display()));
        };
        let schema = Schema::new().field(
            FieldRule::new("SKILL.md")
                .rule(Rule::error(Check::Present).with_message("SKILL.md is missing"))
                .error(Check::Kind(Kind::File))
                .rule(
                    Rule::error(Check::matches(r"\A---\r?\n")?)
                        .with_message("missing YAML front matter"),
                ),
        );
        if let Some(finding) = evaluate(&node, &schema, EvalMode::FailFast).first() {
            return self.fail(format!(
                "invalid skill structure in {}: {finding}",
                skill_dir.display()
            ));
        }

        let content = match read(&skill_dir.join("SKILL.md")) {
            Ok(content) => content,
            Err(message) => return self.fail(message),
        };
        let Some((front_matter, _)) = split_front_matter(&content) else {
            return self.fail(format!(
                "invalid skill structure in {}: SKILL.md: missing YAML front matter",
                skill_dir.display()
            ));
        };
        let front_matter = Value::String(front_matter.to_string());
        let rules = [
            Rule::error(Check::matches(r"(?m)^name:")?)
                .with_message("missing required field: name"),
            Rule::error(Check::matches(r"(?m)^description:")?)
                .with_message("missing required field: description"),
        ];
        let findings = evaluate_rules(
            Some(&YamlNode(&front_matter)),
            &rules,
            "SKILL.md",
            EvalMode::FailFast,
        );
        match findings.first() {
            Some(finding) => self.fail(format!(
                "invalid skill structure in {}: {finding}",
                skill_dir.display()
            )),
            None => Ok(true),
        }
    }

    /// Every key of `expected` must be present with an equal value; nested
    /// mappings are compared recursively. Extra keys are allowed.
    pub fn assert_yaml_structure(&self, path: &Path, expected: &Value) -> HarnessResult<bool> {
        let actual = match YamlValidator::new(self.strict).load(path) {
            Ok(value) => value,
            Err(err) if self.strict => return Err(err),
            Err(err) => return self.fail(err.to_string()),
        };
        match yaml_structure_mismatch(&actual, expected, "") {
            Some(message) => self.fail(format!("{}: {message}", path.display())),
            None => Ok(true),
        }
    }
}

/// Undecodable bytes are replaced, so mismatches still produce a diff.
fn read(path: &Path) -> Result<String, String> {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|err| format!("cannot read {}: {err}", path.display()))
}

fn yaml_structure_mismatch(actual: &Value, expected: &Value, path: &str) -> Option<String> {
    let Some(expected_map) = expected.as_mapping() else {
        return (actual != expected).then(|| {
            format!(
                "{path} value mismatch: expected {}, found {}",
                render(expected),
                render(actual)
            )
        });
    };
    let Some(actual_map) = actual.as_mapping() else {
        let shown = if path.is_empty() { "document" } else { path };
        return Some(format!("{shown} should be a map, found {}", render(actual)));
    };
    for (key, expected_value) in expected_map {
        let name = key.as_str().map(str::to_string).unwrap_or_else(|| render(key));
        let full_path = if path.is_empty() {
            name
        } else {
            format!("{path}.{name}")
        };
        let Some(actual_value) = actual_map.get(key) else {
            return Some(format!("missing key: {full_path}"));
        };
        if let Some(message) = yaml_structure_mismatch(actual_value, expected_value, &full_path) {
            return Some(message);
        }
    }
    None
}

fn render(value: &Value) -> String {
    serde_yaml_ng::to_string(value)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| format!("{value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unified_diff_empty_when_equal() {
        assert!(unified_diff("a\nb\n", "a\nb\n").is_empty());
        let diff = unified_diff("a\nb\n", "a\nc\n");
        assert!(diff.contains("--- expected"));
        assert!(diff.contains("+++ actual"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }

    #[test]
    fn test_exact_content_round_trip_and_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("SKILL.md");
        let content = "---\nname: a\n---\n# A\n";
        fs::write(&path, content).unwrap();

        let strict = FileValidator::new(true);
        assert!(strict.assert_file_content_exact(&path, content).unwrap());

        let mutated = content.replace("# A", "# B");
        let err = strict.assert_file_content_exact(&path, &mutated).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("-# B"));
        assert!(message.contains("+# A"));

        let lenient = FileValidator::new(false);
        assert!(!lenient.assert_file_content_exact(&path, &mutated).unwrap());
    }

    #[test]
    fn test_exists_and_contains() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "hello world").unwrap();
        let v = FileValidator::default();

        assert!(v.assert_file_exists(&path).unwrap());
        assert!(v.assert_directory_exists(dir.path()).unwrap());
        assert!(v.assert_file_exists(dir.path()).is_err());
        assert!(v.assert_directory_exists(&path).is_err());
        assert!(v.assert_file_exists(&dir.path().join("nope")).is_err());

        assert!(v.assert_file_contains(&path, "world").unwrap());
        assert!(v.assert_file_contains(&path, "mars").is_err());
        assert!(v.assert_file_not_contains(&path, "mars").unwrap());
        assert!(v.assert_file_not_contains(&path, "hello").is_err());
        assert!(v.assert_file_contains(&dir.path().join("nope"), "x").is_err());
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".agents/skills/a")).unwrap();
        fs::write(dir.path().join(".agents/skills/a/SKILL.md"), "x").unwrap();
        dir
    }

    #[test]
    fn test_directory_structure_passes() {
        let dir = tree();
        let expected = ExpectedStructure::new().dir(
            ".agents",
            ExpectedStructure::new().dir(
                "skills",
                ExpectedStructure::new()
                    .dir("a", ExpectedStructure::new().file("SKILL.md"))
                    .absent("b"),
            ),
        );
        assert!(FileValidator::default()
            .assert_directory_structure(dir.path(), &expected)
            .unwrap());
    }

    #[test]
    fn test_directory_structure_fails_fast_in_order() {
        let dir = tree();
        let expected = ExpectedStructure::new()
            .file(".cursorrules")
            .dir(".agents", ExpectedStructure::new().absent("skills"));
        let err = FileValidator::default()
            .assert_directory_structure(dir.path(), &expected)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains(".cursorrules: expected file, found nothing"));
        assert!(!message.contains("skills"));
    }

    #[test]
    fn test_directory_structure_wrong_kind() {
        let dir = tree();
        let expected = ExpectedStructure::new().file(".agents");
        let err = FileValidator::default()
            .assert_directory_structure(dir.path(), &expected)
            .unwrap_err();
        assert!(err.to_string().contains(".agents: expected file, found directory"));
    }

    #[test]
    fn test_expected_structure_from_yaml_keeps_order() {
        let value: Value =
            serde_yaml_ng::from_str("z.txt: true\na:\n  b.txt: false\n").unwrap();
        let structure = ExpectedStructure::from_yaml(&value).unwrap();
        assert_eq!(
            structure,
            ExpectedStructure::new()
                .file("z.txt")
                .dir("a", ExpectedStructure::new().absent("b.txt"))
        );
        let bad: Value = serde_yaml_ng::from_str("a: 3\n").unwrap();
        assert!(ExpectedStructure::from_yaml(&bad).is_err());
    }

    #[test]
    fn test_skill_structure() {
        let dir = TempDir::new().unwrap();
        let v = FileValidator::default();
        assert!(v.assert_skill_structure(dir.path()).is_err());

        fs::write(dir.path().join("SKILL.md"), "# no front matter\nname: x\n").unwrap();
        let err = v.assert_skill_structure(dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing YAML front matter"));

        fs::write(dir.path().join("SKILL.md"), "---\nname: x\n---\nbody\n").unwrap();
        let err = v.assert_skill_structure(dir.path()).unwrap_err();
        assert!(err.to_string().contains("description"));

        fs::write(
            dir.path().join("SKILL.md"),
            "---\nname: x\ndescription: a skill\n---\nbody\n",
        )
        .unwrap();
        assert!(v.assert_skill_structure(dir.path()).unwrap());
    }

    #[test]
    fn test_skill_structure_rejects_undecodable_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("SKILL.md"), b"\xff\xfe garbage with no front matter").unwrap();

        let err = FileValidator::new(true)
            .assert_skill_structure(dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("cannot read as text"));
        assert!(!FileValidator::new(false)
            .assert_skill_structure(dir.path())
            .unwrap());
    }

    #[test]
    fn test_skill_fields_must_be_in_front_matter() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("SKILL.md"),
            "---\nname: x\n---\n# Usage\ndescription: only in the body\n",
        )
        .unwrap();
        let err = FileValidator::default()
            .assert_skill_structure(dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("missing required field: description"));

        fs::write(dir.path().join("SKILL.md"), "---\nname: x\ndescription: y\n").unwrap();
        let err = FileValidator::default()
            .assert_skill_structure(dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("missing YAML front matter"));
    }

    #[test]
    fn test_exact_content_diffs_undecodable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.md");
        fs::write(&path, b"line one\n\xff line two\n").unwrap();

        let err = FileValidator::default()
            .assert_file_content_exact(&path, "line one\nline two\n")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("content mismatch"));
        assert!(message.contains("-line two"));
        assert!(message.contains("+\u{FFFD} line two"));
    }

    #[test]
    fn test_yaml_structure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "repo:\n  url: x\n  branch: main\ntarget: cursor\n").unwrap();
        let v = FileValidator::default();

        let expected: Value = serde_yaml_ng::from_str("repo:\n  branch: main\n").unwrap();
        assert!(v.assert_yaml_structure(&path, &expected).unwrap());

        let wrong: Value = serde_yaml_ng::from_str("repo:\n  branch: dev\n").unwrap();
        let err = v.assert_yaml_structure(&path, &wrong).unwrap_err();
        assert!(err.to_string().contains("repo.branch value mismatch"));

        let missing: Value = serde_yaml_ng::from_str("remote: x\n").unwrap();
        let err = v.assert_yaml_structure(&path, &missing).unwrap_err();
        assert!(err.to_string().contains("missing key: remote"));

        let not_map: Value = serde_yaml_ng::from_str("target:\n  name: cursor\n").unwrap();
        assert!(v.assert_yaml_structure(&path, &not_map).is_err());
    }
}
