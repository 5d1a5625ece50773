//! YAML loading, schema validation and structural comparison.
//!
//! Skill and manifest rules are expressed as [`Schema`]s; hard failures are
//! errors, soft ones (short description, unusual version or compatibility)
//! are warnings and never make a document invalid.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_yaml_ng::{Mapping, Value};
use tracing::{debug, warn};

use super::rules::{
    Check, EvalMode, FieldRule, Finding, Kind, Rule, Schema, Severity, YamlNode, evaluate,
};
use crate::errors::{HarnessError, HarnessResult};

/// Accepted skill version format.
pub const VERSION_PATTERN: &str = r"^v?\d+(\.\d+){0,2}(-[A-Za-z0-9]+)?$";

/// Compatibility values recognised without a "Designed for" sentence.
pub const COMPATIBILITY_TARGETS: [&str; 4] = ["cursor", "claude_code", "open_code", "all"];

/// Result of validating one document.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub parsed_content: Option<Value>,
    #[serde(skip)]
    pub findings: Vec<Finding>,
}

impl ValidationOutcome {
    fn from_findings(findings: Vec<Finding>, parsed: Option<Value>) -> Self {
        let (errors, warnings): (Vec<&Finding>, Vec<&Finding>) = findings
            .iter()
            .partition(|f| f.severity == Severity::Error);
        Self {
            valid: errors.is_empty(),
            errors: errors.iter().map(ToString::to_string).collect(),
            warnings: warnings.iter().map(ToString::to_string).collect(),
            parsed_content: parsed,
            findings,
        }
    }

    fn unreadable(err: &HarnessError) -> Self {
        Self {
            valid: false,
            errors: vec![err.to_string()],
            warnings: Vec::new(),
            parsed_content: None,
            findings: Vec::new(),
        }
    }

    /// Whether any error or warning mentions `text`.
    pub fn mentions(&self, text: &str) -> bool {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .any(|m| m.contains(text))
    }
}

/// Outcome of comparing two YAML files.
#[derive(Debug, Clone, Serialize)]
pub struct YamlComparison {
    pub equal: bool,
    pub differences: Vec<String>,
}

fn version_rules(field: FieldRule) -> HarnessResult<FieldRule> {
    Ok(field.error(Check::Kind(Kind::String)).rule(
        Rule::warning(Check::matches(VERSION_PATTERN)?)
            .with_message("version format may be invalid"),
    ))
}

fn variable_schema() -> HarnessResult<Schema> {
    Ok(Schema::new()
        .field(
            FieldRule::new("name")
                .required()
                .error(Check::Kind(Kind::String))
                .rule(
                    Rule::error(Check::matches(r"^\w+$")?)
                        .with_message("contains invalid characters"),
                ),
        )
        .field(
            FieldRule::new("default")
                .rule(Rule::error(Check::Kind(Kind::Scalar)).with_message("must be a scalar")),
        ))
}

fn metadata_schema() -> HarnessResult<Schema> {
    Ok(Schema::new()
        .field(FieldRule::new("author").error(Check::Kind(Kind::String)))
        .field(
            FieldRule::new("tags")
                .error(Check::Kind(Kind::List))
                .error(Check::Each(vec![Rule::error(Check::Kind(Kind::String))])),
        )
        .field(version_rules(FieldRule::new("version"))?))
}

fn skill_fields(version_required: bool) -> HarnessResult<Schema> {
    let version = if version_required {
        FieldRule::new("version").required()
    } else {
        FieldRule::new("version")
    };
    Ok(Schema::new()
        .field(
            FieldRule::new("name")
                .required()
                .error(Check::Kind(Kind::String)),
        )
        .field(
            FieldRule::new("description")
                .required()
                .error(Check::Kind(Kind::String))
                .rule(
                    Rule::warning(Check::MinLen(10)).with_message("description may be too short"),
                ),
        )
        .field(version_rules(version)?)
        .field(
            FieldRule::new("variables")
                .error(Check::Kind(Kind::List))
                .error(Check::Each(vec![
                    Rule::error(Check::Kind(Kind::Map)),
                    Rule::error(Check::Nested(variable_schema()?)),
                ])),
        )
        .field(
            FieldRule::new("compatibility").rule(
                Rule::warning(Check::Any(vec![
                    Check::one_of(COMPATIBILITY_TARGETS),
                    Check::matches("(?i)designed for")?,
                ]))
                .with_message("compatibility may be invalid"),
            ),
        )
        .field(
            FieldRule::new("metadata")
                .error(Check::Kind(Kind::Map))
                .error(Check::Nested(metadata_schema()?)),
        ))
}

/// Rules for a standalone skill YAML document.
pub fn skill_schema() -> HarnessResult<Schema> {
    skill_fields(true)
}

/// Rules for `SKILL.md` front matter, where the version usually lives under
/// `metadata`.
pub fn front_matter_schema() -> HarnessResult<Schema> {
    skill_fields(false)
}

/// Rules for an OpenCode `manifest.yaml`.
pub fn manifest_schema() -> HarnessResult<Schema> {
    let tool = Schema::new()
        .field(FieldRule::new("name").required())
        .field(
            FieldRule::new("description")
                .rule(Rule::warning(Check::Present).with_message("missing description")),
        );
    Ok(Schema::new()
        .field(
            FieldRule::new("name")
                .required()
                .error(Check::Kind(Kind::String))
                .rule(
                    Rule::warning(Check::matches(r"^[\w-]+$")?)
                        .with_message("name contains special characters"),
                ),
        )
        .field(
            FieldRule::new("version")
                .required()
                .error(Check::Kind(Kind::String)),
        )
        .field(FieldRule::new("description").error(Check::Kind(Kind::String)))
        .field(
            FieldRule::new("tools")
                .error(Check::Kind(Kind::List))
                .error(Check::Each(vec![
                    Rule::error(Check::Kind(Kind::Map)),
                    Rule::error(Check::Nested(tool)),
                ])),
        ))
}

/// Split `---` delimited front matter from the body of a Markdown document.
pub fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((front, body));
        }
        offset += line.len();
    }
    None
}

/// Template for a new skill document.
pub fn skill_template(name: &str, description: &str) -> Value {
    let description = if description.is_empty() {
        format!("{name} skill")
    } else {
        description.to_string()
    };

    let mut metadata = Mapping::new();
    metadata.insert("author".into(), "Skill Hub User".into());
    metadata.insert(
        "tags".into(),
        Value::Sequence(vec!["skill".into(), "template".into()]),
    );
    metadata.insert(
        "created".into(),
        chrono::Local::now().format("%Y-%m-%d").to_string().into(),
    );

    let mut variable = Mapping::new();
    variable.insert("name".into(), "LANGUAGE".into());
    variable.insert("default".into(), "en-US".into());
    variable.insert("description".into(), "Output language".into());

    let mut doc = Mapping::new();
    doc.insert("name".into(), name.into());
    doc.insert("description".into(), description.into());
    doc.insert("version".into(), "1.0.0".into());
    doc.insert(
        "compatibility".into(),
        "Designed for Cursor, Claude Code, and OpenCode".into(),
    );
    doc.insert("metadata".into(), Value::Mapping(metadata));
    doc.insert(
        "variables".into(),
        Value::Sequence(vec![Value::Mapping(variable)]),
    );
    Value::Mapping(doc)
}

/// YAML validation.
///
/// In strict mode documents with errors produce `ValidationMismatch`;
/// otherwise the errors are reported in the [`ValidationOutcome`].
#[derive(Debug, Clone, Copy)]
pub struct YamlValidator {
    strict: bool,
}

impl Default for YamlValidator {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl YamlValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Load a YAML file. An empty document loads as an empty mapping.
    pub fn load(&self, path: &Path) -> HarnessResult<Value> {
        let content = fs::read_to_string(path).map_err(|err| HarnessError::Parse {
            path: path.to_path_buf(),
            message: if err.kind() == std::io::ErrorKind::NotFound {
                "file does not exist".to_string()
            } else {
                err.to_string()
            },
        })?;
        parse_str(&content, path)
    }

    /// Evaluate `schema` against `document`, reporting every finding.
    pub fn validate(&self, document: &Value, schema: &Schema) -> HarnessResult<ValidationOutcome> {
        let findings = evaluate(&YamlNode(document), schema, EvalMode::Collect);
        let outcome = ValidationOutcome::from_findings(findings, Some(document.clone()));
        self.finish("document", outcome)
    }

    fn finish(&self, subject: &str, outcome: ValidationOutcome) -> HarnessResult<ValidationOutcome> {
        for warning in &outcome.warnings {
            debug!(subject, %warning, "Validation warning");
        }
        if outcome.valid {
            return Ok(outcome);
        }
        let message = format!("{subject} failed validation:\n{}", outcome.errors.join("\n"));
        if self.strict {
            Err(HarnessError::ValidationMismatch(message))
        } else {
            warn!(subject, errors = outcome.errors.len(), "Validation failed");
            Ok(outcome)
        }
    }

    /// Validate a skill YAML file. A name other than `expected_name` is a
    /// warning. Unreadable files are reported as invalid, not raised.
    pub fn validate_skill_yaml(
        &self,
        path: &Path,
        expected_name: Option<&str>,
    ) -> HarnessResult<ValidationOutcome> {
        let document = match self.load(path) {
            Ok(document) => document,
            Err(err) => return Ok(ValidationOutcome::unreadable(&err)),
        };
        self.validate_skill_document(&path.display().to_string(), document, expected_name, &skill_schema()?)
    }

    /// Validate the front matter of a `SKILL.md` file.
    pub fn validate_skill_front_matter(
        &self,
        path: &Path,
        expected_name: Option<&str>,
    ) -> HarnessResult<ValidationOutcome> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => return Ok(ValidationOutcome::unreadable(&HarnessError::Io(err))),
        };
        let Some((front, _body)) = split_front_matter(&content) else {
            return Ok(ValidationOutcome::unreadable(&HarnessError::Parse {
                path: path.to_path_buf(),
                message: "missing YAML front matter".to_string(),
            }));
        };
        let document = match parse_str(front, path) {
            Ok(document) => document,
            Err(err) => return Ok(ValidationOutcome::unreadable(&err)),
        };
        self.validate_skill_document(
            &path.display().to_string(),
            document,
            expected_name,
            &front_matter_schema()?,
        )
    }

    fn validate_skill_document(
        &self,
        subject: &str,
        document: Value,
        expected_name: Option<&str>,
        schema: &Schema,
    ) -> HarnessResult<ValidationOutcome> {
        let mut findings = evaluate(&YamlNode(&document), schema, EvalMode::Collect);
        if let (Some(expected), Some(actual)) = (expected_name, document.get("name").and_then(Value::as_str))
            && expected != actual
        {
            findings.push(Finding {
                path: "name".to_string(),
                severity: Severity::Warning,
                message: format!("expected '{expected}', found '{actual}'"),
            });
        }
        self.finish(subject, ValidationOutcome::from_findings(findings, Some(document)))
    }

    /// Validate an OpenCode `manifest.yaml`.
    pub fn validate_manifest_yaml(&self, path: &Path) -> HarnessResult<ValidationOutcome> {
        let document = match self.load(path) {
            Ok(document) => document,
            Err(err) => return Ok(ValidationOutcome::unreadable(&err)),
        };
        let findings = evaluate(&YamlNode(&document), &manifest_schema()?, EvalMode::Collect);
        self.finish(
            &path.display().to_string(),
            ValidationOutcome::from_findings(findings, Some(document)),
        )
    }

    /// Recursive key diff. Keys in `ignore_fields` are skipped at any depth.
    pub fn compare(&self, first: &Value, second: &Value, ignore_fields: &[&str]) -> Vec<String> {
        let mut differences = Vec::new();
        diff_values(first, second, ignore_fields, "", &mut differences);
        differences
    }

    /// Load and [`compare`](Self::compare) two files.
    pub fn compare_files(
        &self,
        first: &Path,
        second: &Path,
        ignore_fields: &[&str],
    ) -> HarnessResult<YamlComparison> {
        let a = self.load(first)?;
        let b = self.load(second)?;
        let differences = self.compare(&a, &b, ignore_fields);
        Ok(YamlComparison {
            equal: differences.is_empty(),
            differences,
        })
    }
}

fn parse_str(content: &str, origin: &Path) -> HarnessResult<Value> {
    let value: Value = serde_yaml_ng::from_str(content).map_err(|err| HarnessError::Parse {
        path: origin.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(if value.is_null() {
        Value::Mapping(Mapping::new())
    } else {
        value
    })
}

fn key_name(key: &Value) -> String {
    key.as_str()
        .map(str::to_string)
        .unwrap_or_else(|| compact(key))
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

fn diff_values(a: &Value, b: &Value, ignore: &[&str], path: &str, out: &mut Vec<String>) {
    let (Some(map_a), Some(map_b)) = (a.as_mapping(), b.as_mapping()) else {
        if a != b {
            let shown = if path.is_empty() { "<root>" } else { path };
            out.push(format!(
                "{shown}: value differs - {} != {}",
                compact(a),
                compact(b)
            ));
        }
        return;
    };

    let child_path = |key: &Value| {
        let name = key_name(key);
        if path.is_empty() {
            name
        } else {
            format!("{path}.{name}")
        }
    };

    for (key, value_a) in map_a {
        if key.as_str().is_some_and(|k| ignore.contains(&k)) {
            continue;
        }
        match map_b.get(key) {
            None => out.push(format!("{}: only in first", child_path(key))),
            Some(value_b) => diff_values(value_a, value_b, ignore, &child_path(key), out),
        }
    }
    for key in map_b.keys() {
        if key.as_str().is_some_and(|k| ignore.contains(&k)) {
            continue;
        }
        if !map_a.contains_key(key) {
            out.push(format!("{}: only in second", child_path(key)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    const VALID_SKILL: &str = "\
name: my-skill
description: A skill used by the end-to-end suite
version: 1.2.0
compatibility: Designed for Cursor, Claude Code, and OpenCode
metadata:
  author: E2E
  tags: [test, e2e]
variables:
  - name: LANGUAGE
    default: en
";

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = TempDir::new().unwrap();
        let v = YamlValidator::default();
        let err = v.load(&dir.path().join("nope.yaml")).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert!(err.to_string().contains("file does not exist"));

        let bad = write(&dir, "bad.yaml", "a: [1, 2\n");
        assert_eq!(v.load(&bad).unwrap_err().kind(), "ParseError");

        let empty = write(&dir, "empty.yaml", "");
        assert!(v.load(&empty).unwrap().as_mapping().unwrap().is_empty());
    }

    #[test]
    fn test_valid_skill_yaml() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "skill.yaml", VALID_SKILL);
        let outcome = YamlValidator::default()
            .validate_skill_yaml(&path, Some("my-skill"))
            .unwrap();
        assert!(outcome.valid, "{:?}", outcome.errors);
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert!(outcome.parsed_content.is_some());
    }

    #[test]
    fn test_missing_description_not_strict() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "skill.yaml", "name: x\nversion: 1.0.0\n");
        let outcome = YamlValidator::new(false)
            .validate_skill_yaml(&path, None)
            .unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.errors, vec!["description: missing required field"]);
    }

    #[test]
    fn test_missing_description_strict_raises() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "skill.yaml", "name: x\nversion: 1.0.0\n");
        let err = YamlValidator::new(true)
            .validate_skill_yaml(&path, None)
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationMismatch");
        assert!(err.to_string().contains("description"));
    }

    #[test]
    fn test_soft_issues_are_warnings() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "skill.yaml",
            "name: other\ndescription: short\nversion: one\ncompatibility: Vim\n",
        );
        let outcome = YamlValidator::default()
            .validate_skill_yaml(&path, Some("mine"))
            .unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.warnings.len(), 4, "{:?}", outcome.warnings);
        assert!(outcome.mentions("description may be too short"));
        assert!(outcome.mentions("version format may be invalid"));
        assert!(outcome.mentions("compatibility may be invalid"));
        assert!(outcome.mentions("expected 'mine', found 'other'"));
    }

    #[test]
    fn test_nested_errors() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "skill.yaml",
            "name: x\ndescription: long enough text\nversion: 1.0.0\n\
             variables:\n  - name: bad-name\n    default: [1]\n  - plain\n\
             metadata:\n  author: 3\n  tags: [a, 2]\n",
        );
        let outcome = YamlValidator::new(false)
            .validate_skill_yaml(&path, None)
            .unwrap();
        assert!(!outcome.valid);
        assert_eq!(
            outcome.errors,
            vec![
                "variables[0].name: contains invalid characters",
                "variables[0].default: must be a scalar",
                "variables[1]: expected map, found \"plain\"",
                "metadata.author: expected string, found number 3",
                "metadata.tags[1]: expected string, found number 2",
            ]
        );
    }

    #[test]
    fn test_version_pattern() {
        let re = regex::Regex::new(VERSION_PATTERN).unwrap();
        for ok in ["1", "1.2", "1.2.3", "v1.2.3", "1.0.0-beta1"] {
            assert!(re.is_match(ok), "{ok}");
        }
        for bad in ["1.2.3.4", "x1", "1.0.0-", "1.0.0-beta.1"] {
            assert!(!re.is_match(bad), "{bad}");
        }
    }

    #[test]
    fn test_manifest() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "manifest.yaml",
            "name: my tool!\nversion: 1.0.0\ntools:\n  - name: a\n  - description: b\n",
        );
        let outcome = YamlValidator::new(false).validate_manifest_yaml(&path).unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.errors, vec!["tools[1].name: missing required field"]);
        assert!(outcome.mentions("name contains special characters"));
        assert!(outcome.mentions("tools[0].description: missing description"));
    }

    #[test]
    fn test_unreadable_file_is_invalid_not_raised() {
        let dir = TempDir::new().unwrap();
        let outcome = YamlValidator::new(true)
            .validate_manifest_yaml(&dir.path().join("missing.yaml"))
            .unwrap();
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("file does not exist"));
    }

    #[test]
    fn test_front_matter() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "SKILL.md",
            "---\nname: a\ndescription: front matter skill\nmetadata:\n  version: 1.0.0\n---\n# A\n",
        );
        let outcome = YamlValidator::default()
            .validate_skill_front_matter(&path, Some("a"))
            .unwrap();
        assert!(outcome.valid, "{:?}", outcome.errors);

        let plain = write(&dir, "PLAIN.md", "# no front matter\n");
        let outcome = YamlValidator::default()
            .validate_skill_front_matter(&plain, None)
            .unwrap();
        assert!(!outcome.valid);
        assert!(outcome.mentions("missing YAML front matter"));
    }

    #[test]
    fn test_split_front_matter() {
        assert_eq!(
            split_front_matter("---\nname: a\n---\nbody\n"),
            Some(("name: a\n", "body\n"))
        );
        assert_eq!(split_front_matter("---\r\nname: a\r\n---\r\n"), Some(("name: a\r\n", "")));
        assert_eq!(split_front_matter("name: a\n"), None);
        assert_eq!(split_front_matter("---\nname: a\n"), None);
    }

    #[test]
    fn test_compare() {
        let a: Value = serde_yaml_ng::from_str("a: 1\nb:\n  c: 2\n  t: x\nonly_a: 1\nt: 1\n").unwrap();
        let b: Value = serde_yaml_ng::from_str("a: 1\nb:\n  c: 3\n  t: y\nonly_b: 1\nt: 2\n").unwrap();
        let v = YamlValidator::default();
        assert_eq!(
            v.compare(&a, &b, &["t"]),
            vec![
                "b.c: value differs - 2 != 3",
                "only_a: only in first",
                "only_b: only in second",
            ]
        );
        assert!(v.compare(&a, &a, &[]).is_empty());
    }

    #[test]
    fn test_compare_files() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.yaml", "name: x\nlast_sync: 1\n");
        let b = write(&dir, "b.yaml", "name: x\nlast_sync: 2\n");
        let v = YamlValidator::default();
        assert!(v.compare_files(&a, &b, &["last_sync"]).unwrap().equal);
        assert!(!v.compare_files(&a, &b, &[]).unwrap().equal);
    }

    #[test]
    fn test_template_is_valid() {
        let template = skill_template("tmpl", "");
        let outcome = YamlValidator::default()
            .validate(&template, &skill_schema().unwrap())
            .unwrap();
        assert!(outcome.valid);
        assert_eq!(template["description"], "tmpl skill");
    }
}
