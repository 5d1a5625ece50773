//! Declarative checks and their evaluator.
//!
//! A [`Schema`] is an ordered list of [`FieldRule`]s. Each field rule names a
//! child of the node being checked and the [`Rule`]s that child must satisfy.
//! The same evaluator walks YAML documents ([`YamlNode`]) and directory trees
//! ([`PathNode`]); only the [`Node`] implementation differs.

use std::borrow::Cow;
use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use serde_yaml_ng::Value;

use crate::errors::{HarnessError, HarnessResult};

/// Shape of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Number,
    Boolean,
    List,
    Map,
    Null,
    /// String, number or boolean.
    Scalar,
    File,
    Directory,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::List => "list",
            Self::Map => "map",
            Self::Null => "null",
            Self::Scalar => "scalar",
            Self::File => "file",
            Self::Directory => "directory",
        };
        f.write_str(name)
    }
}

/// Something a schema can be evaluated against.
pub trait Node: Sized {
    /// Whether the node has shape `kind`.
    fn is_kind(&self, kind: Kind) -> bool;

    /// Short description of what the node is, for messages.
    fn describe(&self) -> String;

    /// Named child, `None` when absent.
    fn child(&self, key: &str) -> Option<Self>;

    /// Ordered elements (list items or directory entries).
    fn items(&self) -> Vec<Self>;

    /// Textual value, when the node has one.
    fn text(&self) -> Option<Cow<'_, str>>;

    /// Why a node that should carry text has none (e.g. a file that is not
    /// valid UTF-8). Text checks fail on such nodes instead of passing.
    fn unreadable(&self) -> Option<String> {
        None
    }

    /// Length used by [`Check::MinLen`].
    fn len(&self) -> Option<usize> {
        self.text().map(|t| t.chars().count())
    }

    /// Path of child `key` below `parent`.
    fn join(parent: &str, key: &str) -> String {
        if parent.is_empty() {
            key.to_string()
        } else {
            format!("{parent}.{key}")
        }
    }

    /// Path of this node as item `index` of `parent`.
    fn item_path(&self, parent: &str, index: usize) -> String {
        format!("{parent}[{index}]")
    }
}

/// One declarative check.
#[derive(Debug, Clone)]
pub enum Check {
    /// The node must exist.
    Present,
    /// The node must not exist.
    Absent,
    /// The node must have this shape. A failed kind check skips the
    /// remaining rules of the same field.
    Kind(Kind),
    /// The text must match the pattern. Nodes without text pass, unless
    /// they are [`Node::unreadable`].
    Matches(Regex),
    /// Text (or list) length must be at least this.
    MinLen(usize),
    /// The text must equal one of these values, ignoring case. Nodes without
    /// text pass.
    OneOf(Vec<String>),
    /// At least one of the checks must pass.
    Any(Vec<Check>),
    /// The node is a container whose children satisfy the schema.
    Nested(Schema),
    /// Every item satisfies the rules.
    Each(Vec<Rule>),
}

impl Check {
    /// `Matches` for a pattern, surfacing compile errors.
    pub fn matches(pattern: &str) -> HarnessResult<Self> {
        Regex::new(pattern).map(Self::Matches).map_err(|err| {
            HarnessError::EnvironmentSetup(format!("invalid pattern {pattern:?}: {err}"))
        })
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }

    fn reads_text(&self) -> bool {
        matches!(self, Self::Matches(_) | Self::MinLen(_) | Self::OneOf(_))
    }

    fn default_message<N: Node>(&self, node: Option<&N>) -> String {
        let found = node.map(Node::describe).unwrap_or_else(|| "nothing".to_string());
        match self {
            Self::Present => "missing required field".to_string(),
            Self::Absent => format!("must not exist, found {found}"),
            Self::Kind(kind) => format!("expected {kind}, found {found}"),
            Self::Matches(re) => format!("{found} does not match {}", re.as_str()),
            Self::MinLen(min) => format!("shorter than {min}"),
            Self::OneOf(values) => format!("{found} is not one of [{}]", values.join(", ")),
            Self::Any(_) => format!("{found} satisfies none of the alternatives"),
            Self::Nested(_) | Self::Each(_) => format!("invalid {found}"),
        }
    }
}

/// How bad a failed check is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// A check with its severity and optional message.
#[derive(Debug, Clone)]
pub struct Rule {
    pub check: Check,
    pub severity: Severity,
    pub message: Option<String>,
}

impl Rule {
    pub fn error(check: Check) -> Self {
        Self {
            check,
            severity: Severity::Error,
            message: None,
        }
    }

    pub fn warning(check: Check) -> Self {
        Self {
            check,
            severity: Severity::Warning,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Rules for one named child.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub key: String,
    pub rules: Vec<Rule>,
}

impl FieldRule {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            rules: Vec::new(),
        }
    }

    /// Shorthand for an error-level `Present` rule.
    pub fn required(self) -> Self {
        self.rule(Rule::error(Check::Present))
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn error(self, check: Check) -> Self {
        self.rule(Rule::error(check))
    }

    pub fn warning(self, check: Check) -> Self {
        self.rule(Rule::warning(check))
    }
}

/// Ordered field rules.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: Vec<FieldRule>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: FieldRule) -> Self {
        self.fields.push(field);
        self
    }
}

/// A failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub path: String,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Whether evaluation stops at the first error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Stop at the first error-level finding. Warnings never stop evaluation.
    FailFast,
    /// Report everything.
    Collect,
}

/// Evaluate `schema` against `node`.
pub fn evaluate<N: Node>(node: &N, schema: &Schema, mode: EvalMode) -> Vec<Finding> {
    let mut findings = Vec::new();
    let _ = eval_schema(node, schema, "", mode, &mut findings);
    findings
}

/// Evaluate free-standing rules against a node that may be absent.
pub fn evaluate_rules<N: Node>(
    node: Option<&N>,
    rules: &[Rule],
    path: &str,
    mode: EvalMode,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let _ = eval_rules(node, rules, path, mode, &mut findings);
    findings
}

fn eval_schema<N: Node>(
    node: &N,
    schema: &Schema,
    path: &str,
    mode: EvalMode,
    out: &mut Vec<Finding>,
) -> ControlFlow<()> {
    for field in &schema.fields {
        let child = node.child(&field.key);
        let child_path = N::join(path, &field.key);
        eval_rules(child.as_ref(), &field.rules, &child_path, mode, out)?;
    }
    ControlFlow::Continue(())
}

fn eval_rules<N: Node>(
    node: Option<&N>,
    rules: &[Rule],
    path: &str,
    mode: EvalMode,
    out: &mut Vec<Finding>,
) -> ControlFlow<()> {
    for rule in rules {
        let passed = match (&rule.check, node) {
            (Check::Present, node) => node.is_some(),
            (Check::Absent, node) => node.is_none(),
            // Everything else only applies to nodes that exist.
            (_, None) => continue,
            (Check::Nested(schema), Some(node)) => {
                eval_schema(node, schema, path, mode, out)?;
                continue;
            }
            (Check::Each(item_rules), Some(node)) => {
                for (index, item) in node.items().iter().enumerate() {
                    let item_path = item.item_path(path, index);
                    eval_rules(Some(item), item_rules, &item_path, mode, out)?;
                }
                continue;
            }
            (check, Some(node)) => passes(check, node),
        };

        if passed {
            continue;
        }

        if rule.check.reads_text()
            && let Some(reason) = node.and_then(|n| n.unreadable())
        {
            out.push(Finding {
                path: path.to_string(),
                severity: Severity::Error,
                message: format!("cannot read as text: {reason}"),
            });
            if mode == EvalMode::FailFast {
                return ControlFlow::Break(());
            }
            // Remaining text checks would report the same thing.
            break;
        }

        let message = rule
            .message
            .clone()
            .unwrap_or_else(|| rule.check.default_message(node));
        out.push(Finding {
            path: path.to_string(),
            severity: rule.severity,
            message,
        });

        if rule.severity == Severity::Error && mode == EvalMode::FailFast {
            return ControlFlow::Break(());
        }
        if matches!(rule.check, Check::Present | Check::Kind(_)) {
            break;
        }
    }
    ControlFlow::Continue(())
}

fn passes<N: Node>(check: &Check, node: &N) -> bool {
    match check {
        Check::Present => true,
        Check::Absent => false,
        Check::Kind(kind) => node.is_kind(*kind),
        Check::Matches(re) => match node.text() {
            Some(text) => re.is_match(&text),
            None => node.unreadable().is_none(),
        },
        Check::MinLen(min) => match node.len() {
            Some(len) => len >= *min,
            None => node.unreadable().is_none(),
        },
        Check::OneOf(values) => match node.text() {
            Some(text) => values
                .iter()
                .any(|value| value.eq_ignore_ascii_case(text.as_ref())),
            None => node.unreadable().is_none(),
        },
        Check::Any(checks) => checks.iter().any(|c| passes(c, node)),
        Check::Nested(schema) => {
            evaluate(node, schema, EvalMode::FailFast)
                .iter()
                .all(|f| f.severity != Severity::Error)
        }
        Check::Each(rules) => node.items().iter().all(|item| {
            evaluate_rules(Some(item), rules, "", EvalMode::FailFast)
                .iter()
                .all(|f| f.severity != Severity::Error)
        }),
    }
}

// ============================================================================
// YAML values
// ============================================================================

/// A YAML value as a [`Node`].
#[derive(Debug, Clone, Copy)]
pub struct YamlNode<'a>(pub &'a Value);

impl Node for YamlNode<'_> {
    fn is_kind(&self, kind: Kind) -> bool {
        let value = untag(self.0);
        match kind {
            Kind::String => value.is_string(),
            Kind::Number => value.is_number(),
            Kind::Boolean => value.is_bool(),
            Kind::List => value.is_sequence(),
            Kind::Map => value.is_mapping(),
            Kind::Null => value.is_null(),
            Kind::Scalar => value.is_string() || value.is_number() || value.is_bool(),
            Kind::File | Kind::Directory => false,
        }
    }

    fn describe(&self) -> String {
        match untag(self.0) {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("boolean {b}"),
            Value::Number(n) => format!("number {n}"),
            Value::String(s) => format!("{s:?}"),
            Value::Sequence(seq) => format!("list of {}", seq.len()),
            Value::Mapping(map) => format!("map of {}", map.len()),
            Value::Tagged(_) => "tagged value".to_string(),
        }
    }

    fn child(&self, key: &str) -> Option<Self> {
        untag(self.0).as_mapping()?.get(key).map(YamlNode)
    }

    fn items(&self) -> Vec<Self> {
        untag(self.0)
            .as_sequence()
            .map(|seq| seq.iter().map(YamlNode).collect())
            .unwrap_or_default()
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        untag(self.0).as_str().map(Cow::Borrowed)
    }

    fn len(&self) -> Option<usize> {
        match untag(self.0) {
            Value::String(s) => Some(s.chars().count()),
            Value::Sequence(seq) => Some(seq.len()),
            Value::Mapping(map) => Some(map.len()),
            _ => None,
        }
    }
}

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

// ============================================================================
// Filesystem paths
// ============================================================================

/// A filesystem entry as a [`Node`]. Children are directory entries.
#[derive(Debug, Clone)]
pub struct PathNode {
    path: PathBuf,
}

impl PathNode {
    /// `None` when nothing exists at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        path.symlink_metadata().ok().map(|_| Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Node for PathNode {
    fn is_kind(&self, kind: Kind) -> bool {
        match kind {
            Kind::File => self.path.is_file(),
            Kind::Directory => self.path.is_dir(),
            _ => false,
        }
    }

    fn describe(&self) -> String {
        if self.path.is_dir() {
            "directory".to_string()
        } else if self.path.is_file() {
            "file".to_string()
        } else {
            "special file".to_string()
        }
    }

    fn child(&self, key: &str) -> Option<Self> {
        if !self.path.is_dir() {
            return None;
        }
        Self::open(self.path.join(key))
    }

    fn items(&self) -> Vec<Self> {
        let Ok(entries) = std::fs::read_dir(&self.path) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        paths.into_iter().map(|path| Self { path }).collect()
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        if !self.path.is_file() {
            return None;
        }
        std::fs::read_to_string(&self.path).ok().map(Cow::Owned)
    }

    fn unreadable(&self) -> Option<String> {
        if !self.path.is_file() {
            return None;
        }
        std::fs::read_to_string(&self.path)
            .err()
            .map(|err| format!("{}: {err}", self.path.display()))
    }

    fn join(parent: &str, key: &str) -> String {
        if parent.is_empty() {
            key.to_string()
        } else {
            format!("{parent}/{key}")
        }
    }

    fn item_path(&self, parent: &str, index: usize) -> String {
        match self.path.file_name() {
            Some(name) => Self::join(parent, &name.to_string_lossy()),
            None => format!("{parent}[{index}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(src: &str) -> Value {
        serde_yaml_ng::from_str(src).unwrap()
    }

    fn person_schema() -> Schema {
        Schema::new()
            .field(
                FieldRule::new("name")
                    .required()
                    .error(Check::Kind(Kind::String)),
            )
            .field(
                FieldRule::new("age")
                    .required()
                    .error(Check::Kind(Kind::Number)),
            )
            .field(
                FieldRule::new("nick")
                    .warning(Check::MinLen(3))
                    .rule(Rule::warning(Check::one_of(["bob", "alice"])).with_message("unusual nick")),
            )
    }

    #[test]
    fn test_collect_reports_everything() {
        let doc = yaml("name: 5\nnick: x\n");
        let findings = evaluate(&YamlNode(&doc), &person_schema(), EvalMode::Collect);
        let rendered: Vec<String> = findings.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "name: expected string, found number 5",
                "age: missing required field",
                "nick: shorter than 3",
                "nick: unusual nick",
            ]
        );
        assert_eq!(findings[2].severity, Severity::Warning);
    }

    #[test]
    fn test_fail_fast_stops_at_first_error() {
        let doc = yaml("name: 5\n");
        let findings = evaluate(&YamlNode(&doc), &person_schema(), EvalMode::FailFast);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].path, "name");
    }

    #[test]
    fn test_warnings_do_not_stop_fail_fast() {
        let schema = Schema::new()
            .field(FieldRule::new("a").warning(Check::MinLen(10)))
            .field(FieldRule::new("b").required());
        let doc = yaml("a: short\n");
        let findings = evaluate(&YamlNode(&doc), &schema, EvalMode::FailFast);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].path, "b");
    }

    #[test]
    fn test_each_and_nested_paths() {
        let item = Schema::new().field(FieldRule::new("id").required());
        let schema = Schema::new().field(
            FieldRule::new("items")
                .error(Check::Kind(Kind::List))
                .error(Check::Each(vec![
                    Rule::error(Check::Kind(Kind::Map)),
                    Rule::error(Check::Nested(item)),
                ])),
        );
        let doc = yaml("items:\n  - id: 1\n  - name: x\n  - plain\n");
        let findings = evaluate(&YamlNode(&doc), &schema, EvalMode::Collect);
        let paths: Vec<&str> = findings.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["items[1].id", "items[2]"]);
    }

    #[test]
    fn test_kind_failure_skips_remaining_rules() {
        let schema = Schema::new().field(
            FieldRule::new("version")
                .error(Check::Kind(Kind::String))
                .warning(Check::matches(r"^\d+$").unwrap()),
        );
        let doc = yaml("version: 1.5\n");
        let findings = evaluate(&YamlNode(&doc), &schema, EvalMode::Collect);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_any_and_absent() {
        let schema = Schema::new()
            .field(FieldRule::new("compat").warning(Check::Any(vec![
                Check::one_of(["cursor", "all"]),
                Check::matches("(?i)designed for").unwrap(),
            ])))
            .field(FieldRule::new("secret").error(Check::Absent));
        let ok = yaml("compat: Designed for Cursor\n");
        assert!(evaluate(&YamlNode(&ok), &schema, EvalMode::Collect).is_empty());
        let upper = yaml("compat: CURSOR\n");
        assert!(evaluate(&YamlNode(&upper), &schema, EvalMode::Collect).is_empty());

        let bad = yaml("compat: vim\nsecret: x\n");
        let findings = evaluate(&YamlNode(&bad), &schema, EvalMode::Collect);
        assert_eq!(findings.len(), 2);
        assert!(findings[1].message.starts_with("must not exist"));
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        assert!(Check::matches("(unclosed").is_err());
    }

    #[test]
    fn test_path_nodes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("skills/a")).unwrap();
        std::fs::write(dir.path().join("skills/a/SKILL.md"), "---\nname: a\n---\n").unwrap();

        let skill = Schema::new().field(
            FieldRule::new("SKILL.md")
                .required()
                .error(Check::Kind(Kind::File))
                .error(Check::matches("(?m)^name:").unwrap()),
        );
        let schema = Schema::new()
            .field(
                FieldRule::new("skills")
                    .required()
                    .error(Check::Kind(Kind::Directory))
                    .error(Check::Each(vec![Rule::error(Check::Nested(skill))])),
            )
            .field(FieldRule::new("stray").error(Check::Absent));

        let root = PathNode::open(dir.path()).unwrap();
        assert!(evaluate(&root, &schema, EvalMode::FailFast).is_empty());

        std::fs::create_dir_all(dir.path().join("skills/b")).unwrap();
        let findings = evaluate(&root, &schema, EvalMode::FailFast);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].path, "skills/b/SKILL.md");
        assert!(PathNode::open(dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_undecodable_file_fails_text_checks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("SKILL.md"), b"\xff\xfe garbage").unwrap();
        let schema = Schema::new().field(
            FieldRule::new("SKILL.md")
                .error(Check::Kind(Kind::File))
                .warning(Check::matches("garbage").unwrap())
                .error(Check::MinLen(1))
                .error(Check::Any(vec![Check::matches("^x").unwrap()])),
        );
        let root = PathNode::open(dir.path()).unwrap();

        let findings = evaluate(&root, &schema, EvalMode::Collect);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Error);
        assert!(findings[0].message.starts_with("cannot read as text"));

        let any = Schema::new().field(
            FieldRule::new("SKILL.md").error(Check::Any(vec![Check::matches("x").unwrap()])),
        );
        assert_eq!(evaluate(&root, &any, EvalMode::FailFast).len(), 1);
    }

    #[test]
    fn test_non_text_yaml_values_skip_text_checks() {
        let doc = yaml("version: 3\n");
        let schema = Schema::new()
            .field(FieldRule::new("version").error(Check::matches(r"^\d+\.\d+$").unwrap()));
        assert!(evaluate(&YamlNode(&doc), &schema, EvalMode::Collect).is_empty());
    }
}
