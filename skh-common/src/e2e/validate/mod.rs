//! Validation engine: declarative rules plus filesystem and YAML validators.

pub mod files;
pub mod rules;
pub mod yaml;

pub use files::{Expectation, ExpectedStructure, FileValidator, unified_diff};
pub use rules::{
    Check, EvalMode, FieldRule, Finding, Kind, Node, PathNode, Rule, Schema, Severity, YamlNode,
    evaluate, evaluate_rules,
};
pub use yaml::{
    ValidationOutcome, YamlComparison, YamlValidator, front_matter_schema, manifest_schema,
    skill_schema, skill_template, split_front_matter,
};
