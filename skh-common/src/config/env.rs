//! Environment variable parsing with type safety.
//!
//! Provides a typed parser for harness environment variables with
//! validation and error collection. The variable source is pluggable so
//! configuration can be resolved from a fixed map without touching the
//! process environment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Path does not exist.
    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

type Lookup = Box<dyn Fn(&str) -> Option<String>>;

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    lookup: Lookup,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser over the process environment with the SKH_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "SKH_",
            lookup: Box::new(|name| env::var(name).ok()),
            errors: Vec::new(),
        }
    }

    /// Create a parser over a fixed set of variables.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            prefix: "SKH_",
            lookup: Box::new(move |name| vars.get(name).cloned()),
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, var_name: &str) -> Option<String> {
        (self.lookup)(var_name)
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match self.raw(&var_name) {
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    default
                }
            },
            None => default,
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> u64 {
        let var_name = self.var_name(name);
        match self.raw(&var_name) {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(n) if n >= min && n <= max => n,
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    default
                }
            },
            None => default,
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> u32 {
        let value = self.get_u64_range(name, u64::from(default), u64::from(min), u64::from(max));
        u32::try_from(value).unwrap_or(default)
    }

    /// Get an unprefixed path value (for variables shared with other tools,
    /// such as `SKILL_HUB_BIN`).
    ///
    /// Records an error when `must_exist` is set and the path is missing.
    pub fn get_raw_path(&mut self, var_name: &str, must_exist: bool) -> Option<PathBuf> {
        let value = self.raw(var_name)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        let path = PathBuf::from(trimmed);
        if must_exist && !path.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name.to_string(),
                path: path.clone(),
            });
        }
        Some(path)
    }

    /// Get an optional prefixed path (None if not set or empty).
    pub fn get_optional_path(&mut self, name: &str) -> Option<PathBuf> {
        let var_name = self.var_name(name);
        self.raw(&var_name)
            .filter(|value| !value.trim().is_empty())
            .map(|value| PathBuf::from(value.trim()))
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        match self.raw(&var_name) {
            Some(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => lower,
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name,
                            value,
                        });
                        default.to_string()
                    }
                }
            }
            None => default.to_string(),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
