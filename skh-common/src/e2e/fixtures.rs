//! E2E Test Fixtures
//!
//! The `~/.skill-hub` layout as seen from a sandbox home, typed views over the
//! persisted `state.json`, and skill documents that can be seeded into the
//! hub repository.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};

/// Name of the hub directory below the home directory.
pub const HUB_DIR_NAME: &str = ".skill-hub";

/// Paths of the skill-hub data directory below a home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubLayout {
    home: PathBuf,
}

impl HubLayout {
    pub fn new(home: impl AsRef<Path>) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
        }
    }

    pub fn hub_dir(&self) -> PathBuf {
        self.home.join(HUB_DIR_NAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.hub_dir().join("config.yaml")
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.hub_dir().join("repo")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.repo_dir().join("skills")
    }

    pub fn skill_dir(&self, name: &str) -> PathBuf {
        self.skills_dir().join(name)
    }

    pub fn state_file(&self) -> PathBuf {
        self.repo_dir().join("state.json")
    }

    /// Whether `init` has produced a hub directory.
    pub fn is_initialized(&self) -> bool {
        self.hub_dir().is_dir()
    }

    /// Parse the persisted project state.
    pub fn load_state(&self) -> HarnessResult<StateFile> {
        let path = self.state_file();
        let content = fs::read_to_string(&path).map_err(|err| HarnessError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        StateFile::parse(&content, &path)
    }

    /// Write a skill into the hub repository, returning its `SKILL.md` path.
    pub fn seed_skill(&self, fixture: &SkillFixture) -> HarnessResult<PathBuf> {
        let dir = self.skill_dir(&fixture.name);
        fs::create_dir_all(&dir).map_err(|err| {
            HarnessError::EnvironmentSetup(format!("cannot create {}: {err}", dir.display()))
        })?;
        let path = dir.join("SKILL.md");
        fs::write(&path, fixture.render()?)?;
        debug!(skill = %fixture.name, path = %path.display(), "Seeded skill");
        Ok(path)
    }
}

/// Per-skill entry of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillState {
    #[serde(default)]
    pub skill_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// State recorded for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub preferred_target: Option<String>,
    #[serde(default)]
    pub enabled_skills: Vec<String>,
    #[serde(default)]
    pub skills: BTreeMap<String, SkillState>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub last_sync: Option<String>,
}

impl ProjectConfig {
    /// Enabled skill names, from either the list or the per-skill map.
    pub fn enabled(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.enabled_skills.iter().map(String::as_str).collect();
        for name in self.skills.keys() {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }

    pub fn is_enabled(&self, skill: &str) -> bool {
        self.enabled().contains(&skill)
    }
}

/// Parsed `state.json`, keyed by absolute project path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl StateFile {
    /// Accepts both `{"projects": {...}}` and a bare path-keyed map.
    pub fn parse(content: &str, origin: &Path) -> HarnessResult<Self> {
        let parse_error = |err: serde_json::Error| HarnessError::Parse {
            path: origin.to_path_buf(),
            message: err.to_string(),
        };
        let mut root: serde_json::Value = serde_json::from_str(content).map_err(parse_error)?;
        let projects = if root.get("projects").is_some_and(serde_json::Value::is_object) {
            root["projects"].take()
        } else {
            root
        };
        let projects = serde_json::from_value(projects).map_err(parse_error)?;
        Ok(Self { projects })
    }

    /// Lookup by project path, falling back to the canonical path.
    pub fn project(&self, path: &Path) -> Option<&ProjectConfig> {
        let key = path.to_string_lossy();
        if let Some(project) = self.projects.get(key.as_ref()) {
            return Some(project);
        }
        let canonical = path.canonicalize().ok()?;
        self.projects.get(canonical.to_string_lossy().as_ref())
    }
}

/// A variable declared in skill front matter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillVariable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkillMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A `SKILL.md` document: YAML front matter plus a Markdown body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillFixture {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<String>,
    pub metadata: SkillMetadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<SkillVariable>,
    #[serde(skip)]
    pub body: String,
}

impl SkillFixture {
    /// Minimal valid skill with one `NAME` variable.
    pub fn simple(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some(format!("Simple test skill {name}")),
            compatibility: Some("all".to_string()),
            metadata: SkillMetadata {
                version: Some("1.0.0".to_string()),
                author: Some("Test User".to_string()),
                tags: vec!["test".to_string(), "e2e".to_string()],
            },
            variables: Vec::new(),
            body: format!("# {name}\n\nHello {{{{.NAME}}}}!\n"),
        }
        .variable("NAME", Some("World"), Some("Who to greet"))
    }

    /// Skill exercising variable substitution.
    pub fn with_variables(name: &str) -> Self {
        let mut fixture = Self::simple(name)
            .variable("PROJECT_NAME", Some("MyProject"), Some("Project name"))
            .variable("LANGUAGE", Some("Go"), Some("Programming language"))
            .variable("FRAMEWORK", Some("Gin"), Some("Web framework"));
        fixture.variables.retain(|v| v.name != "NAME");
        fixture.description = Some(format!("Variable test skill {name}"));
        fixture.body = "# {{.PROJECT_NAME}}\n\n\
                        - Language: {{.LANGUAGE}}\n\
                        - Framework: {{.FRAMEWORK}}\n"
            .to_string();
        fixture
    }

    /// Skill with a missing description, an unknown compatibility, a
    /// malformed version and a variable without default.
    pub fn invalid(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            compatibility: Some("Invalid Tool".to_string()),
            metadata: SkillMetadata {
                version: Some("not-a-version".to_string()),
                ..SkillMetadata::default()
            },
            variables: vec![SkillVariable {
                name: "VAR1".to_string(),
                default: None,
                description: None,
            }],
            body: "# Invalid skill\n".to_string(),
        }
    }

    pub fn variable(mut self, name: &str, default: Option<&str>, description: Option<&str>) -> Self {
        self.variables.push(SkillVariable {
            name: name.to_string(),
            default: default.map(str::to_string),
            description: description.map(str::to_string),
        });
        self
    }

    pub fn compatibility(mut self, compatibility: &str) -> Self {
        self.compatibility = Some(compatibility.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Render the complete `SKILL.md` content.
    pub fn render(&self) -> HarnessResult<String> {
        let front = serde_yaml_ng::to_string(self).map_err(|err| {
            HarnessError::EnvironmentSetup(format!("cannot render skill {}: {err}", self.name))
        })?;
        Ok(format!("---\n{front}---\n{}", self.body))
    }
}
