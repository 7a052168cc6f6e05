//! Project workspaces.
//!
//! A project is a named workspace directory under the projects dir, with a
//! `project.yaml` (or `project.toml`) descriptor and a `tasks/` subtree.
//! Project names are unique case-insensitively and double as directory
//! names; a project is immutable while a dispatch it authorizes runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

use crate::error::HarnessError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Candidate working directories for dispatches, in preference order.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Role names this project allows. Empty = any role.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Project {
    /// The working directory a dispatch runs in when routing supplies no
    /// override: the first configured path, falling back to the project dir.
    pub fn default_cwd(&self, project_dir: &Path) -> PathBuf {
        self.paths
            .first()
            .cloned()
            .unwrap_or_else(|| project_dir.to_path_buf())
    }

    pub fn allows_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r == role)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// In-memory view of the projects directory, reloadable on demand.
pub struct ProjectRegistry {
    dir: PathBuf,
    projects: RwLock<Vec<Project>>,
}

impl ProjectRegistry {
    pub fn load(dir: &Path) -> Self {
        let registry = Self {
            dir: dir.to_path_buf(),
            projects: RwLock::new(Vec::new()),
        };
        registry.reload();
        registry
    }

    /// Rescan the projects directory. Unreadable descriptors are skipped
    /// with a warning. Returns the number of projects loaded.
    pub fn reload(&self) -> usize {
        let mut loaded = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                match load_project_file(&path) {
                    Ok(Some(project)) => loaded.push(project),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), err = %e, "skipping unreadable project");
                    }
                }
            }
        }
        loaded.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        let count = loaded.len();
        *self.write_lock() = loaded;
        count
    }

    pub fn list(&self) -> Vec<Project> {
        self.read_lock().clone()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Project> {
        self.read_lock()
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// The directory a project lives in. Does not require the descriptor to
    /// be loadable — the name is the directory name.
    pub fn project_dir(&self, name: &str) -> Option<PathBuf> {
        let project = self.get(name)?;
        Some(self.dir.join(&project.name))
    }

    /// Create a project directory and descriptor. Rejects a duplicate name
    /// case-insensitively.
    pub fn create(
        &self,
        name: &str,
        description: Option<&str>,
        roles: Vec<String>,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(HarnessError::InvalidParams("project name is empty".into()).into());
        }
        if self.get(name).is_some() {
            return Err(HarnessError::DuplicateProject(name.to_string()).into());
        }
        let project = Project {
            name: name.to_string(),
            description: description.unwrap_or_default().to_string(),
            paths: Vec::new(),
            roles,
        };
        let dir = self.dir.join(name);
        std::fs::create_dir_all(dir.join("tasks"))
            .with_context(|| format!("creating {}", dir.display()))?;
        let yaml = serde_yaml::to_string(&project).context("serializing project")?;
        std::fs::write(dir.join("project.yaml"), yaml).context("writing project.yaml")?;

        self.write_lock().push(project.clone());
        Ok(project)
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Vec<Project>> {
        match self.projects.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Project>> {
        match self.projects.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Load `project.yaml` (preferred) or `project.toml` from a directory.
/// Returns `Ok(None)` when neither exists (not a project directory).
fn load_project_file(dir: &Path) -> Result<Option<Project>> {
    let yaml_path = dir.join("project.yaml");
    if yaml_path.exists() {
        let contents = std::fs::read_to_string(&yaml_path)?;
        let project = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", yaml_path.display()))?;
        return Ok(Some(project));
    }
    let toml_path = dir.join("project.toml");
    if toml_path.exists() {
        let contents = std::fs::read_to_string(&toml_path)?;
        let project = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", toml_path.display()))?;
        return Ok(Some(project));
    }
    Ok(None)
}
