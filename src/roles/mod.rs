//! Agent role definitions and the on-disk role registry.
//!
//! A role is a persona: a prompt body plus a model hint and a permission
//! set. Roles are loaded from YAML files in the configured roles directory;
//! one file per role, filename irrelevant (the `name` field is the key).

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

use crate::config::ModelAliases;

static ROLE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("static regex"));

// ─── Role ─────────────────────────────────────────────────────────────────────

/// Model tier requested by a role, resolved to a concrete model id through
/// the configured alias map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelHint {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelHint {
    pub fn resolve(&self, aliases: &ModelAliases) -> String {
        match self {
            Self::Haiku => aliases.haiku.clone(),
            Self::Sonnet => aliases.sonnet.clone(),
            Self::Opus => aliases.opus.clone(),
        }
    }
}

/// Capabilities a role may be granted. `agent-draft` unlocks the tool
/// server's write operations (spawn/await/kill of sibling agents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    AgentDraft,
    FileWrite,
    ShellExec,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Opaque 26-character identifier.
    pub id: String,
    pub version: semver::Version,
    /// Lowercase-hyphen registry key.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub display_name: String,
    pub model: ModelHint,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// System prompt body handed to the child agent.
    pub prompt: String,
}

impl Role {
    /// Whether this role gets the full tool server (spawn/await/kill) rather
    /// than the readonly one. Derived from the permission set alone.
    pub fn full_tool_access(&self) -> bool {
        self.permissions.contains(&Permission::AgentDraft)
    }

    fn validate(&self) -> Result<()> {
        if self.id.len() != 26 {
            anyhow::bail!("role id must be 26 characters, got {}", self.id.len());
        }
        if !ROLE_NAME_RE.is_match(&self.name) {
            anyhow::bail!("role name must be lowercase-hyphen: {:?}", self.name);
        }
        Ok(())
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// In-memory view of the roles directory. `reload` rescans from disk;
/// malformed files are skipped with a warning so one bad role cannot take
/// the daemon down.
pub struct RoleRegistry {
    dir: PathBuf,
    roles: RwLock<HashMap<String, Role>>,
}

impl RoleRegistry {
    pub fn load(dir: &Path) -> Self {
        let registry = Self {
            dir: dir.to_path_buf(),
            roles: RwLock::new(HashMap::new()),
        };
        registry.reload();
        registry
    }

    /// Rescan the roles directory. Returns the number of roles loaded.
    pub fn reload(&self) -> usize {
        let mut loaded = HashMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => {
                // Missing roles dir is not fatal; the registry is just empty.
                *self.write_lock() = loaded;
                return 0;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            match load_role_file(&path) {
                Ok(role) => {
                    if let Some(prev) = loaded.insert(role.name.clone(), role) {
                        warn!(name = %prev.name, path = %path.display(), "duplicate role name — later file wins");
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "skipping unreadable role file");
                }
            }
        }
        let count = loaded.len();
        info!(count, dir = %self.dir.display(), "roles loaded");
        *self.write_lock() = loaded;
        count
    }

    pub fn get(&self, name: &str) -> Option<Role> {
        self.read_lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Role>> {
        match self.roles.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Role>> {
        match self.roles.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn load_role_file(path: &Path) -> Result<Role> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let role: Role =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    role.validate()?;
    Ok(role)
}
