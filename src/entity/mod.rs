//! Entity scaffolding helpers.
//!
//! Generates and validates the YAML descriptors the harness consumes: role
//! files and project files. Exposed over RPC (`entity_scaffold`,
//! `entity_validate`) and the `entity` CLI subcommand.

use anyhow::Result;
use serde::Serialize;

use crate::error::HarnessError;
use crate::id::sortable_id;
use crate::roles::Role;
use crate::store::slug::slugify;
use crate::store::Project;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Role,
    Project,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "role" => Some(Self::Role),
            "project" => Some(Self::Project),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::Project => "project",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub kind: Option<&'static str>,
    pub errors: Vec<String>,
}

/// Render a fresh entity descriptor.
pub fn scaffold(kind: EntityKind, name: &str, author: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(HarnessError::InvalidParams("entity name is empty".into()).into());
    }
    match kind {
        EntityKind::Role => {
            let (slug, _) = slugify(name);
            Ok(format!(
                r#"# Role definition — scaffolded for {author}
id: "{id}"
version: "0.1.0"
name: {slug}
display_name: "{name}"
description: ""
model: sonnet
permissions: []
prompt: |
  You are {name}. Describe the persona, constraints, and output
  expectations here.
"#,
                id = sortable_id(),
            ))
        }
        EntityKind::Project => Ok(format!(
            r#"# Project descriptor — scaffolded for {author}
name: {name}
description: ""
paths: []
roles: []
"#,
        )),
    }
}

/// Validate a descriptor. With no kind given, both shapes are tried and
/// the first that parses wins.
pub fn validate(content: &str, kind: Option<EntityKind>) -> ValidationReport {
    match kind {
        Some(EntityKind::Role) => report(EntityKind::Role, validate_role(content)),
        Some(EntityKind::Project) => report(EntityKind::Project, validate_project(content)),
        None => {
            let as_role = validate_role(content);
            if as_role.is_empty() {
                return report(EntityKind::Role, as_role);
            }
            let as_project = validate_project(content);
            if as_project.is_empty() {
                return report(EntityKind::Project, as_project);
            }
            ValidationReport {
                valid: false,
                kind: None,
                errors: as_role.into_iter().chain(as_project).collect(),
            }
        }
    }
}

fn report(kind: EntityKind, errors: Vec<String>) -> ValidationReport {
    ValidationReport {
        valid: errors.is_empty(),
        kind: Some(kind.as_str()),
        errors,
    }
}

fn validate_role(content: &str) -> Vec<String> {
    let role: Role = match serde_yaml::from_str(content) {
        Ok(role) => role,
        Err(e) => return vec![format!("not a role file: {e}")],
    };
    let mut errors = Vec::new();
    if role.id.len() != 26 {
        errors.push(format!("role id must be 26 characters, got {}", role.id.len()));
    }
    let (slug, modified) = slugify(&role.name);
    if modified || slug != role.name {
        errors.push(format!("role name must be lowercase-hyphen: {:?}", role.name));
    }
    if role.prompt.trim().is_empty() {
        errors.push("role prompt is empty".to_string());
    }
    errors
}

fn validate_project(content: &str) -> Vec<String> {
    let project: Project = match serde_yaml::from_str(content) {
        Ok(project) => project,
        Err(e) => return vec![format!("not a project file: {e}")],
    };
    let mut errors = Vec::new();
    if project.name.trim().is_empty() {
        errors.push("project name is empty".to_string());
    }
    errors
}
