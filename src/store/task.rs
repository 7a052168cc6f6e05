//! Task manifests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dispatch::{DispatchEnvelope, DispatchStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Closed,
}

/// Denormalized projection of one dispatch, kept in the task manifest so
/// list operations never have to open every dispatch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub id: String,
    pub role: String,
    pub status: DispatchStatus,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_dispatch_id: Option<String>,
}

impl From<&DispatchEnvelope> for DispatchSummary {
    fn from(envelope: &DispatchEnvelope) -> Self {
        Self {
            id: envelope.id.clone(),
            role: envelope.role.clone(),
            status: envelope.status,
            cost: envelope.cost,
            started_at: envelope.started_at,
            parent_dispatch_id: envelope.parent_dispatch_id.clone(),
        }
    }
}

/// `task.json` — the per-task index. The slug is the directory name and is
/// unique within its project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskManifest {
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Groups inbound messages from the same conversation onto one task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    /// Ordered dispatch index; upsert-by-id, never shrinks.
    #[serde(default)]
    pub dispatches: Vec<DispatchSummary>,
}

impl TaskManifest {
    pub fn new(
        name: &str,
        slug: &str,
        description: Option<String>,
        correlation_key: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            slug: slug.to_string(),
            description,
            status: TaskStatus::Open,
            created_at: Utc::now(),
            correlation_key,
            dispatches: Vec::new(),
        }
    }

    /// Insert or replace the row with the summary's id, preserving order of
    /// first appearance.
    pub fn upsert_dispatch(&mut self, summary: DispatchSummary) {
        match self.dispatches.iter_mut().find(|d| d.id == summary.id) {
            Some(existing) => *existing = summary,
            None => self.dispatches.push(summary),
        }
    }
}
