//! Dispatch envelopes and the structured result schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use super::event::DispatchEvent;

// ─── Status & usage ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Running,
    Completed,
    Aborted,
    Crashed,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Crashed => "crashed",
        }
    }
}

/// Token accounting snapshot from the child's terminal result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageSnapshot {
    #[serde(alias = "input_tokens")]
    pub input_tokens: u64,
    #[serde(alias = "output_tokens")]
    pub output_tokens: u64,
    #[serde(alias = "context_window", skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(alias = "max_output_tokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

// ─── Structured result ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Partial,
    Failed,
    Blocked,
}

/// The schema a child agent reports through the SDK's structured-output
/// tool. Captured verbatim when it validates; the raw result text is kept
/// as a fallback when it does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResult {
    pub status: ResultStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

impl StructuredResult {
    /// Validate a raw tool input against the schema. `status` and `summary`
    /// are required; unknown extra fields are tolerated.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

// ─── Envelope & file ──────────────────────────────────────────────────────────

/// One execution of one role against one task, minus its event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    /// 26-char sortable id; never changes after creation.
    pub id: String,
    pub task_slug: String,
    pub role: String,
    /// Concrete model the role hint resolved to.
    pub model: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: DispatchStatus,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_dispatch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<StructuredResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Agent-protocol session id, captured from the child's init message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

impl DispatchEnvelope {
    pub fn new(
        id: String,
        task_slug: String,
        role: String,
        model: String,
        cwd: PathBuf,
        parent_dispatch_id: Option<String>,
    ) -> Self {
        Self {
            id,
            task_slug,
            role,
            model,
            cwd,
            started_at: Utc::now(),
            ended_at: None,
            status: DispatchStatus::Running,
            cost: 0.0,
            parent_dispatch_id,
            structured_result: None,
            result_text: None,
            error: None,
            session_id: None,
            usage: None,
        }
    }
}

/// The on-disk shape of `dispatches/<id>.json`: the envelope plus its
/// append-only event sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchFile {
    #[serde(flatten)]
    pub envelope: DispatchEnvelope,
    #[serde(default)]
    pub events: Vec<DispatchEvent>,
}

/// Partial envelope update. `None` fields are left untouched; the id and
/// the event list can never be changed through a patch.
#[derive(Debug, Clone, Default)]
pub struct DispatchPatch {
    pub status: Option<DispatchStatus>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost: Option<f64>,
    pub structured_result: Option<StructuredResult>,
    pub result_text: Option<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub usage: Option<UsageSnapshot>,
}

impl DispatchPatch {
    pub fn apply(&self, envelope: &mut DispatchEnvelope) {
        if let Some(status) = self.status {
            envelope.status = status;
        }
        if let Some(ended_at) = self.ended_at {
            envelope.ended_at = Some(ended_at);
        }
        if let Some(cost) = self.cost {
            envelope.cost = cost;
        }
        if let Some(ref sr) = self.structured_result {
            envelope.structured_result = Some(sr.clone());
        }
        if let Some(ref text) = self.result_text {
            envelope.result_text = Some(text.clone());
        }
        if let Some(ref error) = self.error {
            envelope.error = Some(error.clone());
        }
        if let Some(ref sid) = self.session_id {
            envelope.session_id = Some(sid.clone());
        }
        if let Some(usage) = self.usage {
            envelope.usage = Some(usage);
        }
    }
}

// ─── Offline tree reconstruction ──────────────────────────────────────────────

/// One node of a dispatch tree: an envelope plus the dispatches it spawned
/// through the tool server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchNode {
    pub envelope: DispatchEnvelope,
    pub children: Vec<DispatchNode>,
}

/// Rebuild the spawn tree from `parent_dispatch_id` back references. Roots
/// are dispatches without a parent (or whose parent lives outside the
/// slice); children sort by id, i.e. by start time. The ids are plain
/// strings, never live pointers — this is an analytics view, nothing in
/// the dispatch path walks it.
pub fn dispatch_tree(envelopes: &[DispatchEnvelope]) -> Vec<DispatchNode> {
    fn children_of(parent: &str, envelopes: &[DispatchEnvelope]) -> Vec<DispatchNode> {
        let mut nodes: Vec<DispatchNode> = envelopes
            .iter()
            .filter(|e| e.parent_dispatch_id.as_deref() == Some(parent))
            .map(|e| DispatchNode {
                envelope: e.clone(),
                children: children_of(&e.id, envelopes),
            })
            .collect();
        nodes.sort_by(|a, b| a.envelope.id.cmp(&b.envelope.id));
        nodes
    }

    let known: std::collections::HashSet<&str> =
        envelopes.iter().map(|e| e.id.as_str()).collect();
    let mut roots: Vec<DispatchNode> = envelopes
        .iter()
        .filter(|e| {
            e.parent_dispatch_id
                .as_deref()
                .map(|p| !known.contains(p))
                .unwrap_or(true)
        })
        .map(|e| DispatchNode {
            envelope: e.clone(),
            children: children_of(&e.id, envelopes),
        })
        .collect();
    roots.sort_by(|a, b| a.envelope.id.cmp(&b.envelope.id));
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_result_accepts_minimal_shape() {
        let v = json!({"status": "success", "summary": "done"});
        let sr = StructuredResult::from_value(&v).expect("valid");
        assert_eq!(sr.status, ResultStatus::Success);
        assert!(sr.changes.is_empty());
    }

    #[test]
    fn structured_result_rejects_missing_summary() {
        assert!(StructuredResult::from_value(&json!({"status": "partial"})).is_none());
    }

    #[test]
    fn structured_result_rejects_unknown_status() {
        let v = json!({"status": "great", "summary": "?"});
        assert!(StructuredResult::from_value(&v).is_none());
    }

    #[test]
    fn patch_never_touches_id() {
        let mut env = DispatchEnvelope::new(
            "01J0000000000000000000TEST".into(),
            "t".into(),
            "r".into(),
            "m".into(),
            "/tmp".into(),
            None,
        );
        let patch = DispatchPatch {
            status: Some(DispatchStatus::Completed),
            cost: Some(0.42),
            ..Default::default()
        };
        patch.apply(&mut env);
        assert_eq!(env.id, "01J0000000000000000000TEST");
        assert_eq!(env.status, DispatchStatus::Completed);
        assert!((env.cost - 0.42).abs() < f64::EPSILON);
        assert!(env.error.is_none(), "unset patch fields stay untouched");
    }

    fn child_of(id: &str, parent: Option<&str>) -> DispatchEnvelope {
        let mut e = DispatchEnvelope::new(
            id.to_string(),
            "t".into(),
            "r".into(),
            "m".into(),
            "/tmp".into(),
            parent.map(String::from),
        );
        e.status = DispatchStatus::Completed;
        e
    }

    #[test]
    fn tree_rebuilds_from_parent_back_references() {
        let envelopes = vec![
            child_of("01A", None),
            child_of("01B", Some("01A")),
            child_of("01C", Some("01A")),
            child_of("01D", Some("01C")),
            child_of("01E", None),
        ];
        let tree = dispatch_tree(&envelopes);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].envelope.id, "01A");
        assert_eq!(tree[0].children.len(), 2);
        assert_eq!(tree[0].children[1].envelope.id, "01C");
        assert_eq!(tree[0].children[1].children[0].envelope.id, "01D");
        assert!(tree[1].children.is_empty());
    }

    #[test]
    fn orphaned_parent_ids_become_roots() {
        // Parent lives in another task's slice — the child still shows up.
        let envelopes = vec![child_of("01B", Some("gone-elsewhere"))];
        let tree = dispatch_tree(&envelopes);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].envelope.id, "01B");
    }
}
