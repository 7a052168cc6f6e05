//! Dispatch event records.
//!
//! Every observation the supervisor makes during a dispatch is appended to
//! the dispatch file as one of these. The type set is closed; payloads are
//! type-specific JSON. Event ids are sortable, so id order equals the order
//! in which the supervisor observed them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::sortable_id;

/// Free-text payloads are clipped to this many characters before storage.
pub const MAX_TEXT_PAYLOAD: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "user:message")]
    UserMessage,
    #[serde(rename = "session:init")]
    SessionInit,
    #[serde(rename = "session:complete")]
    SessionComplete,
    #[serde(rename = "session:compaction")]
    SessionCompaction,
    #[serde(rename = "session:rate_limit")]
    SessionRateLimit,
    #[serde(rename = "session:status")]
    SessionStatus,
    #[serde(rename = "agent:text")]
    AgentText,
    #[serde(rename = "agent:thinking")]
    AgentThinking,
    #[serde(rename = "agent:tool_call")]
    AgentToolCall,
    #[serde(rename = "agent:tool_result")]
    AgentToolResult,
    #[serde(rename = "harness:loop_warning")]
    LoopWarning,
    #[serde(rename = "harness:loop_kill")]
    LoopKill,
    #[serde(rename = "harness:stall")]
    Stall,
    #[serde(rename = "harness:abort")]
    Abort,
    #[serde(rename = "harness:error")]
    HarnessError,
    #[serde(rename = "system:files_persisted")]
    FilesPersisted,
    #[serde(rename = "system:hook_started")]
    HookStarted,
    #[serde(rename = "system:hook_progress")]
    HookProgress,
    #[serde(rename = "system:hook_response")]
    HookResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl DispatchEvent {
    pub fn new(event_type: EventType, payload: Option<Value>) -> Self {
        Self {
            id: sortable_id(),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Clip text to [`MAX_TEXT_PAYLOAD`] characters (on a char boundary).
pub fn truncate_text(s: &str) -> String {
    if s.chars().count() <= MAX_TEXT_PAYLOAD {
        return s.to_string();
    }
    s.chars().take(MAX_TEXT_PAYLOAD).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_with_colon_names() {
        let e = DispatchEvent::new(EventType::LoopWarning, None);
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["type"], "harness:loop_warning");
        assert_eq!(json["id"].as_str().expect("id").len(), 26);
    }

    #[test]
    fn long_text_is_clipped() {
        let long = "x".repeat(5000);
        assert_eq!(truncate_text(&long).len(), MAX_TEXT_PAYLOAD);
        assert_eq!(truncate_text("short"), "short");
    }

    #[test]
    fn multibyte_truncation_stays_on_char_boundary() {
        let long = "é".repeat(3000);
        let clipped = truncate_text(&long);
        assert_eq!(clipped.chars().count(), MAX_TEXT_PAYLOAD);
    }

    #[test]
    fn event_roundtrips_through_json() {
        let e = DispatchEvent::new(
            EventType::AgentToolCall,
            Some(serde_json::json!({"tool": "Bash", "target": "cargo test"})),
        );
        let json = serde_json::to_string(&e).expect("serialize");
        let back: DispatchEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event_type, EventType::AgentToolCall);
        assert_eq!(back.payload.expect("payload")["tool"], "Bash");
    }
}
