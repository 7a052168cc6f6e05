//! The child-agent message stream.
//!
//! A child agent is an opaque producer of typed messages; the wire form is
//! one JSON object per stdout line (`--output-format stream-json`). The
//! supervisor consumes an [`AgentStream`]; the production implementation
//! spawns the `claude` CLI, while tests script the stream directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use crate::store::UsageSnapshot;

/// Environment variable a nested agent session would inherit; stripped so
/// the child does not believe it is running inside another agent.
const NESTED_SESSION_VAR: &str = "CLAUDECODE";
/// Stream-close timeout handed to the child, in milliseconds.
const STREAM_CLOSE_TIMEOUT_VAR: &str = "CLAUDE_CODE_STREAM_CLOSE_TIMEOUT";
/// Forwarded to the child only when the parent has it set.
#[cfg(unix)]
const SHELL_VAR: &str = "SHELL";

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Harness-level notices: init, compaction, persisted files, hooks,
    /// status, rate limits. `subtype` discriminates.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(flatten)]
        rest: Value,
    },
    Assistant { message: AssistantMessage },
    User { message: UserMessage },
    /// Terminal message for the turn.
    Result {
        subtype: String,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<UsageSnapshot>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<UserBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

/// Flatten a tool_result's content (string or content-block array) to text.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ─── Target extraction ────────────────────────────────────────────────────────

/// Lift the salient string out of a tool input: the file for file ops, the
/// command head for shells, the pattern for searches, the role or agent id
/// for the harness tools. MCP-prefixed names (`mcp__srv__tool`) match on
/// their final segment.
pub fn extract_target(tool: &str, input: &Value) -> Option<String> {
    let base = tool.rsplit("__").next().unwrap_or(tool);
    let field = |key: &str| input.get(key).and_then(Value::as_str).map(String::from);
    match base {
        "Read" | "Write" | "Edit" | "NotebookEdit" => field("file_path"),
        "Bash" => input
            .get("command")
            .and_then(Value::as_str)
            .map(|c| c.chars().take(80).collect()),
        "Grep" | "Glob" => field("pattern"),
        "draft_agent" => field("role"),
        "await_agent" | "kill_agent" => field("agentId"),
        _ => None,
    }
}

// ─── Stream & launcher seams ──────────────────────────────────────────────────

/// What the supervisor needs to start one child turn.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub prompt: String,
    /// Role prompt, appended to the child's system prompt.
    pub system_prompt: String,
    pub model: String,
    pub cwd: PathBuf,
    pub session: SessionBinding,
    pub stream_close_timeout_ms: u64,
    /// Extra environment from config.
    pub extra_env: HashMap<String, String>,
}

/// How the turn binds to an agent-protocol session: a fresh session with a
/// harness-chosen id, or a resume of an earlier one.
#[derive(Debug, Clone)]
pub enum SessionBinding {
    New(String),
    Resume(String),
}

#[async_trait]
pub trait AgentStream: Send {
    /// Next message from the child; `None` when the stream closed.
    async fn next_message(&mut self) -> Option<Result<AgentMessage>>;
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentStream>>;
}

// ─── Claude CLI launcher ──────────────────────────────────────────────────────

/// Launches the `claude` CLI as the child agent.
pub struct ClaudeLauncher;

#[async_trait]
impl AgentLauncher for ClaudeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentStream>> {
        let mut cmd = Command::new("claude");
        cmd.args([
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
            "--model",
            &spec.model,
            "--append-system-prompt",
            &spec.system_prompt,
        ]);
        match &spec.session {
            SessionBinding::New(id) => {
                cmd.args(["--session-id", id]);
            }
            SessionBinding::Resume(id) => {
                cmd.args(["--resume", id]);
            }
        }
        cmd.args(["-p", &spec.prompt]);

        // Sanitized environment copy: the nested-session marker is stripped,
        // the stream-close timeout is pinned, and config-level extras win.
        cmd.env_clear();
        for (key, value) in std::env::vars() {
            if key == NESTED_SESSION_VAR {
                continue;
            }
            cmd.env(key, value);
        }
        cmd.env(
            STREAM_CLOSE_TIMEOUT_VAR,
            spec.stream_close_timeout_ms.to_string(),
        );
        #[cfg(unix)]
        if let Ok(shell) = std::env::var(SHELL_VAR) {
            cmd.env(SHELL_VAR, shell);
        }
        for (key, value) in &spec.extra_env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .current_dir(&spec.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn `claude` — is it installed and on PATH?")?;

        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;

        // Drain stderr so the child never blocks on a full pipe.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agent_stderr", "{}", line);
            }
        });

        Ok(Box::new(ChildStream {
            lines: BufReader::new(stdout).lines(),
            child: Some(child),
        }))
    }
}

/// Line-delimited JSON stream over a child's stdout. Dropping the stream
/// kills the child (`kill_on_drop`), which is how cooperative aborts reach
/// the process.
struct ChildStream {
    lines: Lines<BufReader<ChildStdout>>,
    child: Option<Child>,
}

#[async_trait]
impl AgentStream for ChildStream {
    async fn next_message(&mut self) -> Option<Result<AgentMessage>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AgentMessage>(&line) {
                        Ok(msg) => return Some(Ok(msg)),
                        Err(_) => {
                            warn!(line = %line, "unparseable agent message");
                            continue;
                        }
                    }
                }
                Ok(None) => {
                    // Stream closed — reap the child so it doesn't zombie.
                    if let Some(mut child) = self.child.take() {
                        let _ = child.wait().await;
                    }
                    return None;
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_assistant_tool_use() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "running"},
                {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"command": "ls"}}
            ]}
        })
        .to_string();
        let msg: AgentMessage = serde_json::from_str(&line).expect("parse");
        let AgentMessage::Assistant { message } = msg else {
            panic!("expected assistant");
        };
        assert_eq!(message.content.len(), 2);
        assert!(matches!(message.content[1], ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn parses_result_with_usage() {
        let line = json!({
            "type": "result",
            "subtype": "success",
            "total_cost_usd": 0.12,
            "num_turns": 4,
            "usage": {"inputTokens": 100, "outputTokens": 50}
        })
        .to_string();
        let msg: AgentMessage = serde_json::from_str(&line).expect("parse");
        let AgentMessage::Result {
            subtype,
            total_cost_usd,
            usage,
            ..
        } = msg
        else {
            panic!("expected result");
        };
        assert_eq!(subtype, "success");
        assert_eq!(total_cost_usd, Some(0.12));
        assert_eq!(usage.expect("usage").input_tokens, 100);
    }

    #[test]
    fn unknown_message_types_do_not_fail_parsing() {
        let msg: AgentMessage =
            serde_json::from_str(r#"{"type":"telemetry","data":1}"#).expect("parse");
        assert!(matches!(msg, AgentMessage::Unknown));
    }

    #[test]
    fn extract_target_per_tool() {
        assert_eq!(
            extract_target("Read", &json!({"file_path": "/src/lib.rs"})),
            Some("/src/lib.rs".to_string())
        );
        let long_cmd = "c".repeat(200);
        assert_eq!(
            extract_target("Bash", &json!({"command": long_cmd})).map(|t| t.len()),
            Some(80)
        );
        assert_eq!(
            extract_target("Grep", &json!({"pattern": "fn main"})),
            Some("fn main".to_string())
        );
        assert_eq!(
            extract_target("mcp__crewd__draft_agent", &json!({"role": "api-dev"})),
            Some("api-dev".to_string())
        );
        assert_eq!(
            extract_target("await_agent", &json!({"agentId": "01ABC"})),
            Some("01ABC".to_string())
        );
        assert_eq!(extract_target("WebFetch", &json!({"url": "x"})), None);
    }

    #[test]
    fn tool_result_text_flattens_blocks() {
        assert_eq!(tool_result_text(&json!("plain")), "plain");
        assert_eq!(
            tool_result_text(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(tool_result_text(&json!(42)), "");
    }

    #[test]
    fn parses_system_init_with_session_id() {
        let msg: AgentMessage = serde_json::from_str(
            r#"{"type":"system","subtype":"init","session_id":"sess-9","model":"m"}"#,
        )
        .expect("parse");
        let AgentMessage::System {
            subtype, session_id, ..
        } = msg
        else {
            panic!("expected system");
        };
        assert_eq!(subtype.as_deref(), Some("init"));
        assert_eq!(session_id.as_deref(), Some("sess-9"));
    }

    #[test]
    fn parses_thinking_blocks() {
        let line = json!({
            "type": "assistant",
            "message": { "content": [{ "type": "thinking", "thinking": "hmm" }] }
        })
        .to_string();
        let msg: AgentMessage = serde_json::from_str(&line).expect("parse");
        let AgentMessage::Assistant { message } = msg else {
            panic!("expected assistant");
        };
        assert!(matches!(
            &message.content[0],
            ContentBlock::Thinking { thinking } if thinking == "hmm"
        ));
    }

    #[test]
    fn parses_user_tool_results() {
        let line = json!({
            "type": "user",
            "message": { "content": [
                { "type": "tool_result", "tool_use_id": "tu_3", "is_error": true, "content": "boom" }
            ]}
        })
        .to_string();
        let msg: AgentMessage = serde_json::from_str(&line).expect("parse");
        let AgentMessage::User { message } = msg else {
            panic!("expected user");
        };
        let UserBlock::ToolResult {
            tool_use_id,
            is_error,
            content,
        } = &message.content[0]
        else {
            panic!("expected tool_result");
        };
        assert_eq!(tool_use_id, "tu_3");
        assert!(*is_error);
        assert_eq!(tool_result_text(content), "boom");
    }

    #[test]
    fn unknown_content_blocks_are_tolerated() {
        let line = json!({
            "type": "assistant",
            "message": { "content": [
                { "type": "server_tool_use", "id": "x" },
                { "type": "text", "text": "still here" }
            ]}
        })
        .to_string();
        let msg: AgentMessage = serde_json::from_str(&line).expect("parse");
        let AgentMessage::Assistant { message } = msg else {
            panic!("expected assistant");
        };
        assert!(matches!(message.content[0], ContentBlock::Other));
        assert!(matches!(message.content[1], ContentBlock::Text { .. }));
    }
}
