//! The embedded tool server.
//!
//! Child agents call back into the harness through this in-process RPC
//! surface to spawn sibling agents, await or kill them, and read harness
//! state. Two flavors exist: **readonly** for coding agents and **full**
//! for conversational agents whose role carries the `agent-draft`
//! permission. Tool invocations arrive as `(name, json args)` pairs and
//! return JSON, so any transport (MCP, tests) can sit in front.

pub mod context;

pub use context::build_task_context;

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::info;

use crate::engine::DispatchEngine;
use crate::error::HarnessError;
use crate::supervisor::DispatchResult;

// ─── Dispatch tracker ─────────────────────────────────────────────────────────

/// Maps agent id → the eventual terminal [`DispatchResult`]. `draft_agent`
/// registers before returning; `await_agent` blocks on the entry. Results
/// stay available after completion, so awaiting twice is fine.
#[derive(Default)]
pub struct DispatchTracker {
    map: Mutex<HashMap<String, watch::Receiver<Option<DispatchResult>>>>,
}

impl DispatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent and get the sender its supervisor task resolves.
    pub fn register(&self, agent_id: &str) -> watch::Sender<Option<DispatchResult>> {
        let (tx, rx) = watch::channel(None);
        self.lock().insert(agent_id.to_string(), rx);
        tx
    }

    /// Block until the agent's dispatch reaches a terminal state.
    pub async fn await_result(&self, agent_id: &str) -> Result<DispatchResult> {
        let mut rx = self
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| HarnessError::AgentNotFound(agent_id.to_string()))?;
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return Ok(result);
            }
            rx.changed()
                .await
                .map_err(|_| anyhow::anyhow!("dispatch task for {agent_id} went away"))?;
        }
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.lock().contains_key(agent_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<Option<DispatchResult>>>> {
        match self.map.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Tool catalogue ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAccess {
    ReadOnly,
    Full,
}

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub write: bool,
}

/// Every tool the server knows. The write tools are only reachable with
/// [`ToolAccess::Full`].
pub fn catalogue() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "draft_agent",
            description: "Spawn a sibling agent for a role and prompt; returns its agent id",
            write: true,
        },
        ToolDef {
            name: "await_agent",
            description: "Block until an agent's dispatch finishes; returns its result",
            write: true,
        },
        ToolDef {
            name: "kill_agent",
            description: "Abort a running agent",
            write: true,
        },
        ToolDef {
            name: "list_agents",
            description: "List running agents",
            write: false,
        },
        ToolDef {
            name: "list_tasks",
            description: "List tasks in a project",
            write: false,
        },
        ToolDef {
            name: "get_task_context",
            description: "Markdown history of a task's prior results",
            write: false,
        },
        ToolDef {
            name: "list_projects",
            description: "List known projects",
            write: false,
        },
    ]
}

// ─── Server ───────────────────────────────────────────────────────────────────

/// One tool server instance exists per dispatch, bound to the parent
/// dispatch's project so recursively spawned agents land in the right
/// place and carry `parentDispatchId`.
pub struct ToolServer {
    engine: Weak<DispatchEngine>,
    access: ToolAccess,
    project: String,
    parent_dispatch_id: String,
}

impl ToolServer {
    pub fn new(
        engine: &Arc<DispatchEngine>,
        access: ToolAccess,
        project: &str,
        parent_dispatch_id: &str,
    ) -> Self {
        Self {
            engine: Arc::downgrade(engine),
            access,
            project: project.to_string(),
            parent_dispatch_id: parent_dispatch_id.to_string(),
        }
    }

    pub fn access(&self) -> ToolAccess {
        self.access
    }

    /// Route one tool invocation.
    pub async fn dispatch(&self, tool_name: &str, arguments: Value) -> Result<Value> {
        let Some(def) = catalogue().into_iter().find(|t| t.name == tool_name) else {
            return Err(
                HarnessError::InvalidParams(format!("unknown tool: {tool_name}")).into(),
            );
        };
        if def.write && self.access == ToolAccess::ReadOnly {
            return Err(HarnessError::InvalidParams(format!(
                "tool '{tool_name}' requires the agent-draft permission"
            ))
            .into());
        }
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("engine is shutting down"))?;

        let result = match tool_name {
            "draft_agent" => {
                let role = str_arg(&arguments, "role")?;
                let prompt = str_arg(&arguments, "prompt")?;
                let task_slug = opt_str(&arguments, "taskSlug");
                let agent_id = engine
                    .spawn_child_dispatch(
                        &self.project,
                        role,
                        prompt,
                        task_slug,
                        &self.parent_dispatch_id,
                    )
                    .await?;
                json!({ "agentId": agent_id })
            }
            "await_agent" => {
                let agent_id = str_arg(&arguments, "agentId")?;
                let result = engine.tracker().await_result(agent_id).await?;
                serde_json::to_value(result)?
            }
            "kill_agent" => {
                let agent_id = str_arg(&arguments, "agentId")?;
                json!({ "killed": engine.kill_agent(agent_id) })
            }
            "list_agents" => json!({ "agents": engine.agents_snapshot() }),
            "list_tasks" => {
                let project = opt_str(&arguments, "project").unwrap_or(&self.project);
                let tasks = engine.list_tasks(project).await?;
                json!({
                    "tasks": tasks
                        .iter()
                        .map(|t| json!({
                            "slug": t.slug,
                            "name": t.name,
                            "status": t.status,
                            "dispatches": t.dispatches.len(),
                        }))
                        .collect::<Vec<_>>()
                })
            }
            "get_task_context" => {
                let slug = str_arg(&arguments, "taskSlug").or_else(|_| str_arg(&arguments, "slug"))?;
                let context = engine.task_context(&self.project, slug).await?;
                json!({ "context": context })
            }
            "list_projects" => {
                json!({
                    "projects": engine
                        .projects()
                        .iter()
                        .map(|p| json!({
                            "name": p.name,
                            "description": p.description,
                            "paths": p.paths,
                            "roles": p.roles,
                        }))
                        .collect::<Vec<_>>()
                })
            }
            // Unreachable — the catalogue check above covers it.
            other => {
                return Err(HarnessError::InvalidParams(format!("unknown tool: {other}")).into())
            }
        };

        info!(
            tool = tool_name,
            parent = %self.parent_dispatch_id,
            "tool server call"
        );
        Ok(result)
    }
}

// ─── Arg helpers ──────────────────────────────────────────────────────────────

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HarnessError::InvalidParams(format!("missing required field '{key}'")).into())
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DispatchStatus;

    fn result(id: &str) -> DispatchResult {
        DispatchResult {
            dispatch_id: id.to_string(),
            status: DispatchStatus::Completed,
            abort_reason: None,
            cost: 0.0,
            usage: None,
            structured_result: None,
            result_text: None,
            error: None,
            session_id: None,
            num_turns: None,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn tracker_awaits_a_later_resolution() {
        let tracker = Arc::new(DispatchTracker::new());
        let tx = tracker.register("agent-1");

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.await_result("agent-1").await })
        };
        tokio::task::yield_now().await;
        tx.send(Some(result("agent-1"))).expect("send");

        let got = waiter.await.expect("join").expect("result");
        assert_eq!(got.dispatch_id, "agent-1");
    }

    #[tokio::test]
    async fn tracker_resolves_immediately_after_completion() {
        let tracker = DispatchTracker::new();
        let tx = tracker.register("agent-2");
        tx.send(Some(result("agent-2"))).expect("send");
        let got = tracker.await_result("agent-2").await.expect("result");
        assert_eq!(got.dispatch_id, "agent-2");
        // Awaiting again still works.
        assert!(tracker.await_result("agent-2").await.is_ok());
    }

    #[tokio::test]
    async fn tracker_rejects_unknown_ids() {
        let tracker = DispatchTracker::new();
        let err = tracker.await_result("ghost").await.expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::AgentNotFound(_))
        ));
    }

    #[test]
    fn catalogue_separates_write_tools() {
        let write: Vec<&str> = catalogue().iter().filter(|t| t.write).map(|t| t.name).collect();
        assert_eq!(write, vec!["draft_agent", "await_agent", "kill_agent"]);
    }
}
