//! Shared test support: a scripted agent launcher standing in for the
//! child process, plus fixture helpers for projects and roles.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crewd::config::HarnessConfig;
use crewd::supervisor::stream::{AgentLauncher, AgentMessage, AgentStream, LaunchSpec};
use crewd::AppContext;

// ─── Config & fixtures ────────────────────────────────────────────────────────

pub fn test_config(data_dir: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::new(Some(0), Some(data_dir.to_path_buf()), None, None);
    config.max_agents = 8;
    config
}

pub fn seed_project(config: &HarnessConfig, name: &str) -> PathBuf {
    let dir = config.projects_dir.join(name);
    let workdir = dir.join("workdir");
    std::fs::create_dir_all(dir.join("tasks")).expect("mkdir tasks");
    std::fs::create_dir_all(&workdir).expect("mkdir workdir");
    std::fs::write(
        dir.join("project.yaml"),
        format!(
            "name: {name}\ndescription: test project\npaths: [\"{}\"]\nroles: []\n",
            workdir.display()
        ),
    )
    .expect("write project.yaml");
    dir
}

pub fn seed_role(config: &HarnessConfig, name: &str, permissions: &str) {
    std::fs::create_dir_all(&config.roles_dir).expect("mkdir roles");
    std::fs::write(
        config.roles_dir.join(format!("{name}.yaml")),
        format!(
            r#"
id: "{id}"
version: "0.1.0"
name: {name}
display_name: "{name}"
model: sonnet
permissions: {permissions}
prompt: |
  You are the {name} agent.
"#,
            id = crewd::id::sortable_id(),
        ),
    )
    .expect("write role");
}

pub fn msg(value: Value) -> AgentMessage {
    serde_json::from_value(value).expect("valid agent message")
}

// ─── Canned message builders ──────────────────────────────────────────────────

pub fn init_msg(session_id: &str) -> AgentMessage {
    msg(json!({ "type": "system", "subtype": "init", "session_id": session_id }))
}

pub fn text_msg(text: &str) -> AgentMessage {
    msg(json!({
        "type": "assistant",
        "message": { "content": [{ "type": "text", "text": text }] }
    }))
}

pub fn tool_use_msg(id: &str, name: &str, input: Value) -> AgentMessage {
    msg(json!({
        "type": "assistant",
        "message": { "content": [
            { "type": "tool_use", "id": id, "name": name, "input": input }
        ]}
    }))
}

pub fn tool_result_msg(id: &str, is_error: bool, content: &str) -> AgentMessage {
    msg(json!({
        "type": "user",
        "message": { "content": [
            { "type": "tool_result", "tool_use_id": id, "is_error": is_error, "content": content }
        ]}
    }))
}

pub fn structured_output_msg(id: &str, payload: Value) -> AgentMessage {
    tool_use_msg(id, "StructuredOutput", payload)
}

pub fn result_msg(subtype: &str, cost: f64) -> AgentMessage {
    msg(json!({
        "type": "result",
        "subtype": subtype,
        "total_cost_usd": cost,
        "num_turns": 2,
        "duration_ms": 1234,
        "result": "turn finished",
        "usage": { "inputTokens": 1000, "outputTokens": 200, "contextWindow": 200000 }
    }))
}

// ─── Scripted stream & launcher ───────────────────────────────────────────────

pub enum Step {
    /// Yield a message.
    Msg(AgentMessage),
    /// Wait before the next step.
    Delay(Duration),
    /// Produce nothing until the supervisor gives up (stall / kill tests).
    Hang,
}

pub struct ScriptedStream {
    steps: VecDeque<Step>,
}

#[async_trait]
impl AgentStream for ScriptedStream {
    async fn next_message(&mut self) -> Option<anyhow::Result<AgentMessage>> {
        loop {
            match self.steps.pop_front()? {
                Step::Msg(message) => return Some(Ok(message)),
                Step::Delay(duration) => tokio::time::sleep(duration).await,
                Step::Hang => {
                    futures_util::future::pending::<()>().await;
                    unreachable!();
                }
            }
        }
    }
}

/// Hands out one pre-recorded script per launch, newest first, and records
/// every [`LaunchSpec`] it saw.
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub launches: Mutex<Vec<LaunchSpec>>,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().expect("lock").push_back(steps);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().expect("lock").len()
    }

    pub fn last_launch(&self) -> Option<LaunchSpec> {
        self.launches.lock().expect("lock").last().cloned()
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn AgentStream>> {
        self.launches.lock().expect("lock").push(spec.clone());
        let steps = self
            .scripts
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no script queued for launch"))?;
        Ok(Box::new(ScriptedStream {
            steps: steps.into(),
        }))
    }
}

// ─── Harness bootstrap ────────────────────────────────────────────────────────

pub struct TestHarness {
    pub ctx: Arc<AppContext>,
    pub launcher: Arc<ScriptedLauncher>,
    // Held for the test's lifetime; dropping it removes the tree.
    pub dir: tempfile::TempDir,
}

/// Build a full harness around a scripted launcher, with one project
/// (`Acme`) and two roles (`api-dev`, and `concierge` with agent-draft).
pub async fn bootstrap() -> TestHarness {
    bootstrap_with(|_| {}).await
}

/// Like [`bootstrap`], with a hook to tweak the config (e.g. a short stall
/// timeout) before the harness comes up.
pub async fn bootstrap_with(tweak: impl FnOnce(&mut HarnessConfig)) -> TestHarness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    seed_project(&config, "Acme");
    seed_role(&config, "api-dev", "[]");
    seed_role(&config, "concierge", "[agent-draft]");
    tweak(&mut config);

    let launcher = ScriptedLauncher::new();
    let ctx = AppContext::initialize(config, launcher.clone()).expect("initialize");
    ctx.startup().await;
    TestHarness { ctx, launcher, dir }
}

/// The task directory for a slug under the fixture project.
pub fn task_dir(ctx: &AppContext, slug: &str) -> PathBuf {
    let project_dir = ctx.projects.project_dir("Acme").expect("project dir");
    ctx.store.task_dir(&project_dir, slug)
}

/// Poll until the pool holds `n` agents (or panic after ~2s).
pub async fn wait_for_pool_size(ctx: &AppContext, n: usize) {
    for _ in 0..200 {
        if ctx.pool.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached size {n} (now {})", ctx.pool.len());
}
