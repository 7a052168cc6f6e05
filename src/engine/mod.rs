//! The dispatch engine.
//!
//! Owns the glue between the front doors and the supervision core: routing
//! an inbound prompt to a role, opening or reusing the task folder,
//! prepending prior results, spawning the supervised dispatch, and the
//! project/task/draft/agent operations the RPC facade and CLI delegate to.
//! All state is explicit — one engine value per process, threaded through
//! call sites.

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::comms::{CommsRegistry, InboundMessage};
use crate::config::HarnessConfig;
use crate::draft::{DraftEngine, DraftSession, DraftSummary};
use crate::error::HarnessError;
use crate::id::sortable_id;
use crate::pool::{AgentPool, AgentSnapshot};
use crate::roles::{Role, RoleRegistry};
use crate::router::debounce::Debouncer;
use crate::router::Router;
use crate::store::{Project, ProjectRegistry, TaskManifest, TaskStore};
use crate::supervisor::{DispatchSpec, Supervisor};
use crate::toolserver::{build_task_context, DispatchTracker, ToolAccess, ToolServer};

// ─── Request/response shapes ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SubmitPrompt {
    pub content: String,
    pub role: Option<String>,
    pub project: Option<String>,
    pub task_slug: Option<String>,
    /// Thread the reply stream goes to; generated when the caller has none.
    pub channel_id: Option<String>,
    pub correlation_key: Option<String>,
    pub cwd_override: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub thread_id: String,
    pub task_slug: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub slug: String,
    pub task_dir: PathBuf,
    pub slug_modified: bool,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct DispatchEngine {
    config: Arc<HarnessConfig>,
    store: Arc<TaskStore>,
    projects: Arc<ProjectRegistry>,
    roles: Arc<RoleRegistry>,
    pool: Arc<AgentPool>,
    comms: Arc<CommsRegistry>,
    supervisor: Arc<Supervisor>,
    draft: Arc<DraftEngine>,
    router: Router,
    tracker: Arc<DispatchTracker>,
    debouncer: OnceCell<Debouncer>,
}

impl DispatchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<HarnessConfig>,
        store: Arc<TaskStore>,
        projects: Arc<ProjectRegistry>,
        roles: Arc<RoleRegistry>,
        pool: Arc<AgentPool>,
        comms: Arc<CommsRegistry>,
        supervisor: Arc<Supervisor>,
        draft: Arc<DraftEngine>,
    ) -> Arc<Self> {
        let router = Router::new(&config.routes, &config.default_role);
        Arc::new(Self {
            config,
            store,
            projects,
            roles,
            pool,
            comms,
            supervisor,
            draft,
            router,
            tracker: Arc::new(DispatchTracker::new()),
            debouncer: OnceCell::new(),
        })
    }

    /// Install the inbound-burst debouncer. Separate from construction
    /// because the flush closure needs a handle back to the engine.
    pub fn init_debouncer(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let window = Duration::from_millis(self.config.debounce_ms);
        let _ = self.debouncer.set(Debouncer::new(
            window,
            Arc::new(move |batch: Vec<InboundMessage>| {
                let Some(engine) = weak.upgrade() else { return };
                let Some(first) = batch.first().cloned() else { return };
                let content = batch
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                tokio::spawn(async move {
                    let submit = SubmitPrompt {
                        content,
                        role: first.role,
                        project: first.project,
                        task_slug: first.task_slug,
                        channel_id: Some(first.channel_id),
                        correlation_key: first.correlation_key,
                        cwd_override: None,
                    };
                    if let Err(e) = engine.submit_prompt(submit).await {
                        error!(err = %e, "debounced submit failed");
                    }
                });
            }),
        ));
    }

    /// Feed one raw inbound message into the debouncer. Bursts on the same
    /// thread key coalesce into a single dispatch.
    pub fn inbound(&self, message: InboundMessage) {
        let key = message
            .correlation_key
            .clone()
            .unwrap_or_else(|| message.channel_id.clone());
        match self.debouncer.get() {
            Some(debouncer) => debouncer.push(&key, message),
            None => warn!("inbound message before debouncer init — dropped"),
        }
    }

    // ─── Prompt intake ────────────────────────────────────────────────────────

    /// The main front door. A new dispatch is spawned in the background and
    /// the receipt returns immediately; when a draft is active the prompt
    /// is routed to it instead (project optional in that case).
    pub async fn submit_prompt(self: &Arc<Self>, submit: SubmitPrompt) -> Result<SubmitReceipt> {
        if let Some(session) = self.draft.status() {
            // A recovered draft whose role file vanished refuses cleanly
            // instead of crashing mid-turn.
            if session.stale_role {
                return Err(HarnessError::RoleNotFound(session.role).into());
            }
            let draft = self.draft.clone();
            let comms = self.comms.clone();
            let content = submit.content.clone();
            let channel = session.channel_id.clone();
            tokio::spawn(async move {
                if let Err(e) = draft.resume(&content).await {
                    error!(err = %e, "draft turn failed");
                    comms
                        .broadcast(&crate::comms::ChannelMessage::new(
                            channel,
                            crate::comms::MessageType::Error,
                            format!("draft turn failed: {e}"),
                        ))
                        .await;
                }
            });
            return Ok(SubmitReceipt {
                thread_id: session.channel_id,
                task_slug: session.task_slug,
                agent_id: session.agent_id,
            });
        }

        let project_name = submit
            .project
            .clone()
            .ok_or_else(|| HarnessError::InvalidParams("project is required".into()))?;
        let project = self
            .projects
            .get(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.clone()))?;
        let project_dir = self
            .projects
            .project_dir(&project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.clone()))?;

        let role_name = match &submit.role {
            Some(role) => role.clone(),
            None => self.router.resolve_role(&submit.content).to_string(),
        };
        let role = self
            .roles
            .get(&role_name)
            .ok_or_else(|| HarnessError::RoleNotFound(role_name.clone()))?;
        if !project.allows_role(&role.name) {
            return Err(HarnessError::InvalidParams(format!(
                "project {} does not allow role {}",
                project.name, role.name
            ))
            .into());
        }

        let cwd = submit
            .cwd_override
            .clone()
            .or_else(|| self.router.resolve_routing_cwd(&submit.content).map(PathBuf::from))
            .unwrap_or_else(|| project.default_cwd(&project_dir));

        // Open or reuse the task folder: explicit slug first, then the
        // conversation's correlation key, else a fresh task.
        let manifest = match &submit.task_slug {
            Some(slug) => {
                let task_dir = self.store.task_dir(&project_dir, slug);
                self.store
                    .get_task(&task_dir)
                    .await
                    .ok_or_else(|| HarnessError::TaskNotFound(slug.clone()))?
            }
            None => {
                let existing = match &submit.correlation_key {
                    Some(key) => self.store.find_task_by_correlation(&project_dir, key).await,
                    None => None,
                };
                match existing {
                    Some(manifest) => manifest,
                    None => {
                        let name = task_name_from(&submit.content);
                        let (manifest, _, _) = self
                            .store
                            .create_task(
                                &project_dir,
                                &name,
                                None,
                                submit.correlation_key.clone(),
                            )
                            .await?;
                        manifest
                    }
                }
            }
        };

        let thread_id = submit
            .channel_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let agent_id = self
            .spawn_dispatch(&project_dir, &manifest, role, cwd, &submit.content, None, &thread_id)
            .await;

        Ok(SubmitReceipt {
            thread_id,
            task_slug: manifest.slug,
            agent_id,
        })
    }

    /// Spawn a supervised dispatch in the background. Returns the agent id
    /// at once; `await_agent` (via the tracker) is the only way to wait.
    async fn spawn_dispatch(
        self: &Arc<Self>,
        project_dir: &std::path::Path,
        manifest: &TaskManifest,
        role: Role,
        cwd: PathBuf,
        prompt: &str,
        parent_dispatch_id: Option<String>,
        channel_id: &str,
    ) -> String {
        let task_dir = self.store.task_dir(project_dir, &manifest.slug);

        // Follow-ups see prior structured results ahead of the new ask.
        let envelopes = self.store.dispatch_envelopes(&task_dir).await;
        let prompt = if envelopes.iter().any(|e| e.structured_result.is_some()) {
            format!(
                "{}\n\n{}",
                build_task_context(manifest, &envelopes),
                prompt
            )
        } else {
            prompt.to_string()
        };

        let dispatch_id = sortable_id();
        let resolved_model = role.model.resolve(&self.config.models);
        let spec = DispatchSpec {
            dispatch_id: dispatch_id.clone(),
            task_dir,
            task_slug: manifest.slug.clone(),
            role,
            model: resolved_model,
            cwd,
            prompt,
            channel_id: channel_id.to_string(),
            parent_dispatch_id,
        };

        let tx = self.tracker.register(&dispatch_id);
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            let result = supervisor.run_dispatch(spec).await;
            let _ = tx.send(Some(result));
        });

        info!(dispatch = %dispatch_id, "dispatch spawned");
        dispatch_id
    }

    /// The tool server's spawn path: a child agent opening a sibling
    /// dispatch under its own project, with the parent id recorded so the
    /// dispatch tree can be reconstructed offline.
    pub async fn spawn_child_dispatch(
        self: &Arc<Self>,
        project_name: &str,
        role_name: &str,
        prompt: &str,
        task_slug: Option<&str>,
        parent_dispatch_id: &str,
    ) -> Result<String> {
        let project = self
            .projects
            .get(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        let project_dir = self
            .projects
            .project_dir(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        let role = self
            .roles
            .get(role_name)
            .ok_or_else(|| HarnessError::RoleNotFound(role_name.to_string()))?;

        let manifest = match task_slug {
            Some(slug) => {
                let task_dir = self.store.task_dir(&project_dir, slug);
                self.store
                    .get_task(&task_dir)
                    .await
                    .ok_or_else(|| HarnessError::TaskNotFound(slug.to_string()))?
            }
            None => {
                let name = task_name_from(prompt);
                let (manifest, _, _) = self
                    .store
                    .create_task(&project_dir, &name, None, None)
                    .await?;
                manifest
            }
        };

        let cwd = project.default_cwd(&project_dir);
        let channel_id = format!("agent:{parent_dispatch_id}");
        let agent_id = self
            .spawn_dispatch(
                &project_dir,
                &manifest,
                role,
                cwd,
                prompt,
                Some(parent_dispatch_id.to_string()),
                &channel_id,
            )
            .await;
        Ok(agent_id)
    }

    /// Build the tool server a dispatch's child would talk to. The flavor
    /// is a policy decision off the role's permission set.
    pub fn tool_server(self: &Arc<Self>, role: &Role, project: &str, dispatch_id: &str) -> ToolServer {
        let access = if role.full_tool_access() {
            ToolAccess::Full
        } else {
            ToolAccess::ReadOnly
        };
        ToolServer::new(self, access, project, dispatch_id)
    }

    // ─── Reads & agent control ────────────────────────────────────────────────

    pub fn tracker(&self) -> &DispatchTracker {
        &self.tracker
    }

    pub fn agents_snapshot(&self) -> Vec<AgentSnapshot> {
        self.pool.snapshot()
    }

    /// Idempotent: killing an unknown or already-killed agent returns false.
    pub fn kill_agent(&self, agent_id: &str) -> bool {
        self.pool.kill(agent_id)
    }

    pub fn projects(&self) -> Vec<Project> {
        self.projects.list()
    }

    pub fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        roles: Vec<String>,
    ) -> Result<Project> {
        self.projects.create(name, description, roles)
    }

    pub fn reload_projects(&self) -> usize {
        self.projects.reload()
    }

    pub async fn create_task(
        &self,
        project_name: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<CreatedTask> {
        let project_dir = self
            .projects
            .project_dir(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        let (manifest, task_dir, slug_modified) = self
            .store
            .create_task(&project_dir, name, description, None)
            .await?;
        Ok(CreatedTask {
            slug: manifest.slug,
            task_dir,
            slug_modified,
        })
    }

    pub async fn close_task(&self, project_name: &str, slug: &str) -> Result<()> {
        let project_dir = self
            .projects
            .project_dir(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        let task_dir = self.store.task_dir(&project_dir, slug);
        if self.store.get_task(&task_dir).await.is_none() {
            return Err(HarnessError::TaskNotFound(slug.to_string()).into());
        }
        self.store.close_task(&task_dir).await
    }

    pub async fn list_tasks(&self, project_name: &str) -> Result<Vec<TaskManifest>> {
        let project_dir = self
            .projects
            .project_dir(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        Ok(self.store.list_tasks(&project_dir).await)
    }

    pub async fn task_context(&self, project_name: &str, slug: &str) -> Result<String> {
        let project_dir = self
            .projects
            .project_dir(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        let task_dir = self.store.task_dir(&project_dir, slug);
        let manifest = self
            .store
            .get_task(&task_dir)
            .await
            .ok_or_else(|| HarnessError::TaskNotFound(slug.to_string()))?;
        let envelopes = self.store.dispatch_envelopes(&task_dir).await;
        Ok(build_task_context(&manifest, &envelopes))
    }

    // ─── Draft delegation ─────────────────────────────────────────────────────

    pub async fn open_draft(
        &self,
        role: &str,
        project: &str,
        task_slug: &str,
    ) -> Result<DraftSession> {
        let channel_id = uuid::Uuid::new_v4().to_string();
        self.draft.create(role, project, task_slug, &channel_id).await
    }

    pub async fn undraft(&self) -> Result<DraftSummary> {
        self.draft.undraft().await
    }

    pub fn draft_status(&self) -> Option<DraftSession> {
        self.draft.status()
    }

    /// Startup recovery: reload the persisted active draft, if any.
    pub async fn recover(&self) -> Option<DraftSession> {
        self.draft.recover().await
    }
}

/// Derive a task name from prompt content: first line, capped.
fn task_name_from(content: &str) -> String {
    let first = content.lines().next().unwrap_or("task").trim();
    let name: String = first.chars().take(80).collect();
    if name.is_empty() {
        "task".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_come_from_the_first_line() {
        assert_eq!(task_name_from("Build login\nwith oauth"), "Build login");
        assert_eq!(task_name_from(""), "task");
        let long = "x".repeat(300);
        assert_eq!(task_name_from(&long).len(), 80);
    }
}
