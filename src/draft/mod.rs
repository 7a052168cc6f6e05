//! The draft session machine.
//!
//! A draft is a conversational, resumable dispatch: one agent stays
//! registered in the pool across user turns, and each turn resumes the
//! same agent-protocol session. At most one draft exists per process;
//! states run `none → active → closed` with no back-edges — closing is
//! terminal and a new draft is a fresh object.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{LoopThresholds, ModelAliases};
use crate::error::HarnessError;
use crate::id::sortable_id;
use crate::pool::{AgentEntry, AgentPool};
use crate::roles::RoleRegistry;
use crate::store::{
    read_json, write_json, DispatchEnvelope, DispatchEvent, DispatchPatch, DispatchStatus,
    EventType, ProjectRegistry, TaskStore,
};
use crate::supervisor::stream::{LaunchSpec, SessionBinding};
use crate::supervisor::{DispatchResult, StreamEnding, Supervisor, TurnSpec};

const DRAFT_FILE: &str = "draft.json";

// ─── Session state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSession {
    /// Agent-protocol session id, handed to the child so it can resume.
    pub session_id: String,
    /// Key in the agent pool, held for the draft's full lifetime.
    pub agent_id: String,
    pub role: String,
    pub project: String,
    pub task_slug: String,
    pub task_dir: PathBuf,
    pub channel_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub turn_count: u32,
    pub status: DraftStatus,
    /// False until the child's first `session:init` is observed.
    pub session_initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_dispatch_id: Option<String>,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    /// Set by recovery when the role file has disappeared; the next turn
    /// refuses with a clear error instead of crashing.
    #[serde(default)]
    pub stale_role: bool,
}

/// What `undraft` hands back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub session_id: String,
    pub task_slug: String,
    pub turns: u32,
    pub cost: f64,
    pub duration_ms: u64,
}

type StatusCallback = Box<dyn Fn(Option<&DraftSession>) + Send + Sync>;

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct DraftEngine {
    store: Arc<TaskStore>,
    pool: Arc<AgentPool>,
    supervisor: Arc<Supervisor>,
    roles: Arc<RoleRegistry>,
    projects: Arc<ProjectRegistry>,
    models: ModelAliases,
    active: Mutex<Option<DraftSession>>,
    /// Serializes turns; state reads stay lock-free of this.
    turn_lock: tokio::sync::Mutex<()>,
    on_status: Mutex<Option<StatusCallback>>,
}

impl DraftEngine {
    pub fn new(
        store: Arc<TaskStore>,
        pool: Arc<AgentPool>,
        supervisor: Arc<Supervisor>,
        roles: Arc<RoleRegistry>,
        projects: Arc<ProjectRegistry>,
        models: ModelAliases,
    ) -> Self {
        Self {
            store,
            pool,
            supervisor,
            roles,
            projects,
            models,
            active: Mutex::new(None),
            turn_lock: tokio::sync::Mutex::new(()),
            on_status: Mutex::new(None),
        }
    }

    pub fn set_on_status(&self, callback: StatusCallback) {
        if let Ok(mut guard) = self.on_status.lock() {
            *guard = Some(callback);
        }
    }

    pub fn status(&self) -> Option<DraftSession> {
        self.lock_active().clone()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Open a draft for a role on an existing task. Hard error while one is
    /// already active.
    pub async fn create(
        &self,
        role_name: &str,
        project_name: &str,
        task_slug: &str,
        channel_id: &str,
    ) -> Result<DraftSession> {
        if self.status().is_some() {
            return Err(HarnessError::DraftAlreadyActive.into());
        }
        let role = self
            .roles
            .get(role_name)
            .ok_or_else(|| HarnessError::RoleNotFound(role_name.to_string()))?;
        let project_dir = self
            .projects
            .project_dir(project_name)
            .ok_or_else(|| HarnessError::ProjectNotFound(project_name.to_string()))?;
        let task_dir = self.store.task_dir(&project_dir, task_slug);
        if self.store.get_task(&task_dir).await.is_none() {
            return Err(HarnessError::TaskNotFound(task_slug.to_string()).into());
        }

        let agent_id = sortable_id();
        self.pool.register(AgentEntry {
            id: agent_id.clone(),
            role: role.name.clone(),
            task_slug: task_slug.to_string(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        })?;

        let session = DraftSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_id,
            role: role.name.clone(),
            project: project_name.to_string(),
            task_slug: task_slug.to_string(),
            task_dir: task_dir.clone(),
            channel_id: channel_id.to_string(),
            started_at: Utc::now(),
            last_activity: Utc::now(),
            turn_count: 0,
            status: DraftStatus::Active,
            session_initialized: false,
            active_dispatch_id: None,
            cost: 0.0,
            last_input_tokens: None,
            last_output_tokens: None,
            context_window: None,
            max_output_tokens: None,
            stale_role: false,
        };
        persist_draft(&task_dir, &session).await;
        *self.lock_active() = Some(session.clone());
        self.fire_status();
        info!(agent = %session.agent_id, role = %session.role, task = %session.task_slug, "draft opened");
        Ok(session)
    }

    /// Run one conversational turn against the active draft.
    pub async fn resume(&self, prompt: &str) -> Result<DispatchResult> {
        let _turn = self.turn_lock.lock().await;

        let mut session = self.status().ok_or(HarnessError::NoActiveDraft)?;
        if session.stale_role {
            return Err(HarnessError::RoleNotFound(session.role.clone()).into());
        }
        let role = self
            .roles
            .get(&session.role)
            .ok_or_else(|| HarnessError::RoleNotFound(session.role.clone()))?;
        let project = self
            .projects
            .get(&session.project)
            .ok_or_else(|| HarnessError::ProjectNotFound(session.project.clone()))?;
        let project_dir = self
            .projects
            .project_dir(&session.project)
            .ok_or_else(|| HarnessError::ProjectNotFound(session.project.clone()))?;
        let cwd = project.default_cwd(&project_dir);

        // The abort handle lives in the pool for the draft's whole life.
        let cancel = self
            .pool
            .cancel_handle(&session.agent_id)
            .ok_or_else(|| HarnessError::AgentNotFound(session.agent_id.clone()))?;

        let model = role.model.resolve(&self.models);

        // First turn opens the dispatch envelope; later turns append to it.
        let mut envelope_is_new = false;
        let dispatch_id = match &session.active_dispatch_id {
            Some(id) => id.clone(),
            None => {
                let id = sortable_id();
                let mut envelope = DispatchEnvelope::new(
                    id.clone(),
                    session.task_slug.clone(),
                    role.name.clone(),
                    model.clone(),
                    cwd.clone(),
                    None,
                );
                envelope.session_id = Some(session.session_id.clone());
                self.store
                    .create_dispatch(&session.task_dir, &envelope)
                    .await
                    .context("persisting draft dispatch")?;
                session.active_dispatch_id = Some(id.clone());
                envelope_is_new = true;
                id
            }
        };

        if let Err(e) = self
            .store
            .append_event(
                &session.task_dir,
                &dispatch_id,
                DispatchEvent::new(
                    EventType::UserMessage,
                    Some(serde_json::json!({ "text": crate::store::truncate_text(prompt) })),
                ),
            )
            .await
        {
            warn!(dispatch = %dispatch_id, err = %e, "failed to journal draft prompt");
        }

        let binding = if session.session_initialized {
            SessionBinding::Resume(session.session_id.clone())
        } else {
            SessionBinding::New(session.session_id.clone())
        };
        let launch = LaunchSpec {
            prompt: prompt.to_string(),
            system_prompt: role.prompt.clone(),
            model,
            cwd,
            session: binding,
            stream_close_timeout_ms: self.supervisor.stream_close_timeout_ms(),
            extra_env: self.supervisor.extra_env().clone(),
        };

        let was_resume = session.session_initialized;
        let outcome = match self.supervisor.launcher().launch(&launch).await {
            Ok(stream) => {
                let turn = TurnSpec {
                    task_dir: &session.task_dir,
                    dispatch_id: &dispatch_id,
                    channel_id: &session.channel_id,
                    cancel,
                    thresholds: LoopThresholds::disabled(),
                    stall_timeout: self.supervisor.stall_timeout(),
                    journal_prompt: None,
                };
                self.supervisor.run_turn(&turn, stream).await
            }
            Err(e) => {
                // The child never spawned. An envelope opened by this turn
                // must not sit at `running` forever: finalize it crashed
                // with a journaled error and drop it from the session so a
                // retry opens a fresh one. An envelope from earlier turns
                // keeps its history and stays active for the retry.
                let message = e.to_string();
                if envelope_is_new {
                    if let Err(journal_err) = self
                        .store
                        .append_event(
                            &session.task_dir,
                            &dispatch_id,
                            DispatchEvent::new(
                                EventType::HarnessError,
                                Some(serde_json::json!({
                                    "message": crate::store::truncate_text(&message)
                                })),
                            ),
                        )
                        .await
                    {
                        warn!(dispatch = %dispatch_id, err = %journal_err, "failed to journal draft launch failure");
                    }
                    let patch = DispatchPatch {
                        status: Some(DispatchStatus::Crashed),
                        ended_at: Some(Utc::now()),
                        error: Some(message.clone()),
                        ..Default::default()
                    };
                    if let Err(patch_err) = self
                        .store
                        .update_dispatch(&session.task_dir, &dispatch_id, &patch)
                        .await
                    {
                        warn!(dispatch = %dispatch_id, err = %patch_err, "failed to finalize unlaunched draft dispatch");
                    }
                    session.active_dispatch_id = None;
                }
                session.last_activity = Utc::now();
                persist_draft(&session.task_dir, &session).await;
                *self.lock_active() = Some(session.clone());
                self.fire_status();
                warn!(agent = %session.agent_id, err = %message, "draft turn failed to launch");
                return Err(e.context("launching draft agent"));
            }
        };

        // Per-turn accounting.
        session.turn_count += 1;
        session.last_activity = Utc::now();
        session.cost += outcome.cost;
        if let Some(usage) = outcome.usage {
            session.last_input_tokens = Some(usage.input_tokens);
            session.last_output_tokens = Some(usage.output_tokens);
            session.context_window = usage.context_window.or(session.context_window);
            session.max_output_tokens = usage.max_output_tokens.or(session.max_output_tokens);
        }
        if outcome.session_init_seen {
            session.session_initialized = true;
        }

        // A resume turn that dies without reaching a terminal result means
        // the child could not pick the session back up: close the draft and
        // mark the dispatch crashed. Stalls and kills leave the draft
        // active so the user can simply send another turn.
        let resume_failed = was_resume
            && matches!(
                outcome.ending,
                StreamEnding::StreamFailure(_)
                    | StreamEnding::Failed(_)
                    | StreamEnding::ClosedWithoutResult
            );

        let patch = DispatchPatch {
            status: resume_failed.then_some(DispatchStatus::Crashed),
            ended_at: resume_failed.then(Utc::now),
            cost: Some(session.cost),
            error: if resume_failed { outcome.error_message() } else { None },
            session_id: Some(session.session_id.clone()),
            usage: outcome.usage,
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .update_dispatch(&session.task_dir, &dispatch_id, &patch)
            .await
        {
            warn!(dispatch = %dispatch_id, err = %e, "failed to update draft dispatch");
        }

        if resume_failed {
            session.status = DraftStatus::Closed;
            persist_draft(&session.task_dir, &session).await;
            self.pool.release(&session.agent_id);
            *self.lock_active() = None;
            self.fire_status();
            warn!(agent = %session.agent_id, "draft auto-closed after resume failure");
        } else {
            persist_draft(&session.task_dir, &session).await;
            *self.lock_active() = Some(session.clone());
            self.fire_status();
        }

        let status = if resume_failed {
            DispatchStatus::Crashed
        } else {
            outcome.status()
        };
        let abort_reason = outcome.abort_reason();
        let error = outcome.error_message();
        Ok(DispatchResult {
            dispatch_id,
            status,
            abort_reason,
            cost: outcome.cost,
            usage: outcome.usage,
            structured_result: outcome.structured_result,
            result_text: outcome.result_text,
            error,
            session_id: Some(session.session_id),
            num_turns: outcome.num_turns,
            duration_ms: outcome.duration_ms,
        })
    }

    /// Close the draft — the only normal exit. Releases the pool slot and
    /// finalizes the dispatch envelope.
    pub async fn undraft(&self) -> Result<DraftSummary> {
        let _turn = self.turn_lock.lock().await;

        let mut session = self.status().ok_or(HarnessError::NoActiveDraft)?;
        session.status = DraftStatus::Closed;
        persist_draft(&session.task_dir, &session).await;

        if let Some(dispatch_id) = &session.active_dispatch_id {
            let patch = DispatchPatch {
                status: Some(DispatchStatus::Completed),
                ended_at: Some(Utc::now()),
                cost: Some(session.cost),
                ..Default::default()
            };
            if let Err(e) = self
                .store
                .update_dispatch(&session.task_dir, dispatch_id, &patch)
                .await
            {
                warn!(dispatch = %dispatch_id, err = %e, "failed to finalize draft dispatch");
            }
        }

        self.pool.release(&session.agent_id);
        *self.lock_active() = None;
        self.fire_status();
        info!(agent = %session.agent_id, turns = session.turn_count, "draft closed");

        Ok(DraftSummary {
            session_id: session.session_id,
            task_slug: session.task_slug,
            turns: session.turn_count,
            cost: session.cost,
            duration_ms: (Utc::now() - session.started_at).num_milliseconds().max(0) as u64,
        })
    }

    // ─── Recovery ─────────────────────────────────────────────────────────────

    /// Reload a persisted active draft at startup. The first active draft
    /// found gets a fresh abort handle and its pool slot back; any further
    /// active drafts (there should be none) are closed on disk. When the
    /// pool has no room the draft is closed on disk instead of loaded.
    pub async fn recover(&self) -> Option<DraftSession> {
        for task_dir in self.store.all_task_dirs().await {
            let path = task_dir.join(DRAFT_FILE);
            let Some(mut session) = read_json::<DraftSession>(&path).await else {
                continue;
            };
            if session.status != DraftStatus::Active {
                continue;
            }
            if self.status().is_some() {
                warn!(path = %path.display(), "second active draft on disk — closing it");
                session.status = DraftStatus::Closed;
                persist_draft(&task_dir, &session).await;
                continue;
            }

            session.stale_role = !self.roles.contains(&session.role);
            if session.stale_role {
                warn!(role = %session.role, "recovered draft references a missing role");
            }

            let registered = self.pool.register(AgentEntry {
                id: session.agent_id.clone(),
                role: session.role.clone(),
                task_slug: session.task_slug.clone(),
                started_at: Utc::now(),
                cancel: CancellationToken::new(),
            });
            if let Err(e) = registered {
                warn!(agent = %session.agent_id, err = %e, "pool full — closing recovered draft");
                session.status = DraftStatus::Closed;
                persist_draft(&task_dir, &session).await;
                continue;
            }

            session.task_dir = task_dir.clone();
            persist_draft(&task_dir, &session).await;
            *self.lock_active() = Some(session.clone());
            self.fire_status();
            info!(agent = %session.agent_id, task = %session.task_slug, "draft recovered");
        }
        self.status()
    }

    fn fire_status(&self) {
        let session = self.status();
        if let Ok(guard) = self.on_status.lock() {
            if let Some(cb) = guard.as_ref() {
                cb(session.as_ref());
            }
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<DraftSession>> {
        match self.active.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Write `draft.json` atomically: temp file + rename, falling back to a
/// direct write when the rename fails.
async fn persist_draft(task_dir: &Path, session: &DraftSession) {
    let path = task_dir.join(DRAFT_FILE);
    let tmp = task_dir.join(format!("{DRAFT_FILE}.tmp"));
    let direct = match write_json(&tmp, session).await {
        Ok(()) => match tokio::fs::rename(&tmp, &path).await {
            Ok(()) => false,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "draft rename failed — writing directly");
                true
            }
        },
        Err(_) => true,
    };
    if direct {
        if let Err(e) = write_json(&path, session).await {
            warn!(path = %path.display(), err = %e, "failed to persist draft");
        }
    }
}
