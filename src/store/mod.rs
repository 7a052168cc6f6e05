//! Task & dispatch persistence.
//!
//! The store is a directory tree, all JSON, 2-space indented, trailing
//! newline:
//!
//! ```text
//! <projects-dir>/<project>/project.yaml
//! <projects-dir>/<project>/tasks/<slug>/task.json
//! <projects-dir>/<project>/tasks/<slug>/dispatches/<dispatchId>.json
//! <projects-dir>/<project>/tasks/<slug>/draft.json
//! ```
//!
//! Missing directories yield empty reads; corrupt JSON is skipped on list
//! operations and reported as `None` on single-gets. Each dispatch file has
//! exactly one writer (the supervisor that owns it), so dispatch writes are
//! unlocked; the task manifest is shared across that task's supervisors, so
//! its read-modify-write goes through a per-task mutex.

pub mod dispatch;
pub mod event;
pub mod project;
pub mod slug;
pub mod task;

pub use dispatch::{
    dispatch_tree, DispatchEnvelope, DispatchFile, DispatchNode, DispatchPatch, DispatchStatus,
    ResultStatus, StructuredResult, UsageSnapshot,
};
pub use event::{truncate_text, DispatchEvent, EventType, MAX_TEXT_PAYLOAD};
pub use project::{Project, ProjectRegistry};
pub use task::{DispatchSummary, TaskManifest, TaskStatus};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::HarnessError;

// ─── Store ────────────────────────────────────────────────────────────────────

pub struct TaskStore {
    projects_dir: PathBuf,
    /// Per-task-directory write locks serializing manifest upserts.
    manifest_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl TaskStore {
    pub fn new(projects_dir: &Path) -> Self {
        Self {
            projects_dir: projects_dir.to_path_buf(),
            manifest_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub fn tasks_dir(&self, project_dir: &Path) -> PathBuf {
        project_dir.join("tasks")
    }

    pub fn task_dir(&self, project_dir: &Path, slug: &str) -> PathBuf {
        self.tasks_dir(project_dir).join(slug)
    }

    // ─── Tasks ────────────────────────────────────────────────────────────────

    /// Open a new task folder. The slug derives from the name; collisions
    /// get a numeric suffix. Returns the manifest, the task directory, and
    /// whether the slug differs from the raw name.
    pub async fn create_task(
        &self,
        project_dir: &Path,
        name: &str,
        description: Option<String>,
        correlation_key: Option<String>,
    ) -> Result<(TaskManifest, PathBuf, bool)> {
        let tasks_dir = self.tasks_dir(project_dir);
        tokio::fs::create_dir_all(&tasks_dir)
            .await
            .with_context(|| format!("creating {}", tasks_dir.display()))?;

        let (base, derived) = slug::slugify(name);
        let final_slug = slug::deduplicate_slug(&tasks_dir, &base);
        let slug_modified = derived || final_slug != base;

        let task_dir = tasks_dir.join(&final_slug);
        tokio::fs::create_dir_all(task_dir.join("dispatches"))
            .await
            .with_context(|| format!("creating {}", task_dir.display()))?;

        let manifest = TaskManifest::new(name, &final_slug, description, correlation_key);
        write_json(&task_dir.join("task.json"), &manifest).await?;
        Ok((manifest, task_dir, slug_modified))
    }

    pub async fn get_task(&self, task_dir: &Path) -> Option<TaskManifest> {
        read_json(&task_dir.join("task.json")).await
    }

    /// All task manifests under a project, newest first. Malformed or
    /// missing manifests are skipped silently.
    pub async fn list_tasks(&self, project_dir: &Path) -> Vec<TaskManifest> {
        let mut manifests = Vec::new();
        for dir in list_subdirs(&self.tasks_dir(project_dir)).await {
            if let Some(manifest) = self.get_task(&dir).await {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        manifests
    }

    pub async fn close_task(&self, task_dir: &Path) -> Result<()> {
        let mut manifest = self
            .get_task(task_dir)
            .await
            .ok_or_else(|| HarnessError::TaskNotFound(task_dir.display().to_string()))?;
        manifest.status = TaskStatus::Closed;
        write_json(&task_dir.join("task.json"), &manifest).await
    }

    /// Find the open task carrying a given correlation key, if any.
    pub async fn find_task_by_correlation(
        &self,
        project_dir: &Path,
        key: &str,
    ) -> Option<TaskManifest> {
        self.list_tasks(project_dir)
            .await
            .into_iter()
            .find(|t| t.status == TaskStatus::Open && t.correlation_key.as_deref() == Some(key))
    }

    /// Every task directory across every project — used by draft recovery.
    pub async fn all_task_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for project_dir in list_subdirs(&self.projects_dir).await {
            dirs.extend(list_subdirs(&self.tasks_dir(&project_dir)).await);
        }
        dirs
    }

    // ─── Dispatches ───────────────────────────────────────────────────────────

    fn dispatch_path(&self, task_dir: &Path, dispatch_id: &str) -> PathBuf {
        task_dir.join("dispatches").join(format!("{dispatch_id}.json"))
    }

    /// Write a fresh dispatch file (empty event list) and index it in the
    /// task manifest.
    pub async fn create_dispatch(&self, task_dir: &Path, envelope: &DispatchEnvelope) -> Result<()> {
        let file = DispatchFile {
            envelope: envelope.clone(),
            events: Vec::new(),
        };
        let path = self.dispatch_path(task_dir, &envelope.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_json(&path, &file).await?;
        self.upsert_summary(task_dir, envelope).await;
        Ok(())
    }

    /// Append one event to a dispatch's log. The supervisor (or draft
    /// machine) owning the dispatch is the sole writer, so no lock is taken.
    pub async fn append_event(
        &self,
        task_dir: &Path,
        dispatch_id: &str,
        event: DispatchEvent,
    ) -> Result<()> {
        let path = self.dispatch_path(task_dir, dispatch_id);
        let mut file: DispatchFile = read_json(&path)
            .await
            .ok_or_else(|| anyhow::anyhow!("dispatch file missing: {}", path.display()))?;
        file.events.push(event);
        write_json(&path, &file).await
    }

    /// Merge a partial update into the envelope (id and events untouchable)
    /// and refresh the manifest projection.
    pub async fn update_dispatch(
        &self,
        task_dir: &Path,
        dispatch_id: &str,
        patch: &DispatchPatch,
    ) -> Result<()> {
        let path = self.dispatch_path(task_dir, dispatch_id);
        let mut file: DispatchFile = read_json(&path)
            .await
            .ok_or_else(|| anyhow::anyhow!("dispatch file missing: {}", path.display()))?;
        patch.apply(&mut file.envelope);
        write_json(&path, &file).await?;
        let envelope = file.envelope.clone();
        self.upsert_summary(task_dir, &envelope).await;
        Ok(())
    }

    /// All envelopes under a task, without events, ascending by id (which is
    /// ascending by start time). Malformed files are skipped silently.
    pub async fn dispatch_envelopes(&self, task_dir: &Path) -> Vec<DispatchEnvelope> {
        let dir = task_dir.join("dispatches");
        let mut envelopes = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return envelopes,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(file) = read_json::<DispatchFile>(&path).await {
                envelopes.push(file.envelope);
            }
        }
        envelopes.sort_by(|a, b| a.id.cmp(&b.id));
        envelopes
    }

    /// Full dispatch file (envelope + events); `None` when missing or corrupt.
    pub async fn get_dispatch(&self, task_dir: &Path, dispatch_id: &str) -> Option<DispatchFile> {
        read_json(&self.dispatch_path(task_dir, dispatch_id)).await
    }

    /// The last `n` events of a dispatch, in order.
    pub async fn recent_events(
        &self,
        task_dir: &Path,
        dispatch_id: &str,
        n: usize,
    ) -> Vec<DispatchEvent> {
        match self.get_dispatch(task_dir, dispatch_id).await {
            Some(file) => {
                let skip = file.events.len().saturating_sub(n);
                file.events.into_iter().skip(skip).collect()
            }
            None => Vec::new(),
        }
    }

    // ─── Manifest projection ──────────────────────────────────────────────────

    /// Upsert the dispatch's summary row into `task.json`. A missing
    /// manifest loses the index row but never blocks the dispatch write.
    async fn upsert_summary(&self, task_dir: &Path, envelope: &DispatchEnvelope) {
        let lock = self.manifest_lock(task_dir).await;
        let _guard = lock.lock().await;

        let path = task_dir.join("task.json");
        let Some(mut manifest) = read_json::<TaskManifest>(&path).await else {
            warn!(task_dir = %task_dir.display(), "task.json missing — dispatch index row dropped");
            return;
        };
        manifest.upsert_dispatch(envelope.into());
        if let Err(e) = write_json(&path, &manifest).await {
            warn!(task_dir = %task_dir.display(), err = %e, "failed to refresh task manifest");
        }
    }

    async fn manifest_lock(&self, task_dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.manifest_locks.lock().await;
        locks
            .entry(task_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ─── JSON helpers ─────────────────────────────────────────────────────────────

/// Write a value as pretty JSON (2-space indent) with a trailing newline.
pub async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing json")?;
    tokio::fs::write(path, json + "\n")
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Read and parse a JSON file; `None` on missing or corrupt content.
pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "skipping corrupt json file");
            None
        }
    }
}

async fn list_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return dirs,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs
}
