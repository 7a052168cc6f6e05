pub mod comms;
pub mod config;
pub mod draft;
pub mod engine;
pub mod entity;
pub mod error;
pub mod id;
pub mod ipc;
pub mod pool;
pub mod roles;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod toolserver;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use comms::ws::WsProvider;
use comms::CommsRegistry;
use config::HarnessConfig;
use draft::DraftEngine;
use engine::DispatchEngine;
use ipc::event::EventBroadcaster;
use pool::AgentPool;
use roles::RoleRegistry;
use store::{ProjectRegistry, TaskStore};
use supervisor::stream::AgentLauncher;
use supervisor::Supervisor;

/// Shared application state passed to every RPC handler and background task.
pub struct AppContext {
    pub config: Arc<HarnessConfig>,
    pub store: Arc<TaskStore>,
    pub projects: Arc<ProjectRegistry>,
    pub roles: Arc<RoleRegistry>,
    pub pool: Arc<AgentPool>,
    pub comms: Arc<CommsRegistry>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub engine: Arc<DispatchEngine>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the whole harness together around one agent launcher. The
    /// launcher is injected so tests can script the child stream.
    pub fn initialize(config: HarnessConfig, launcher: Arc<dyn AgentLauncher>) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let store = Arc::new(TaskStore::new(&config.projects_dir));
        let projects = Arc::new(ProjectRegistry::load(&config.projects_dir));
        let roles = Arc::new(RoleRegistry::load(&config.roles_dir));
        let pool = Arc::new(AgentPool::new(config.max_agents));
        let comms = Arc::new(CommsRegistry::new());
        let broadcaster = Arc::new(EventBroadcaster::new());

        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            pool.clone(),
            comms.clone(),
            launcher,
            config.thresholds,
            Duration::from_secs(config.stall_timeout_secs),
            config.stream_close_timeout_ms,
            config.agent_env.clone(),
        ));

        let draft = Arc::new(DraftEngine::new(
            store.clone(),
            pool.clone(),
            supervisor.clone(),
            roles.clone(),
            projects.clone(),
            config.models.clone(),
        ));

        let engine = DispatchEngine::new(
            config.clone(),
            store.clone(),
            projects.clone(),
            roles.clone(),
            pool.clone(),
            comms.clone(),
            supervisor.clone(),
            draft.clone(),
        );
        engine.init_debouncer();

        // Observer wiring: pool deltas, draft transitions, and compactions
        // become JSON-RPC notifications.
        {
            let notifier = broadcaster.clone();
            pool.set_on_change(Box::new(move |snapshot| {
                notifier.notify("pool_status", json!({ "agents": snapshot }));
            }));
        }
        {
            let notifier = broadcaster.clone();
            draft.set_on_status(Box::new(move |session| {
                notifier.notify(
                    "draft_status",
                    json!({ "active": session.is_some(), "session": session }),
                );
            }));
        }
        {
            let notifier = broadcaster.clone();
            supervisor.set_on_compaction(Box::new(move |dispatch_id| {
                notifier.notify("context_compacted", json!({ "dispatchId": dispatch_id }));
            }));
        }

        comms.register(WsProvider::new(broadcaster.clone()))?;

        Ok(Arc::new(Self {
            config,
            store,
            projects,
            roles,
            pool,
            comms,
            broadcaster,
            engine,
            started_at: std::time::Instant::now(),
        }))
    }

    /// Bring the harness up: start channel providers and recover any
    /// persisted draft session.
    pub async fn startup(&self) {
        self.comms.start_all().await;
        self.engine.recover().await;
    }
}
