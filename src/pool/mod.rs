//! The agent pool — the only authority for agent presence.
//!
//! An insertion-ordered map from agent id to the in-flight agent's handle.
//! The pool holds a non-owning reference (by id) to each running dispatch
//! plus its cooperative abort token; releasing removes the entry without
//! touching persisted state. Kill never blocks on the child: it trips the
//! token and returns, and the owning supervisor exits through its abort
//! branch on the next stream step.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::HarnessError;

#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub id: String,
    pub role: String,
    pub task_slug: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// Pool entry as exposed to observers — abort handle stripped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    pub role: String,
    pub task_slug: String,
    pub started_at: DateTime<Utc>,
}

impl From<&AgentEntry> for AgentSnapshot {
    fn from(entry: &AgentEntry) -> Self {
        Self {
            id: entry.id.clone(),
            role: entry.role.clone(),
            task_slug: entry.task_slug.clone(),
            started_at: entry.started_at,
        }
    }
}

type ChangeCallback = Box<dyn Fn(&[AgentSnapshot]) + Send + Sync>;

pub struct AgentPool {
    /// 0 = unlimited.
    max_concurrent: usize,
    agents: Mutex<IndexMap<String, AgentEntry>>,
    on_change: Mutex<Option<ChangeCallback>>,
}

impl AgentPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            agents: Mutex::new(IndexMap::new()),
            on_change: Mutex::new(None),
        }
    }

    /// Install the single change callback, fired after every mutation with
    /// a snapshot of the pool (abort handles omitted).
    pub fn set_on_change(&self, callback: ChangeCallback) {
        *self.lock_callback() = Some(callback);
    }

    /// Register a new agent. Fails when the pool is at capacity.
    pub fn register(&self, entry: AgentEntry) -> Result<(), HarnessError> {
        {
            let mut agents = self.lock_agents();
            if self.max_concurrent > 0 && agents.len() >= self.max_concurrent {
                return Err(HarnessError::PoolFull {
                    limit: self.max_concurrent,
                });
            }
            agents.insert(entry.id.clone(), entry);
        }
        self.fire_change();
        Ok(())
    }

    /// Remove an agent. No-op for an unknown id.
    pub fn release(&self, agent_id: &str) {
        let removed = self.lock_agents().shift_remove(agent_id).is_some();
        if removed {
            self.fire_change();
        }
    }

    /// Trip the agent's abort token and remove it. Idempotent: a second
    /// kill of the same id is a no-op returning `false`.
    pub fn kill(&self, agent_id: &str) -> bool {
        let entry = self.lock_agents().shift_remove(agent_id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                self.fire_change();
                true
            }
            None => false,
        }
    }

    /// Clone of the agent's abort token, for callers that must observe the
    /// kill without owning the pool entry.
    pub fn cancel_handle(&self, agent_id: &str) -> Option<CancellationToken> {
        self.lock_agents().get(agent_id).map(|e| e.cancel.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.lock_agents().contains_key(agent_id)
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.lock_agents().values().map(AgentSnapshot::from).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_agents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_agents().is_empty()
    }

    fn fire_change(&self) {
        let snapshot = self.snapshot();
        if let Some(cb) = self.lock_callback().as_ref() {
            cb(&snapshot);
        }
    }

    fn lock_agents(&self) -> std::sync::MutexGuard<'_, IndexMap<String, AgentEntry>> {
        match self.agents.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_callback(&self) -> std::sync::MutexGuard<'_, Option<ChangeCallback>> {
        match self.on_change.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn entry(id: &str) -> AgentEntry {
        AgentEntry {
            id: id.to_string(),
            role: "api-dev".to_string(),
            task_slug: "build-login".to_string(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn register_respects_capacity() {
        let pool = AgentPool::new(2);
        pool.register(entry("a")).expect("a");
        pool.register(entry("b")).expect("b");
        let err = pool.register(entry("c")).expect_err("full");
        assert!(matches!(err, HarnessError::PoolFull { limit: 2 }));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn zero_capacity_means_unlimited() {
        let pool = AgentPool::new(0);
        for i in 0..50 {
            pool.register(entry(&format!("agent-{i}"))).expect("register");
        }
        assert_eq!(pool.len(), 50);
    }

    #[test]
    fn kill_trips_token_and_is_idempotent() {
        let pool = AgentPool::new(0);
        let e = entry("a");
        let token = e.cancel.clone();
        pool.register(e).expect("register");

        assert!(pool.kill("a"));
        assert!(token.is_cancelled());
        assert!(!pool.kill("a"), "second kill is a no-op");
        assert!(pool.is_empty());
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let pool = AgentPool::new(0);
        pool.register(entry("first")).expect("register");
        pool.register(entry("second")).expect("register");
        pool.register(entry("third")).expect("register");
        pool.release("second");
        let ids: Vec<String> = pool.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["first", "third"]);
    }

    #[test]
    fn change_callback_fires_on_every_mutation() {
        let pool = AgentPool::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        pool.set_on_change(Box::new(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        }));

        pool.register(entry("a")).expect("register");
        pool.register(entry("b")).expect("register");
        pool.kill("a");
        pool.release("b");
        pool.release("b"); // unknown id — no callback
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
