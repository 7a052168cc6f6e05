//! Typed domain errors that map to JSON-RPC error codes.
//!
//! The service layer threads `anyhow::Error` through call sites; errors that
//! a client must be able to distinguish are raised as `HarnessError` so the
//! RPC facade can recover the code with `downcast_ref` instead of matching
//! on message strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("a draft session is already active")]
    DraftAlreadyActive,

    #[error("no active draft session")]
    NoActiveDraft,

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    DuplicateProject(String),

    #[error("agent pool is full ({limit} max)")]
    PoolFull { limit: usize },

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl HarnessError {
    /// JSON-RPC error code for this error. Codes `-32000..=-32006` are the
    /// harness range; everything else maps to the standard codes in `ipc`.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::TaskNotFound(_) => -32000,
            Self::AgentNotFound(_) => -32001,
            Self::RoleNotFound(_) => -32002,
            Self::DraftAlreadyActive => -32004,
            Self::NoActiveDraft => -32005,
            Self::ProjectNotFound(_) => -32006,
            // Pool saturation and duplicate names have no reserved code;
            // clients see them as invalid-params class failures.
            Self::PoolFull { .. } | Self::DuplicateProject(_) | Self::InvalidParams(_) => -32602,
        }
    }
}
