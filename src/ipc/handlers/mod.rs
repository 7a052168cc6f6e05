//! RPC method handlers. Each module covers one surface; every handler is
//! `(params, ctx) -> Result<Value>` and delegates to the engine.

pub mod agents;
pub mod draft;
pub mod entity;
pub mod projects;
pub mod prompt;
pub mod tasks;

use crate::error::HarnessError;
use serde_json::Value;

/// Parse RPC params into a typed struct, mapping failures to invalid-params.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> anyhow::Result<T> {
    serde_json::from_value(params).map_err(|e| HarnessError::InvalidParams(e.to_string()).into())
}
