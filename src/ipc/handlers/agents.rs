use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::parse_params;
use crate::AppContext;

/// Pool snapshot — abort handles are never serialized.
pub async fn list(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    Ok(json!({ "agents": ctx.engine.agents_snapshot() }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KillParams {
    agent_id: String,
}

pub async fn kill(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: KillParams = parse_params(params)?;
    Ok(json!({ "killed": ctx.engine.kill_agent(&p.agent_id) }))
}
