use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::parse_params;
use crate::AppContext;

#[derive(Deserialize)]
struct OpenParams {
    role: String,
    project: String,
    task: String,
}

/// One draft at a time; the task is required.
pub async fn open(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: OpenParams = parse_params(params)?;
    let session = ctx.engine.open_draft(&p.role, &p.project, &p.task).await?;
    Ok(serde_json::to_value(session)?)
}

pub async fn close(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let summary = ctx.engine.undraft().await?;
    Ok(serde_json::to_value(summary)?)
}

pub async fn status(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    match ctx.engine.draft_status() {
        Some(session) => Ok(json!({ "active": true, "session": session })),
        None => Ok(json!({ "active": false })),
    }
}
