use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::parse_params;
use crate::AppContext;

#[derive(Deserialize)]
struct CreateParams {
    project: String,
    name: String,
    description: Option<String>,
}

pub async fn create(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: CreateParams = parse_params(params)?;
    let created = ctx
        .engine
        .create_task(&p.project, &p.name, p.description)
        .await?;
    Ok(serde_json::to_value(created)?)
}

#[derive(Deserialize)]
struct TaskRef {
    project: String,
    slug: String,
}

pub async fn close(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: TaskRef = parse_params(params)?;
    ctx.engine.close_task(&p.project, &p.slug).await?;
    Ok(json!({ "closed": true }))
}

#[derive(Deserialize)]
struct ListParams {
    project: String,
}

pub async fn list(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: ListParams = parse_params(params)?;
    let tasks = ctx.engine.list_tasks(&p.project).await?;
    Ok(json!({ "tasks": tasks }))
}

pub async fn context(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: TaskRef = parse_params(params)?;
    let context = ctx.engine.task_context(&p.project, &p.slug).await?;
    Ok(json!({ "context": context }))
}
