use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::parse_params;
use crate::AppContext;

pub async fn list(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let projects: Vec<Value> = ctx
        .engine
        .projects()
        .into_iter()
        .map(|p| {
            json!({
                "name": p.name,
                "description": p.description,
                "paths": p.paths,
                "roles": p.roles,
            })
        })
        .collect();
    Ok(json!({ "projects": projects }))
}

#[derive(Deserialize)]
struct CreateParams {
    name: String,
    description: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

pub async fn create(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: CreateParams = parse_params(params)?;
    let project = ctx
        .engine
        .create_project(&p.name, p.description.as_deref(), p.roles)?;
    Ok(json!({
        "name": project.name,
        "description": project.description,
        "paths": project.paths,
        "roles": project.roles,
    }))
}

pub async fn reload(_params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let count = ctx.engine.reload_projects();
    Ok(json!({ "projects": count }))
}
