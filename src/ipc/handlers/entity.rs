use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::parse_params;
use crate::entity::{self, EntityKind};
use crate::error::HarnessError;
use crate::AppContext;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaffoldParams {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    author: String,
}

pub async fn scaffold(params: Value, _ctx: &Arc<AppContext>) -> Result<Value> {
    let p: ScaffoldParams = parse_params(params)?;
    let kind = EntityKind::parse(&p.kind)
        .ok_or_else(|| HarnessError::InvalidParams(format!("unknown entity type: {}", p.kind)))?;
    let content = entity::scaffold(kind, &p.name, &p.author)?;
    Ok(json!({ "content": content }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateParams {
    content: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub async fn validate(params: Value, _ctx: &Arc<AppContext>) -> Result<Value> {
    let p: ValidateParams = parse_params(params)?;
    let kind = match &p.kind {
        Some(k) => Some(EntityKind::parse(k).ok_or_else(|| {
            HarnessError::InvalidParams(format!("unknown entity type: {k}"))
        })?),
        None => None,
    };
    let report = entity::validate(&p.content, kind);
    Ok(serde_json::to_value(report)?)
}
