use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::parse_params;
use crate::engine::SubmitPrompt;
use crate::AppContext;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitParams {
    content: String,
    role: Option<String>,
    project: Option<String>,
    task_slug: Option<String>,
    channel_id: Option<String>,
    correlation_key: Option<String>,
    /// Working-directory override (used by the CLI's `--cwd`).
    cwd: Option<std::path::PathBuf>,
}

/// The main front door. Returns `{threadId, taskSlug, agentId}` before the
/// dispatch completes; progress streams out as notifications.
pub async fn submit(params: Value, ctx: &Arc<AppContext>) -> Result<Value> {
    let p: SubmitParams = parse_params(params)?;
    let receipt = ctx
        .engine
        .submit_prompt(SubmitPrompt {
            content: p.content,
            role: p.role,
            project: p.project,
            task_slug: p.task_slug,
            channel_id: p.channel_id,
            correlation_key: p.correlation_key,
            cwd_override: p.cwd,
        })
        .await?;
    Ok(serde_json::to_value(receipt)?)
}
