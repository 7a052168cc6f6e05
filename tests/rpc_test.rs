//! RPC facade tests: method table, error-code mapping, and notification
//! payload shapes, driven through `dispatch_text` without a socket.

mod common;

use common::*;
use crewd::ipc::dispatch_text;
use serde_json::{json, Value};

async fn call(harness: &TestHarness, method: &str, params: Value) -> Value {
    let request = json!({ "jsonrpc": "2.0", "id": 7, "method": method, "params": params });
    let raw = dispatch_text(&request.to_string(), &harness.ctx).await;
    serde_json::from_str(&raw).expect("valid response json")
}

fn error_code(response: &Value) -> i64 {
    response["error"]["code"].as_i64().expect("error code")
}

#[tokio::test]
async fn project_methods_round_trip() {
    let harness = bootstrap().await;

    let listed = call(&harness, "list_projects", json!({})).await;
    assert_eq!(listed["result"]["projects"][0]["name"], "Acme");

    let created = call(
        &harness,
        "create_project",
        json!({ "name": "Beta", "description": "second" }),
    )
    .await;
    assert_eq!(created["result"]["name"], "Beta");

    let duplicate = call(&harness, "create_project", json!({ "name": "beta" })).await;
    assert_eq!(error_code(&duplicate), -32602, "case-insensitive duplicate");

    let reloaded = call(&harness, "reload_projects", json!({})).await;
    assert_eq!(reloaded["result"]["projects"], 2);
}

#[tokio::test]
async fn task_methods_round_trip() {
    let harness = bootstrap().await;

    let created = call(
        &harness,
        "create_task",
        json!({ "project": "Acme", "name": "Ship the Thing" }),
    )
    .await;
    assert_eq!(created["result"]["slug"], "ship-thing");
    assert_eq!(created["result"]["slugModified"], true);

    let listed = call(&harness, "list_tasks", json!({ "project": "Acme" })).await;
    assert_eq!(listed["result"]["tasks"][0]["slug"], "ship-thing");

    let context = call(
        &harness,
        "get_task_context",
        json!({ "project": "Acme", "slug": "ship-thing" }),
    )
    .await;
    assert!(context["result"]["context"]
        .as_str()
        .expect("markdown")
        .contains("## Task History"));

    let closed = call(
        &harness,
        "close_task",
        json!({ "project": "Acme", "slug": "ship-thing" }),
    )
    .await;
    assert_eq!(closed["result"]["closed"], true);
}

#[tokio::test]
async fn error_codes_match_the_surface_contract() {
    let harness = bootstrap().await;

    // -32000 task-not-found
    let response = call(
        &harness,
        "get_task_context",
        json!({ "project": "Acme", "slug": "ghost" }),
    )
    .await;
    assert_eq!(error_code(&response), -32000);

    // -32002 role-not-found
    let response = call(
        &harness,
        "submit_prompt",
        json!({ "content": "x", "project": "Acme", "role": "nonexistent" }),
    )
    .await;
    assert_eq!(error_code(&response), -32002);

    // -32005 no-active-draft
    let response = call(&harness, "undraft", json!({})).await;
    assert_eq!(error_code(&response), -32005);

    // -32006 project-not-found
    let response = call(&harness, "list_tasks", json!({ "project": "Nope" })).await;
    assert_eq!(error_code(&response), -32006);

    // Missing project without an active draft is an invalid-params failure.
    let response = call(&harness, "submit_prompt", json!({ "content": "x" })).await;
    assert_eq!(error_code(&response), -32602);

    // Standard JSON-RPC codes.
    let response = call(&harness, "no_such_method", json!({})).await;
    assert_eq!(error_code(&response), -32601);
    let raw = dispatch_text("{not json", &harness.ctx).await;
    let parsed: Value = serde_json::from_str(&raw).expect("response");
    assert_eq!(error_code(&parsed), -32700);
}

#[tokio::test]
async fn draft_error_codes() {
    let harness = bootstrap().await;
    call(
        &harness,
        "create_task",
        json!({ "project": "Acme", "name": "chat" }),
    )
    .await;

    let opened = call(
        &harness,
        "draft",
        json!({ "role": "concierge", "project": "Acme", "task": "chat" }),
    )
    .await;
    assert_eq!(opened["result"]["taskSlug"], "chat");

    // -32004 draft-already-active
    let again = call(
        &harness,
        "draft",
        json!({ "role": "concierge", "project": "Acme", "task": "chat" }),
    )
    .await;
    assert_eq!(error_code(&again), -32004);

    let status = call(&harness, "get_draft_status", json!({})).await;
    assert_eq!(status["result"]["active"], true);
    assert_eq!(status["result"]["session"]["turnCount"], 0);
    assert!(
        status["result"]["session"]["agentId"].is_string(),
        "abort handles never serialize — only plain fields"
    );

    let summary = call(&harness, "undraft", json!({})).await;
    assert_eq!(summary["result"]["turns"], 0);

    let status = call(&harness, "get_draft_status", json!({})).await;
    assert_eq!(status["result"]["active"], false);
}

#[tokio::test]
async fn agent_methods_strip_handles_and_kill_is_safe() {
    let harness = bootstrap().await;

    let listed = call(&harness, "list_agents", json!({})).await;
    assert_eq!(listed["result"]["agents"], json!([]));

    let killed = call(&harness, "kill_agent", json!({ "agentId": "ghost" })).await;
    assert_eq!(killed["result"]["killed"], false);
}

#[tokio::test]
async fn submit_prompt_returns_before_completion() {
    let harness = bootstrap().await;
    harness.launcher.push_script(vec![
        Step::Msg(init_msg("sess")),
        Step::Msg(result_msg("success", 0.01)),
    ]);

    let response = call(
        &harness,
        "submit_prompt",
        json!({ "content": "Build login", "project": "Acme", "role": "api-dev" }),
    )
    .await;
    let result = &response["result"];
    assert_eq!(result["taskSlug"], "build-login");
    assert!(result["threadId"].is_string());
    let agent_id = result["agentId"].as_str().expect("agent id").to_string();

    // Receipt arrived while the dispatch was still in flight; wait for it
    // so the temp dir can tear down cleanly.
    harness
        .ctx
        .engine
        .tracker()
        .await_result(&agent_id)
        .await
        .expect("terminal result");
}

#[tokio::test]
async fn entity_methods_scaffold_and_validate() {
    let harness = bootstrap().await;

    let scaffolded = call(
        &harness,
        "entity_scaffold",
        json!({ "type": "role", "name": "Review Bot", "author": "sam" }),
    )
    .await;
    let content = scaffolded["result"]["content"].as_str().expect("yaml");
    assert!(content.contains("name: review-bot"));

    let validated = call(
        &harness,
        "entity_validate",
        json!({ "content": content, "type": "role" }),
    )
    .await;
    assert_eq!(validated["result"]["valid"], true);

    let invalid = call(
        &harness,
        "entity_validate",
        json!({ "content": "{{{{", }),
    )
    .await;
    assert_eq!(invalid["result"]["valid"], false);
}
