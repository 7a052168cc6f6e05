//! Draft session machine tests: lifecycle, turn accounting, persistence,
//! recovery, and the auto-close on resume failure.

mod common;

use common::*;
use crewd::draft::DraftStatus;
use crewd::engine::SubmitPrompt;
use crewd::store::DispatchStatus;
use crewd::supervisor::stream::SessionBinding;
use crewd::AppContext;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn open_draft(harness: &TestHarness) -> crewd::draft::DraftSession {
    harness
        .ctx
        .engine
        .create_task("Acme", "drafting session", None)
        .await
        .expect("task");
    harness
        .ctx
        .engine
        .open_draft("concierge", "Acme", "drafting-session")
        .await
        .expect("draft")
}

fn draft_turn_script(first_turn: bool) -> Vec<Step> {
    let mut steps = Vec::new();
    if first_turn {
        steps.push(Step::Msg(init_msg("ignored-by-draft")));
    }
    steps.push(Step::Msg(text_msg("draft reply")));
    steps.push(Step::Msg(result_msg("success", 0.05)));
    steps
}

async fn wait_for_turns(ctx: &Arc<AppContext>, n: u32) {
    for _ in 0..300 {
        if ctx
            .engine
            .draft_status()
            .map(|s| s.turn_count >= n)
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("draft never reached {n} turns");
}

// ─── Scenario: draft resume across turns ─────────────────────────────────────

#[tokio::test]
async fn three_prompts_route_to_the_same_draft() {
    let harness = bootstrap().await;
    let session = open_draft(&harness).await;
    assert_eq!(session.turn_count, 0);
    assert_eq!(harness.ctx.pool.len(), 1, "draft holds its pool slot");

    for turn in 1..=3u32 {
        harness.launcher.push_script(draft_turn_script(turn == 1));
        let receipt = harness
            .ctx
            .engine
            .submit_prompt(SubmitPrompt {
                content: format!("turn {turn}"),
                // Project intentionally omitted: drafts don't need one.
                ..Default::default()
            })
            .await
            .expect("submit");
        assert_eq!(receipt.task_slug, "drafting-session");
        assert_eq!(receipt.agent_id, session.agent_id);
        wait_for_turns(&harness.ctx, turn).await;
    }

    let status = harness.ctx.engine.draft_status().expect("active");
    assert_eq!(status.turn_count, 3);
    assert!(status.session_initialized);
    assert!((status.cost - 0.15).abs() < 1e-9, "costs accumulate");
    assert_eq!(status.last_input_tokens, Some(1000));

    // First turn binds a fresh session, later turns resume it.
    let launches = harness.launcher.launches.lock().expect("lock").clone();
    assert_eq!(launches.len(), 3);
    match &launches[0].session {
        SessionBinding::New(id) => assert_eq!(id, &session.session_id),
        SessionBinding::Resume(_) => panic!("first turn must not resume"),
    }
    match &launches[2].session {
        SessionBinding::Resume(id) => assert_eq!(id, &session.session_id),
        SessionBinding::New(_) => panic!("later turns must resume"),
    }

    let summary = harness.ctx.engine.undraft().await.expect("undraft");
    assert_eq!(summary.turns, 3);
    assert_eq!(summary.task_slug, "drafting-session");
    assert!(harness.ctx.engine.draft_status().is_none());
    assert!(harness.ctx.pool.is_empty(), "undraft releases the slot");
}

// ─── Exclusivity & validation ────────────────────────────────────────────────

#[tokio::test]
async fn second_draft_is_rejected_while_one_is_active() {
    let harness = bootstrap().await;
    open_draft(&harness).await;
    let err = harness
        .ctx
        .engine
        .open_draft("concierge", "Acme", "drafting-session")
        .await
        .expect_err("second draft");
    assert!(err.to_string().contains("already active"));
}

#[tokio::test]
async fn draft_requires_an_existing_task() {
    let harness = bootstrap().await;
    let err = harness
        .ctx
        .engine
        .open_draft("concierge", "Acme", "no-such-task")
        .await
        .expect_err("missing task");
    assert!(err.to_string().contains("task not found"));
}

// ─── Stall keeps the draft alive ─────────────────────────────────────────────

#[tokio::test]
async fn stalled_turn_leaves_the_draft_active() {
    let harness = bootstrap_with(|config| config.stall_timeout_secs = 1).await;
    let session = open_draft(&harness).await;

    harness.launcher.push_script(vec![
        Step::Msg(init_msg("sess")),
        Step::Hang,
    ]);
    harness
        .ctx
        .engine
        .submit_prompt(SubmitPrompt {
            content: "this one stalls".to_string(),
            ..Default::default()
        })
        .await
        .expect("submit");
    wait_for_turns(&harness.ctx, 1).await;

    let status = harness.ctx.engine.draft_status().expect("still active");
    assert_eq!(status.status, DraftStatus::Active);
    assert_eq!(status.agent_id, session.agent_id);
    assert!(
        harness.ctx.pool.contains(&session.agent_id),
        "slot survives the stalled turn"
    );
}

// ─── Resume failure auto-closes ──────────────────────────────────────────────

#[tokio::test]
async fn resume_failure_closes_the_draft_and_crashes_the_dispatch() {
    let harness = bootstrap().await;
    open_draft(&harness).await;

    // Turn 1 initializes the session normally.
    harness.launcher.push_script(draft_turn_script(true));
    harness
        .ctx
        .engine
        .submit_prompt(SubmitPrompt {
            content: "turn one".to_string(),
            ..Default::default()
        })
        .await
        .expect("submit");
    wait_for_turns(&harness.ctx, 1).await;
    let dispatch_id = harness
        .ctx
        .engine
        .draft_status()
        .expect("active")
        .active_dispatch_id
        .expect("dispatch");

    // Turn 2: the child dies without a terminal result — resume failed.
    harness
        .launcher
        .push_script(vec![Step::Msg(text_msg("gasp"))]);
    harness
        .ctx
        .engine
        .submit_prompt(SubmitPrompt {
            content: "turn two".to_string(),
            ..Default::default()
        })
        .await
        .expect("submit");

    for _ in 0..300 {
        if harness.ctx.engine.draft_status().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.ctx.engine.draft_status().is_none(), "draft auto-closed");
    assert!(harness.ctx.pool.is_empty());

    let task_dir = task_dir(&harness.ctx, "drafting-session");
    let file = harness
        .ctx
        .store
        .get_dispatch(&task_dir, &dispatch_id)
        .await
        .expect("dispatch");
    assert_eq!(file.envelope.status, DispatchStatus::Crashed);

    // The draft file on disk is closed too.
    let draft: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(task_dir.join("draft.json")).expect("draft file"),
    )
    .expect("json");
    assert_eq!(draft["status"], json!("closed"));
}

// ─── Launch failure on a fresh turn ──────────────────────────────────────────

#[tokio::test]
async fn first_turn_launch_failure_finalizes_the_orphan_dispatch() {
    let harness = bootstrap().await;
    open_draft(&harness).await;

    // No script queued: the launcher refuses, as a missing child binary would.
    harness
        .ctx
        .engine
        .submit_prompt(SubmitPrompt {
            content: "turn one".to_string(),
            ..Default::default()
        })
        .await
        .expect("submit");

    let task_dir = task_dir(&harness.ctx, "drafting-session");
    let mut envelopes = Vec::new();
    for _ in 0..300 {
        envelopes = harness.ctx.store.dispatch_envelopes(&task_dir).await;
        if envelopes
            .first()
            .map(|e| e.status == DispatchStatus::Crashed)
            .unwrap_or(false)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(envelopes.len(), 1);
    assert_eq!(
        envelopes[0].status,
        DispatchStatus::Crashed,
        "no envelope left running"
    );
    assert!(envelopes[0]
        .error
        .as_deref()
        .expect("error recorded")
        .contains("no script"));

    let file = harness
        .ctx
        .store
        .get_dispatch(&task_dir, &envelopes[0].id)
        .await
        .expect("dispatch");
    assert!(file
        .events
        .iter()
        .any(|e| e.event_type == crewd::store::EventType::HarnessError));

    // The draft survives for a retry, with the dead dispatch dropped.
    let status = harness.ctx.engine.draft_status().expect("still active");
    assert_eq!(status.status, DraftStatus::Active);
    assert!(status.active_dispatch_id.is_none());

    // A retry opens a fresh envelope instead of resurrecting the dead one.
    harness.launcher.push_script(draft_turn_script(true));
    harness
        .ctx
        .engine
        .submit_prompt(SubmitPrompt {
            content: "try again".to_string(),
            ..Default::default()
        })
        .await
        .expect("submit");
    wait_for_turns(&harness.ctx, 1).await;

    let envelopes = harness.ctx.store.dispatch_envelopes(&task_dir).await;
    assert_eq!(envelopes.len(), 2);
    let retry_id = harness
        .ctx
        .engine
        .draft_status()
        .expect("active")
        .active_dispatch_id
        .expect("new dispatch");
    assert_ne!(retry_id, envelopes[0].id);
}

// ─── Recovery ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn active_draft_is_recovered_on_startup() {
    let harness = bootstrap().await;
    let session = open_draft(&harness).await;

    // Second process over the same data directory.
    let config = test_config(harness.dir.path());
    let launcher = ScriptedLauncher::new();
    let ctx2 = AppContext::initialize(config, launcher).expect("second context");
    let recovered = ctx2.engine.recover().await.expect("recovered draft");

    assert_eq!(recovered.agent_id, session.agent_id);
    assert_eq!(recovered.session_id, session.session_id);
    assert!(!recovered.stale_role);
    assert!(ctx2.pool.contains(&session.agent_id), "pool slot recreated");
}

#[tokio::test]
async fn recovery_flags_a_missing_role_as_stale() {
    let harness = bootstrap().await;
    let session = open_draft(&harness).await;

    let mut config = test_config(harness.dir.path());
    // The concierge role file is gone in the restarted process.
    config.roles_dir = harness.dir.path().join("empty-roles");
    std::fs::create_dir_all(&config.roles_dir).expect("mkdir");

    let ctx2 = AppContext::initialize(config, ScriptedLauncher::new()).expect("second context");
    let recovered = ctx2.engine.recover().await.expect("recovered draft");
    assert!(recovered.stale_role);
    assert_eq!(recovered.agent_id, session.agent_id);
}

#[tokio::test]
async fn recovery_with_a_full_pool_closes_the_draft_on_disk() {
    let harness = bootstrap().await;
    open_draft(&harness).await;

    let mut config = test_config(harness.dir.path());
    config.max_agents = 1;
    let ctx2 = AppContext::initialize(config, ScriptedLauncher::new()).expect("second context");
    // Saturate the pool before recovery runs.
    ctx2.pool
        .register(crewd::pool::AgentEntry {
            id: "squatter".to_string(),
            role: "api-dev".to_string(),
            task_slug: "x".to_string(),
            started_at: chrono::Utc::now(),
            cancel: tokio_util::sync::CancellationToken::new(),
        })
        .expect("register");

    assert!(ctx2.engine.recover().await.is_none(), "draft not loaded");

    let task_dir = task_dir(&ctx2, "drafting-session");
    let draft: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(task_dir.join("draft.json")).expect("draft file"),
    )
    .expect("json");
    assert_eq!(draft["status"], json!("closed"));
}
