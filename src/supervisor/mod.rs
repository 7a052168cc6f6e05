//! The per-dispatch supervision loop.
//!
//! One supervisor instance drives one child agent turn: it consumes the
//! typed message stream, journals every observation to the dispatch file,
//! fans user-visible traffic out through the communication registry, and
//! applies the safety policies — stall timer, loop detection, non-retryable
//! error detection, cooperative abort. Terminal state is reported as a
//! [`DispatchResult`] and persisted into the envelope.

pub mod detectors;
pub mod stream;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::comms::{ChannelMessage, CommsRegistry, MessageType};
use crate::config::LoopThresholds;
use crate::pool::{AgentEntry, AgentPool};
use crate::roles::Role;
use crate::store::{
    truncate_text, DispatchEnvelope, DispatchEvent, DispatchPatch, DispatchStatus, EventType,
    StructuredResult, TaskStore, UsageSnapshot,
};

use detectors::{
    find_non_retryable, max_repeat_count, normalize_error_line, pingpong_count, push_bounded,
    CallKey, ErrorKey, ERROR_WINDOW, TOOL_WINDOW,
};
use stream::{
    extract_target, tool_result_text, AgentLauncher, AgentMessage, AgentStream, ContentBlock,
    LaunchSpec, UserBlock,
};

/// The SDK-internal tool whose input is the agent's structured result; it
/// is captured verbatim and never forwarded as an event.
const STRUCTURED_OUTPUT_TOOL: &str = "StructuredOutput";

// ─── Outcome types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Stall,
    ErrorLoop,
    NonRetryableError,
    Unknown,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stall => "stall",
            Self::ErrorLoop => "error_loop",
            Self::NonRetryableError => "non_retryable_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Terminal report of one dispatch (or one draft turn).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub dispatch_id: String,
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<StructuredResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// How the stream loop ended. The try/reason-variable pattern is replaced
/// by this explicit sum type: the loop returns it, the caller maps it to a
/// terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamEnding {
    /// Terminal result with subtype `success`.
    Completed,
    /// `error_max_turns` / `error_max_budget_usd` — aborted by the stream's
    /// own hard limits.
    LimitReached(String),
    /// Any other `error_*` result subtype.
    StreamFailure(String),
    /// Cooperative abort: stall, loop kill, non-retryable kill, or an
    /// external kill (reason `Unknown`).
    Aborted(AbortReason),
    /// Stream closed without a terminal result message.
    ClosedWithoutResult,
    /// The stream itself failed.
    Failed(String),
}

/// Everything observed during one turn of the stream loop.
pub(crate) struct TurnOutcome {
    pub ending: StreamEnding,
    pub cost: f64,
    pub usage: Option<UsageSnapshot>,
    pub structured_result: Option<StructuredResult>,
    pub result_text: Option<String>,
    pub session_id: Option<String>,
    pub session_init_seen: bool,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl TurnOutcome {
    pub fn status(&self) -> DispatchStatus {
        match &self.ending {
            StreamEnding::Completed => DispatchStatus::Completed,
            StreamEnding::LimitReached(_) | StreamEnding::Aborted(_) => DispatchStatus::Aborted,
            StreamEnding::StreamFailure(_)
            | StreamEnding::ClosedWithoutResult
            | StreamEnding::Failed(_) => DispatchStatus::Crashed,
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match &self.ending {
            StreamEnding::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.ending {
            StreamEnding::LimitReached(subtype) | StreamEnding::StreamFailure(subtype) => {
                Some(subtype.clone())
            }
            StreamEnding::ClosedWithoutResult => Some("stream closed without a result".to_string()),
            StreamEnding::Failed(message) => Some(message.clone()),
            _ => None,
        }
    }
}

// ─── Spec types ───────────────────────────────────────────────────────────────

/// Everything needed to run one full dispatch.
pub struct DispatchSpec {
    /// Doubles as the pool agent id.
    pub dispatch_id: String,
    pub task_dir: PathBuf,
    pub task_slug: String,
    pub role: Role,
    pub model: String,
    pub cwd: PathBuf,
    /// Final prompt, task context already prepended.
    pub prompt: String,
    pub channel_id: String,
    pub parent_dispatch_id: Option<String>,
}

/// Inner spec shared by full dispatches and draft turns.
pub(crate) struct TurnSpec<'a> {
    pub task_dir: &'a Path,
    pub dispatch_id: &'a str,
    pub channel_id: &'a str,
    pub cancel: CancellationToken,
    pub thresholds: LoopThresholds,
    pub stall_timeout: Duration,
    /// A prompt to journal as `user:message` right after `session:init`
    /// (the init event leads the dispatch log). Draft turns journal their
    /// prompt themselves and pass `None`.
    pub journal_prompt: Option<&'a str>,
}

type CompactionCallback = Box<dyn Fn(&str) + Send + Sync>;

// ─── Supervisor ───────────────────────────────────────────────────────────────

pub struct Supervisor {
    store: Arc<TaskStore>,
    pool: Arc<AgentPool>,
    comms: Arc<CommsRegistry>,
    launcher: Arc<dyn AgentLauncher>,
    thresholds: LoopThresholds,
    stall_timeout: Duration,
    stream_close_timeout_ms: u64,
    extra_env: HashMap<String, String>,
    on_compaction: Mutex<Option<CompactionCallback>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<TaskStore>,
        pool: Arc<AgentPool>,
        comms: Arc<CommsRegistry>,
        launcher: Arc<dyn AgentLauncher>,
        thresholds: LoopThresholds,
        stall_timeout: Duration,
        stream_close_timeout_ms: u64,
        extra_env: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            pool,
            comms,
            launcher,
            thresholds,
            stall_timeout,
            stream_close_timeout_ms,
            extra_env,
            on_compaction: Mutex::new(None),
        }
    }

    /// Install the compaction observer (fired with the dispatch id whenever
    /// the child reports a context compaction).
    pub fn set_on_compaction(&self, callback: CompactionCallback) {
        if let Ok(mut guard) = self.on_compaction.lock() {
            *guard = Some(callback);
        }
    }

    pub fn launcher(&self) -> Arc<dyn AgentLauncher> {
        self.launcher.clone()
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    pub fn stream_close_timeout_ms(&self) -> u64 {
        self.stream_close_timeout_ms
    }

    pub fn extra_env(&self) -> &HashMap<String, String> {
        &self.extra_env
    }

    /// Run one dispatch start to finish: register in the pool, persist the
    /// envelope, stream the child, finalize. The pool slot is released on
    /// every path out.
    pub async fn run_dispatch(&self, spec: DispatchSpec) -> DispatchResult {
        let cancel = CancellationToken::new();
        let entry = AgentEntry {
            id: spec.dispatch_id.clone(),
            role: spec.role.name.clone(),
            task_slug: spec.task_slug.clone(),
            started_at: chrono::Utc::now(),
            cancel: cancel.clone(),
        };
        if let Err(e) = self.pool.register(entry) {
            warn!(dispatch = %spec.dispatch_id, err = %e, "pool rejected dispatch");
            return DispatchResult {
                dispatch_id: spec.dispatch_id,
                status: DispatchStatus::Crashed,
                abort_reason: None,
                cost: 0.0,
                usage: None,
                structured_result: None,
                result_text: None,
                error: Some(e.to_string()),
                session_id: None,
                num_turns: None,
                duration_ms: None,
            };
        }

        // Guaranteed-release path: whatever happens below, the slot frees.
        let result = self.run_registered(&spec, cancel).await;
        self.pool.release(&spec.dispatch_id);
        result
    }

    async fn run_registered(&self, spec: &DispatchSpec, cancel: CancellationToken) -> DispatchResult {
        let envelope = DispatchEnvelope::new(
            spec.dispatch_id.clone(),
            spec.task_slug.clone(),
            spec.role.name.clone(),
            spec.model.clone(),
            spec.cwd.clone(),
            spec.parent_dispatch_id.clone(),
        );
        if let Err(e) = self.store.create_dispatch(&spec.task_dir, &envelope).await {
            warn!(dispatch = %spec.dispatch_id, err = %e, "failed to persist dispatch envelope");
            return DispatchResult {
                dispatch_id: spec.dispatch_id.clone(),
                status: DispatchStatus::Crashed,
                abort_reason: None,
                cost: 0.0,
                usage: None,
                structured_result: None,
                result_text: None,
                error: Some(e.to_string()),
                session_id: None,
                num_turns: None,
                duration_ms: None,
            };
        }

        self.comms
            .broadcast(
                &ChannelMessage::new(
                    &spec.channel_id,
                    MessageType::Lifecycle,
                    format!("{} started on {}", spec.role.display_name, spec.task_slug),
                )
                .with_metadata(json!({
                    "dispatchId": spec.dispatch_id,
                    "role": spec.role.name,
                    "model": spec.model,
                    "status": "running",
                })),
            )
            .await;
        self.comms.broadcast_status(&spec.channel_id, "working").await;

        let launch = LaunchSpec {
            prompt: spec.prompt.clone(),
            system_prompt: spec.role.prompt.clone(),
            model: spec.model.clone(),
            cwd: spec.cwd.clone(),
            session: stream::SessionBinding::New(uuid::Uuid::new_v4().to_string()),
            stream_close_timeout_ms: self.stream_close_timeout_ms,
            extra_env: self.extra_env.clone(),
        };

        let outcome = match self.launcher.launch(&launch).await {
            Ok(stream) => {
                let turn = TurnSpec {
                    task_dir: &spec.task_dir,
                    dispatch_id: &spec.dispatch_id,
                    channel_id: &spec.channel_id,
                    cancel,
                    thresholds: self.thresholds,
                    stall_timeout: self.stall_timeout,
                    journal_prompt: Some(&spec.prompt),
                };
                self.run_turn(&turn, stream).await
            }
            Err(e) => TurnOutcome {
                ending: StreamEnding::Failed(e.to_string()),
                cost: 0.0,
                usage: None,
                structured_result: None,
                result_text: None,
                session_id: None,
                session_init_seen: false,
                num_turns: None,
                duration_ms: None,
            },
        };

        self.finalize(spec, outcome).await
    }

    /// Map a finished turn to a terminal envelope + result, journal the
    /// terminal events, and tell the channel.
    async fn finalize(&self, spec: &DispatchSpec, outcome: TurnOutcome) -> DispatchResult {
        let status = outcome.status();
        let abort_reason = outcome.abort_reason();
        let error = outcome.error_message();

        match &outcome.ending {
            StreamEnding::Aborted(reason) => {
                self.journal(
                    &spec.task_dir,
                    &spec.dispatch_id,
                    DispatchEvent::new(
                        EventType::Abort,
                        Some(json!({ "reason": reason.as_str() })),
                    ),
                )
                .await;
            }
            StreamEnding::Failed(message) => {
                self.journal(
                    &spec.task_dir,
                    &spec.dispatch_id,
                    DispatchEvent::new(
                        EventType::HarnessError,
                        Some(json!({ "message": truncate_text(message) })),
                    ),
                )
                .await;
            }
            _ => {}
        }

        let patch = DispatchPatch {
            status: Some(status),
            ended_at: Some(chrono::Utc::now()),
            cost: Some(outcome.cost),
            structured_result: outcome.structured_result.clone(),
            result_text: outcome.result_text.clone(),
            error: error.clone(),
            session_id: outcome.session_id.clone(),
            usage: outcome.usage,
        };
        if let Err(e) = self
            .store
            .update_dispatch(&spec.task_dir, &spec.dispatch_id, &patch)
            .await
        {
            warn!(dispatch = %spec.dispatch_id, err = %e, "failed to finalize dispatch envelope");
        }

        let summary = outcome
            .structured_result
            .as_ref()
            .map(|sr| sr.summary.clone())
            .or_else(|| outcome.result_text.clone())
            .unwrap_or_default();
        let metadata = json!({
            "dispatchId": spec.dispatch_id,
            "status": status.as_str(),
            "abortReason": abort_reason.map(|r| r.as_str()),
            "cost": outcome.cost,
            "terminal": true,
        });
        let message = match status {
            DispatchStatus::Completed => {
                ChannelMessage::new(&spec.channel_id, MessageType::Result, summary)
            }
            DispatchStatus::Aborted => ChannelMessage::new(
                &spec.channel_id,
                MessageType::Warning,
                match abort_reason {
                    Some(reason) => format!("dispatch aborted ({})", reason.as_str()),
                    None => format!(
                        "dispatch aborted ({})",
                        error.as_deref().unwrap_or("limit reached")
                    ),
                },
            ),
            _ => ChannelMessage::new(
                &spec.channel_id,
                MessageType::Error,
                format!(
                    "dispatch crashed: {}",
                    error.as_deref().unwrap_or("unknown error")
                ),
            ),
        };
        self.comms.broadcast(&message.with_metadata(metadata)).await;

        // Open questions from the agent go out on their own message type so
        // chat providers can render them as asks rather than results.
        if let Some(sr) = &outcome.structured_result {
            if !sr.questions.is_empty() {
                self.comms
                    .broadcast(
                        &ChannelMessage::new(
                            &spec.channel_id,
                            MessageType::Question,
                            sr.questions.join("\n"),
                        )
                        .with_metadata(json!({ "dispatchId": spec.dispatch_id })),
                    )
                    .await;
            }
        }
        self.comms.broadcast_status(&spec.channel_id, "idle").await;

        info!(
            dispatch = %spec.dispatch_id,
            status = status.as_str(),
            cost = outcome.cost,
            "dispatch finished"
        );

        DispatchResult {
            dispatch_id: spec.dispatch_id.clone(),
            status,
            abort_reason,
            cost: outcome.cost,
            usage: outcome.usage,
            structured_result: outcome.structured_result,
            result_text: outcome.result_text,
            error,
            session_id: outcome.session_id,
            num_turns: outcome.num_turns,
            duration_ms: outcome.duration_ms,
        }
    }

    // ─── The stream loop ──────────────────────────────────────────────────────

    /// Drive one turn of the child stream to its ending. Used by both full
    /// dispatches and draft turns (the latter with detection disabled).
    pub(crate) async fn run_turn(
        &self,
        turn: &TurnSpec<'_>,
        mut stream: Box<dyn AgentStream>,
    ) -> TurnOutcome {
        let mut state = TurnState::new();

        let sleeper = tokio::time::sleep(turn.stall_timeout);
        tokio::pin!(sleeper);

        let ending = loop {
            tokio::select! {
                biased;

                _ = turn.cancel.cancelled() => {
                    break StreamEnding::Aborted(
                        state.abort_reason.take().unwrap_or(AbortReason::Unknown),
                    );
                }

                _ = &mut sleeper => {
                    // Stall: the child went silent. Journal, set the reason,
                    // trip the handle; the cancelled branch exits the loop.
                    state.abort_reason = Some(AbortReason::Stall);
                    self.journal(
                        turn.task_dir,
                        turn.dispatch_id,
                        DispatchEvent::new(
                            EventType::Stall,
                            Some(json!({ "timeoutSecs": turn.stall_timeout.as_secs() })),
                        ),
                    )
                    .await;
                    turn.cancel.cancel();
                }

                next = stream.next_message() => {
                    sleeper.as_mut().reset(Instant::now() + turn.stall_timeout);
                    match next {
                        None => break StreamEnding::ClosedWithoutResult,
                        Some(Err(e)) => break StreamEnding::Failed(e.to_string()),
                        Some(Ok(message)) => {
                            if let Some(ending) =
                                self.handle_message(turn, &mut state, message).await
                            {
                                break ending;
                            }
                        }
                    }
                }
            }
        };

        // Dropping the stream kills the child (kill_on_drop) when the loop
        // exits before the process does.
        drop(stream);

        state.into_outcome(ending)
    }

    /// Process one message. Returns `Some` when the turn is over.
    async fn handle_message(
        &self,
        turn: &TurnSpec<'_>,
        state: &mut TurnState,
        message: AgentMessage,
    ) -> Option<StreamEnding> {
        match message {
            AgentMessage::System {
                subtype,
                session_id,
                rest,
            } => {
                self.handle_system(turn, state, subtype.as_deref(), session_id, rest)
                    .await;
                None
            }
            AgentMessage::Assistant { message } => {
                for block in message.content {
                    if let Some(ending) = self.handle_block(turn, state, block).await {
                        return Some(ending);
                    }
                }
                None
            }
            AgentMessage::User { message } => {
                for block in message.content {
                    if let UserBlock::ToolResult {
                        tool_use_id,
                        is_error,
                        content,
                    } = block
                    {
                        if let Some(ending) = self
                            .handle_tool_result(turn, state, &tool_use_id, is_error, &content)
                            .await
                        {
                            return Some(ending);
                        }
                    }
                }
                None
            }
            AgentMessage::Result {
                subtype,
                total_cost_usd,
                usage,
                num_turns,
                duration_ms,
                result,
                session_id,
            } => {
                state.cost = total_cost_usd.unwrap_or(0.0);
                state.usage = usage;
                state.num_turns = num_turns;
                state.duration_ms = duration_ms;
                state.result_text = result;
                if state.session_id.is_none() {
                    state.session_id = session_id;
                }
                self.journal(
                    turn.task_dir,
                    turn.dispatch_id,
                    DispatchEvent::new(
                        EventType::SessionComplete,
                        Some(json!({
                            "subtype": subtype,
                            "costUsd": state.cost,
                            "numTurns": state.num_turns,
                            "durationMs": state.duration_ms,
                        })),
                    ),
                )
                .await;
                Some(classify_result_subtype(&subtype))
            }
            AgentMessage::Unknown => None,
        }
    }

    async fn handle_system(
        &self,
        turn: &TurnSpec<'_>,
        state: &mut TurnState,
        subtype: Option<&str>,
        session_id: Option<String>,
        rest: Value,
    ) {
        let event = match subtype {
            Some("init") => {
                if let Some(sid) = session_id {
                    state.session_id = Some(sid);
                }
                state.session_init_seen = true;
                self.journal(
                    turn.task_dir,
                    turn.dispatch_id,
                    DispatchEvent::new(
                        EventType::SessionInit,
                        Some(json!({ "sessionId": state.session_id })),
                    ),
                )
                .await;
                // The prompt follows the init event in the dispatch log.
                if let Some(prompt) = turn.journal_prompt {
                    if !state.prompt_journaled {
                        state.prompt_journaled = true;
                        self.journal(
                            turn.task_dir,
                            turn.dispatch_id,
                            DispatchEvent::new(
                                EventType::UserMessage,
                                Some(json!({ "text": truncate_text(prompt) })),
                            ),
                        )
                        .await;
                    }
                }
                return;
            }
            Some("compact") => {
                if let Ok(guard) = self.on_compaction.lock() {
                    if let Some(cb) = guard.as_ref() {
                        cb(turn.dispatch_id);
                    }
                }
                DispatchEvent::new(EventType::SessionCompaction, None)
            }
            Some("files_persisted") => DispatchEvent::new(EventType::FilesPersisted, Some(rest)),
            Some("hook_started") => DispatchEvent::new(EventType::HookStarted, Some(rest)),
            Some("hook_progress") => DispatchEvent::new(EventType::HookProgress, Some(rest)),
            Some("hook_response") => DispatchEvent::new(EventType::HookResponse, Some(rest)),
            Some("status") => DispatchEvent::new(EventType::SessionStatus, Some(rest)),
            Some("rate_limit") => DispatchEvent::new(EventType::SessionRateLimit, Some(rest)),
            _ => return,
        };
        self.journal(turn.task_dir, turn.dispatch_id, event).await;
    }

    async fn handle_block(
        &self,
        turn: &TurnSpec<'_>,
        state: &mut TurnState,
        block: ContentBlock,
    ) -> Option<StreamEnding> {
        match block {
            ContentBlock::Text { text } => {
                self.journal(
                    turn.task_dir,
                    turn.dispatch_id,
                    DispatchEvent::new(
                        EventType::AgentText,
                        Some(json!({ "text": truncate_text(&text) })),
                    ),
                )
                .await;
                self.comms
                    .broadcast(&ChannelMessage::new(turn.channel_id, MessageType::Chat, text))
                    .await;
                None
            }
            ContentBlock::Thinking { thinking } => {
                self.journal(
                    turn.task_dir,
                    turn.dispatch_id,
                    DispatchEvent::new(
                        EventType::AgentThinking,
                        Some(json!({ "text": truncate_text(&thinking) })),
                    ),
                )
                .await;
                self.comms
                    .broadcast(&ChannelMessage::new(
                        turn.channel_id,
                        MessageType::Thinking,
                        thinking,
                    ))
                    .await;
                None
            }
            ContentBlock::ToolUse { id, name, input } => {
                self.handle_tool_use(turn, state, id, name, input).await
            }
            ContentBlock::Other => None,
        }
    }

    async fn handle_tool_use(
        &self,
        turn: &TurnSpec<'_>,
        state: &mut TurnState,
        id: String,
        name: String,
        input: Value,
    ) -> Option<StreamEnding> {
        // The structured-output tool is the result payload in disguise —
        // capture verbatim, never journal, never window.
        let base = name.rsplit("__").next().unwrap_or(&name);
        if base == STRUCTURED_OUTPUT_TOOL {
            state.structured_raw = Some(input);
            return None;
        }

        let target = extract_target(&name, &input);
        state.pending.insert(
            id.clone(),
            PendingCall {
                tool: name.clone(),
                target: target.clone(),
                started: Instant::now(),
            },
        );
        push_bounded(
            &mut state.tool_window,
            CallKey::new(name.clone(), target.clone()),
            TOOL_WINDOW,
        );

        self.journal(
            turn.task_dir,
            turn.dispatch_id,
            DispatchEvent::new(
                EventType::AgentToolCall,
                Some(json!({ "id": id, "tool": name, "target": target })),
            ),
        )
        .await;
        self.comms
            .broadcast(&ChannelMessage::new(
                turn.channel_id,
                MessageType::ToolUse,
                match &target {
                    Some(t) => format!("{name}: {t}"),
                    None => name.clone(),
                },
            ))
            .await;

        self.check_loops(turn, state, &name, target.as_deref()).await
    }

    /// Run the repeat and ping-pong detectors over the tool window. At the
    /// kill threshold the turn ends; at the warn threshold a single warning
    /// per dispatch is journaled.
    async fn check_loops(
        &self,
        turn: &TurnSpec<'_>,
        state: &mut TurnState,
        tool: &str,
        target: Option<&str>,
    ) -> Option<StreamEnding> {
        let t = turn.thresholds;
        let repeats = max_repeat_count(&state.tool_window);
        let alternations = pingpong_count(&state.tool_window);

        let kill = (t.loop_kill > 0 && repeats >= t.loop_kill as usize)
            .then_some("repeat")
            .or((t.pingpong_kill > 0 && alternations >= t.pingpong_kill as usize)
                .then_some("ping_pong"));
        if let Some(kind) = kill {
            self.journal(
                turn.task_dir,
                turn.dispatch_id,
                DispatchEvent::new(
                    EventType::LoopKill,
                    Some(json!({
                        "kind": kind,
                        "tool": tool,
                        "target": target,
                        "repeats": repeats,
                        "alternations": alternations,
                    })),
                ),
            )
            .await;
            self.comms
                .broadcast(&ChannelMessage::new(
                    turn.channel_id,
                    MessageType::Warning,
                    format!("agent stuck in a {kind} loop on {tool} — killing dispatch"),
                ))
                .await;
            state.abort_reason = Some(AbortReason::ErrorLoop);
            turn.cancel.cancel();
            return Some(StreamEnding::Aborted(AbortReason::ErrorLoop));
        }

        let warn = (t.loop_warn > 0 && repeats >= t.loop_warn as usize)
            || (t.pingpong_warn > 0 && alternations >= t.pingpong_warn as usize);
        if warn && !state.warned {
            state.warned = true;
            self.journal(
                turn.task_dir,
                turn.dispatch_id,
                DispatchEvent::new(
                    EventType::LoopWarning,
                    Some(json!({
                        "tool": tool,
                        "target": target,
                        "repeats": repeats,
                        "alternations": alternations,
                    })),
                ),
            )
            .await;
            self.comms
                .broadcast(&ChannelMessage::new(
                    turn.channel_id,
                    MessageType::Warning,
                    format!("agent is repeating itself on {tool}"),
                ))
                .await;
        }
        None
    }

    async fn handle_tool_result(
        &self,
        turn: &TurnSpec<'_>,
        state: &mut TurnState,
        tool_use_id: &str,
        is_error: bool,
        content: &Value,
    ) -> Option<StreamEnding> {
        // Unmatched results (including StructuredOutput's echo) are dropped.
        let call = state.pending.remove(tool_use_id)?;
        let duration_ms = call.started.elapsed().as_millis() as u64;
        let text = tool_result_text(content);

        self.journal(
            turn.task_dir,
            turn.dispatch_id,
            DispatchEvent::new(
                EventType::AgentToolResult,
                Some(json!({
                    "id": tool_use_id,
                    "tool": call.tool,
                    "target": call.target,
                    "durationMs": duration_ms,
                    "error": is_error.then(|| truncate_text(&text)),
                })),
            ),
        )
        .await;

        if !is_error {
            return None;
        }

        push_bounded(
            &mut state.error_window,
            ErrorKey {
                tool: call.tool.clone(),
                target: call.target.clone(),
                first_line: normalize_error_line(&text),
            },
            ERROR_WINDOW,
        );

        // Draft turns disable kills entirely (the human intervenes).
        if turn.thresholds.loop_kill == 0 && turn.thresholds.pingpong_kill == 0 {
            return None;
        }

        if let Some(hit) = find_non_retryable(&state.error_window) {
            self.journal(
                turn.task_dir,
                turn.dispatch_id,
                DispatchEvent::new(
                    EventType::LoopKill,
                    Some(json!({
                        "kind": "non_retryable_error",
                        "tool": hit.tool,
                        "target": hit.target,
                        "line": hit.first_line,
                    })),
                ),
            )
            .await;
            self.comms
                .broadcast(&ChannelMessage::new(
                    turn.channel_id,
                    MessageType::Warning,
                    format!(
                        "agent keeps hitting the same error on {} — killing dispatch",
                        call.tool
                    ),
                ))
                .await;
            state.abort_reason = Some(AbortReason::NonRetryableError);
            turn.cancel.cancel();
            return Some(StreamEnding::Aborted(AbortReason::NonRetryableError));
        }
        None
    }

    /// Append an event to the dispatch file. Event capture is best-effort:
    /// a failed write never kills the dispatch.
    async fn journal(&self, task_dir: &Path, dispatch_id: &str, event: DispatchEvent) {
        if let Err(e) = self.store.append_event(task_dir, dispatch_id, event).await {
            warn!(dispatch = %dispatch_id, err = %e, "failed to append dispatch event");
        }
    }
}

// ─── Turn state ───────────────────────────────────────────────────────────────

struct PendingCall {
    tool: String,
    target: Option<String>,
    started: Instant,
}

struct TurnState {
    tool_window: Vec<CallKey>,
    error_window: Vec<ErrorKey>,
    pending: HashMap<String, PendingCall>,
    warned: bool,
    prompt_journaled: bool,
    abort_reason: Option<AbortReason>,
    structured_raw: Option<Value>,
    cost: f64,
    usage: Option<UsageSnapshot>,
    result_text: Option<String>,
    session_id: Option<String>,
    session_init_seen: bool,
    num_turns: Option<u32>,
    duration_ms: Option<u64>,
}

impl TurnState {
    fn new() -> Self {
        Self {
            tool_window: Vec::new(),
            error_window: Vec::new(),
            pending: HashMap::new(),
            warned: false,
            prompt_journaled: false,
            abort_reason: None,
            structured_raw: None,
            cost: 0.0,
            usage: None,
            result_text: None,
            session_id: None,
            session_init_seen: false,
            num_turns: None,
            duration_ms: None,
        }
    }

    fn into_outcome(self, ending: StreamEnding) -> TurnOutcome {
        // The structured-output capture beats the result text, which may be
        // prose; an invalid capture falls back to its raw JSON.
        let mut result_text = self.result_text;
        let structured_result = match &self.structured_raw {
            Some(raw) => match StructuredResult::from_value(raw) {
                Some(sr) => Some(sr),
                None => {
                    if result_text.is_none() {
                        result_text = Some(raw.to_string());
                    }
                    None
                }
            },
            None => None,
        };
        TurnOutcome {
            ending,
            cost: self.cost,
            usage: self.usage,
            structured_result,
            result_text,
            session_id: self.session_id,
            session_init_seen: self.session_init_seen,
            num_turns: self.num_turns,
            duration_ms: self.duration_ms,
        }
    }
}

fn classify_result_subtype(subtype: &str) -> StreamEnding {
    match subtype {
        "success" => StreamEnding::Completed,
        "error_max_turns" | "error_max_budget_usd" => {
            StreamEnding::LimitReached(subtype.to_string())
        }
        s if s.starts_with("error") => StreamEnding::StreamFailure(s.to_string()),
        _ => StreamEnding::Completed,
    }
}
