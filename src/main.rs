use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use crewd::{
    config::HarnessConfig,
    entity::{self, EntityKind},
    ipc,
    supervisor::stream::ClaudeLauncher,
    AppContext,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "crewd",
    about = "crewd — multi-agent dispatch harness daemon",
    version,
    args_conflicts_with_subcommands = true
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Prompt to dispatch (client mode — the daemon must be running).
    prompt: Option<String>,

    /// Project the prompt belongs to
    #[arg(long, short = 'p')]
    project: Option<String>,

    /// Role override (otherwise routing rules decide)
    #[arg(long, short = 'r')]
    role: Option<String>,

    /// Working-directory override for the dispatch
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Attach to an existing task slug
    #[arg(long, short = 't')]
    task: Option<String>,

    /// List known projects and exit
    #[arg(long)]
    list_projects: bool,

    /// List tasks of --project and exit
    #[arg(long)]
    list_tasks: bool,

    /// JSON-RPC WebSocket server port
    #[arg(long, env = "CREWD_PORT")]
    port: Option<u16>,

    /// Data directory for projects, roles, and config
    #[arg(long, env = "CREWD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CREWD_LOG")]
    log: Option<String>,

    /// Maximum concurrent agents (0 = unlimited)
    #[arg(long, env = "CREWD_MAX_AGENTS")]
    max_agents: Option<usize>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CREWD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    Serve,
    /// Scaffold or validate entity descriptors (roles, projects).
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },
}

#[derive(Subcommand)]
enum EntityAction {
    /// Print a fresh descriptor to stdout.
    ///
    /// Examples:
    ///   crewd entity scaffold role api-dev alex
    ///   crewd entity scaffold project Acme alex
    Scaffold {
        /// Entity type: role | project
        kind: String,
        name: String,
        author: String,
    },
    /// Validate a descriptor file; exits 1 when invalid.
    ///
    /// Examples:
    ///   crewd entity validate roles/api-dev.yaml
    ///   crewd entity validate project.yaml project
    Validate {
        file: PathBuf,
        /// Entity type: role | project (auto-detected when omitted)
        kind: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Entity commands are local — no daemon required, no async runtime.
    if let Some(Command::Entity { action }) = &args.command {
        let code = run_entity(action)?;
        std::process::exit(code);
    }

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let config = HarnessConfig::new(args.port, args.data_dir.clone(), args.log.clone(), args.max_agents);

    // Client modes talk to a running daemon over WebSocket.
    if args.list_projects {
        let result = rpc_call(config.port, "list_projects", json!({})).await?;
        for project in result["projects"].as_array().cloned().unwrap_or_default() {
            println!(
                "{}  {}",
                project["name"].as_str().unwrap_or("?"),
                project["description"].as_str().unwrap_or("")
            );
        }
        return Ok(());
    }
    if args.list_tasks {
        let project = args
            .project
            .clone()
            .context("--list-tasks requires --project")?;
        let result = rpc_call(config.port, "list_tasks", json!({ "project": project })).await?;
        for task in result["tasks"].as_array().cloned().unwrap_or_default() {
            println!(
                "{}  [{}]  {}",
                task["slug"].as_str().unwrap_or("?"),
                task["status"].as_str().unwrap_or("?"),
                task["name"].as_str().unwrap_or("")
            );
        }
        return Ok(());
    }
    if let Some(prompt) = &args.prompt {
        let code = run_prompt(&config, &args, prompt).await?;
        std::process::exit(code);
    }

    serve(config, args).await
}

// ─── Daemon ──────────────────────────────────────────────────────────────────

async fn serve(config: HarnessConfig, args: Args) -> Result<()> {
    let _guard = init_tracing(&config, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "crewd starting");
    let ctx = AppContext::initialize(config, Arc::new(ClaudeLauncher))?;
    ctx.startup().await;
    ipc::run(ctx).await
}

/// Env-filter console logging, plus a daily-rotated file when configured.
/// Returns the appender guard that must stay alive for the process.
fn init_tracing(
    config: &HarnessConfig,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false));

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "crewd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry.with(fmt::layer().with_ansi(false).with_writer(writer)).init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

// ─── Client mode ─────────────────────────────────────────────────────────────

/// Submit a prompt and stream its channel until the dispatch finishes.
/// Exit 0 on completed|aborted, 1 otherwise.
async fn run_prompt(config: &HarnessConfig, args: &Args, prompt: &str) -> Result<i32> {
    let url = format!("ws://127.0.0.1:{}", config.port);
    let (ws, _) = connect_async(&url)
        .await
        .with_context(|| format!("connecting to daemon at {url} — is it running?"))?;
    let (mut sink, mut stream) = ws.split();

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "submit_prompt",
        "params": {
            "content": prompt,
            "project": args.project,
            "role": args.role,
            "taskSlug": args.task,
            "cwd": args.cwd,
        }
    });
    sink.send(Message::Text(request.to_string())).await?;

    let mut thread_id: Option<String> = None;
    while let Some(frame) = stream.next().await {
        let Ok(Message::Text(text)) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        // The submit response carries our thread id.
        if value["id"] == json!(1) {
            if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                eprintln!("error: {}", error["message"].as_str().unwrap_or("rpc failure"));
                return Ok(1);
            }
            thread_id = value["result"]["threadId"].as_str().map(String::from);
            if let Some(slug) = value["result"]["taskSlug"].as_str() {
                eprintln!("task: {slug}");
            }
            continue;
        }

        // Notifications for our thread.
        if value["method"] == json!("channel_message") {
            let params = &value["params"];
            if params["channelId"].as_str() != thread_id.as_deref() {
                continue;
            }
            let content = params["content"].as_str().unwrap_or("");
            match params["type"].as_str() {
                Some("chat") | Some("result") => println!("{content}"),
                Some("warning") | Some("error") => eprintln!("{content}"),
                _ => {}
            }
            if params["metadata"]["terminal"] == json!(true) {
                return Ok(match params["metadata"]["status"].as_str() {
                    Some("completed") | Some("aborted") => 0,
                    _ => 1,
                });
            }
        }
    }
    // Connection closed before a terminal message.
    Ok(1)
}

/// One-shot RPC call over a fresh connection, ignoring notifications.
async fn rpc_call(port: u16, method: &str, params: Value) -> Result<Value> {
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _) = connect_async(&url)
        .await
        .with_context(|| format!("connecting to daemon at {url} — is it running?"))?;
    let (mut sink, mut stream) = ws.split();

    let request = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    sink.send(Message::Text(request.to_string())).await?;

    while let Some(frame) = stream.next().await {
        let Ok(Message::Text(text)) = frame else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if value["id"] != json!(1) {
            continue;
        }
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            anyhow::bail!("{}", error["message"].as_str().unwrap_or("rpc failure"));
        }
        return Ok(value["result"].clone());
    }
    anyhow::bail!("connection closed before a response")
}

// ─── Entity commands ─────────────────────────────────────────────────────────

fn run_entity(action: &EntityAction) -> Result<i32> {
    match action {
        EntityAction::Scaffold { kind, name, author } => {
            let kind = EntityKind::parse(kind)
                .with_context(|| format!("unknown entity type: {kind} (role | project)"))?;
            print!("{}", entity::scaffold(kind, name, author)?);
            Ok(0)
        }
        EntityAction::Validate { file, kind } => {
            let kind = match kind {
                Some(k) => Some(
                    EntityKind::parse(k)
                        .with_context(|| format!("unknown entity type: {k} (role | project)"))?,
                ),
                None => None,
            };
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let report = entity::validate(&content, kind);
            if report.valid {
                println!("valid {}", report.kind.unwrap_or("entity"));
                Ok(0)
            } else {
                for error in &report.errors {
                    eprintln!("error: {error}");
                }
                Ok(1)
            }
        }
    }
}
