use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4460;
const DEFAULT_MAX_AGENTS: usize = 4;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STREAM_CLOSE_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_DEBOUNCE_MS: u64 = 1_500;
const DEFAULT_ROLE: &str = "generalist";

// ─── Threshold & alias tables ─────────────────────────────────────────────────

/// Loop-detector thresholds. A value of `0` disables that threshold
/// (draft turns run with everything disabled — a human is present).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LoopThresholds {
    pub loop_warn: u32,
    pub loop_kill: u32,
    pub pingpong_warn: u32,
    pub pingpong_kill: u32,
}

impl Default for LoopThresholds {
    fn default() -> Self {
        Self {
            loop_warn: 3,
            loop_kill: 5,
            pingpong_warn: 3,
            pingpong_kill: 4,
        }
    }
}

impl LoopThresholds {
    /// All detection disabled — used for draft turns.
    pub fn disabled() -> Self {
        Self {
            loop_warn: 0,
            loop_kill: 0,
            pingpong_warn: 0,
            pingpong_kill: 0,
        }
    }
}

/// Concrete model ids behind the role-level model hints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelAliases {
    pub haiku: String,
    pub sonnet: String,
    pub opus: String,
}

impl Default for ModelAliases {
    fn default() -> Self {
        Self {
            haiku: "claude-haiku-4-5-20251001".to_string(),
            sonnet: "claude-sonnet-4-6".to_string(),
            opus: "claude-opus-4-1".to_string(),
        }
    }
}

/// One prompt-prefix routing rule. First matching pattern wins; patterns are
/// compiled case-insensitive by the router.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub role: String,
    pub cwd: Option<PathBuf>,
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/crewd.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4460).
    port: Option<u16>,
    /// Maximum concurrent agents; 0 = unlimited (default: 4).
    max_agents: Option<usize>,
    /// Log level filter string, e.g. "debug", "info,crewd=trace" (default: "info").
    log: Option<String>,
    /// Directory holding project workspaces (default: `{data_dir}/projects`).
    projects_dir: Option<PathBuf>,
    /// Directory holding role definition files (default: `{data_dir}/roles`).
    roles_dir: Option<PathBuf>,
    /// Role used when no routing rule matches (default: "generalist").
    default_role: Option<String>,
    /// Seconds of child silence before a dispatch is aborted (default: 300).
    stall_timeout_secs: Option<u64>,
    /// Stream-close timeout propagated to child agents in ms (default: 600000).
    stream_close_timeout_ms: Option<u64>,
    /// Inbound message coalescing window in ms (default: 1500).
    debounce_ms: Option<u64>,
    /// Loop-detector thresholds.
    thresholds: Option<LoopThresholds>,
    /// Model alias map (`[models]` table with haiku/sonnet/opus keys).
    models: Option<ModelAliases>,
    /// Routing rules (`[[route]]` tables), evaluated in order.
    route: Option<Vec<RouteRule>>,
    /// Extra environment variables set on every child agent.
    agent_env: Option<HashMap<String, String>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("crewd.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse crewd.toml — using defaults");
            None
        }
    }
}

// ─── HarnessConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub projects_dir: PathBuf,
    pub roles_dir: PathBuf,
    pub default_role: String,
    /// Maximum concurrent agents in the pool (0 = unlimited).
    pub max_agents: usize,
    pub stall_timeout_secs: u64,
    pub stream_close_timeout_ms: u64,
    pub debounce_ms: u64,
    pub thresholds: LoopThresholds,
    pub models: ModelAliases,
    pub routes: Vec<RouteRule>,
    /// Extra environment variables for child agents.
    pub agent_env: HashMap<String, String>,
}

impl HarnessConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/crewd.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        max_agents: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_agents = max_agents.or(toml.max_agents).unwrap_or(DEFAULT_MAX_AGENTS);

        let projects_dir = toml
            .projects_dir
            .unwrap_or_else(|| data_dir.join("projects"));
        let roles_dir = toml.roles_dir.unwrap_or_else(|| data_dir.join("roles"));

        Self {
            port,
            log,
            projects_dir,
            roles_dir,
            default_role: toml
                .default_role
                .unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            max_agents,
            stall_timeout_secs: toml
                .stall_timeout_secs
                .unwrap_or(DEFAULT_STALL_TIMEOUT_SECS),
            stream_close_timeout_ms: toml
                .stream_close_timeout_ms
                .unwrap_or(DEFAULT_STREAM_CLOSE_TIMEOUT_MS),
            debounce_ms: toml.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
            thresholds: toml.thresholds.unwrap_or_default(),
            models: toml.models.unwrap_or_default(),
            routes: toml.route.unwrap_or_default(),
            agent_env: toml.agent_env.unwrap_or_default(),
            data_dir,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("crewd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("crewd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("crewd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("crewd");
        }
    }
    // Fallback
    PathBuf::from(".crewd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = HarnessConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_agents, DEFAULT_MAX_AGENTS);
        assert_eq!(cfg.stall_timeout_secs, 300);
        assert_eq!(cfg.thresholds.loop_kill, 5);
        assert_eq!(cfg.projects_dir, dir.path().join("projects"));
    }

    #[test]
    fn toml_overrides_defaults_cli_overrides_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("crewd.toml"),
            r#"
port = 5000
max_agents = 9
stall_timeout_secs = 10

[thresholds]
loop_warn = 2
loop_kill = 3

[[route]]
pattern = "^deploy"
role = "release-bot"
"#,
        )
        .expect("write toml");

        let cfg = HarnessConfig::new(Some(6000), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, 6000, "CLI beats TOML");
        assert_eq!(cfg.max_agents, 9);
        assert_eq!(cfg.stall_timeout_secs, 10);
        assert_eq!(cfg.thresholds.loop_warn, 2);
        assert_eq!(cfg.thresholds.pingpong_kill, 4, "unset keys keep defaults");
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.routes[0].role, "release-bot");
    }

    #[test]
    fn disabled_thresholds_are_all_zero() {
        let t = LoopThresholds::disabled();
        assert_eq!(t.loop_warn, 0);
        assert_eq!(t.loop_kill, 0);
        assert_eq!(t.pingpong_warn, 0);
        assert_eq!(t.pingpong_kill, 0);
    }
}
