//! Immutable process configuration, built once at startup. Every field has
//! a `RELAY_*` environment variable and a hardcoded fallback, following the
//! ancestor orchestrator's `SwarmConfig::default()` idiom; a `--config`
//! TOML file layers overrides on top via `toml` + `serde`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().unwrap_or_else(|| default.to_string())
}

fn env_bool_or(key: &str, default: bool) -> bool {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(default)
}

fn env_list_or(key: &str, default: Vec<String>) -> Vec<String> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentProvider {
    Codex,
    Claude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitAutoCommitScope {
    Task,
    Plan,
    Both,
}

/// TOML override file merged on top of env-derived defaults. Every field is
/// optional; only present fields override the base config.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigOverrides {
    pub default_workdir: Option<String>,
    pub agent_timeout_ms: Option<u64>,
    pub sandbox: Option<String>,
    pub approval_policy: Option<String>,
    pub max_reply_chars: Option<usize>,
    pub allowed_guilds: Option<Vec<String>>,
    pub allowed_channels: Option<Vec<String>>,
    pub thread_auto_respond: Option<bool>,
    pub tasks_max_pending: Option<usize>,
    pub research_lease_ttl_sec: Option<i64>,
    pub research_tick_sec: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub agent_provider: AgentProvider,
    pub agent_binary: String,
    pub default_workdir: String,
    pub allowed_workdir_roots: Vec<PathBuf>,
    pub agent_timeout_ms: u64,
    pub sandbox: Option<String>,
    pub approval_policy: Option<String>,
    pub max_reply_chars: usize,

    pub allowed_guilds: Vec<String>,
    pub allowed_channels: Vec<String>,
    pub thread_auto_respond: bool,

    pub upload_enabled: bool,
    pub upload_max_files: usize,
    pub upload_max_bytes: u64,
    pub upload_allowed_roots: Vec<PathBuf>,
    pub discord_attachments_enabled: bool,

    pub context_enabled: bool,
    pub context_every_turn: bool,
    pub context_version: u32,
    pub context_max_chars: usize,
    pub context_max_chars_per_file: usize,
    pub context_specs: Vec<String>,

    pub tasks_enabled: bool,
    pub tasks_max_pending: usize,
    pub tasks_stop_on_error: bool,
    pub tasks_post_full_output: bool,
    pub tasks_summary_after_run: bool,

    pub plans_enabled: bool,
    pub plans_max_history: usize,
    pub plan_apply_require_confirm_in_guilds: bool,

    pub handoff_enabled: bool,
    pub handoff_auto_after_task_run: bool,
    pub handoff_auto_after_each_task: bool,
    pub handoff_auto_after_plan_apply: bool,
    pub handoff_git_auto_commit: bool,
    pub handoff_git_auto_push: bool,
    pub handoff_git_commit_message: String,

    pub git_auto_commit_enabled: bool,
    pub git_auto_commit_scope: GitAutoCommitScope,
    pub git_commit_prefix: String,

    pub agent_actions_enabled: bool,
    pub agent_actions_dm_only: bool,
    pub agent_actions_allowed: Vec<String>,
    pub agent_actions_max_per_message: usize,

    pub jobs_auto_watch: bool,
    pub jobs_auto_watch_every_sec: u32,
    pub jobs_auto_watch_tail_lines: u32,

    pub progress_enabled: bool,
    pub progress_keep_lines: usize,
    pub progress_heartbeat_ms: u64,
    pub progress_stall_warn_ms: u64,

    pub research_enabled: bool,
    pub research_dm_only: bool,
    pub research_default_max_steps: u32,
    pub research_default_max_wallclock_min: u32,
    pub research_default_max_runs: u32,
    pub research_tick_sec: u64,
    pub research_tick_max_parallel: usize,
    pub research_actions_allowed: Vec<String>,
    pub research_max_actions_per_step: usize,
    pub research_lease_ttl_sec: i64,
    pub research_inflight_ttl_sec: i64,
    pub research_post_on_applied: bool,
    pub research_post_on_blocked: bool,
    pub research_post_every_steps: u32,

    pub state_dir: PathBuf,
    pub chat_token: Option<String>,
}

impl Config {
    /// Build from environment, falling back to documented defaults.
    pub fn from_env() -> Self {
        let state_dir = PathBuf::from(env_string_or("RELAY_STATE_DIR", "./relay-state"));
        Config {
            agent_provider: if env_string_or("RELAY_AGENT_PROVIDER", "codex") == "claude" {
                AgentProvider::Claude
            } else {
                AgentProvider::Codex
            },
            agent_binary: env_string_or("RELAY_AGENT_BINARY", "codex"),
            default_workdir: env_string_or("RELAY_DEFAULT_WORKDIR", "."),
            allowed_workdir_roots: env_list_or("RELAY_ALLOWED_WORKDIR_ROOTS", vec![".".to_string()])
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            agent_timeout_ms: env_or("RELAY_AGENT_TIMEOUT_MS", 600_000),
            sandbox: std::env::var("RELAY_SANDBOX").ok(),
            approval_policy: std::env::var("RELAY_APPROVAL_POLICY").ok(),
            max_reply_chars: env_or("RELAY_MAX_REPLY_CHARS", 1800),

            allowed_guilds: env_list_or("RELAY_ALLOWED_GUILDS", Vec::new()),
            allowed_channels: env_list_or("RELAY_ALLOWED_CHANNELS", Vec::new()),
            thread_auto_respond: env_bool_or("RELAY_THREAD_AUTO_RESPOND", true),

            upload_enabled: env_bool_or("RELAY_UPLOAD_ENABLED", true),
            upload_max_files: env_or("RELAY_UPLOAD_MAX_FILES", 5),
            upload_max_bytes: env_or("RELAY_UPLOAD_MAX_BYTES", 512 * 1024),
            upload_allowed_roots: env_list_or("RELAY_UPLOAD_ALLOWED_ROOTS", vec![".".to_string()])
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            discord_attachments_enabled: env_bool_or("RELAY_DISCORD_ATTACHMENTS_ENABLED", true),

            context_enabled: env_bool_or("RELAY_CONTEXT_ENABLED", true),
            context_every_turn: env_bool_or("RELAY_CONTEXT_EVERY_TURN", false),
            context_version: env_or("RELAY_CONTEXT_VERSION", 1),
            context_max_chars: env_or("RELAY_CONTEXT_MAX_CHARS", 20_000),
            context_max_chars_per_file: env_or("RELAY_CONTEXT_MAX_CHARS_PER_FILE", 4_000),
            context_specs: env_list_or("RELAY_CONTEXT_SPECS", Vec::new()),

            tasks_enabled: env_bool_or("RELAY_TASKS_ENABLED", true),
            tasks_max_pending: env_or("RELAY_TASKS_MAX_PENDING", 50),
            tasks_stop_on_error: env_bool_or("RELAY_TASKS_STOP_ON_ERROR", false),
            tasks_post_full_output: env_bool_or("RELAY_TASKS_POST_FULL_OUTPUT", false),
            tasks_summary_after_run: env_bool_or("RELAY_TASKS_SUMMARY_AFTER_RUN", true),

            plans_enabled: env_bool_or("RELAY_PLANS_ENABLED", true),
            plans_max_history: env_or("RELAY_PLANS_MAX_HISTORY", 20),
            plan_apply_require_confirm_in_guilds: env_bool_or("RELAY_PLAN_APPLY_REQUIRE_CONFIRM_IN_GUILDS", true),

            handoff_enabled: env_bool_or("RELAY_HANDOFF_ENABLED", true),
            handoff_auto_after_task_run: env_bool_or("RELAY_HANDOFF_AUTO_AFTER_TASK_RUN", false),
            handoff_auto_after_each_task: env_bool_or("RELAY_HANDOFF_AUTO_AFTER_EACH_TASK", false),
            handoff_auto_after_plan_apply: env_bool_or("RELAY_HANDOFF_AUTO_AFTER_PLAN_APPLY", false),
            handoff_git_auto_commit: env_bool_or("RELAY_HANDOFF_GIT_AUTO_COMMIT", false),
            handoff_git_auto_push: env_bool_or("RELAY_HANDOFF_GIT_AUTO_PUSH", false),
            handoff_git_commit_message: env_string_or("RELAY_HANDOFF_GIT_COMMIT_MESSAGE", "relay: handoff"),

            git_auto_commit_enabled: env_bool_or("RELAY_GIT_AUTO_COMMIT_ENABLED", true),
            git_auto_commit_scope: match env_string_or("RELAY_GIT_AUTO_COMMIT_SCOPE", "both").as_str() {
                "task" => GitAutoCommitScope::Task,
                "plan" => GitAutoCommitScope::Plan,
                _ => GitAutoCommitScope::Both,
            },
            git_commit_prefix: env_string_or("RELAY_GIT_COMMIT_PREFIX", "relay:"),

            agent_actions_enabled: env_bool_or("RELAY_AGENT_ACTIONS_ENABLED", true),
            agent_actions_dm_only: env_bool_or("RELAY_AGENT_ACTIONS_DM_ONLY", false),
            agent_actions_allowed: env_list_or(
                "RELAY_AGENT_ACTIONS_ALLOWED",
                vec!["job_start".to_string(), "job_watch".to_string(), "job_stop".to_string(), "task_add".to_string(), "task_run".to_string()],
            ),
            agent_actions_max_per_message: env_or("RELAY_AGENT_ACTIONS_MAX_PER_MESSAGE", 5),

            jobs_auto_watch: env_bool_or("RELAY_JOBS_AUTO_WATCH", true),
            jobs_auto_watch_every_sec: env_or("RELAY_JOBS_AUTO_WATCH_EVERY_SEC", 10),
            jobs_auto_watch_tail_lines: env_or("RELAY_JOBS_AUTO_WATCH_TAIL_LINES", 20),

            progress_enabled: env_bool_or("RELAY_PROGRESS_ENABLED", true),
            progress_keep_lines: env_or("RELAY_PROGRESS_KEEP_LINES", 50),
            progress_heartbeat_ms: env_or("RELAY_PROGRESS_HEARTBEAT_MS", 15_000),
            progress_stall_warn_ms: env_or("RELAY_PROGRESS_STALL_WARN_MS", 45_000),

            research_enabled: env_bool_or("RELAY_RESEARCH_ENABLED", true),
            research_dm_only: env_bool_or("RELAY_RESEARCH_DM_ONLY", false),
            research_default_max_steps: env_or("RELAY_RESEARCH_DEFAULT_MAX_STEPS", 200),
            research_default_max_wallclock_min: env_or("RELAY_RESEARCH_DEFAULT_MAX_WALLCLOCK_MIN", 720),
            research_default_max_runs: env_or("RELAY_RESEARCH_DEFAULT_MAX_RUNS", 50),
            research_tick_sec: env_or("RELAY_RESEARCH_TICK_SEC", 60),
            research_tick_max_parallel: env_or("RELAY_RESEARCH_TICK_MAX_PARALLEL", 2),
            research_actions_allowed: env_list_or(
                "RELAY_RESEARCH_ACTIONS_ALLOWED",
                relay_core::research::default_allowed_actions(),
            ),
            research_max_actions_per_step: env_or("RELAY_RESEARCH_MAX_ACTIONS_PER_STEP", 5),
            research_lease_ttl_sec: env_or("RELAY_RESEARCH_LEASE_TTL_SEC", 180),
            research_inflight_ttl_sec: env_or("RELAY_RESEARCH_INFLIGHT_TTL_SEC", 600),
            research_post_on_applied: env_bool_or("RELAY_RESEARCH_POST_ON_APPLIED", true),
            research_post_on_blocked: env_bool_or("RELAY_RESEARCH_POST_ON_BLOCKED", true),
            research_post_every_steps: env_or("RELAY_RESEARCH_POST_EVERY_STEPS", 5),

            state_dir,
            chat_token: std::env::var("RELAY_CHAT_TOKEN").ok(),
        }
    }

    /// Merge a TOML overrides file on top of the env-derived defaults.
    pub fn apply_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(v) = overrides.default_workdir {
            self.default_workdir = v;
        }
        if let Some(v) = overrides.agent_timeout_ms {
            self.agent_timeout_ms = v;
        }
        if let Some(v) = overrides.sandbox {
            self.sandbox = Some(v);
        }
        if let Some(v) = overrides.approval_policy {
            self.approval_policy = Some(v);
        }
        if let Some(v) = overrides.max_reply_chars {
            self.max_reply_chars = v;
        }
        if let Some(v) = overrides.allowed_guilds {
            self.allowed_guilds = v;
        }
        if let Some(v) = overrides.allowed_channels {
            self.allowed_channels = v;
        }
        if let Some(v) = overrides.thread_auto_respond {
            self.thread_auto_respond = v;
        }
        if let Some(v) = overrides.tasks_max_pending {
            self.tasks_max_pending = v;
        }
        if let Some(v) = overrides.research_lease_ttl_sec {
            self.research_lease_ttl_sec = v;
        }
        if let Some(v) = overrides.research_tick_sec {
            self.research_tick_sec = v;
        }
        self
    }

    /// Load `path` as a TOML overrides file and merge it on top of `self`.
    pub fn load_overrides_file(self, path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config override file {}", path.display()))?;
        let overrides: ConfigOverrides = toml::from_str(&text).with_context(|| format!("parsing config override file {}", path.display()))?;
        Ok(self.apply_overrides(overrides))
    }

    /// Validate required configuration; returns a Fatal-kind error message
    /// suitable for a non-zero exit before any session work begins.
    pub fn validate(&self) -> Result<()> {
        if self.chat_token.is_none() {
            anyhow::bail!("RELAY_CHAT_TOKEN is required");
        }
        if let Some(parent) = self.state_dir.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                anyhow::bail!("state dir parent {} does not exist", parent.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        std::env::remove_var("RELAY_AGENT_TIMEOUT_MS");
        std::env::remove_var("RELAY_TASKS_MAX_PENDING");
        std::env::remove_var("RELAY_RESEARCH_LEASE_TTL_SEC");
        let cfg = Config::from_env();
        assert_eq!(cfg.agent_timeout_ms, 600_000);
        assert_eq!(cfg.tasks_max_pending, 50);
        assert_eq!(cfg.research_lease_ttl_sec, 180);
    }

    #[test]
    fn validate_requires_chat_token() {
        std::env::remove_var("RELAY_CHAT_TOKEN");
        let cfg = Config::from_env();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_file_merges_on_top_of_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "default_workdir = \"/srv/project\"\nagent_timeout_ms = 5000\n").unwrap();
        let cfg = Config::from_env().load_overrides_file(&path).unwrap();
        assert_eq!(cfg.default_workdir, "/srv/project");
        assert_eq!(cfg.agent_timeout_ms, 5000);
    }
}
