//! Process wiring: config, durable state, the job manager, the task
//! runner, and the research auto-tick loop. The message/command loop
//! itself waits on a `ChatAdapter`-supplied inbound stream, which the
//! `NullAdapter` satisfies with an empty one for local smoke-running.

use crate::adapter::NullAdapter;
use crate::config::Config;
use crate::executor::AgentTaskExecutor;
use crate::research_applier::ResearchApplier;
use anyhow::Result;
use relay_core::agent_invoker::{AgentInvoker, AgentProvider as CoreAgentProvider};
use relay_core::chat::ChatAdapter;
use relay_core::jobs::JobManager;
use relay_core::queue::ConversationQueue;
use relay_core::research::{self, AutoTickReentryGuard, ResearchConfig};
use relay_core::state::StateStore;
use relay_core::tasks::{TaskExecutor, TaskRunner, TaskRunnerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct App {
    pub config: Config,
    pub state: Arc<StateStore>,
    pub jobs: Arc<JobManager>,
    pub queue: Arc<ConversationQueue>,
    pub task_runner: Arc<TaskRunner>,
    pub executor: Arc<AgentTaskExecutor>,
    pub research_applier: Arc<ResearchApplier>,
}

impl App {
    pub async fn bootstrap(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.state_dir).await?;

        let state = Arc::new(StateStore::open(config.state_dir.join("sessions.json")).await?);
        let adapter: Arc<dyn ChatAdapter> = Arc::new(NullAdapter::new("relay-bot"));
        let jobs = Arc::new(JobManager::new(config.state_dir.join("jobs"), adapter));
        let queue = Arc::new(ConversationQueue::new());

        let provider = match config.agent_provider {
            crate::config::AgentProvider::Codex => CoreAgentProvider::Codex,
            crate::config::AgentProvider::Claude => CoreAgentProvider::Claude,
        };
        let invoker = AgentInvoker::new(config.agent_binary.clone(), provider);
        let executor = Arc::new(AgentTaskExecutor::new(
            invoker,
            config.agent_timeout_ms,
            config.sandbox.clone(),
            config.approval_policy.clone(),
        ));

        let task_runner = Arc::new(TaskRunner::new(TaskRunnerConfig {
            git_auto_commit: config.git_auto_commit_enabled,
            commit_prefix: config.git_commit_prefix.clone(),
            post_summary: config.tasks_summary_after_run,
        }));

        let research_applier = Arc::new(ResearchApplier::new(
            state.clone(),
            jobs.clone(),
            task_runner.clone(),
            executor.clone(),
            config.default_workdir.clone(),
        ));

        let keys = state.all_keys().await;
        jobs.recover_watchers(state.clone(), keys, config.default_workdir.clone()).await;

        Ok(App { config, state, jobs, queue, task_runner, executor, research_applier })
    }

    /// Scan durable sessions for research-enabled project roots, for the
    /// auto-tick scanner to drive on each interval.
    async fn research_project_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for key in self.state.all_keys().await {
            let Some(session) = self.state.get(&key).await else { continue };
            if !session.research.enabled {
                continue;
            }
            if let Some(root) = session.research.project_root {
                roots.push(PathBuf::from(root));
            }
        }
        roots
    }

    /// Spawn the research auto-tick scanner as a background task. Scans
    /// every configured interval for projects eligible for an autostep and
    /// dispatches `research::run_step` for each, bounded by the reentry guard
    /// and `research_tick_max_parallel`.
    pub fn spawn_research_auto_tick(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let app = self.clone();
        let guard = Arc::new(AutoTickReentryGuard::new());
        let semaphore = Arc::new(tokio::sync::Semaphore::new(app.config.research_tick_max_parallel.max(1)));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(app.config.research_tick_sec));
            loop {
                ticker.tick().await;
                if !app.config.research_enabled {
                    continue;
                }
                let project_roots = app.research_project_roots().await;
                for project_root in &project_roots {
                    let manager_state = match research::load_state(project_root).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(project_root = %project_root.display(), error = %e, "failed to load research state during auto-tick");
                            continue;
                        }
                    };
                    if !research::is_due_for_autostep(&manager_state) {
                        continue;
                    }
                    let key_str = project_root.display().to_string();
                    if !guard.try_begin(&key_str) {
                        continue;
                    }

                    let app = app.clone();
                    let guard = guard.clone();
                    let semaphore = semaphore.clone();
                    let project_root = project_root.clone();
                    tokio::spawn(async move {
                        let _permit = semaphore.acquire().await.expect("semaphore never closed");
                        let cfg = ResearchConfig {
                            lease_ttl_sec: app.config.research_lease_ttl_sec,
                            inflight_ttl_sec: app.config.research_inflight_ttl_sec,
                            max_actions_per_step: app.config.research_max_actions_per_step,
                            allowed_actions: app.config.research_actions_allowed.clone(),
                        };
                        let holder = format!("autotick-{}", uuid::Uuid::new_v4().simple());
                        let executor = app.executor.clone();
                        let result = research::run_step(&project_root, &holder, &cfg, app.research_applier.as_ref(), move |state| {
                            let executor = executor.clone();
                            async move {
                                let prompt = format!(
                                    "Goal: {}\nPhase: {:?}\nSteps so far: {}\nDecide the next research step.",
                                    state.goal, state.phase, state.counters.steps
                                );
                                let owner = relay_core::types::ConversationKey::channel(
                                    state.discord.guild_id.clone().unwrap_or_default(),
                                    state.discord.channel_id.clone(),
                                );
                                executor.run_task(&owner.research_manager_key(), &state.project_root, prompt).await
                            }
                        })
                        .await;
                        match result {
                            Ok(outcome) => info!(project_root = %project_root.display(), ?outcome, "research auto-tick step finished"),
                            Err(e) => warn!(project_root = %project_root.display(), error = %e, "research auto-tick step failed"),
                        }
                        guard.end(&key_str);
                    });
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.state.shutdown().await;
    }
}

pub async fn run(config: Config) -> Result<()> {
    let app = Arc::new(App::bootstrap(config).await?);
    info!(state_dir = %app.config.state_dir.display(), "relay bootstrapped");

    // Chat adapter wiring (NullAdapter) and the inbound message loop live at
    // the edge the real chat platform would occupy; this process stays
    // alive driving the research auto-tick scanner until interrupted.
    let _tick_handle = app.spawn_research_auto_tick();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    app.shutdown().await;
    Ok(())
}
