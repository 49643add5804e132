//! Wires research-decision actions into the Job Manager, the session task
//! queue, and the research project's own manager state — the concrete
//! `ResearchActionApplier` the auto-tick loop hands to `research::run_step`.

use crate::executor::AgentTaskExecutor;
use async_trait::async_trait;
use relay_core::error::{RelayError, RelayResult};
use relay_core::jobs::JobManager;
use relay_core::research::{self, ResearchAction, ResearchStatus};
use relay_core::state::StateStore;
use relay_core::tasks::TaskRunner;
use relay_core::types::{ConversationKey, JobResearchBinding, Task};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub struct ResearchApplier {
    state: Arc<StateStore>,
    jobs: Arc<JobManager>,
    task_runner: Arc<TaskRunner>,
    executor: Arc<AgentTaskExecutor>,
    default_workdir: String,
}

impl ResearchApplier {
    pub fn new(state: Arc<StateStore>, jobs: Arc<JobManager>, task_runner: Arc<TaskRunner>, executor: Arc<AgentTaskExecutor>, default_workdir: String) -> Self {
        ResearchApplier { state, jobs, task_runner, executor, default_workdir }
    }

    async fn manager_key(&self, project_root: &Path) -> RelayResult<ConversationKey> {
        let manager_state = research::load_state(project_root).await.map_err(RelayError::Filesystem)?;
        let owner = ConversationKey::channel(manager_state.discord.guild_id.unwrap_or_default(), manager_state.discord.channel_id);
        Ok(owner.research_manager_key())
    }
}

#[async_trait]
impl research::ResearchActionApplier for ResearchApplier {
    async fn apply(&self, project_root: &Path, action: &ResearchAction) -> RelayResult<()> {
        let key = self.manager_key(project_root).await?;

        match action {
            ResearchAction::JobStart { command, watch, .. } => {
                let mut manager_state = research::load_state(project_root).await.map_err(RelayError::Filesystem)?;
                manager_state.counters.runs += 1;
                let run_id = format!("r{:04}", manager_state.counters.runs);
                let run_dir = project_root.join("exp").join("results").join(&run_id);
                tokio::fs::create_dir_all(&run_dir).await.map_err(RelayError::Filesystem)?;
                let binding = JobResearchBinding {
                    project_root: project_root.display().to_string(),
                    step_id: manager_state.inflight_step.step_id.clone().unwrap_or_default(),
                    run_id,
                    run_dir: run_dir.display().to_string(),
                    stdout_path: run_dir.join("stdout.log").display().to_string(),
                    metrics_path: run_dir.join("metrics.json").display().to_string(),
                };
                manager_state.active.run_id = Some(binding.run_id.clone());
                let job = self
                    .jobs
                    .start_job(&self.state, &key, &self.default_workdir, command.clone(), watch.clone(), Some(binding))
                    .await?;
                manager_state.active.job_id = Some(job.id);
                research::save_state(project_root, &manager_state).await.map_err(RelayError::Filesystem)?;
            }
            ResearchAction::JobWatch { watch, .. } => {
                self.state
                    .mutate(&key, &self.default_workdir, |s| {
                        if let Some(job) = s.running_job_mut() {
                            job.watch = watch.clone();
                        }
                    })
                    .await;
            }
            ResearchAction::JobStop { .. } => {
                self.jobs.stop_job(&self.state, &key, &self.default_workdir).await?;
            }
            ResearchAction::TaskAdd { text, .. } => {
                self.state
                    .mutate(&key, &self.default_workdir, |s| {
                        let id = s.next_task_id();
                        s.tasks.push(Task::new(id, text.clone()));
                    })
                    .await;
            }
            ResearchAction::TaskRun { .. } => {
                if self.task_runner.start(&self.state, &key, &self.default_workdir).await {
                    let state = self.state.clone();
                    let task_runner = self.task_runner.clone();
                    let executor = self.executor.clone();
                    let default_workdir = self.default_workdir.clone();
                    let run_key = key.clone();
                    tokio::spawn(async move {
                        if let Err(e) = task_runner.drive(&state, executor.as_ref(), &run_key, &default_workdir).await {
                            warn!(conversation_key = %run_key, error = %e, "research-triggered task run failed");
                        }
                    });
                }
            }
            ResearchAction::WriteReport { markdown, replace, .. } => {
                let path = project_root.join("reports").join("rolling_report.md");
                if *replace {
                    tokio::fs::write(&path, markdown).await.map_err(RelayError::Filesystem)?;
                } else {
                    use tokio::io::AsyncWriteExt;
                    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await.map_err(RelayError::Filesystem)?;
                    file.write_all(format!("\n{markdown}\n").as_bytes()).await.map_err(RelayError::Filesystem)?;
                }
            }
            ResearchAction::ResearchPause { .. } => {
                let mut manager_state = research::load_state(project_root).await.map_err(RelayError::Filesystem)?;
                manager_state.status = ResearchStatus::Paused;
                manager_state.auto_run = false;
                research::save_state(project_root, &manager_state).await.map_err(RelayError::Filesystem)?;
            }
            ResearchAction::ResearchMarkDone { .. } => {
                let mut manager_state = research::load_state(project_root).await.map_err(RelayError::Filesystem)?;
                manager_state.status = ResearchStatus::Done;
                manager_state.auto_run = false;
                research::save_state(project_root, &manager_state).await.map_err(RelayError::Filesystem)?;
            }
        }
        Ok(())
    }
}
