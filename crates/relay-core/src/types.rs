//! Core data model: conversation keys, sessions, tasks, plans, jobs, and the
//! research binding. See the relay's state-store module for persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier for a logical chat context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKey {
    Dm { user_id: String },
    Channel { guild_id: String, channel_id: String },
    Thread { guild_id: String, thread_id: String },
}

impl ConversationKey {
    pub fn dm(user_id: impl Into<String>) -> Self {
        ConversationKey::Dm { user_id: user_id.into() }
    }

    pub fn channel(guild_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        ConversationKey::Channel {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn thread(guild_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        ConversationKey::Thread {
            guild_id: guild_id.into(),
            thread_id: thread_id.into(),
        }
    }

    /// A research manager's conversation is a distinct key derived from the
    /// owning conversation, so the manager's agent session never interleaves
    /// with the user's.
    pub fn research_manager_key(&self) -> ConversationKey {
        ConversationKey::Thread {
            guild_id: "research-manager".to_string(),
            thread_id: format!("{}::research:manager", self.slug()),
        }
    }

    /// Filesystem/path-safe rendering, used for upload/job/plan/research directories.
    pub fn slug(&self) -> String {
        match self {
            ConversationKey::Dm { user_id } => format!("dm-{user_id}"),
            ConversationKey::Channel { guild_id, channel_id } => format!("ch-{guild_id}-{channel_id}"),
            ConversationKey::Thread { guild_id, thread_id } => format!("th-{guild_id}-{thread_id}"),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Dm { user_id } => write!(f, "dm:{user_id}"),
            ConversationKey::Channel { guild_id, channel_id } => write!(f, "channel:{guild_id}:{channel_id}"),
            ConversationKey::Thread { guild_id, thread_id } => write!(f, "thread:{guild_id}:{thread_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Blocked,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_result_preview: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            text: text.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            last_error: None,
            last_result_preview: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskLoopState {
    pub running: bool,
    pub stop_requested: bool,
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub workdir: String,
    pub path: String,
    pub request: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Done,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWatchConfig {
    pub enabled: bool,
    pub every_sec: u32,
    pub tail_lines: u32,
    pub then_task: Option<String>,
    pub run_tasks: bool,
}

impl Default for JobWatchConfig {
    fn default() -> Self {
        JobWatchConfig {
            enabled: true,
            every_sec: 10,
            tail_lines: 20,
            then_task: None,
            run_tasks: false,
        }
    }
}

impl JobWatchConfig {
    /// Clamp incoming fields (e.g. from an agent action) to the documented ranges.
    pub fn clamped(mut self) -> Self {
        self.every_sec = self.every_sec.clamp(1, 86_400);
        self.tail_lines = self.tail_lines.clamp(1, 500);
        if let Some(t) = &self.then_task {
            if t.len() > 2000 {
                self.then_task = Some(t.chars().take(2000).collect());
            }
        }
        self
    }
}

/// Binds a job to the research run that started it, for the completion hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResearchBinding {
    pub project_root: String,
    pub step_id: String,
    pub run_id: String,
    pub run_dir: String,
    pub stdout_path: String,
    pub metrics_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub workdir: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub job_dir: String,
    pub log_path: String,
    pub exit_code_path: String,
    pub pid_path: String,
    pub exit_code: Option<i32>,
    pub watch: Option<JobWatchConfig>,
    pub research: Option<JobResearchBinding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoFlags {
    pub actions: bool,
    pub research: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchBinding {
    pub enabled: bool,
    pub project_root: Option<String>,
    pub slug: Option<String>,
    pub manager_conv_key: Option<String>,
    pub last_note_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub thread_id: Option<String>,
    pub workdir: String,
    pub context_version: u32,
    pub updated_at: DateTime<Utc>,
    pub last_channel_id: Option<String>,
    pub last_guild_id: Option<String>,
    pub tasks: Vec<Task>,
    pub task_loop: TaskLoopState,
    pub plans: Vec<Plan>,
    pub jobs: Vec<Job>,
    pub auto: AutoFlags,
    pub research: ResearchBinding,
    /// Monotonically increasing counter used to mint `t-NNNN` task ids.
    pub next_task_seq: u64,
}

impl Session {
    pub fn new(default_workdir: impl Into<String>) -> Self {
        Session {
            thread_id: None,
            workdir: default_workdir.into(),
            context_version: 0,
            updated_at: Utc::now(),
            last_channel_id: None,
            last_guild_id: None,
            tasks: Vec::new(),
            task_loop: TaskLoopState::default(),
            plans: Vec::new(),
            jobs: Vec::new(),
            auto: AutoFlags::default(),
            research: ResearchBinding::default(),
            next_task_seq: 0,
        }
    }

    pub fn next_task_id(&mut self) -> String {
        self.next_task_seq += 1;
        format!("t-{:04}", self.next_task_seq)
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending))
            .count()
    }

    pub fn running_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| matches!(t.status, TaskStatus::Running))
    }

    pub fn next_pending_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| matches!(t.status, TaskStatus::Pending))
    }

    pub fn running_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| matches!(j.status, JobStatus::Running))
    }

    pub fn running_job_mut(&mut self) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| matches!(j.status, JobStatus::Running))
    }

    pub fn push_job(&mut self, job: Job) {
        self.jobs.push(job);
        if self.jobs.len() > 50 {
            let overflow = self.jobs.len() - 50;
            self.jobs.drain(0..overflow);
        }
    }

    pub fn push_plan(&mut self, plan: Plan, max_history: usize) {
        self.plans.push(plan);
        if self.plans.len() > max_history {
            let overflow = self.plans.len() - max_history;
            self.plans.drain(0..overflow);
        }
    }

    /// Restart-time reset: demote a running task, clear task-loop flags.
    /// Returns true if anything changed (so the caller knows to persist).
    pub fn apply_restart_reset(&mut self) -> bool {
        let mut changed = false;
        for task in self.tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Running) {
                task.status = TaskStatus::Pending;
                task.last_error = Some("interrupted by relay restart".to_string());
                changed = true;
            }
        }
        if self.task_loop.running || self.task_loop.stop_requested || self.task_loop.current_task_id.is_some() {
            self.task_loop = TaskLoopState::default();
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_sequential() {
        let mut s = Session::new("/tmp");
        assert_eq!(s.next_task_id(), "t-0001");
        assert_eq!(s.next_task_id(), "t-0002");
    }

    #[test]
    fn restart_reset_demotes_running_task() {
        let mut s = Session::new("/tmp");
        let mut t = Task::new("t-0001", "echo hi");
        t.status = TaskStatus::Running;
        s.tasks.push(t);
        s.task_loop.running = true;
        s.task_loop.current_task_id = Some("t-0001".to_string());

        let changed = s.apply_restart_reset();
        assert!(changed);
        assert_eq!(s.tasks[0].status, TaskStatus::Pending);
        assert_eq!(s.tasks[0].last_error.as_deref(), Some("interrupted by relay restart"));
        assert!(!s.task_loop.running);
        assert!(s.task_loop.current_task_id.is_none());
    }

    #[test]
    fn at_most_one_running_job_invariant_is_queryable() {
        let mut s = Session::new("/tmp");
        assert!(s.running_job().is_none());
        s.push_job(Job {
            id: "j1".into(),
            command: "sleep 1".into(),
            workdir: "/tmp".into(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            pid: Some(123),
            job_dir: "/tmp/j1".into(),
            log_path: "/tmp/j1/job.log".into(),
            exit_code_path: "/tmp/j1/exit_code".into(),
            pid_path: "/tmp/j1/pid".into(),
            exit_code: None,
            watch: None,
            research: None,
        });
        assert!(s.running_job().is_some());
    }

    #[test]
    fn jobs_are_capped_at_fifty() {
        let mut s = Session::new("/tmp");
        for i in 0..60 {
            s.push_job(Job {
                id: format!("j{i}"),
                command: "true".into(),
                workdir: "/tmp".into(),
                status: JobStatus::Done,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                pid: None,
                job_dir: "/tmp".into(),
                log_path: "/tmp/job.log".into(),
                exit_code_path: "/tmp/exit_code".into(),
                pid_path: "/tmp/pid".into(),
                exit_code: Some(0),
                watch: None,
                research: None,
            });
        }
        assert_eq!(s.jobs.len(), 50);
        assert_eq!(s.jobs.first().unwrap().id, "j10");
    }
}
