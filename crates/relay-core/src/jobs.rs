//! Background Job Manager: launches detached shell jobs via a wrapper
//! script, tracks them in session state, and runs watcher timers that tail
//! logs and post updates.

use crate::chat::{ChannelRef, ChatAdapter};
use crate::error::{RelayError, RelayResult};
use crate::research;
use crate::state::StateStore;
use crate::types::{ConversationKey, Job, JobResearchBinding, JobStatus, JobWatchConfig, Task};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

fn new_job_id() -> String {
    format!("j{}", uuid::Uuid::new_v4().simple())
}

/// Builds the wrapper script content: records PID, installs signal handlers
/// that write a documented exit code, tees output to the log, then runs the
/// user command and records its exit code.
fn wrapper_script(command: &str, job_dir: &std::path::Path) -> String {
    let pid_path = job_dir.join("pid").display().to_string();
    let exit_code_path = job_dir.join("exit_code").display().to_string();
    let log_path = job_dir.join("job.log").display().to_string();
    format!(
        r#"#!/bin/sh
echo $$ > "{pid_path}"
trap 'echo 143 > "{exit_code_path}"; exit 143' TERM
trap 'echo 130 > "{exit_code_path}"; exit 130' INT
{{
{command}
}} >> "{log_path}" 2>&1
echo $? > "{exit_code_path}"
"#
    )
}

pub struct JobManager {
    jobs_root: PathBuf,
    watchers: Mutex<HashMap<(ConversationKey, String), tokio::task::JoinHandle<()>>>,
    adapter: Arc<dyn ChatAdapter>,
}

pub type SharedJobManager = Arc<JobManager>;

impl JobManager {
    pub fn new(jobs_root: impl Into<PathBuf>, adapter: Arc<dyn ChatAdapter>) -> Self {
        JobManager { jobs_root: jobs_root.into(), watchers: Mutex::new(HashMap::new()), adapter }
    }

    pub fn job_dir(&self, key: &ConversationKey, job_id: &str) -> PathBuf {
        self.jobs_root.join(key.slug()).join(job_id)
    }

    /// Start a detached job. Refuses if the session already has one running.
    pub async fn start_job(
        &self,
        state: &Arc<StateStore>,
        key: &ConversationKey,
        default_workdir: &str,
        command: String,
        watch: Option<JobWatchConfig>,
        research: Option<JobResearchBinding>,
    ) -> RelayResult<Job> {
        if state.get(key).await.and_then(|s| s.running_job().cloned()).is_some() {
            return Err(RelayError::validation("a job is already running for this conversation"));
        }

        let job_id = new_job_id();
        let job_dir = self.job_dir(key, &job_id);
        tokio::fs::create_dir_all(&job_dir).await?;

        let workdir = state.get(key).await.map(|s| s.workdir).unwrap_or_else(|| default_workdir.to_string());
        let script = wrapper_script(&command, &job_dir);
        let script_path = job_dir.join("wrapper.sh");
        tokio::fs::write(&script_path, script).await?;

        let child = std::process::Command::new("sh")
            .arg(&script_path)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(RelayError::Filesystem)?;
        let pid = child.id();
        // Deliberately dropped: the job is detached from the relay's own
        // lifetime. Only the PID and side files are consulted afterward.
        drop(child);

        let job = Job {
            id: job_id.clone(),
            command,
            workdir,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            pid: Some(pid),
            job_dir: job_dir.display().to_string(),
            log_path: job_dir.join("job.log").display().to_string(),
            exit_code_path: job_dir.join("exit_code").display().to_string(),
            pid_path: job_dir.join("pid").display().to_string(),
            exit_code: None,
            watch: watch.clone(),
            research,
        };

        state.mutate(key, default_workdir, |s| s.push_job(job.clone())).await;
        info!(conversation_key = %key, job_id, "job started");

        if watch.as_ref().map(|w| w.enabled).unwrap_or(false) {
            self.start_watcher(state.clone(), key.clone(), job_id.clone(), default_workdir.to_string()).await;
        }

        Ok(job)
    }

    pub async fn start_watcher(&self, state: Arc<StateStore>, key: ConversationKey, job_id: String, default_workdir: String) {
        let mut guard = self.watchers.lock().await;
        let map_key = (key.clone(), job_id.clone());
        if guard.contains_key(&map_key) {
            return;
        }
        let jobs_root = self.jobs_root.clone();
        let adapter = self.adapter.clone();
        let handle = tokio::spawn(async move {
            run_watcher_loop(state, key, job_id, default_workdir, jobs_root, adapter).await;
        });
        guard.insert(map_key, handle);
    }

    /// Bypasses the Conversation Queue per the watch-stop contract.
    pub async fn stop_watcher(&self, key: &ConversationKey, job_id: &str) {
        let mut guard = self.watchers.lock().await;
        if let Some(handle) = guard.remove(&(key.clone(), job_id.to_string())) {
            handle.abort();
        }
    }

    /// Graceful-terminate the running job's process group, then mark canceled.
    pub async fn stop_job(&self, state: &Arc<StateStore>, key: &ConversationKey, default_workdir: &str) -> RelayResult<()> {
        let pid = state.get(key).await.and_then(|s| s.running_job().and_then(|j| j.pid));
        let Some(pid) = pid else {
            return Err(RelayError::validation("no job is running for this conversation"));
        };
        let _ = std::process::Command::new("kill").args(["-TERM", &format!("-{pid}")]).output();
        let _ = std::process::Command::new("kill").args(["-TERM", &pid.to_string()]).output();

        let job_id = state
            .mutate(key, default_workdir, |s| {
                if let Some(job) = s.running_job_mut() {
                    job.status = JobStatus::Canceled;
                    job.finished_at = Some(Utc::now());
                    if let Some(w) = job.watch.as_mut() {
                        w.enabled = false;
                    }
                    Some(job.id.clone())
                } else {
                    None
                }
            })
            .await;
        if let Some(job_id) = job_id {
            self.stop_watcher(key, &job_id).await;
        }
        Ok(())
    }

    /// Restore watchers for any session with a running, watch-enabled job.
    pub async fn recover_watchers(self: &Arc<Self>, state: Arc<StateStore>, keys: Vec<ConversationKey>, default_workdir: String) {
        for key in keys {
            if let Some(session) = state.get(&key).await {
                if let Some(job) = session.running_job() {
                    if job.watch.as_ref().map(|w| w.enabled).unwrap_or(false) {
                        self.start_watcher(state.clone(), key.clone(), job.id.clone(), default_workdir.clone()).await;
                    }
                }
            }
        }
    }
}

async fn run_watcher_loop(
    state: Arc<StateStore>,
    key: ConversationKey,
    job_id: String,
    default_workdir: String,
    jobs_root: PathBuf,
    adapter: Arc<dyn ChatAdapter>,
) {
    let mut last_tail_hash: Option<String> = None;
    loop {
        let every_sec = state
            .get(&key)
            .await
            .and_then(|s| s.jobs.iter().find(|j| j.id == job_id).and_then(|j| j.watch.clone()))
            .map(|w| w.every_sec)
            .unwrap_or(10);
        tokio::time::sleep(std::time::Duration::from_secs(every_sec as u64)).await;

        let job_dir = jobs_root.join(key.slug()).join(&job_id);
        let log_path = job_dir.join("job.log");
        let exit_code_path = job_dir.join("exit_code");

        if exit_code_path.exists() {
            let exit_code: Option<i32> = tokio::fs::read_to_string(&exit_code_path)
                .await
                .ok()
                .and_then(|s| s.trim().parse().ok());
            let tail = tail_log(&log_path, 20).await.unwrap_or_default();
            let code_label = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
            post_watcher_update(&adapter, &state, &key, &format!("Job `{job_id}` finished (exit {code_label}):\n```\n{tail}\n```")).await;
            finalize_job(&state, &key, &job_id, exit_code, &default_workdir).await;
            break;
        }

        let tail = tail_log(&log_path, 20).await.unwrap_or_default();
        let hash = hash_tail(&tail);
        let changed = last_tail_hash.as_deref() != Some(hash.as_str());

        if changed {
            last_tail_hash = Some(hash);
            post_watcher_update(&adapter, &state, &key, &format!("Job `{job_id}` update:\n```\n{tail}\n```")).await;
        } else {
            let pid = state.get(&key).await.and_then(|s| s.jobs.iter().find(|j| j.id == job_id).and_then(|j| j.pid));
            if pid.map(is_pid_alive).unwrap_or(false) {
                post_watcher_update(&adapter, &state, &key, &format!("Job `{job_id}`: no new output")).await;
            }
            // pid not alive and tail unchanged: skip, avoid spamming a dead job
        }
    }
}

async fn post_watcher_update(adapter: &Arc<dyn ChatAdapter>, state: &Arc<StateStore>, key: &ConversationKey, text: &str) {
    let Some(session) = state.get(key).await else { return };
    let Some(channel_id) = session.last_channel_id else { return };
    let channel = ChannelRef {
        guild_id: session.last_guild_id,
        channel_id,
        is_thread: matches!(key, ConversationKey::Thread { .. }),
    };
    if let Err(e) = adapter.send(&channel, text).await {
        warn!(conversation_key = %key, error = %e, "watcher post failed");
    }
}

fn hash_tail(tail: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tail.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill").args(["-0", &pid.to_string()]).status().map(|s| s.success()).unwrap_or(false)
}

async fn finalize_job(state: &Arc<StateStore>, key: &ConversationKey, job_id: &str, exit_code: Option<i32>, default_workdir: &str) {
    let status = if exit_code == Some(0) { JobStatus::Done } else { JobStatus::Failed };
    let (then_task, research_binding) = state
        .mutate(key, default_workdir, |s| {
            let mut then_task = None;
            let mut research_binding = None;
            if let Some(job) = s.jobs.iter_mut().find(|j| j.id == job_id) {
                job.status = status;
                job.finished_at = Some(Utc::now());
                job.exit_code = exit_code;
                if let Some(w) = &job.watch {
                    then_task = w.then_task.clone();
                }
                research_binding = job.research.clone();
            }
            (then_task, research_binding)
        })
        .await;

    if let Some(text) = then_task {
        let pending = state.get(key).await.map(|s| s.pending_task_count()).unwrap_or(0);
        if pending < 50 {
            state
                .mutate(key, default_workdir, |s| {
                    let id = s.next_task_id();
                    s.tasks.push(Task::new(id, text));
                })
                .await;
        } else {
            warn!(conversation_key = %key, "job follow-up task skipped: tasksMaxPending reached");
        }
    }

    if let Some(binding) = research_binding {
        let result = research::handle_job_completion(Path::new(&binding.project_root), &binding.run_id, Path::new(&binding.metrics_path), exit_code).await;
        match result {
            Ok(valid) => info!(conversation_key = %key, job_id, run_id = %binding.run_id, valid, "research job completion handled"),
            Err(e) => warn!(conversation_key = %key, job_id, run_id = %binding.run_id, error = %e, "research job completion hook failed"),
        }
    }

    info!(conversation_key = %key, job_id, ?exit_code, "job finalized");
}

/// Read up to `max_lines` lines from the tail of a log file, capped at 128 KiB.
pub async fn tail_log(path: &std::path::Path, max_lines: usize) -> RelayResult<String> {
    const CAP: usize = 128 * 1024;
    let bytes = tokio::fs::read(path).await.unwrap_or_default();
    let slice = if bytes.len() > CAP { &bytes[bytes.len() - CAP..] } else { &bytes[..] };
    let text = String::from_utf8_lossy(slice);
    let lines: Vec<&str> = text.lines().rev().take(max_lines).collect();
    Ok(lines.into_iter().rev().collect::<Vec<_>>().join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::EditablePendingMessage;
    use crate::research::{scaffold_project, DiscordBinding, ResearchStatus};
    use std::sync::Mutex as StdMutex;

    struct RecordingAdapter {
        sent: Arc<StdMutex<Vec<String>>>,
    }

    struct NoopMessage;

    #[async_trait::async_trait]
    impl EditablePendingMessage for NoopMessage {
        async fn edit(&self, _text: &str) -> Result<(), String> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ChatAdapter for RecordingAdapter {
        async fn send(&self, _channel: &ChannelRef, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(Arc::new(NoopMessage))
        }
        async fn reply(&self, msg: &crate::chat::InboundMessage, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String> {
            self.send(&msg.channel, text).await
        }
        async fn fetch_attachment(&self, _attachment: &crate::chat::Attachment) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }
        fn bot_user_id(&self) -> &str {
            "bot-1"
        }
    }

    async fn wait_until(cond: impl Fn() -> bool, tries: usize) {
        for _ in 0..tries {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn watcher_posts_only_when_tail_changes() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::open(dir.path().join("s.json")).await.unwrap());
        let key = ConversationKey::dm("u1");
        let workdir = dir.path().to_str().unwrap().to_string();

        let job_dir = dir.path().join("jobs").join(key.slug()).join("j1");
        tokio::fs::create_dir_all(&job_dir).await.unwrap();
        tokio::fs::write(job_dir.join("job.log"), "line1\n").await.unwrap();

        state
            .mutate(&key, &workdir, |s| {
                s.last_channel_id = Some("c1".to_string());
                s.push_job(Job {
                    id: "j1".into(),
                    command: "sleep 1".into(),
                    workdir: workdir.clone(),
                    status: JobStatus::Running,
                    started_at: Utc::now(),
                    finished_at: None,
                    pid: None,
                    job_dir: job_dir.display().to_string(),
                    log_path: job_dir.join("job.log").display().to_string(),
                    exit_code_path: job_dir.join("exit_code").display().to_string(),
                    pid_path: job_dir.join("pid").display().to_string(),
                    exit_code: None,
                    watch: Some(JobWatchConfig { enabled: true, every_sec: 0, tail_lines: 20, then_task: None, run_tasks: false }),
                    research: None,
                });
            })
            .await;

        let sent = Arc::new(StdMutex::new(Vec::new()));
        let adapter: Arc<dyn ChatAdapter> = Arc::new(RecordingAdapter { sent: sent.clone() });
        let jobs_root = dir.path().join("jobs");

        let _handle = tokio::spawn(run_watcher_loop(state.clone(), key.clone(), "j1".to_string(), workdir.clone(), jobs_root, adapter));

        // pid is None (dead), so once the tail stops changing the watcher
        // must stop posting entirely.
        wait_until(|| sent.lock().unwrap().len() >= 1, 50).await;
        let after_first = sent.lock().unwrap().len();
        assert_eq!(after_first, 1);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sent.lock().unwrap().len(), 1, "unchanged tail with a dead pid must not spam posts");

        tokio::fs::write(job_dir.join("job.log"), "line1\nline2\n").await.unwrap();
        wait_until(|| sent.lock().unwrap().len() >= 2, 50).await;
        assert_eq!(sent.lock().unwrap().len(), 2, "a changed tail must produce exactly one more post");
    }

    #[tokio::test]
    async fn finalize_job_invokes_research_completion_hook() {
        let dir = tempfile::tempdir().unwrap();
        let (project_root, _mstate) =
            scaffold_project(dir.path(), "conv1", "goal", DiscordBinding { channel_id: "c1".to_string(), guild_id: None }).await.unwrap();

        let state = Arc::new(StateStore::open(dir.path().join("s.json")).await.unwrap());
        let key = ConversationKey::dm("u1");
        let workdir = dir.path().to_str().unwrap().to_string();
        let metrics_path = project_root.join("exp").join("results").join("r0001").join("metrics.json");

        state
            .mutate(&key, &workdir, |s| {
                s.push_job(Job {
                    id: "j1".into(),
                    command: "true".into(),
                    workdir: workdir.clone(),
                    status: JobStatus::Running,
                    started_at: Utc::now(),
                    finished_at: None,
                    pid: None,
                    job_dir: "/tmp".into(),
                    log_path: "/tmp/job.log".into(),
                    exit_code_path: "/tmp/exit_code".into(),
                    pid_path: "/tmp/pid".into(),
                    exit_code: None,
                    watch: None,
                    research: Some(JobResearchBinding {
                        project_root: project_root.display().to_string(),
                        step_id: "s1".to_string(),
                        run_id: "r0001".to_string(),
                        run_dir: project_root.join("exp").join("results").join("r0001").display().to_string(),
                        stdout_path: project_root.join("exp").join("results").join("r0001").join("stdout.log").display().to_string(),
                        metrics_path: metrics_path.display().to_string(),
                    }),
                });
            })
            .await;

        finalize_job(&state, &key, "j1", Some(0), &workdir).await;

        // metrics.json was never written, so the hook must block autorun.
        let mstate = crate::research::load_state(&project_root).await.unwrap();
        assert_eq!(mstate.status, ResearchStatus::Blocked);
        assert!(!mstate.auto_run);
    }

    #[test]
    fn wrapper_script_contains_signal_traps_and_exit_code_path() {
        let dir = std::path::PathBuf::from("/tmp/job1");
        let script = wrapper_script("echo hi", &dir);
        assert!(script.contains("trap"));
        assert!(script.contains("exit_code"));
        assert!(script.contains("echo hi"));
    }

    #[tokio::test]
    async fn tail_log_reads_last_n_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let content: String = (0..100).map(|i| format!("line {i}\n")).collect();
        tokio::fs::write(&path, content).await.unwrap();
        let tail = tail_log(&path, 5).await.unwrap();
        assert_eq!(tail.lines().count(), 5);
        assert!(tail.ends_with("line 99"));
    }

    #[tokio::test]
    async fn tail_log_on_missing_file_is_empty() {
        let tail = tail_log(std::path::Path::new("/does/not/exist"), 5).await.unwrap();
        assert_eq!(tail, "");
    }
}
