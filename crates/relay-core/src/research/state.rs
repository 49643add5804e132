//! On-disk research project scaffolding and the typed manager state
//! document: lease, idempotency, budgets, and in-flight step tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    Paused,
    Running,
    Blocked,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Plan,
    Wait,
    Analyze,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchBudgets {
    pub max_steps: u32,
    pub max_wall_clock_minutes: u32,
    pub max_runs: u32,
}

impl Default for ResearchBudgets {
    fn default() -> Self {
        ResearchBudgets { max_steps: 200, max_wall_clock_minutes: 720, max_runs: 50 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchCounters {
    pub steps: u32,
    pub runs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InflightStatus {
    Idle,
    Running,
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InflightStep {
    pub step_id: Option<String>,
    pub decision_hash: Option<String>,
    pub status: InflightStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for InflightStep {
    fn default() -> Self {
        InflightStep { step_id: None, decision_hash: None, status: InflightStatus::Idle, started_at: None, error: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveRun {
    pub job_id: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordBinding {
    pub channel_id: String,
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingState {
    pub last_discord_digest_at: Option<DateTime<Utc>>,
    pub last_discord_digest_step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchManagerState {
    pub version: u32,
    pub project_root: String,
    pub goal: String,
    pub status: ResearchStatus,
    pub phase: ResearchPhase,
    pub auto_run: bool,
    pub budgets: ResearchBudgets,
    pub counters: ResearchCounters,
    pub lease: Option<Lease>,
    pub inflight_step: InflightStep,
    pub active: ActiveRun,
    pub discord: DiscordBinding,
    pub started_at: DateTime<Utc>,
    pub last_feedback_at: Option<DateTime<Utc>>,
    pub last_decision_at: Option<DateTime<Utc>>,
    pub reporting: ReportingState,
    pub applied_decision_hashes: VecDeque<String>,
    pub applied_action_keys: VecDeque<String>,
    pub last_update_at: DateTime<Utc>,
}

const MAX_DECISION_HASHES: usize = 500;
const MAX_ACTION_KEYS: usize = 2000;

impl ResearchManagerState {
    pub fn new(project_root: impl Into<String>, goal: impl Into<String>, discord: DiscordBinding) -> Self {
        let now = Utc::now();
        ResearchManagerState {
            version: 1,
            project_root: project_root.into(),
            goal: goal.into(),
            status: ResearchStatus::Running,
            phase: ResearchPhase::Plan,
            auto_run: true,
            budgets: ResearchBudgets::default(),
            counters: ResearchCounters::default(),
            lease: None,
            inflight_step: InflightStep::default(),
            active: ActiveRun::default(),
            discord,
            started_at: now,
            last_feedback_at: None,
            last_decision_at: None,
            reporting: ReportingState::default(),
            applied_decision_hashes: VecDeque::new(),
            applied_action_keys: VecDeque::new(),
            last_update_at: now,
        }
    }

    pub fn budgets_exhausted(&self, now: DateTime<Utc>) -> bool {
        let elapsed_minutes = (now - self.started_at).num_minutes().max(0) as u32;
        self.counters.steps >= self.budgets.max_steps
            || self.counters.runs >= self.budgets.max_runs
            || elapsed_minutes >= self.budgets.max_wall_clock_minutes
    }

    /// Expire a past-TTL lease and fail a past-TTL in-flight step. Returns
    /// true if anything changed.
    pub fn repair_stale_state(&mut self, now: DateTime<Utc>, inflight_ttl_sec: i64) -> bool {
        let mut changed = false;
        if let Some(lease) = &self.lease {
            if !lease.is_active(now) {
                self.lease = None;
                changed = true;
            }
        }
        if self.inflight_step.status == InflightStatus::Running {
            if let Some(started) = self.inflight_step.started_at {
                if (now - started).num_seconds() >= inflight_ttl_sec {
                    self.inflight_step.status = InflightStatus::Failed;
                    self.inflight_step.error = Some("inflight step exceeded TTL".to_string());
                    self.status = ResearchStatus::Blocked;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Try to acquire the lease for `holder`. Fails if an unexpired lease is
    /// already held by someone else.
    pub fn try_acquire_lease(&mut self, holder: &str, ttl_sec: i64, now: DateTime<Utc>) -> bool {
        if let Some(lease) = &self.lease {
            if lease.is_active(now) {
                return false;
            }
        }
        self.lease = Some(Lease {
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_sec),
        });
        true
    }

    pub fn release_lease(&mut self) {
        self.lease = None;
    }

    pub fn decision_hash(decision_json: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(decision_json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn has_applied_decision(&self, hash: &str) -> bool {
        self.applied_decision_hashes.iter().any(|h| h == hash)
    }

    pub fn record_applied_decision(&mut self, hash: String) {
        self.applied_decision_hashes.push_back(hash);
        while self.applied_decision_hashes.len() > MAX_DECISION_HASHES {
            self.applied_decision_hashes.pop_front();
        }
    }

    pub fn has_applied_action(&self, key: &str) -> bool {
        self.applied_action_keys.iter().any(|k| k == key)
    }

    pub fn record_applied_action(&mut self, key: String) {
        self.applied_action_keys.push_back(key);
        while self.applied_action_keys.len() > MAX_ACTION_KEYS {
            self.applied_action_keys.pop_front();
        }
    }
}

/// Subdirectories created for a new research project.
pub const PROJECT_SUBDIRS: &[&str] = &["idea", "exp/results", "reports", "writing", "manager", "memory"];

/// Scaffold a new research project on disk and return the normalized state.
pub async fn scaffold_project(
    projects_root: &Path,
    conv_slug: &str,
    goal: &str,
    discord: DiscordBinding,
) -> std::io::Result<(PathBuf, ResearchManagerState)> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let slug = slugify(goal);
    let project_root = projects_root.join(conv_slug).join(format!("{stamp}-{slug}"));

    for sub in PROJECT_SUBDIRS {
        tokio::fs::create_dir_all(project_root.join(sub)).await?;
    }

    tokio::fs::write(project_root.join("idea").join("goal.md"), format!("# Goal\n\n{goal}\n")).await?;
    tokio::fs::write(project_root.join("idea").join("hypotheses.yaml"), "hypotheses: []\n").await?;
    tokio::fs::write(project_root.join("exp").join("results").join("registry.jsonl"), "").await?;
    tokio::fs::write(project_root.join("reports").join("rolling_report.md"), format!("# Rolling report\n\nGoal: {goal}\n")).await?;
    tokio::fs::write(project_root.join("reports").join("report_digest.md"), "").await?;
    tokio::fs::write(project_root.join("memory").join("WORKING_MEMORY.md"), "").await?;
    tokio::fs::write(project_root.join("memory").join("HANDOFF_LOG.md"), "").await?;
    tokio::fs::write(project_root.join("events.jsonl"), "").await?;

    let state = ResearchManagerState::new(project_root.display().to_string(), goal, discord);
    let state_path = project_root.join("manager").join("state.json");
    tokio::fs::write(&state_path, serde_json::to_vec_pretty(&state)?).await?;

    append_event(&project_root, "research_started", serde_json::json!({ "goal": goal })).await?;

    Ok((project_root, state))
}

pub async fn load_state(project_root: &Path) -> std::io::Result<ResearchManagerState> {
    let bytes = tokio::fs::read(project_root.join("manager").join("state.json")).await?;
    serde_json::from_slice(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn save_state(project_root: &Path, state: &ResearchManagerState) -> std::io::Result<()> {
    let tmp = project_root.join("manager").join("state.json.tmp");
    let path = project_root.join("manager").join("state.json");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
    tokio::fs::rename(&tmp, &path).await
}

pub async fn append_event(project_root: &Path, kind: &str, payload: serde_json::Value) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(project_root.join("events.jsonl"))
        .await?;
    let line = serde_json::json!({ "ts": Utc::now(), "kind": kind, "payload": payload });
    file.write_all(format!("{}\n", line).as_bytes()).await?;
    Ok(())
}

fn slugify(s: &str) -> String {
    let mut out = String::new();
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').chars().take(40).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discord() -> DiscordBinding {
        DiscordBinding { channel_id: "c1".to_string(), guild_id: None }
    }

    #[tokio::test]
    async fn scaffolds_expected_directories_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let (root, state) = scaffold_project(dir.path(), "conv1", "improve accuracy", discord()).await.unwrap();
        for sub in PROJECT_SUBDIRS {
            assert!(root.join(sub).is_dir());
        }
        assert!(root.join("manager").join("state.json").is_file());
        assert_eq!(state.status, ResearchStatus::Running);
    }

    #[test]
    fn lease_expiry_allows_new_holder() {
        let mut state = ResearchManagerState::new("/tmp/p", "goal", discord());
        let t0 = Utc::now();
        assert!(state.try_acquire_lease("a", 1, t0));
        assert!(!state.try_acquire_lease("b", 1, t0));
        let t1 = t0 + chrono::Duration::seconds(2);
        assert!(state.try_acquire_lease("b", 1, t1));
    }

    #[test]
    fn decision_hash_dedup() {
        let mut state = ResearchManagerState::new("/tmp/p", "goal", discord());
        let hash = ResearchManagerState::decision_hash("{\"stepId\":\"s1\"}");
        assert!(!state.has_applied_decision(&hash));
        state.record_applied_decision(hash.clone());
        assert!(state.has_applied_decision(&hash));
    }

    #[test]
    fn budgets_exhausted_blocks_next_step() {
        let mut state = ResearchManagerState::new("/tmp/p", "goal", discord());
        state.budgets.max_steps = 1;
        state.counters.steps = 1;
        assert!(state.budgets_exhausted(Utc::now()));
    }

    #[test]
    fn stale_inflight_step_is_repaired() {
        let mut state = ResearchManagerState::new("/tmp/p", "goal", discord());
        state.inflight_step.status = InflightStatus::Running;
        state.inflight_step.started_at = Some(Utc::now() - chrono::Duration::seconds(600));
        let changed = state.repair_stale_state(Utc::now(), 60);
        assert!(changed);
        assert_eq!(state.inflight_step.status, InflightStatus::Failed);
        assert_eq!(state.status, ResearchStatus::Blocked);
    }

    #[test]
    fn applied_action_keys_are_capped() {
        let mut state = ResearchManagerState::new("/tmp/p", "goal", discord());
        for i in 0..2100 {
            state.record_applied_action(format!("key-{i}"));
        }
        assert_eq!(state.applied_action_keys.len(), MAX_ACTION_KEYS);
        assert!(!state.has_applied_action("key-0"));
        assert!(state.has_applied_action("key-2099"));
    }
}
