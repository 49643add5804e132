//! Research Manager: the autonomous plan-act-observe loop. `state` holds
//! the on-disk project and typed manager state; `actions` holds decision
//! parsing and research-action validation. This module wires the two
//! together into step execution, the job-completion hook, and auto-tick
//! scheduling.

pub mod actions;
pub mod state;

pub use actions::{validate_actions, extract_research_decision, default_allowed_actions, ResearchAction, ResearchDecisionError, ValidationError};
pub use state::{load_state, save_state, scaffold_project, DiscordBinding, ResearchManagerState, ResearchPhase, ResearchStatus};

use crate::error::{RelayError, RelayResult};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug)]
pub enum StepResult {
    Applied,
    Waiting,
    SkippedAnotherInFlight,
    SkippedDuplicateDecision,
    Blocked(String),
}

pub struct ResearchConfig {
    pub lease_ttl_sec: i64,
    pub inflight_ttl_sec: i64,
    pub max_actions_per_step: usize,
    pub allowed_actions: Vec<String>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        ResearchConfig {
            lease_ttl_sec: 180,
            inflight_ttl_sec: 600,
            max_actions_per_step: 5,
            allowed_actions: default_allowed_actions(),
        }
    }
}

/// A seam for applying one validated action; the caller wires in the real
/// Job Manager / Task Runner / report-writer so this module stays free of a
/// direct dependency on them.
#[async_trait::async_trait]
pub trait ResearchActionApplier: Send + Sync {
    async fn apply(&self, project_root: &Path, action: &ResearchAction) -> RelayResult<()>;
}

/// Run one manager step: load, repair, budget-check, lease, prompt+decide
/// (delegated to `decide`), validate, apply, persist.
pub async fn run_step<F, Fut>(
    project_root: &Path,
    holder: &str,
    cfg: &ResearchConfig,
    applier: &dyn ResearchActionApplier,
    decide: F,
) -> RelayResult<StepResult>
where
    F: FnOnce(ResearchManagerState) -> Fut,
    Fut: std::future::Future<Output = RelayResult<String>>,
{
    let mut manager_state = load_state(project_root).await?;
    let now = Utc::now();

    if manager_state.repair_stale_state(now, cfg.inflight_ttl_sec) {
        save_state(project_root, &manager_state).await?;
        state::append_event(project_root, "stale_state_repaired", serde_json::json!({})).await?;
    }

    if manager_state.budgets_exhausted(now) {
        manager_state.status = ResearchStatus::Blocked;
        save_state(project_root, &manager_state).await?;
        return Ok(StepResult::Blocked("budget exhausted".to_string()));
    }

    if manager_state.active.job_id.is_some() {
        return Ok(StepResult::Waiting);
    }

    if !manager_state.try_acquire_lease(holder, cfg.lease_ttl_sec, now) {
        return Ok(StepResult::SkippedAnotherInFlight);
    }

    manager_state.inflight_step = state::InflightStep {
        step_id: None,
        decision_hash: None,
        status: state::InflightStatus::Running,
        started_at: Some(now),
        error: None,
    };
    save_state(project_root, &manager_state).await?;

    let decision_text = match decide(manager_state.clone()).await {
        Ok(text) => text,
        Err(e) => {
            manager_state.inflight_step.status = state::InflightStatus::Failed;
            manager_state.inflight_step.error = Some(e.user_message());
            manager_state.status = ResearchStatus::Blocked;
            manager_state.release_lease();
            save_state(project_root, &manager_state).await?;
            return Err(e);
        }
    };

    let (decision, raw_json) = match extract_research_decision(&decision_text) {
        Ok(v) => v,
        Err(_) => {
            manager_state.inflight_step.status = state::InflightStatus::Failed;
            manager_state.inflight_step.error = Some("no valid research-decision block found".to_string());
            manager_state.status = ResearchStatus::Blocked;
            manager_state.release_lease();
            save_state(project_root, &manager_state).await?;
            return Ok(StepResult::Blocked("malformed decision".to_string()));
        }
    };

    let decision_hash = ResearchManagerState::decision_hash(&raw_json);
    if manager_state.has_applied_decision(&decision_hash) {
        manager_state.release_lease();
        save_state(project_root, &manager_state).await?;
        return Ok(StepResult::SkippedDuplicateDecision);
    }

    let validated = match validate_actions(&decision.actions, &cfg.allowed_actions, cfg.max_actions_per_step) {
        Ok(v) => v,
        Err(_) => {
            manager_state.inflight_step.status = state::InflightStatus::Failed;
            manager_state.status = ResearchStatus::Blocked;
            manager_state.release_lease();
            save_state(project_root, &manager_state).await?;
            return Ok(StepResult::Blocked("invalid actions in decision".to_string()));
        }
    };

    let mut applied_count = 0;
    for action in &validated {
        if manager_state.has_applied_action(action.idempotency_key()) {
            info!(key = action.idempotency_key(), "research action already applied, skipping");
            continue;
        }
        match applier.apply(project_root, action).await {
            Ok(()) => {
                manager_state.record_applied_action(action.idempotency_key().to_string());
                applied_count += 1;
            }
            Err(e) => {
                manager_state.inflight_step.status = state::InflightStatus::Failed;
                manager_state.inflight_step.error = Some(e.user_message());
                manager_state.status = ResearchStatus::Blocked;
                manager_state.auto_run = false;
                manager_state.release_lease();
                save_state(project_root, &manager_state).await?;
                return Err(e);
            }
        }
    }
    let _ = applied_count;

    manager_state.counters.steps += 1;
    manager_state.record_applied_decision(decision_hash.clone());
    manager_state.phase = if manager_state.active.job_id.is_some() { ResearchPhase::Wait } else { ResearchPhase::Analyze };
    manager_state.inflight_step.status = state::InflightStatus::Applied;
    manager_state.inflight_step.decision_hash = Some(decision_hash);
    manager_state.last_decision_at = Some(now);
    manager_state.last_update_at = now;
    if manager_state.status == ResearchStatus::Blocked {
        // an action may have requested pause/mark-done; leave as set.
    } else {
        manager_state.status = ResearchStatus::Running;
    }
    manager_state.release_lease();
    save_state(project_root, &manager_state).await?;

    Ok(StepResult::Applied)
}

/// Validate a completed research job's `metrics.json` and append a
/// registry entry. Returns whether the run was valid.
pub async fn handle_job_completion(project_root: &Path, run_id: &str, metrics_path: &Path, exit_code: Option<i32>) -> RelayResult<bool> {
    let metrics_text = tokio::fs::read_to_string(metrics_path).await.ok();
    let parsed: Option<serde_json::Value> = metrics_text.as_deref().and_then(|t| serde_json::from_str(t).ok());
    let valid = matches!(&parsed, Some(serde_json::Value::Object(_)));

    let entry = if valid {
        serde_json::json!({ "run_id": run_id, "exit_code": exit_code, "status": "ok", "metrics": parsed })
    } else {
        serde_json::json!({ "run_id": run_id, "exit_code": exit_code, "status": "invalid", "notes": "missing_or_invalid_metrics: metrics.json was absent or not a JSON object" })
    };

    let registry_path = project_root.join("exp").join("results").join("registry.jsonl");
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&registry_path).await.map_err(RelayError::Filesystem)?;
    file.write_all(format!("{}\n", entry).as_bytes()).await.map_err(RelayError::Filesystem)?;

    let mut manager_state = load_state(project_root).await.map_err(RelayError::Filesystem)?;
    manager_state.active = state::ActiveRun::default();
    if !valid {
        manager_state.status = ResearchStatus::Blocked;
        manager_state.auto_run = false;
        warn!(run_id, "research run produced invalid metrics; blocking autorun");
    }
    save_state(project_root, &manager_state).await.map_err(RelayError::Filesystem)?;
    state::append_event(project_root, "job_completed", entry.clone()).await.map_err(RelayError::Filesystem)?;

    Ok(valid)
}

/// Tracks which conversations currently have an auto-step dispatched, to
/// avoid concurrent re-entry from the tick scheduler.
#[derive(Default)]
pub struct AutoTickReentryGuard {
    inflight: Mutex<HashSet<String>>,
}

impl AutoTickReentryGuard {
    pub fn new() -> Self {
        AutoTickReentryGuard::default()
    }

    /// Returns true if this conversation was not already dispatched (i.e.
    /// the caller should proceed).
    pub fn try_begin(&self, conversation_key: &str) -> bool {
        self.inflight.lock().unwrap().insert(conversation_key.to_string())
    }

    pub fn end(&self, conversation_key: &str) {
        self.inflight.lock().unwrap().remove(conversation_key);
    }
}

/// Eligibility check used by the auto-tick scanner: a project is due for an
/// autostep if it's running, autoRun is set, it isn't waiting on a job, and
/// nothing is currently in flight for it.
pub fn is_due_for_autostep(state: &ResearchManagerState) -> bool {
    state.status == ResearchStatus::Running
        && state.auto_run
        && state.phase != ResearchPhase::Wait
        && state.active.job_id.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingApplier;
    #[async_trait::async_trait]
    impl ResearchActionApplier for RecordingApplier {
        async fn apply(&self, _project_root: &Path, _action: &ResearchAction) -> RelayResult<()> {
            Ok(())
        }
    }

    fn discord() -> DiscordBinding {
        DiscordBinding { channel_id: "c1".to_string(), guild_id: None }
    }

    #[tokio::test]
    async fn happy_path_applies_one_job_start() {
        let dir = tempfile::tempdir().unwrap();
        let (root, _state) = scaffold_project(dir.path(), "conv1", "improve accuracy", discord()).await.unwrap();
        let cfg = ResearchConfig::default();
        let applier = RecordingApplier;

        let result = run_step(&root, "holder-1", &cfg, &applier, |_s| async move {
            Ok("[[research-decision]]{\"stepId\":\"s1\",\"actions\":[{\"type\":\"job_start\",\"command\":\"echo hi\",\"idempotencyKey\":\"a1\"}]}[[/research-decision]]".to_string())
        }).await.unwrap();

        assert!(matches!(result, StepResult::Applied));
        let state = load_state(&root).await.unwrap();
        assert_eq!(state.counters.steps, 1);
        assert_eq!(state.applied_action_keys.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_decision_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (root, _state) = scaffold_project(dir.path(), "conv1", "goal", discord()).await.unwrap();
        let cfg = ResearchConfig::default();
        let applier = RecordingApplier;
        let decision = "[[research-decision]]{\"stepId\":\"s1\",\"actions\":[]}[[/research-decision]]".to_string();

        let d1 = decision.clone();
        run_step(&root, "h", &cfg, &applier, move |_s| async move { Ok(d1) }).await.unwrap();
        let d2 = decision.clone();
        let second = run_step(&root, "h", &cfg, &applier, move |_s| async move { Ok(d2) }).await.unwrap();
        assert!(matches!(second, StepResult::SkippedDuplicateDecision));
    }

    #[tokio::test]
    async fn budget_exhaustion_blocks_without_deciding() {
        let dir = tempfile::tempdir().unwrap();
        let (root, mut state) = scaffold_project(dir.path(), "conv1", "goal", discord()).await.unwrap();
        state.budgets.max_steps = 0;
        save_state(&root, &state).await.unwrap();
        let cfg = ResearchConfig::default();
        let applier = RecordingApplier;
        let result = run_step(&root, "h", &cfg, &applier, |_s| async move { panic!("should not be called") }).await.unwrap();
        assert!(matches!(result, StepResult::Blocked(_)));
    }

    #[tokio::test]
    async fn job_completion_with_missing_metrics_blocks_autorun() {
        let dir = tempfile::tempdir().unwrap();
        let (root, _state) = scaffold_project(dir.path(), "conv1", "goal", discord()).await.unwrap();
        let missing_path = root.join("exp/results/r0001/metrics.json");
        let valid = handle_job_completion(&root, "r0001", &missing_path, Some(0)).await.unwrap();
        assert!(!valid);
        let state = load_state(&root).await.unwrap();
        assert_eq!(state.status, ResearchStatus::Blocked);
        assert!(!state.auto_run);
    }

    #[test]
    fn reentry_guard_prevents_concurrent_dispatch() {
        let guard = AutoTickReentryGuard::new();
        assert!(guard.try_begin("conv1"));
        assert!(!guard.try_begin("conv1"));
        guard.end("conv1");
        assert!(guard.try_begin("conv1"));
    }
}
