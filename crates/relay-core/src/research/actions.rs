//! Research decision parsing and research-action validation.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchAction {
    JobStart {
        command: String,
        #[serde(default)]
        watch: Option<crate::types::JobWatchConfig>,
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    JobWatch {
        #[serde(default)]
        watch: Option<crate::types::JobWatchConfig>,
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    JobStop {
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    TaskAdd {
        text: String,
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    TaskRun {
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    WriteReport {
        markdown: String,
        #[serde(default)]
        replace: bool,
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    ResearchPause {
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
    ResearchMarkDone {
        #[serde(rename = "idempotencyKey")]
        idempotency_key: String,
    },
}

impl ResearchAction {
    pub fn idempotency_key(&self) -> &str {
        match self {
            ResearchAction::JobStart { idempotency_key, .. }
            | ResearchAction::JobWatch { idempotency_key, .. }
            | ResearchAction::JobStop { idempotency_key, .. }
            | ResearchAction::TaskAdd { idempotency_key, .. }
            | ResearchAction::TaskRun { idempotency_key, .. }
            | ResearchAction::WriteReport { idempotency_key, .. }
            | ResearchAction::ResearchPause { idempotency_key, .. }
            | ResearchAction::ResearchMarkDone { idempotency_key, .. } => idempotency_key,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ResearchAction::JobStart { .. } => "job_start",
            ResearchAction::JobWatch { .. } => "job_watch",
            ResearchAction::JobStop { .. } => "job_stop",
            ResearchAction::TaskAdd { .. } => "task_add",
            ResearchAction::TaskRun { .. } => "task_run",
            ResearchAction::WriteReport { .. } => "write_report",
            ResearchAction::ResearchPause { .. } => "research_pause",
            ResearchAction::ResearchMarkDone { .. } => "research_mark_done",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchDecision {
    #[serde(rename = "stepId")]
    pub step_id: String,
    #[serde(default, rename = "research_update")]
    pub research_update: Option<String>,
    pub actions: Vec<serde_json::Value>,
}

#[derive(Debug)]
pub enum ResearchDecisionError {
    NoBlockFound,
    Malformed(String),
}

/// Extract the single `[[research-decision]]{...}[[/research-decision]]`
/// block from agent output, along with the raw JSON text (used for hashing).
pub fn extract_research_decision(text: &str) -> Result<(ResearchDecision, String), ResearchDecisionError> {
    let re = regex::RegexBuilder::new(r"\[\[research-decision\]\](.*?)\[\[/research-decision\]\]")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap();
    let Some(caps) = re.captures(text) else {
        return Err(ResearchDecisionError::NoBlockFound);
    };
    let body = caps[1].trim().to_string();
    let decision: ResearchDecision = serde_json::from_str(&body).map_err(|e| ResearchDecisionError::Malformed(e.to_string()))?;
    Ok((decision, body))
}

#[derive(Debug)]
pub enum ValidationError {
    NotAllowed(String),
    TooManyActions { max: usize },
    Malformed(String),
}

/// Validate the raw action values against the allowed-type set and a
/// per-step action budget.
pub fn validate_actions(raw_actions: &[serde_json::Value], allowed: &[String], max_per_step: usize) -> Result<Vec<ResearchAction>, ValidationError> {
    if raw_actions.len() > max_per_step {
        return Err(ValidationError::TooManyActions { max: max_per_step });
    }
    let mut decoded = Vec::new();
    for raw in raw_actions {
        let kind = raw.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if !allowed.iter().any(|a| a == &kind) {
            return Err(ValidationError::NotAllowed(kind));
        }
        let action: ResearchAction = serde_json::from_value(raw.clone()).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        decoded.push(action);
    }
    Ok(decoded)
}

pub fn default_allowed_actions() -> Vec<String> {
    vec![
        "job_start".to_string(),
        "job_watch".to_string(),
        "job_stop".to_string(),
        "task_add".to_string(),
        "task_run".to_string(),
        "write_report".to_string(),
        "research_pause".to_string(),
        "research_mark_done".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_decision_block() {
        let text = "notes [[research-decision]]{\"stepId\":\"s1\",\"actions\":[]}[[/research-decision]] trailing";
        let (decision, raw) = extract_research_decision(text).unwrap();
        assert_eq!(decision.step_id, "s1");
        assert!(raw.contains("s1"));
    }

    #[test]
    fn missing_block_is_an_error() {
        let result = extract_research_decision("no block here");
        assert!(matches!(result, Err(ResearchDecisionError::NoBlockFound)));
    }

    #[test]
    fn validates_allowed_action_types() {
        let raw = vec![serde_json::json!({"type": "job_start", "command": "echo hi", "idempotencyKey": "a1"})];
        let allowed = default_allowed_actions();
        let decoded = validate_actions(&raw, &allowed, 5).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].type_name(), "job_start");
    }

    #[test]
    fn rejects_disallowed_action_type() {
        let raw = vec![serde_json::json!({"type": "job_stop", "idempotencyKey": "a1"})];
        let allowed = vec!["task_add".to_string()];
        let result = validate_actions(&raw, &allowed, 5);
        assert!(matches!(result, Err(ValidationError::NotAllowed(_))));
    }

    #[test]
    fn enforces_max_actions_per_step() {
        let raw = vec![
            serde_json::json!({"type": "task_run", "idempotencyKey": "a1"}),
            serde_json::json!({"type": "task_run", "idempotencyKey": "a2"}),
        ];
        let allowed = default_allowed_actions();
        let result = validate_actions(&raw, &allowed, 1);
        assert!(matches!(result, Err(ValidationError::TooManyActions { max: 1 })));
    }
}
