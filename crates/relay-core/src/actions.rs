//! Scans agent final text for a `[[relay-actions]]{...}[[/relay-actions]]`
//! block and decodes it into validated action records.

use crate::types::JobWatchConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayAction {
    JobStart {
        command: String,
        #[serde(default)]
        watch: Option<JobWatchConfig>,
    },
    JobWatch {
        #[serde(default)]
        watch: Option<JobWatchConfig>,
    },
    JobStop {},
    TaskAdd {
        text: String,
    },
    TaskRun {},
}

#[derive(Debug, Clone, Deserialize)]
struct RawActionEnvelope {
    actions: Vec<serde_json::Value>,
}

#[derive(Debug)]
pub enum ActionError {
    TooManyActions { max: usize },
    UnknownType(String),
    FieldTooLong { field: &'static str, max: usize },
    Malformed(String),
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::TooManyActions { max } => write!(f, "too many actions in one message (max {max})"),
            ActionError::UnknownType(t) => write!(f, "unknown action type `{t}`"),
            ActionError::FieldTooLong { field, max } => write!(f, "field `{field}` exceeds {max} characters"),
            ActionError::Malformed(m) => write!(f, "malformed action block: {m}"),
        }
    }
}

/// Find the first `[[relay-actions]]...[[/relay-actions]]` block, parse it,
/// and return validated actions plus the text with that block removed. Other
/// text is preserved byte-for-byte. At most `max_actions` are returned.
pub fn extract_relay_actions(text: &str, max_actions: usize) -> (String, Result<Vec<RelayAction>, ActionError>) {
    let re = regex::RegexBuilder::new(r"\[\[relay-actions\]\](.*?)\[\[/relay-actions\]\]")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap();

    let Some(caps) = re.captures(text) else {
        return (text.to_string(), Ok(Vec::new()));
    };
    let whole_match = caps.get(0).unwrap();
    let body = caps[1].trim();
    let cleaned = format!("{}{}", &text[..whole_match.start()], &text[whole_match.end()..]);

    let envelope: RawActionEnvelope = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return (cleaned, Err(ActionError::Malformed(e.to_string()))),
    };

    if envelope.actions.len() > max_actions {
        return (cleaned, Err(ActionError::TooManyActions { max: max_actions }));
    }

    let mut decoded = Vec::new();
    for raw in envelope.actions {
        match validate_one(&raw) {
            Ok(action) => decoded.push(action),
            Err(e) => return (cleaned, Err(e)),
        }
    }
    (cleaned, Ok(decoded))
}

fn validate_one(raw: &serde_json::Value) -> Result<RelayAction, ActionError> {
    let kind = raw.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
    match kind.as_str() {
        "job_start" => {
            let command = raw.get("command").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if command.is_empty() {
                return Err(ActionError::Malformed("job_start requires a command".to_string()));
            }
            if command.len() > 4000 {
                return Err(ActionError::FieldTooLong { field: "command", max: 4000 });
            }
            let watch = raw.get("watch").and_then(|v| serde_json::from_value::<JobWatchConfig>(v.clone()).ok()).map(|w| w.clamped());
            Ok(RelayAction::JobStart { command, watch })
        }
        "job_watch" => {
            let watch = raw.get("watch").and_then(|v| serde_json::from_value::<JobWatchConfig>(v.clone()).ok()).map(|w| w.clamped());
            Ok(RelayAction::JobWatch { watch })
        }
        "job_stop" => Ok(RelayAction::JobStop {}),
        "task_add" => {
            let text = raw.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if text.is_empty() {
                return Err(ActionError::Malformed("task_add requires text".to_string()));
            }
            if text.len() > 2000 {
                return Err(ActionError::FieldTooLong { field: "text", max: 2000 });
            }
            Ok(RelayAction::TaskAdd { text })
        }
        "task_run" => Ok(RelayAction::TaskRun {}),
        other => Err(ActionError::UnknownType(other.to_string())),
    }
}

pub fn action_type_name(action: &RelayAction) -> &'static str {
    match action {
        RelayAction::JobStart { .. } => "job_start",
        RelayAction::JobWatch { .. } => "job_watch",
        RelayAction::JobStop {} => "job_stop",
        RelayAction::TaskAdd { .. } => "task_add",
        RelayAction::TaskRun {} => "task_run",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_cleans_block() {
        let text = "before [[relay-actions]]{\"actions\":[{\"type\":\"task_add\",\"text\":\"do x\"}]}[[/relay-actions]] after";
        let (cleaned, result) = extract_relay_actions(text, 5);
        assert_eq!(cleaned, "before  after");
        let actions = result.unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], RelayAction::TaskAdd { text } if text == "do x"));
    }

    #[test]
    fn no_block_returns_empty_and_untouched_text() {
        let (cleaned, result) = extract_relay_actions("just a normal reply", 5);
        assert_eq!(cleaned, "just a normal reply");
        assert!(result.unwrap().is_empty());
    }

    #[test]
    fn rejects_unknown_type() {
        let text = "[[relay-actions]]{\"actions\":[{\"type\":\"nuke\"}]}[[/relay-actions]]";
        let (_, result) = extract_relay_actions(text, 5);
        assert!(matches!(result, Err(ActionError::UnknownType(_))));
    }

    #[test]
    fn enforces_max_actions_per_message() {
        let text = "[[relay-actions]]{\"actions\":[{\"type\":\"task_run\"},{\"type\":\"task_run\"}]}[[/relay-actions]]";
        let (_, result) = extract_relay_actions(text, 1);
        assert!(matches!(result, Err(ActionError::TooManyActions { max: 1 })));
    }

    #[test]
    fn job_start_requires_command() {
        let text = "[[relay-actions]]{\"actions\":[{\"type\":\"job_start\"}]}[[/relay-actions]]";
        let (_, result) = extract_relay_actions(text, 5);
        assert!(result.is_err());
    }

    #[test]
    fn job_start_clamps_watch_fields() {
        let text = "[[relay-actions]]{\"actions\":[{\"type\":\"job_start\",\"command\":\"echo hi\",\"watch\":{\"enabled\":true,\"every_sec\":0,\"tail_lines\":99999,\"then_task\":null,\"run_tasks\":false}}]}[[/relay-actions]]";
        let (_, result) = extract_relay_actions(text, 5);
        let actions = result.unwrap();
        if let RelayAction::JobStart { watch: Some(w), .. } = &actions[0] {
            assert_eq!(w.every_sec, 1);
            assert_eq!(w.tail_lines, 500);
        } else {
            panic!("expected job_start with watch");
        }
    }
}
