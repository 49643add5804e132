//! Plan Subsystem: one-shot plan generation, on-disk plan files, and
//! parsing a plan's "Task breakdown" section into queued tasks.

use chrono::Utc;
use regex::Regex;

/// Find a heading matching "Task breakdown" (any level) and return its body
/// up to the next heading of equal-or-shallower level. Falls back to the
/// whole plan when no such heading exists.
fn task_breakdown_section(plan_text: &str) -> &str {
    let heading_re = Regex::new(r"(?im)^(#+)\s*task breakdown\s*$").unwrap();
    let Some(m) = heading_re.find(plan_text) else {
        return plan_text;
    };
    let heading_line_end = plan_text[m.end()..].find('\n').map(|i| m.end() + i + 1).unwrap_or(plan_text.len());
    let level = plan_text[m.start()..m.end()].chars().take_while(|c| *c == '#').count();
    let rest = &plan_text[heading_line_end..];

    let any_heading_re = Regex::new(r"(?m)^(#+)\s").unwrap();
    for cap in any_heading_re.captures_iter(rest) {
        let this_level = cap[1].len();
        if this_level <= level {
            let pos = cap.get(0).unwrap().start();
            return &rest[..pos];
        }
    }
    rest
}

/// Extract step texts in priority order: markdown task-list bullets, then
/// numbered items, then plain bullets.
pub fn parse_plan_task_breakdown_steps(plan_text: &str) -> Vec<String> {
    let section = task_breakdown_section(plan_text);

    let task_list_re = Regex::new(r"(?m)^\s*[-*]\s*\[[ xX]\]\s*(.+)$").unwrap();
    let numbered_re = Regex::new(r"(?m)^\s*\d+[.)]\s*(.+)$").unwrap();
    let bullet_re = Regex::new(r"(?m)^\s*[-*]\s*(.+)$").unwrap();

    let task_list: Vec<String> = task_list_re.captures_iter(section).map(|c| c[1].trim().to_string()).collect();
    if !task_list.is_empty() {
        return task_list;
    }
    let numbered: Vec<String> = numbered_re.captures_iter(section).map(|c| c[1].trim().to_string()).collect();
    if !numbered.is_empty() {
        return numbered;
    }
    bullet_re.captures_iter(section).map(|c| c[1].trim().to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub id: String,
    pub title: String,
    pub workdir: String,
    pub path: String,
    pub request: String,
}

pub fn new_plan_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    format!("p-{stamp}-{}", uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect::<String>())
}

/// Deterministic on-disk path for a plan file.
pub fn plan_path(plans_dir: &std::path::Path, conv_slug: &str, plan_id: &str) -> std::path::PathBuf {
    plans_dir.join(conv_slug).join(format!("{plan_id}.md"))
}

/// Repo-context block seeded into plan-generation prompts, when the workdir
/// is a git repository.
pub fn repo_context_block(gm: &crate::git_manager::GitManager) -> String {
    let branch = gm.current_branch().unwrap_or_else(|_| "<unknown>".to_string());
    let dirty = gm.has_uncommitted_changes().unwrap_or(false);
    format!("Current branch: {branch}\nUncommitted changes: {dirty}")
}

/// Append new pending tasks from `steps`, skipping duplicates by text
/// against any existing pending/running task, and enforcing `max_pending`.
pub fn dedupe_new_steps(existing_texts: &[String], steps: Vec<String>, max_pending: usize, current_pending: usize) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> = existing_texts.iter().cloned().collect();
    let mut accepted = Vec::new();
    let mut budget = max_pending.saturating_sub(current_pending);
    for step in steps {
        if budget == 0 {
            break;
        }
        if seen.contains(&step) {
            continue;
        }
        seen.insert(step.clone());
        accepted.push(step);
        budget -= 1;
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "# Plan\n\nSome prose.\n\n## Task breakdown\n\n- [ ] write the parser\n- [ ] write tests\n- [x] done already\n\n## Risks\n\nSome risk.\n";

    #[test]
    fn extracts_task_list_bullets() {
        let steps = parse_plan_task_breakdown_steps(PLAN);
        assert_eq!(steps, vec!["write the parser", "write tests", "done already"]);
    }

    #[test]
    fn falls_back_to_numbered_items() {
        let plan = "## Task breakdown\n\n1. first step\n2. second step\n\n## Next\nmore text";
        let steps = parse_plan_task_breakdown_steps(plan);
        assert_eq!(steps, vec!["first step", "second step"]);
    }

    #[test]
    fn falls_back_to_whole_plan_without_heading() {
        let plan = "- do a\n- do b\n";
        let steps = parse_plan_task_breakdown_steps(plan);
        assert_eq!(steps, vec!["do a", "do b"]);
    }

    #[test]
    fn reparsing_own_step_list_is_idempotent() {
        let steps = parse_plan_task_breakdown_steps(PLAN);
        let rejoined = format!("## Task breakdown\n\n- {}\n", steps.join("\n- "));
        let reparsed = parse_plan_task_breakdown_steps(&rejoined);
        assert_eq!(steps, reparsed);
    }

    #[test]
    fn dedupes_against_existing_and_respects_budget() {
        let existing = vec!["write tests".to_string()];
        let steps = vec!["write the parser".to_string(), "write tests".to_string(), "ship it".to_string()];
        let accepted = dedupe_new_steps(&existing, steps, 2, 0);
        assert_eq!(accepted, vec!["write the parser", "ship it"]);
    }
}
