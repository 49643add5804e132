//! Command Dispatcher: recognizes the slash-command surface and routes
//! each to a parsed `Command`, with the queue-bypass and task-runner
//! refusal rules the caller enforces before invoking the matching handler.

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Reset,
    Workdir(Option<String>),
    Attach(Option<String>),
    Upload(Option<String>),
    Context(Option<String>),
    Task(Option<String>),
    Worktree(Option<String>),
    Plan(Option<String>),
    Handoff(Option<String>),
    Research(Option<String>),
    Auto(Option<String>),
    Go(Option<String>),
    Overnight(Option<String>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Help => "help",
            Command::Status => "status",
            Command::Reset => "reset",
            Command::Workdir(_) => "workdir",
            Command::Attach(_) => "attach",
            Command::Upload(_) => "upload",
            Command::Context(_) => "context",
            Command::Task(_) => "task",
            Command::Worktree(_) => "worktree",
            Command::Plan(_) => "plan",
            Command::Handoff(_) => "handoff",
            Command::Research(_) => "research",
            Command::Auto(_) => "auto",
            Command::Go(_) => "go",
            Command::Overnight(_) => "overnight",
        }
    }

    /// Bypasses the Conversation Queue per the relay's §4.11 responsiveness rule.
    pub fn bypasses_queue(&self) -> bool {
        match self {
            Command::Status => true,
            Command::Task(Some(rest)) => first_token(rest) == "stop",
            _ => false,
        }
    }

    /// Whether this command is refused with a "stop first" notice while
    /// the Task Runner is active for the conversation.
    pub fn refused_while_task_loop_active(&self) -> bool {
        match self {
            Command::Workdir(_) | Command::Reset | Command::Attach(_) | Command::Go(_) => true,
            Command::Overnight(rest) => first_token(rest.as_deref().unwrap_or("")) != "status",
            Command::Research(rest) => !matches!(first_token(rest.as_deref().unwrap_or("")), "status" | "note"),
            Command::Context(rest) => first_token(rest.as_deref().unwrap_or("")) == "reload",
            _ => false,
        }
    }
}

fn first_token(rest: &str) -> &str {
    rest.trim().split_whitespace().next().unwrap_or("")
}

/// Split "first token, rest" the way sub-command parsing reapplies recursively.
pub fn split_first_token(text: &str) -> (String, Option<String>) {
    let trimmed = text.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head.to_string(), Some(rest.trim().to_string()).filter(|s| !s.is_empty())),
        None => (trimmed.to_string(), None),
    }
}

/// Parse a raw message into a `Command`, or `None` if it doesn't match the
/// recognized slash-command surface at all.
pub fn parse_command(text: &str) -> Option<Command> {
    let re = Regex::new(r"^/(help|status|reset|workdir|attach|upload|context|task|worktree|plan|handoff|research|auto|go|overnight)\b(.*)$").unwrap();
    let caps = re.captures(text.trim())?;
    let name = &caps[1];
    let rest = caps[2].trim();
    let rest_opt = if rest.is_empty() { None } else { Some(rest.to_string()) };

    Some(match name {
        "help" => Command::Help,
        "status" => Command::Status,
        "reset" => Command::Reset,
        "workdir" => Command::Workdir(rest_opt),
        "attach" => Command::Attach(rest_opt),
        "upload" => Command::Upload(rest_opt),
        "context" => Command::Context(rest_opt),
        "task" => Command::Task(rest_opt),
        "worktree" => Command::Worktree(rest_opt),
        "plan" => Command::Plan(rest_opt),
        "handoff" => Command::Handoff(rest_opt),
        "research" => Command::Research(rest_opt),
        "auto" => Command::Auto(rest_opt),
        "go" => Command::Go(rest_opt),
        "overnight" => Command::Overnight(rest_opt),
        _ => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("/status"), Some(Command::Status));
        assert_eq!(parse_command("/help"), Some(Command::Help));
    }

    #[test]
    fn parses_commands_with_arguments() {
        let cmd = parse_command("/workdir /home/user/project").unwrap();
        assert_eq!(cmd, Command::Workdir(Some("/home/user/project".to_string())));
    }

    #[test]
    fn non_command_text_is_not_parsed() {
        assert_eq!(parse_command("hello there"), None);
    }

    #[test]
    fn status_and_task_stop_bypass_the_queue() {
        assert!(Command::Status.bypasses_queue());
        assert!(Command::Task(Some("stop".to_string())).bypasses_queue());
        assert!(!Command::Task(Some("list".to_string())).bypasses_queue());
    }

    #[test]
    fn research_status_and_note_are_allowed_during_task_loop() {
        assert!(!Command::Research(Some("status".to_string())).refused_while_task_loop_active());
        assert!(!Command::Research(Some("note hi".to_string())).refused_while_task_loop_active());
        assert!(Command::Research(Some("start goal".to_string())).refused_while_task_loop_active());
    }

    #[test]
    fn workdir_reset_attach_go_are_always_refused_during_task_loop() {
        assert!(Command::Workdir(None).refused_while_task_loop_active());
        assert!(Command::Reset.refused_while_task_loop_active());
        assert!(Command::Attach(None).refused_while_task_loop_active());
        assert!(Command::Go(Some("x".to_string())).refused_while_task_loop_active());
    }

    #[test]
    fn split_first_token_handles_subcommands() {
        assert_eq!(split_first_token("add do a thing"), ("add".to_string(), Some("do a thing".to_string())));
        assert_eq!(split_first_token("list"), ("list".to_string(), None));
    }
}
