//! Two-way file bridge between the chat platform and the local filesystem:
//! incoming text-attachment ingestion with per-file truncation, and
//! outgoing `[[upload:<path>]]` marker extraction with path-safety checks.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateMode {
    Head,
    Tail,
    HeadTail,
}

impl TruncateMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "head" => Some(TruncateMode::Head),
            "tail" => Some(TruncateMode::Tail),
            "headtail" => Some(TruncateMode::HeadTail),
            _ => None,
        }
    }
}

/// Truncate `s` to at most `n` characters using `mode`. For `n >= len(s)`,
/// returns `s` unchanged.
pub fn truncate_context_by_mode(s: &str, mode: TruncateMode, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= n {
        return s.to_string();
    }
    if n == 0 {
        return String::new();
    }
    match mode {
        TruncateMode::Head => chars[..n].iter().collect(),
        TruncateMode::Tail => chars[chars.len() - n..].iter().collect(),
        TruncateMode::HeadTail => {
            let half = n / 2;
            let head: String = chars[..half].iter().collect();
            let tail_len = n - half;
            let tail: String = chars[chars.len() - tail_len..].iter().collect();
            format!("{head}\n...\n{tail}")
        }
    }
}

/// Heuristic binary detector: a control-character ratio above the threshold
/// means "skip, this is binary".
pub fn looks_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let sample = &bytes[..bytes.len().min(4096)];
    let control = sample
        .iter()
        .filter(|&&b| b == 0 || (b < 0x09) || (b > 0x0d && b < 0x20))
        .count();
    (control as f64) / (sample.len() as f64) > 0.05
}

#[derive(Debug, Clone)]
pub struct IncomingAttachment {
    pub name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IncomingUploadConfig {
    pub max_files: usize,
    pub max_bytes_per_file: u64,
    pub max_total_chars: usize,
    pub default_mode: TruncateMode,
    pub per_file_max_chars: usize,
}

impl Default for IncomingUploadConfig {
    fn default() -> Self {
        IncomingUploadConfig {
            max_files: 5,
            max_bytes_per_file: 512 * 1024,
            max_total_chars: 20_000,
            default_mode: TruncateMode::HeadTail,
            per_file_max_chars: 4_000,
        }
    }
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rs", "py", "js", "ts", "json", "yaml", "yml", "toml", "log", "csv", "sh", "rb", "go", "java", "c", "h", "cpp",
];

fn looks_textual(name: &str, content_type: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        if ct.starts_with("text/") || ct == "application/json" {
            return true;
        }
    }
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Builds the `[Discord Attachments]` block appended to the user prompt.
pub fn build_injected_attachments_block(attachments: &[IncomingAttachment], cfg: &IncomingUploadConfig) -> Option<String> {
    let mut sections = Vec::new();
    let mut total = 0usize;
    for att in attachments.iter().take(cfg.max_files) {
        if att.size > cfg.max_bytes_per_file {
            continue;
        }
        if !looks_textual(&att.name, att.content_type.as_deref()) {
            continue;
        }
        if looks_binary(&att.bytes) {
            continue;
        }
        let text = String::from_utf8_lossy(&att.bytes).to_string();
        let truncated = truncate_context_by_mode(&text, cfg.default_mode, cfg.per_file_max_chars);
        if total + truncated.len() > cfg.max_total_chars {
            break;
        }
        total += truncated.len();
        sections.push(format!("--- {} ---\n{}", att.name, truncated));
    }
    if sections.is_empty() {
        None
    } else {
        Some(format!("[Discord Attachments]\n{}", sections.join("\n\n")))
    }
}

/// Extract `[[upload:<path>]]` markers from agent output, stripping
/// surrounding quotes and a leading `file:` prefix.
pub fn extract_upload_markers(text: &str) -> (String, Vec<String>) {
    let re = regex::Regex::new(r"\[\[upload:\s*([^\]]+?)\s*\]\]").unwrap();
    let mut paths = Vec::new();
    let cleaned = re
        .replace_all(text, |caps: &regex::Captures| {
            let raw = caps[1].trim();
            let raw = raw.trim_matches(|c| c == '"' || c == '\'');
            let raw = raw.strip_prefix("file:").unwrap_or(raw);
            let base = Path::new(raw).file_name().and_then(|n| n.to_str()).unwrap_or(raw).to_string();
            paths.push(raw.to_string());
            format!("[uploaded:{base}]")
        })
        .into_owned();
    (cleaned, paths)
}

#[derive(Debug)]
pub enum OutgoingUploadError {
    OutsideAllowedRoots,
    NotARegularFile,
    TooLarge,
}

/// Resolve and validate a path extracted from `[[upload:...]]` against the
/// configured allowed roots.
pub fn resolve_outgoing_path(
    raw_path: &str,
    conversation_dir: &Path,
    workdir: &Path,
    allowed_roots: &[PathBuf],
    allow_outside_conversation: bool,
    max_bytes: u64,
) -> Result<PathBuf, OutgoingUploadError> {
    let candidate = if Path::new(raw_path).is_absolute() {
        PathBuf::from(raw_path)
    } else if conversation_dir.join(raw_path).exists() {
        conversation_dir.join(raw_path)
    } else {
        workdir.join(raw_path)
    };

    let roots: Vec<&Path> = if allow_outside_conversation {
        allowed_roots.iter().map(|p| p.as_path()).collect()
    } else {
        vec![conversation_dir]
    };

    let is_allowed = roots.iter().any(|root| candidate.starts_with(root));
    if !is_allowed {
        return Err(OutgoingUploadError::OutsideAllowedRoots);
    }
    let meta = std::fs::metadata(&candidate).map_err(|_| OutgoingUploadError::NotARegularFile)?;
    if !meta.is_file() {
        return Err(OutgoingUploadError::NotARegularFile);
    }
    if meta.len() > max_bytes {
        return Err(OutgoingUploadError::TooLarge);
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_unchanged_when_within_bound() {
        assert_eq!(truncate_context_by_mode("hello", TruncateMode::Head, 100), "hello");
    }

    #[test]
    fn truncate_head_takes_prefix() {
        assert_eq!(truncate_context_by_mode("abcdef", TruncateMode::Head, 3), "abc");
    }

    #[test]
    fn truncate_tail_takes_suffix() {
        assert_eq!(truncate_context_by_mode("abcdef", TruncateMode::Tail, 3), "def");
    }

    #[test]
    fn truncate_headtail_keeps_both_ends() {
        let out = truncate_context_by_mode("abcdefghij", TruncateMode::HeadTail, 6);
        assert!(out.starts_with("abc"));
        assert!(out.ends_with("hij") || out.ends_with("ghij"));
    }

    #[test]
    fn binary_detection_flags_null_bytes() {
        let bytes = vec![0u8; 100];
        assert!(looks_binary(&bytes));
        assert!(!looks_binary(b"plain ascii text"));
    }

    #[test]
    fn upload_marker_extraction_round_trips_surrounding_text() {
        let text = "before [[upload: /tmp/report.txt]] after";
        let (cleaned, paths) = extract_upload_markers(text);
        assert_eq!(paths, vec!["/tmp/report.txt".to_string()]);
        assert_eq!(cleaned, "before [uploaded:report.txt] after");
    }

    #[test]
    fn resolve_outgoing_path_rejects_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let conv_dir = dir.path().join("conv");
        std::fs::create_dir_all(&conv_dir).unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, "x").unwrap();
        let result = resolve_outgoing_path(
            outside.to_str().unwrap(),
            &conv_dir,
            dir.path(),
            &[conv_dir.clone()],
            false,
            1024,
        );
        assert!(matches!(result, Err(OutgoingUploadError::OutsideAllowedRoots)));
    }

    #[test]
    fn resolve_outgoing_path_accepts_inside_conversation_dir() {
        let dir = tempfile::tempdir().unwrap();
        let conv_dir = dir.path().join("conv");
        std::fs::create_dir_all(&conv_dir).unwrap();
        let file = conv_dir.join("out.txt");
        std::fs::write(&file, "x").unwrap();
        let result = resolve_outgoing_path(file.to_str().unwrap(), &conv_dir, dir.path(), &[conv_dir.clone()], false, 1024);
        assert!(result.is_ok());
    }
}
