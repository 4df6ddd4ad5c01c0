//! Context sanitizing for the fight handoff.
//!
//! The raw gathering buffer is mostly terminal chrome: spinners, status
//! words, durations. The fight agents only need what the assistant actually
//! looked at (file contents, search hits, code) and substantive prose.

use std::sync::LazyLock;

use regex::Regex;

/// Default cap on the sanitized context, in characters.
pub const MAX_CONTEXT_CHARS: usize = 30_000;

struct Patterns {
    spinner: Regex,
    thinking: Regex,
    duration: Regex,
    token_count: Regex,
    file_content: Regex,
    search_hit: Regex,
    file_path: Regex,
    tool_output: Regex,
    indented: Regex,
    code_punct: Regex,
    exploration_call: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    spinner: Regex::new(r"^[⏳⏺✳⚡↓↑]\s").unwrap(),
    thinking: Regex::new(r"(?i)thinking|Improvising|Whirring|Razzle").unwrap(),
    duration: Regex::new(r"^\s*\d+[ms]\s*$").unwrap(),
    token_count: Regex::new(r"tokens?\s*$").unwrap(),
    file_content: Regex::new(r"^\s*\d+→").unwrap(),
    search_hit: Regex::new(r"^[/\w].*:\d+:").unwrap(),
    file_path: Regex::new(r"^[/\w][\w\-/.]+\.\w{1,6}$").unwrap(),
    tool_output: Regex::new(r"^⎿").unwrap(),
    indented: Regex::new(r"^\s{2,}").unwrap(),
    code_punct: Regex::new(r"[{};=()>]").unwrap(),
    exploration_call: Regex::new(r"(?:Read|Grep|Glob|Search)\(").unwrap(),
});

/// What to do with one line of the raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Keep,
    /// Numbered file-content line; blank lines after it are separators.
    KeepFileContent,
    Drop,
    /// Unrecognized line; also ends file-content mode.
    DropOther,
    Blank,
}

fn judge(line: &str) -> Verdict {
    let p = &*PATTERNS;
    let len = line.chars().count();

    if line.trim().is_empty() {
        return Verdict::Blank;
    }
    if p.spinner.is_match(line)
        || (p.thinking.is_match(line) && len < 80)
        || p.duration.is_match(line)
        || (p.token_count.is_match(line) && len < 40)
    {
        return Verdict::Drop;
    }
    if p.file_content.is_match(line) {
        return Verdict::KeepFileContent;
    }
    if p.search_hit.is_match(line)
        || p.file_path.is_match(line.trim())
        || p.tool_output.is_match(line)
        || p.indented.is_match(line)
        || p.code_punct.is_match(line)
        || p.exploration_call.is_match(line)
        || len > 60
    {
        return Verdict::Keep;
    }
    Verdict::DropOther
}

/// Filter a raw gathering buffer down to substantive content and keep at
/// most the trailing `max_chars` characters.
pub fn sanitize(raw: &str, max_chars: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut in_file_content = false;
    // Whether the last kept line was numbered file content.
    let mut after_file_line = false;

    for line in raw.split('\n') {
        match judge(line) {
            Verdict::Blank => {
                if in_file_content && after_file_line {
                    kept.push("");
                    after_file_line = false;
                }
            }
            Verdict::KeepFileContent => {
                in_file_content = true;
                after_file_line = true;
                kept.push(line);
            }
            Verdict::Keep => {
                after_file_line = false;
                kept.push(line);
            }
            Verdict::Drop => {}
            Verdict::DropOther => in_file_content = false,
        }
    }

    while kept.last().is_some_and(|l| l.is_empty()) {
        kept.pop();
    }

    keep_tail(&kept.join("\n"), max_chars)
}

/// The last `max_chars` characters of `text`.
pub fn keep_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    match text.char_indices().nth(total - max_chars) {
        Some((idx, _)) => text[idx..].to_string(),
        None => String::new(),
    }
}
