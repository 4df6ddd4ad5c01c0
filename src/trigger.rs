//! Trigger phrase detection and gating.
//!
//! The user starts an arena fight by typing `arena-fight <task>` into the
//! hosted shell. Keystrokes are mirrored here before they reach the PTY so
//! the command can be recognized on Enter. A command recalled from shell
//! history never passes through the mirror as text, so after an unmatched
//! Enter the echoed output is scanned for a short window instead.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::line::strip_ansi;

const BACKSPACE: char = '\x7f';
const CTRL_H: char = '\x08';
const CTRL_U: char = '\x15';

/// Tail appended to the command before Enter; removed again when the command
/// is read back from echoed output.
static ECHOED_INSTRUCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*—\s*IMPORTANT.*$").unwrap());

/// Compiled `<phrase> <task>` matcher.
#[derive(Debug, Clone)]
pub struct TriggerPattern {
    regex: Regex,
}

impl TriggerPattern {
    pub fn new(phrase: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!(r"(?i){}\s+(.+)", regex::escape(phrase.trim())))?;
        Ok(Self { regex })
    }

    /// Extract the task from a typed command line.
    ///
    /// Quote characters are removed and the result trimmed; an empty task is
    /// no match.
    pub fn match_typed(&self, input: &str) -> Option<String> {
        let caps = self.regex.captures(input)?;
        let task = caps[1].replace(['\'', '"'], "");
        non_empty(task.trim())
    }

    /// Extract the task from an echoed output line, dropping the appended
    /// instruction if the echo carries it.
    pub fn match_echoed(&self, line: &str) -> Option<String> {
        let caps = self.regex.captures(line)?;
        let task = caps[1].replace(['\'', '"'], "");
        let task = ECHOED_INSTRUCTION_RE.replace(&task, "");
        non_empty(task.trim())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Mirror of what the user has typed on the current shell line.
#[derive(Debug, Default)]
pub struct InputMirror {
    buffer: String,
}

impl InputMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one keystroke. On Enter the mirrored line is returned (escape
    /// sequences removed) and the mirror is cleared.
    pub fn push(&mut self, ch: char) -> Option<String> {
        match ch {
            '\r' | '\n' => {
                let line = strip_ansi(&std::mem::take(&mut self.buffer));
                Some(line)
            }
            BACKSPACE | CTRL_H => {
                self.buffer.pop();
                None
            }
            CTRL_U => {
                self.buffer.clear();
                None
            }
            other => {
                self.buffer.push(other);
                None
            }
        }
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}

/// Short window after an unmatched Enter in which echoed output is checked
/// for a recalled trigger command.
#[derive(Debug, Default)]
pub struct EchoWindow {
    closes_at: Option<Instant>,
}

impl EchoWindow {
    pub fn arm(&mut self, now: Instant, length: Duration) {
        self.closes_at = Some(now + length);
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.closes_at.is_some_and(|t| now < t)
    }

    pub fn close(&mut self) {
        self.closes_at = None;
    }

    /// Drop an expired deadline.
    pub fn expire(&mut self, now: Instant) {
        if !self.is_open(now) {
            self.closes_at = None;
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.closes_at.is_some()
    }
}

/// Cooldown and per-task dedup checks gating the start of a new cycle.
#[derive(Debug)]
pub struct TriggerGate {
    cooldown: Duration,
    dedup_window: Duration,
    cooldown_until: Option<Instant>,
    /// Lower-cased task → dedup expiry.
    recent_tasks: HashMap<String, Instant>,
}

impl TriggerGate {
    pub fn new(cooldown: Duration, dedup_window: Duration) -> Self {
        Self {
            cooldown,
            dedup_window,
            cooldown_until: None,
            recent_tasks: HashMap::new(),
        }
    }

    pub fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn start_cooldown(&mut self, now: Instant) {
        self.cooldown_until = Some(now + self.cooldown);
    }

    #[cfg(test)]
    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// Reserve a dedup slot for `task`. Returns false if the same task
    /// (case-insensitive) was claimed within the dedup window.
    pub fn claim(&mut self, task: &str, now: Instant) -> bool {
        self.recent_tasks.retain(|_, expires| now < *expires);

        let key = task.to_lowercase();
        if self.recent_tasks.contains_key(&key) {
            return false;
        }
        self.recent_tasks.insert(key, now + self.dedup_window);
        true
    }

    #[cfg(test)]
    pub fn recent_len(&self) -> usize {
        self.recent_tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> TriggerPattern {
        TriggerPattern::new("arena-fight").unwrap()
    }

    #[test]
    fn typed_command_with_quotes() {
        let p = pattern();
        assert_eq!(
            p.match_typed("arena-fight \"fix the bug\"").as_deref(),
            Some("fix the bug")
        );
        assert_eq!(
            p.match_typed("arena-fight 'add dark mode'").as_deref(),
            Some("add dark mode")
        );
    }

    #[test]
    fn typed_command_is_case_insensitive_and_may_be_prefixed() {
        let p = pattern();
        assert_eq!(
            p.match_typed("> Arena-Fight add retries").as_deref(),
            Some("add retries")
        );
    }

    #[test]
    fn phrase_without_task_is_no_match() {
        let p = pattern();
        assert!(p.match_typed("arena-fight").is_none());
        assert!(p.match_typed("arena-fight \"\"").is_none());
        assert!(p.match_typed("ls -la").is_none());
    }

    #[test]
    fn phrase_is_matched_literally() {
        let p = TriggerPattern::new("fight.now").unwrap();
        assert!(p.match_typed("fightXnow do it").is_none());
        assert_eq!(p.match_typed("fight.now do it").as_deref(), Some("do it"));
    }

    #[test]
    fn echoed_command_drops_instruction_tail() {
        let p = pattern();
        let line = "> arena-fight fix the bug — IMPORTANT: This is an arena-fight request.";
        assert_eq!(p.match_echoed(line).as_deref(), Some("fix the bug"));
    }

    #[test]
    fn mirror_returns_line_on_enter_and_clears() {
        let mut m = InputMirror::new();
        for ch in "arena-fight x".chars() {
            assert!(m.push(ch).is_none());
        }
        assert_eq!(m.push('\r').as_deref(), Some("arena-fight x"));
        assert_eq!(m.as_str(), "");
    }

    #[test]
    fn mirror_backspace_and_line_kill() {
        let mut m = InputMirror::new();
        for ch in "abcd".chars() {
            m.push(ch);
        }
        m.push('\x7f');
        m.push('\x08');
        assert_eq!(m.as_str(), "ab");
        m.push('\x15');
        assert_eq!(m.as_str(), "");
        m.push('\x7f');
        assert_eq!(m.as_str(), "");
    }

    #[test]
    fn mirror_strips_arrow_key_sequences_on_enter() {
        let mut m = InputMirror::new();
        for ch in "\x1b[A".chars() {
            m.push(ch);
        }
        assert_eq!(m.push('\n').as_deref(), Some(""));
    }

    #[test]
    fn echo_window_expires() {
        let t0 = Instant::now();
        let mut w = EchoWindow::default();
        assert!(!w.is_open(t0));
        w.arm(t0, Duration::from_millis(500));
        assert!(w.is_open(t0 + Duration::from_millis(499)));
        assert!(!w.is_open(t0 + Duration::from_millis(500)));
        w.expire(t0 + Duration::from_millis(600));
        assert!(!w.is_armed());
    }

    #[test]
    fn gate_dedup_is_case_insensitive_and_expires() {
        let t0 = Instant::now();
        let mut gate = TriggerGate::new(Duration::from_secs(180), Duration::from_secs(300));
        assert!(gate.claim("Fix The Bug", t0));
        assert!(!gate.claim("fix the bug", t0 + Duration::from_secs(299)));
        assert!(gate.claim("fix the bug", t0 + Duration::from_secs(300)));
        assert_eq!(gate.recent_len(), 1);
    }

    #[test]
    fn gate_cooldown_window() {
        let t0 = Instant::now();
        let mut gate = TriggerGate::new(Duration::from_secs(180), Duration::from_secs(300));
        assert!(!gate.cooling_down(t0));
        gate.start_cooldown(t0);
        assert!(gate.cooling_down(t0 + Duration::from_secs(179)));
        assert!(!gate.cooling_down(t0 + Duration::from_secs(180)));
    }
}
