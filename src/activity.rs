//! Activity classification of assistant output lines.
//!
//! Each rule is a compiled pattern plus an effect on the agent roster. Rules
//! are independent: every rule whose pattern matches a line fires, in table
//! order, and the tags of all of them are reported. The patterns target
//! Claude Code's interactive output after ANSI stripping (tool-call syntax,
//! the `⏺`/`⎿` glyphs, tree branches in the sub-agent summary). They will
//! silently stop matching if that output format changes.

use std::time::Instant;

use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

use crate::agents::{AgentTracker, BULK_SPAWN_LIMIT};

/// What a rule recognized in a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityTag {
    /// `Read(src/main.rs)` and friends.
    ToolCall,
    /// `Running 3 Explore agents`.
    BulkSpawn,
    /// `├─ Explore CSS theme · 2 tool uses · 13.3k tokens`.
    BranchSummary,
    /// `⎿  Searching for patterns`.
    Progress,
    /// `Completed`, `✓`, `✔`.
    Completion,
    /// `✳ Whirring…`.
    Thinking,
    /// `Entered plan mode`.
    PlanMode,
    /// The prompt glyph came back.
    PromptReturn,
}

/// Applies a matched rule to the roster; returns true if the roster changed.
type RuleEffect = fn(&mut AgentTracker, &Captures<'_>, Instant) -> bool;

struct ActivityRule {
    tag: ActivityTag,
    pattern: Regex,
    /// Lines containing this text never match the rule.
    unless: Option<&'static str>,
    effect: RuleEffect,
}

impl ActivityRule {
    fn captures<'l>(&self, line: &'l str) -> Option<Captures<'l>> {
        if self.unless.is_some_and(|text| line.contains(text)) {
            return None;
        }
        self.pattern.captures(line)
    }
}

/// Result of running the rule table over one line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    pub tags: Vec<ActivityTag>,
    /// Whether any effect changed the roster.
    pub roster_changed: bool,
}

/// Ordered rule table.
pub struct ActivityRules {
    rules: Vec<ActivityRule>,
}

impl ActivityRules {
    /// Rules for Claude Code's interactive TUI.
    pub fn claude_code() -> Self {
        Self {
            rules: vec![
                ActivityRule {
                    tag: ActivityTag::ToolCall,
                    pattern: Regex::new(
                        r"(Task|Explore|Plan|Bash|Read|Write|Edit|Grep|Glob|WebFetch|WebSearch)\(([^)]+)\)",
                    )
                    .unwrap(),
                    unless: None,
                    effect: |tracker, caps, now| {
                        tracker.spawn(&caps[1], &caps[2], 0, 0, now);
                        true
                    },
                },
                ActivityRule {
                    tag: ActivityTag::BulkSpawn,
                    pattern: Regex::new(r"Running (\d+) (\w+) agents?").unwrap(),
                    unless: None,
                    effect: |tracker, caps, now| {
                        let kind = &caps[2];
                        let Ok(count) = caps[1].parse::<u32>() else {
                            warn!(count = %&caps[1], "ignoring agent count out of range");
                            return false;
                        };
                        let spawned = count.min(BULK_SPAWN_LIMIT);
                        if spawned < count {
                            warn!(count, limit = BULK_SPAWN_LIMIT, "clamping bulk agent spawn");
                        }
                        for i in 1..=spawned {
                            tracker.spawn(kind, &format!("{kind} agent {i} of {count}"), 0, 0, now);
                        }
                        spawned > 0
                    },
                },
                ActivityRule {
                    tag: ActivityTag::BranchSummary,
                    pattern: Regex::new(
                        r"[├└]─\s+(\w+)\s+(.+?)(?:\s*·\s*(\d+)\s*tool\s*uses?)?(?:\s*·\s*([\d.]+)(k?)\s*tokens)?\s*$",
                    )
                    .unwrap(),
                    unless: None,
                    effect: |tracker, caps, now| {
                        let tool_uses = caps
                            .get(3)
                            .and_then(|m| m.as_str().parse().ok())
                            .unwrap_or(0);
                        let tokens = caps
                            .get(4)
                            .map(|m| parse_tokens(m.as_str(), caps.get(5).is_some_and(|k| k.as_str() == "k")))
                            .unwrap_or(0);
                        tracker.spawn(&caps[1], caps[2].trim(), tool_uses, tokens, now);
                        true
                    },
                },
                ActivityRule {
                    tag: ActivityTag::Progress,
                    pattern: Regex::new(r"⎿\s+(\w+ing\s+.+)").unwrap(),
                    unless: None,
                    effect: |tracker, caps, _| match tracker.most_recent_mut() {
                        Some(record) => {
                            record.set_description(&caps[1]);
                            record.tool_uses += 1;
                            true
                        }
                        None => false,
                    },
                },
                ActivityRule {
                    tag: ActivityTag::Completion,
                    pattern: Regex::new(r"Completed|completed|✓|✔").unwrap(),
                    unless: None,
                    effect: |tracker, _, now| tracker.complete_oldest(now).is_some(),
                },
                ActivityRule {
                    tag: ActivityTag::Thinking,
                    pattern: Regex::new(r"[✳⏺]\s+(.+?)(?:\s*\(thought for.*\))?$").unwrap(),
                    unless: Some("Entered plan mode"),
                    effect: |tracker, caps, _| match tracker.most_recent_mut() {
                        Some(record) => {
                            record.set_description(&caps[1]);
                            true
                        }
                        None => false,
                    },
                },
                ActivityRule {
                    tag: ActivityTag::PlanMode,
                    pattern: Regex::new(r"Entered plan mode").unwrap(),
                    unless: None,
                    effect: |tracker, _, now| {
                        tracker.spawn("Plan", "Exploring and designing implementation", 0, 0, now);
                        true
                    },
                },
                ActivityRule {
                    tag: ActivityTag::PromptReturn,
                    pattern: Regex::new(r"^[❯➜>$]\s").unwrap(),
                    unless: None,
                    effect: |tracker, _, now| tracker.complete_all(now) > 0,
                },
            ],
        }
    }

    /// Tags of every rule matching `line`, without side effects.
    pub fn classify(&self, line: &str) -> Vec<ActivityTag> {
        self.rules
            .iter()
            .filter(|rule| rule.captures(line).is_some())
            .map(|rule| rule.tag)
            .collect()
    }

    /// Run every matching rule's effect against the roster.
    pub fn apply(&self, line: &str, tracker: &mut AgentTracker, now: Instant) -> Classified {
        let mut out = Classified::default();
        for rule in &self.rules {
            if let Some(caps) = rule.captures(line) {
                out.tags.push(rule.tag);
                out.roster_changed |= (rule.effect)(tracker, &caps, now);
            }
        }
        out
    }
}

/// `13.3` with a `k` suffix is 13,300 tokens.
fn parse_tokens(number: &str, thousands: bool) -> u64 {
    let value: f64 = number.parse().unwrap_or(0.0);
    let scaled = if thousands { value * 1000.0 } else { value };
    scaled.round().max(0.0) as u64
}
