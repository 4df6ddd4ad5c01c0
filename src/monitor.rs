//! Per-session monitor.
//!
//! Owns every piece of trigger, gathering and roster state for one hosted
//! shell. The monitor does no I/O and reads no clock: callers pass `now` in
//! and carry out the returned [`Action`]s. This keeps the whole flow
//! testable with injected instants.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::activity::ActivityRules;
use crate::agents::{AgentSnapshot, AgentTracker};
use crate::config::ProjectConfig;
use crate::gathering::{
    FeedOutcome, FinishedCycle, Gatherer, GatheringConfig, is_already_done, is_implementing,
};
use crate::line::LineAssembler;
use crate::sanitize::sanitize;
use crate::trigger::{EchoWindow, InputMirror, TriggerGate, TriggerPattern};

const SKIP_REASON_ALREADY_DONE: &str = "Task already implemented";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub phrase: String,
    pub instruction: String,
    pub echo_window: Duration,
    pub dedup_window: Duration,
    pub cooldown: Duration,
    pub gathering: GatheringConfig,
    pub max_context_chars: usize,
    pub removal_delay: Duration,
    pub interrupt_key: String,
    /// Swallowed keystroke that force-finishes the cycle.
    pub force_key: Option<char>,
    /// Swallowed keystroke that cancels the cycle.
    pub cancel_key: Option<char>,
    /// Swallowed keystroke that asks the host to apply the last winner.
    pub apply_key: Option<char>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_project(&ProjectConfig::default())
    }
}

impl MonitorConfig {
    pub fn from_project(config: &ProjectConfig) -> Self {
        Self {
            phrase: config.trigger.phrase.clone(),
            instruction: config.trigger.instruction.clone(),
            echo_window: Duration::from_millis(config.trigger.echo_window_millis),
            dedup_window: Duration::from_secs(config.trigger.dedup_window_secs),
            cooldown: Duration::from_secs(config.trigger.cooldown_secs),
            gathering: config.gathering.to_gathering_config(),
            max_context_chars: config.gathering.max_context_chars,
            removal_delay: Duration::from_secs(config.agents.removal_delay_secs),
            interrupt_key: config.session.interrupt_key.clone(),
            force_key: control_key("force_key", &config.session.force_key),
            cancel_key: control_key("cancel_key", &config.session.cancel_key),
            apply_key: control_key("apply_key", &config.session.apply_key),
        }
    }
}

/// Control keys must be a single character; anything else disables the key.
fn control_key(name: &str, key: &str) -> Option<char> {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Some(ch),
        (None, _) => None,
        _ => {
            warn!(key = name, "control key must be a single character, ignoring");
            None
        }
    }
}

/// Notifications for the UI and the execution log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    GatheringStarted {
        task: String,
    },
    GatheringProgress {
        task: String,
        context_length: usize,
        elapsed_ms: u64,
    },
    Skipped {
        task: String,
        reason: String,
    },
    Cancelled,
    AgentsUpdated {
        agents: Vec<AgentSnapshot>,
    },
    FightTriggered {
        fight_id: String,
        task: String,
    },
    LaunchFailed {
        task: String,
        error: String,
    },
    SolutionApplied {
        fight_id: String,
        task: String,
        path: String,
    },
    ApplyFailed {
        error: String,
    },
}

/// Side effects requested by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Keystrokes to inject into the session.
    Write(String),
    Launch {
        task: String,
        context: Option<String>,
    },
    Notify(MonitorEvent),
    /// Fetch the last fight's winning output and hand it to the assistant.
    ApplyWinner,
}

/// What to do with a chunk of user input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputOutcome {
    /// Bytes to pass on to the session.
    pub forward: String,
    pub actions: Vec<Action>,
}

pub struct Monitor {
    config: MonitorConfig,
    pattern: TriggerPattern,
    mirror: InputMirror,
    echo: EchoWindow,
    gate: TriggerGate,
    gatherer: Gatherer,
    tracker: AgentTracker,
    rules: ActivityRules,
    assembler: LineAssembler,
    /// Task whose trigger was blocked; the next implementing line gets an
    /// interrupt.
    watch: Option<String>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Result<Self, regex::Error> {
        let pattern = TriggerPattern::new(&config.phrase)?;
        Ok(Self {
            pattern,
            mirror: InputMirror::new(),
            echo: EchoWindow::default(),
            gate: TriggerGate::new(config.cooldown, config.dedup_window),
            gatherer: Gatherer::new(config.gathering.clone()),
            tracker: AgentTracker::new(config.removal_delay),
            rules: ActivityRules::claude_code(),
            assembler: LineAssembler::new(),
            watch: None,
            config,
        })
    }

    #[cfg(test)]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_gathering(&self) -> bool {
        self.gatherer.is_active()
    }

    /// Task of the blocked trigger still being watched, if any.
    pub fn watching(&self) -> Option<&str> {
        self.watch.as_deref()
    }

    #[cfg(test)]
    pub fn cooldown_until(&self) -> Option<Instant> {
        self.gate.cooldown_until()
    }

    pub fn agents(&self, now: Instant) -> Vec<AgentSnapshot> {
        self.tracker.snapshot(now)
    }

    /// Process keystrokes on their way to the session.
    pub fn on_input(&mut self, data: &str, now: Instant) -> InputOutcome {
        let mut outcome = InputOutcome::default();

        for ch in data.chars() {
            if Some(ch) == self.config.force_key {
                outcome.actions.extend(self.force_trigger(now));
                continue;
            }
            if Some(ch) == self.config.cancel_key {
                outcome.actions.extend(self.cancel(now));
                continue;
            }
            if Some(ch) == self.config.apply_key {
                outcome.actions.push(Action::ApplyWinner);
                continue;
            }

            let Some(line) = self.mirror.push(ch) else {
                outcome.forward.push(ch);
                continue;
            };

            match self.pattern.match_typed(&line) {
                Some(task) => {
                    info!(task = %task, "trigger typed");
                    self.activate(&task, now, &mut outcome.actions);
                    outcome.forward.push_str(&self.config.instruction);
                }
                None => self.echo.arm(now, self.config.echo_window),
            }
            outcome.forward.push(ch);
        }

        outcome
    }

    /// Process a chunk of session output.
    pub fn on_output(&mut self, chunk: &str, now: Instant) -> Vec<Action> {
        let lines = self.assembler.push(chunk);
        self.process_lines(lines, now)
    }

    /// Like [`Monitor::on_output`] for raw PTY bytes.
    pub fn on_output_bytes(&mut self, bytes: &[u8], now: Instant) -> Vec<Action> {
        let lines = self.assembler.push_bytes(bytes);
        self.process_lines(lines, now)
    }

    /// Advance deadlines: the gathering check, agent record removal and the
    /// echo window.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(finished) = self.gatherer.check(now) {
            self.finish(finished, now, &mut actions);
        }

        self.echo.expire(now);

        if self.tracker.expire(now) > 0 {
            actions.push(Action::Notify(MonitorEvent::AgentsUpdated {
                agents: self.tracker.snapshot(now),
            }));
        }

        actions
    }

    /// Finish the cycle now instead of waiting for idle or timeout.
    pub fn force_trigger(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(finished) = self.gatherer.force(now) {
            self.finish(finished, now, &mut actions);
        }
        actions
    }

    /// Drop the cycle without a fight. No cooldown is set.
    pub fn cancel(&mut self, _now: Instant) -> Vec<Action> {
        let Some(task) = self.gatherer.cancel() else {
            return Vec::new();
        };
        info!(task = %task, "gathering cancelled");
        self.watch = None;
        vec![
            Action::Write(self.config.interrupt_key.clone()),
            Action::Notify(MonitorEvent::Cancelled),
        ]
    }

    fn process_lines(&mut self, lines: Vec<String>, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for line in lines {
            self.process_line(&line, now, &mut actions);
        }
        actions
    }

    fn process_line(&mut self, line: &str, now: Instant, actions: &mut Vec<Action>) {
        if self.watch.is_none() && self.echo.is_open(now) {
            if let Some(task) = self.pattern.match_echoed(line) {
                info!(task = %task, "trigger recalled from history");
                self.echo.close();
                self.activate(&task, now, actions);
            }
        }

        match self.gatherer.feed(line, now) {
            FeedOutcome::Inactive => {}
            FeedOutcome::Progress {
                task,
                context_length,
                elapsed,
            } => actions.push(Action::Notify(MonitorEvent::GatheringProgress {
                task,
                context_length,
                elapsed_ms: elapsed.as_millis() as u64,
            })),
            FeedOutcome::Finished(finished) => self.finish(finished, now, actions),
        }

        if !self.gatherer.is_active() && self.watch.is_some() && is_implementing(line) {
            if let Some(task) = self.watch.take() {
                info!(task = %task, "assistant started implementing a blocked task, interrupting");
            }
            actions.push(Action::Write(self.config.interrupt_key.clone()));
        }

        let classified = self.rules.apply(line, &mut self.tracker, now);
        if !classified.tags.is_empty() {
            debug!(tags = ?classified.tags, "classified line");
        }
        if classified.roster_changed {
            actions.push(Action::Notify(MonitorEvent::AgentsUpdated {
                agents: self.tracker.snapshot(now),
            }));
        }
    }

    fn activate(&mut self, task: &str, now: Instant, actions: &mut Vec<Action>) {
        if self.gate.cooling_down(now) || self.gatherer.is_active() {
            debug!(task = %task, "trigger blocked, watching for implementation");
            self.watch = Some(task.to_string());
            return;
        }
        if !self.gate.claim(task, now) {
            debug!(task = %task, "duplicate trigger ignored");
            self.watch = Some(task.to_string());
            return;
        }
        self.gatherer.start(task, now);
        actions.push(Action::Notify(MonitorEvent::GatheringStarted {
            task: task.to_string(),
        }));
    }

    fn finish(&mut self, finished: FinishedCycle, now: Instant, actions: &mut Vec<Action>) {
        let FinishedCycle {
            task,
            context,
            reason,
            elapsed,
        } = finished;
        self.gate.start_cooldown(now);
        self.watch = None;

        if is_already_done(&context) {
            info!(task = %task, ?reason, "assistant reports the task is already done, skipping");
            actions.push(Action::Notify(MonitorEvent::Skipped {
                task,
                reason: SKIP_REASON_ALREADY_DONE.to_string(),
            }));
            return;
        }

        let context = sanitize(&context, self.config.max_context_chars);
        info!(
            task = %task,
            ?reason,
            elapsed_secs = elapsed.as_secs(),
            context_chars = context.chars().count(),
            "firing fight"
        );
        actions.push(Action::Write(self.config.interrupt_key.clone()));
        actions.push(Action::Launch {
            task,
            context: if context.is_empty() {
                None
            } else {
                Some(context)
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn monitor() -> Monitor {
        Monitor::new(MonitorConfig::default()).unwrap()
    }

    fn events(actions: &[Action]) -> Vec<&MonitorEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Notify(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn started(actions: &[Action]) -> bool {
        events(actions)
            .iter()
            .any(|e| matches!(e, MonitorEvent::GatheringStarted { .. }))
    }

    #[test]
    fn typed_trigger_gets_instruction_before_enter() {
        let t0 = Instant::now();
        let mut m = monitor();
        let out = m.on_input("arena-fight \"fix the bug\"\r", t0);
        let instruction = &m.config().instruction;
        assert_eq!(
            out.forward,
            format!("arena-fight \"fix the bug\"{instruction}\r")
        );
        assert_eq!(
            out.actions,
            vec![Action::Notify(MonitorEvent::GatheringStarted {
                task: "fix the bug".to_string()
            })]
        );
        assert!(m.is_gathering());
    }

    #[test]
    fn keystrokes_split_across_chunks_are_mirrored() {
        let t0 = Instant::now();
        let mut m = monitor();
        assert_eq!(m.on_input("arena-", t0).forward, "arena-");
        assert!(m.on_input("fight add", t0).actions.is_empty());
        let out = m.on_input("x\x7f retries\r", t0);
        assert!(started(&out.actions));
        assert!(matches!(
            &out.actions[0],
            Action::Notify(MonitorEvent::GatheringStarted { task }) if task == "add retries"
        ));
    }

    #[test]
    fn plain_enter_is_forwarded_unchanged() {
        let t0 = Instant::now();
        let mut m = monitor();
        let out = m.on_input("ls -la\r", t0);
        assert_eq!(out.forward, "ls -la\r");
        assert!(out.actions.is_empty());
        assert!(!m.is_gathering());
    }

    #[test]
    fn recalled_command_is_caught_from_echo() {
        let t0 = Instant::now();
        let mut m = monitor();
        // Up arrow then Enter: the mirror never sees the command text.
        m.on_input("\x1b[A\r", t0);
        let actions = m.on_output(
            "> arena-fight add dark mode — IMPORTANT: This is an arena-fight request.\n",
            t0 + Duration::from_millis(100),
        );
        assert!(matches!(
            events(&actions)[0],
            MonitorEvent::GatheringStarted { task } if task == "add dark mode"
        ));
    }

    #[test]
    fn echo_window_closes_after_expiry() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("\r", t0);
        let actions = m.on_output("arena-fight late echo\n", t0 + Duration::from_millis(600));
        assert!(!started(&actions));
        assert!(!m.is_gathering());
    }

    #[test]
    fn output_without_enter_never_triggers() {
        let t0 = Instant::now();
        let mut m = monitor();
        let actions = m.on_output("arena-fight from a log file\n", t0);
        assert!(actions.is_empty());
    }

    #[test]
    fn blocked_trigger_sets_watch_and_interrupts_on_implementation() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight first\r", t0);
        m.on_output(&format!("{}\n", "x".repeat(80)), t0 + secs(1));
        m.force_trigger(t0 + secs(5));
        assert!(!m.is_gathering());

        // Cooldown is active now.
        let out = m.on_input("arena-fight second\r", t0 + secs(10));
        assert!(!started(&out.actions));
        assert_eq!(m.watching(), Some("second"));

        let actions = m.on_output("Let me look at the tests first.\n", t0 + secs(11));
        assert!(!actions.contains(&Action::Write("\x1b".to_string())));
        let actions = m.on_output("I'll now create the handler module.\n", t0 + secs(12));
        assert!(actions.contains(&Action::Write("\x1b".to_string())));
        assert_eq!(m.watching(), None);
    }

    #[test]
    fn trigger_during_cycle_watches_instead_of_restarting() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight one\r", t0);
        let out = m.on_input("arena-fight two\r", t0 + secs(1));
        assert!(!started(&out.actions));
        assert_eq!(m.watching(), Some("two"));
        assert!(m.is_gathering());
    }

    #[test]
    fn watch_suppresses_echo_fallback() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight one\r", t0);
        m.on_input("arena-fight two\r", t0);
        m.on_input("\r", t0);
        let actions = m.on_output("arena-fight three\n", t0 + Duration::from_millis(10));
        assert!(!started(&actions));
        assert_eq!(m.watching(), Some("two"));
    }

    #[test]
    fn cancel_interrupts_without_cooldown() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight something\r", t0);
        let actions = m.cancel(t0 + secs(1));
        assert_eq!(
            actions,
            vec![
                Action::Write("\x1b".to_string()),
                Action::Notify(MonitorEvent::Cancelled)
            ]
        );
        assert!(!m.is_gathering());
        assert!(m.cooldown_until().is_none());

        let out = m.on_input("arena-fight something else\r", t0 + secs(2));
        assert!(started(&out.actions));
    }

    #[test]
    fn cancel_without_cycle_is_noop() {
        let mut m = monitor();
        assert!(m.cancel(Instant::now()).is_empty());
    }

    #[test]
    fn control_keys_are_swallowed() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight task\r", t0);
        let out = m.on_input("\x1c", t0 + secs(1));
        assert_eq!(out.forward, "");
        assert!(
            events(&out.actions)
                .iter()
                .any(|e| matches!(e, MonitorEvent::Cancelled))
        );

        let out = m.on_input("a\x1db", t0 + secs(2));
        assert_eq!(out.forward, "ab");
        assert!(out.actions.is_empty());
    }

    #[test]
    fn apply_key_requests_winner_without_forwarding() {
        let t0 = Instant::now();
        let mut m = monitor();
        let out = m.on_input("ls\x1e\r", t0);
        assert_eq!(out.forward, "ls\r");
        assert_eq!(out.actions, vec![Action::ApplyWinner]);
        assert!(!m.is_gathering());
    }

    #[test]
    fn force_key_fires_after_min_wait() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight wire the cache\r", t0);
        m.on_output("Read(src/cache.rs)\n", t0 + secs(1));
        let out = m.on_input("\x1d", t0 + secs(4));
        assert_eq!(out.actions[0], Action::Write("\x1b".to_string()));
        assert!(matches!(
            &out.actions[1],
            Action::Launch { task, context: Some(ctx) } if task == "wire the cache" && ctx.contains("Read(src/cache.rs)")
        ));
    }

    #[test]
    fn empty_sanitized_context_launches_without_context() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight bare\r", t0);
        let actions = m.tick(t0 + secs(121));
        assert!(actions.contains(&Action::Launch {
            task: "bare".to_string(),
            context: None,
        }));
    }

    #[test]
    fn progress_is_reported_per_line() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_input("arena-fight task\r", t0);
        let actions = m.on_output("hello\nworld\n", t0 + Duration::from_millis(1500));
        let progress: Vec<_> = events(&actions)
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::GatheringProgress {
                    context_length,
                    elapsed_ms,
                    ..
                } => Some((*context_length, *elapsed_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(6, 1500), (12, 1500)]);
    }

    #[test]
    fn roster_changes_emit_one_snapshot_per_line() {
        let t0 = Instant::now();
        let mut m = monitor();
        let actions = m.on_output("⏺ Read(src/lib.rs)\n", t0);
        let snapshots: Vec<_> = events(&actions)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::AgentsUpdated { .. }))
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(m.agents(t0).len(), 1);
    }

    #[test]
    fn tick_expires_done_agents() {
        let t0 = Instant::now();
        let mut m = monitor();
        m.on_output("Bash(cargo test)\n", t0);
        m.on_output("✓ done\n", t0 + secs(1));
        assert!(m.tick(t0 + secs(5)).is_empty());
        let actions = m.tick(t0 + secs(11));
        assert_eq!(
            actions,
            vec![Action::Notify(MonitorEvent::AgentsUpdated { agents: vec![] })]
        );
    }

    #[test]
    fn control_key_must_be_single_char() {
        assert_eq!(control_key("force_key", "\x1d"), Some('\x1d'));
        assert_eq!(control_key("force_key", ""), None);
        assert_eq!(control_key("force_key", "ab"), None);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(MonitorEvent::GatheringProgress {
            task: "t".to_string(),
            context_length: 12,
            elapsed_ms: 3400,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "gathering_progress",
                "task": "t",
                "context_length": 12,
                "elapsed_ms": 3400
            })
        );
        let json = serde_json::to_value(MonitorEvent::Cancelled).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "cancelled" }));
    }
}
