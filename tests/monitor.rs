//! End-to-end monitor scenarios driven with injected instants.

use std::time::{Duration, Instant};

use arena_monitor::monitor::{Action, Monitor, MonitorConfig, MonitorEvent};
use arena_monitor::sanitize::MAX_CONTEXT_CHARS;

const INTERRUPT: &str = "\x1b";

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn monitor() -> Monitor {
    Monitor::new(MonitorConfig::default()).unwrap()
}

fn launches(actions: &[Action]) -> Vec<(&str, Option<&str>)> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Launch { task, context } => Some((task.as_str(), context.as_deref())),
            _ => None,
        })
        .collect()
}

fn started_tasks(actions: &[Action]) -> Vec<&str> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Notify(MonitorEvent::GatheringStarted { task }) => Some(task.as_str()),
            _ => None,
        })
        .collect()
}

/// Run ticks every 100ms from `from` to `to` inclusive, collecting actions.
fn tick_through(m: &mut Monitor, t0: Instant, from_ms: u64, to_ms: u64) -> Vec<(u64, Action)> {
    let mut out = Vec::new();
    let mut ms = from_ms;
    while ms <= to_ms {
        for action in m.tick(t0 + Duration::from_millis(ms)) {
            out.push((ms, action));
        }
        ms += 100;
    }
    out
}

#[test]
fn typed_trigger_starts_exactly_one_cycle() {
    let t0 = Instant::now();
    let mut m = monitor();
    let out = m.on_input("arena-fight \"fix the bug\"\r", t0);
    assert_eq!(started_tasks(&out.actions), vec!["fix the bug"]);
    assert!(m.is_gathering());

    // The echoed command line does not start another one.
    let actions = m.on_output(
        "❯ arena-fight \"fix the bug\" — IMPORTANT: This is an arena-fight request.\r\n",
        t0 + Duration::from_millis(50),
    );
    assert!(started_tasks(&actions).is_empty());
}

#[test]
fn repeated_task_is_deduplicated_after_cooldown() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight fix the bug\r", t0);
    let actions = m.tick(t0 + secs(122));
    assert_eq!(launches(&actions).len(), 1);

    // Cancelling leaves no cooldown, so only the dedup slot from t0 (300s)
    // stands in the way.
    let mut m = monitor();
    m.on_input("arena-fight fix the bug\r", t0);
    m.cancel(t0 + secs(1));
    let out = m.on_input("arena-fight Fix The Bug\r", t0 + secs(200));
    assert!(started_tasks(&out.actions).is_empty());
    assert_eq!(m.watching(), Some("Fix The Bug"));

    let out = m.on_input("arena-fight fix the bug\r", t0 + secs(301));
    assert_eq!(started_tasks(&out.actions), vec!["fix the bug"]);
}

#[test]
fn idle_finish_on_the_next_check_after_timeout() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight explain caching\r", t0);
    m.on_output(
        "⏺ Read(src/cache.rs)\n  1→pub struct Cache {\n  2→    entries: HashMap<String, Entry>,\n",
        t0 + secs(1),
    );

    // Last activity at 1s; idle exceeds 20s after 21s. Checks run every 2s
    // from the cycle start, so the first due check after that is at 22s.
    let fired = tick_through(&mut m, t0, 100, 24_000);
    let launch_at: Vec<u64> = fired
        .iter()
        .filter(|(_, a)| matches!(a, Action::Launch { .. }))
        .map(|(ms, _)| *ms)
        .collect();
    assert_eq!(launch_at, vec![22_000]);
    assert!(!m.is_gathering());

    let (_, interrupt) = fired
        .iter()
        .find(|(_, a)| matches!(a, Action::Write(_)))
        .unwrap();
    assert_eq!(interrupt, &Action::Write(INTERRUPT.to_string()));
}

#[test]
fn max_timeout_finishes_regardless_of_activity() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight big refactor\r", t0);

    let mut ms = 0;
    let mut launched_at = None;
    while ms <= 125_000 && launched_at.is_none() {
        let now = t0 + Duration::from_millis(ms);
        // Constant activity keeps the idle timer from ever expiring.
        m.on_output("✳ Whirring…\n", now);
        if !launches(&m.tick(now)).is_empty() {
            launched_at = Some(ms);
        }
        ms += 100;
    }
    let launched_at = launched_at.expect("cycle should finish on max timeout");
    assert!(launched_at > 120_000);
    assert!(launched_at <= 122_000);
}

#[test]
fn transition_after_min_wait_fires_in_the_same_step() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight add dark mode\r", t0);
    m.on_output("⏺ Grep(theme)\nsrc/theme.ts:12: export const light = {\n", t0 + secs(2));

    let actions = m.on_output("⏺ Edit(src/theme.ts)\n", t0 + secs(5));
    let fired = launches(&actions);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, "add dark mode");
    let context = fired[0].1.unwrap();
    assert!(context.contains("src/theme.ts:12: export const light = {"));
    assert!(actions.contains(&Action::Write(INTERRUPT.to_string())));
    assert!(!m.is_gathering());
}

#[test]
fn transition_before_min_wait_keeps_gathering() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight add dark mode\r", t0);
    let actions = m.on_output("⏺ Edit(src/theme.ts)\n", t0 + secs(1));
    assert!(launches(&actions).is_empty());
    assert!(m.is_gathering());
}

#[test]
fn already_implemented_is_skipped_without_launch() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight add retries\r", t0);
    m.on_output(
        "⏺ Read(src/http.rs)\nRetries with backoff are already fully implemented in src/http.rs.\n",
        t0 + secs(2),
    );
    let actions = m.force_trigger(t0 + secs(4));
    assert!(launches(&actions).is_empty());
    assert!(!actions.contains(&Action::Write(INTERRUPT.to_string())));
    assert!(actions.contains(&Action::Notify(MonitorEvent::Skipped {
        task: "add retries".to_string(),
        reason: "Task already implemented".to_string(),
    })));

    // Skipping still starts the cooldown.
    let out = m.on_input("arena-fight something new\r", t0 + secs(10));
    assert!(started_tasks(&out.actions).is_empty());
}

#[test]
fn context_is_sanitized_and_truncated() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight read everything\r", t0);

    let mut chunk = String::new();
    for i in 0..2_000 {
        chunk.push_str(&format!("  {i:>5}→    let value_{i} = compute_something(input, {i});\n"));
        chunk.push_str("✳ Churning…\n");
    }
    m.on_output(&chunk, t0 + secs(1));

    let actions = m.force_trigger(t0 + secs(10));
    let fired = launches(&actions);
    let context = fired[0].1.unwrap();
    assert_eq!(context.chars().count(), MAX_CONTEXT_CHARS);
    assert!(context.ends_with("compute_something(input, 1999);"));
    assert!(!context.contains("Churning"));
}

#[test]
fn history_recall_triggers_through_the_echo() {
    let t0 = Instant::now();
    let mut m = monitor();
    let out = m.on_input("\x1b[A", t0);
    assert_eq!(out.forward, "\x1b[A");
    m.on_input("\r", t0 + Duration::from_millis(10));

    let actions = m.on_output(
        "\x1b[2K\r> arena-fight 'tune the cache' — IMPORTANT: This is an arena-fight request. ONLY explore\r\n",
        t0 + Duration::from_millis(80),
    );
    assert_eq!(started_tasks(&actions), vec!["tune the cache"]);
}

#[test]
fn blocked_trigger_interrupts_when_the_assistant_starts_editing() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight first\r", t0);
    m.force_trigger(t0 + secs(4));

    m.on_input("arena-fight second\r", t0 + secs(30));
    assert_eq!(m.watching(), Some("second"));

    let actions = m.on_output("⏺ Write(src/new_module.rs)\n", t0 + secs(40));
    assert!(actions.contains(&Action::Write(INTERRUPT.to_string())));
    assert!(launches(&actions).is_empty());
    assert_eq!(m.watching(), None);

    // Only once.
    let actions = m.on_output("⏺ Edit(src/new_module.rs)\n", t0 + secs(41));
    assert!(!actions.contains(&Action::Write(INTERRUPT.to_string())));
}

#[test]
fn stale_tick_after_cancel_does_nothing() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_input("arena-fight task\r", t0);
    m.on_output(&format!("{}\n", "x".repeat(100)), t0 + secs(1));
    m.cancel(t0 + secs(2));
    let fired = tick_through(&mut m, t0, 2_000, 130_000);
    assert!(fired.is_empty());
}

#[test]
fn roster_follows_subagent_output() {
    let t0 = Instant::now();
    let mut m = monitor();
    m.on_output(
        "Running 2 Explore agents\n├─ Explore auth flow · 4 tool uses · 13.3k tokens\n",
        t0,
    );
    let agents = m.agents(t0 + secs(1));
    assert_eq!(agents.len(), 3);
    assert_eq!(agents[2].tool_uses, 4);
    assert_eq!(agents[2].tokens, 13_300);

    m.on_output("❯ ls\n", t0 + secs(2));
    assert!(
        m.agents(t0 + secs(3))
            .iter()
            .all(|a| a.status == arena_monitor::agents::AgentStatus::Done)
    );
    m.tick(t0 + secs(12));
    assert!(m.agents(t0 + secs(12)).is_empty());
}
