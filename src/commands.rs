//! Non-interactive subcommands: config display, transcript classification
//! and sanitizing.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::activity::{ActivityRules, ActivityTag};
use crate::agents::AgentTracker;
use crate::config::ProjectConfig;
use crate::line::LineAssembler;
use crate::sanitize::sanitize;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .arena/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

/// Control characters shown as `^X`.
fn key_label(key: &str) -> String {
    key.chars()
        .map(|c| match c as u32 {
            0x1b => "ESC".to_string(),
            n @ 0x00..=0x1f => format!("^{}", char::from(b'@' + n as u8)),
            _ => c.to_string(),
        })
        .collect()
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Trigger\n");
    push_kv(&mut output, "phrase", &config.trigger.phrase);
    push_kv(
        &mut output,
        "echo_window",
        format!("{}ms", config.trigger.echo_window_millis),
    );
    push_kv(
        &mut output,
        "dedup_window",
        format!("{}s", config.trigger.dedup_window_secs),
    );
    push_kv(&mut output, "cooldown", format!("{}s", config.trigger.cooldown_secs));
    output.push('\n');

    output.push_str("Gathering\n");
    let g = &config.gathering;
    push_kv(&mut output, "idle_timeout", format!("{}s", g.idle_timeout_secs));
    push_kv(&mut output, "max_timeout", format!("{}s", g.max_timeout_secs));
    push_kv(&mut output, "min_wait", format!("{}ms", g.min_wait_millis));
    push_kv(
        &mut output,
        "check_interval",
        format!("{}ms", g.check_interval_millis),
    );
    push_kv(&mut output, "min_context_chars", g.min_context_chars);
    push_kv(&mut output, "max_context_chars", g.max_context_chars);
    output.push('\n');

    output.push_str("Agents\n");
    push_kv(
        &mut output,
        "removal_delay",
        format!("{}s", config.agents.removal_delay_secs),
    );
    output.push('\n');

    output.push_str("Session\n");
    push_kv(&mut output, "shell", config.session.resolve_shell());
    push_kv(&mut output, "interrupt_key", key_label(&config.session.interrupt_key));
    push_kv(&mut output, "force_key", key_label(&config.session.force_key));
    push_kv(&mut output, "cancel_key", key_label(&config.session.cancel_key));
    push_kv(&mut output, "apply_key", key_label(&config.session.apply_key));
    push_kv(
        &mut output,
        "winner_dir",
        config.session.resolve_winner_dir().display(),
    );
    push_kv(&mut output, "tick", format!("{}ms", config.session.tick_millis));
    output.push('\n');

    output.push_str("Launcher\n");
    push_kv(&mut output, "server_url", &config.launcher.server_url);
    push_kv(&mut output, "timeout", format!("{}s", config.launcher.timeout_secs));
    output.push('\n');

    output.push_str("Log\n");
    push_kv(
        &mut output,
        "path",
        config
            .log
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string()),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "config", config_source_label(config_path));
    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "source_path".to_string(),
            serde_json::Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Tags for each non-empty normalized line of a transcript.
pub fn classify_transcript(raw: &[u8]) -> Vec<(String, Vec<ActivityTag>)> {
    let rules = ActivityRules::claude_code();
    let mut assembler = LineAssembler::new();
    let mut lines = assembler.push_bytes(raw);
    // A transcript without a trailing newline still ends its last line.
    lines.extend(assembler.push("\n"));

    // Effects run against a scratch roster so overlapping rules behave as
    // they do live.
    let mut tracker = AgentTracker::new(Duration::from_secs(10));
    let now = Instant::now();
    lines
        .into_iter()
        .map(|line| {
            let tags = rules.apply(&line, &mut tracker, now).tags;
            (line, tags)
        })
        .collect()
}

pub fn render_classification(rows: &[(String, Vec<ActivityTag>)]) -> String {
    let mut output = String::new();
    for (line, tags) in rows {
        let label = if tags.is_empty() {
            "-".to_string()
        } else {
            tags.iter()
                .map(|t| format!("{t:?}"))
                .collect::<Vec<_>>()
                .join(",")
        };
        output.push_str(&format!("{label:<28} {line}\n"));
    }
    output
}

pub fn classify_file(path: &Path) -> Result<String> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(render_classification(&classify_transcript(&raw)))
}

pub fn sanitize_file(path: &Path, max_chars: usize) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(sanitize(&raw, max_chars))
}
