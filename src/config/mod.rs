use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gathering::GatheringConfig;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".arena";
const WINNER_DIR: &str = ".arena-fights";

const DEFAULT_INSTRUCTION: &str = " — IMPORTANT: This is an arena-fight request. ONLY explore and read files to gather context. Do NOT implement, edit, write, or create any files. Do NOT use Edit or Write tools. Just report your findings.";

fn default_phrase() -> String {
    "arena-fight".to_string()
}

fn default_instruction() -> String {
    DEFAULT_INSTRUCTION.to_string()
}

fn default_echo_window_millis() -> u64 {
    500
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    180
}

fn default_idle_timeout_secs() -> u64 {
    20
}

fn default_max_timeout_secs() -> u64 {
    120
}

fn default_min_wait_millis() -> u64 {
    3000
}

fn default_check_interval_millis() -> u64 {
    2000
}

fn default_min_context_chars() -> usize {
    50
}

fn default_max_context_chars() -> usize {
    crate::sanitize::MAX_CONTEXT_CHARS
}

fn default_removal_delay_secs() -> u64 {
    10
}

fn default_interrupt_key() -> String {
    "\x1b".to_string()
}

fn default_force_key() -> String {
    "\x1d".to_string()
}

fn default_cancel_key() -> String {
    "\x1c".to_string()
}

fn default_apply_key() -> String {
    "\x1e".to_string()
}

fn default_tick_millis() -> u64 {
    100
}

fn default_server_url() -> String {
    "http://localhost:4242".to_string()
}

fn default_launcher_timeout_secs() -> u64 {
    10
}

/// How fights are triggered from the shell.
///
/// ```toml
/// [trigger]
/// phrase = "arena-fight"
/// cooldown_secs = 180
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerSettings {
    #[serde(default = "default_phrase")]
    pub phrase: String,
    /// Appended to the command line before Enter.
    #[serde(default = "default_instruction")]
    pub instruction: String,
    #[serde(default = "default_echo_window_millis")]
    pub echo_window_millis: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            phrase: default_phrase(),
            instruction: default_instruction(),
            echo_window_millis: default_echo_window_millis(),
            dedup_window_secs: default_dedup_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatheringSettings {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_min_wait_millis")]
    pub min_wait_millis: u64,
    #[serde(default = "default_check_interval_millis")]
    pub check_interval_millis: u64,
    #[serde(default = "default_min_context_chars")]
    pub min_context_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for GatheringSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            min_wait_millis: default_min_wait_millis(),
            check_interval_millis: default_check_interval_millis(),
            min_context_chars: default_min_context_chars(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

impl GatheringSettings {
    pub fn to_gathering_config(&self) -> GatheringConfig {
        GatheringConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_timeout: Duration::from_secs(self.max_timeout_secs),
            min_wait: Duration::from_millis(self.min_wait_millis),
            check_interval: Duration::from_millis(self.check_interval_millis),
            min_context_chars: self.min_context_chars,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    #[serde(default = "default_removal_delay_secs")]
    pub removal_delay_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            removal_delay_secs: default_removal_delay_secs(),
        }
    }
}

/// The hosted shell and the keys the monitor reserves in it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSettings {
    /// Shell to host; falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,
    /// Sent to the session to stop the assistant's current turn.
    #[serde(default = "default_interrupt_key")]
    pub interrupt_key: String,
    #[serde(default = "default_force_key")]
    pub force_key: String,
    #[serde(default = "default_cancel_key")]
    pub cancel_key: String,
    /// Applies the winning solution of the last fight.
    #[serde(default = "default_apply_key")]
    pub apply_key: String,
    /// Where winning solutions are written; defaults to `~/.arena-fights`.
    #[serde(default)]
    pub winner_dir: Option<PathBuf>,
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: None,
            interrupt_key: default_interrupt_key(),
            force_key: default_force_key(),
            cancel_key: default_cancel_key(),
            apply_key: default_apply_key(),
            winner_dir: None,
            tick_millis: default_tick_millis(),
        }
    }
}

impl SessionSettings {
    pub fn resolve_shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub fn resolve_winner_dir(&self) -> PathBuf {
        self.winner_dir.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .filter(|h| !h.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
                .join(WINNER_DIR)
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LauncherSettings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_launcher_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            timeout_secs: default_launcher_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogSettings {
    /// JSON-lines execution log; relative paths resolve against the
    /// directory holding `.arena/`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub trigger: TriggerSettings,
    #[serde(default)]
    pub gathering: GatheringSettings,
    #[serde(default)]
    pub agents: AgentSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub launcher: LauncherSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.arena/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Resolve the execution log path against the project root (the parent
    /// of `.arena/`), or `cwd` when no config file was found.
    pub fn log_path(&self, config_path: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
        let path = self.log.path.as_ref()?;
        if path.is_absolute() {
            return Some(path.clone());
        }
        let root = config_path
            .and_then(|p| p.parent())
            .and_then(|p| p.parent())
            .unwrap_or(cwd);
        Some(root.join(path))
    }
}
