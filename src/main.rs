use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use arena_monitor::cli::{Cli, Command};
use arena_monitor::commands;
use arena_monitor::config::ProjectConfig;
use arena_monitor::launcher::{FightLauncher, HttpLauncher};
use arena_monitor::log::{ExecutionLog, LogEvent};
use arena_monitor::monitor::{Monitor, MonitorConfig};
use arena_monitor::supervisor::{self, EventSinks, SessionConfig, SessionResult};
use arena_monitor::terminal::{self, RawModeGuard};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet_by_default = !matches!(&cli.command, Command::Run { .. });

    let filter = match cli.verbose {
        0 if quiet_by_default => "arena_monitor=warn",
        0 => "arena_monitor=info",
        1 => "arena_monitor=debug",
        _ => "arena_monitor=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (mut config, config_path) = ProjectConfig::load(&cwd)?;

    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .arena/config.toml found, using defaults"),
    }

    match cli.command {
        Command::Run { shell, server } => {
            if let Some(shell) = shell {
                config.session.shell = Some(shell);
            }
            if let Some(server) = server {
                config.launcher.server_url = server;
            }

            let log = match config.log_path(config_path.as_deref(), &cwd) {
                Some(path) => Some(Arc::new(ExecutionLog::new(&path)?)),
                None => None,
            };

            let monitor = Monitor::new(MonitorConfig::from_project(&config))
                .context("invalid trigger phrase")?;
            let launcher: Arc<dyn FightLauncher> =
                Arc::new(HttpLauncher::from_settings(&config.launcher));

            let shell = config.session.resolve_shell();
            if let Some(log) = &log {
                log.log(LogEvent::SessionStarted {
                    shell: shell.clone(),
                    cwd: cwd.display().to_string(),
                })?;
            }

            let session = SessionConfig {
                program: shell,
                args: vec![],
                work_dir: cwd.clone(),
                pty_size: terminal::current_size(),
                tick: Duration::from_millis(config.session.tick_millis.max(1)),
                forward_stdin: true,
                echo_output: true,
                follow_resize: true,
                winner_dir: config.session.resolve_winner_dir(),
            };

            let raw_mode = RawModeGuard::enable()?;
            let result = supervisor::run_session(
                session,
                monitor,
                launcher,
                EventSinks {
                    log: log.clone(),
                    events: None,
                },
            );
            drop(raw_mode);

            let SessionResult::Exited { code } = result?;
            if let Some(log) = &log {
                if let Err(e) = log.log(LogEvent::SessionEnded { exit_code: code }) {
                    warn!(error = %e, "failed to write execution log");
                }
            }
            info!(?code, "session ended");
        }
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    commands::render_config_json(&config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    commands::render_config_human(&config, config_path.as_deref())
                );
            }
        }
        Command::Classify { file } => {
            print!("{}", commands::classify_file(&file)?);
        }
        Command::Sanitize { file, max_chars } => {
            let max_chars = max_chars.unwrap_or(config.gathering.max_context_chars);
            println!("{}", commands::sanitize_file(&file, max_chars)?);
        }
    }

    Ok(())
}
