//! PTY host: runs the user's shell and feeds the monitor.
//!
//! Spawns the shell in a PTY, forwards its output to the user's terminal in
//! real time and mirrors it into the [`Monitor`]. User keystrokes pass
//! through the monitor on their way in. A ticker drives the monitor's
//! deadlines and keeps the PTY sized to the user's terminal; a dispatcher
//! carries out the actions the monitor returns.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::launcher::{FightId, FightLauncher};
use crate::log::ExecutionLog;
use crate::monitor::{Action, Monitor, MonitorEvent};
use crate::solution::{apply_prompt, write_winner};
use crate::terminal;

const LAUNCH_FAILED_NOTICE: &str = "echo \"Failed to start fight — is the server running?\"\r";

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;
type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

#[derive(Debug)]
pub enum SessionResult {
    Exited { code: Option<u32> },
}

pub struct SessionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub pty_size: PtySize,
    /// Interval of the deadline ticker.
    pub tick: Duration,
    /// Forward the user's stdin into the session.
    pub forward_stdin: bool,
    /// Copy session output to stdout.
    pub echo_output: bool,
    /// Resize the PTY whenever the user's terminal changes size.
    pub follow_resize: bool,
    /// Where winning solutions are written before the assistant reads them.
    pub winner_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "/bin/sh".to_string(),
            args: vec![],
            work_dir: PathBuf::from("."),
            pty_size: PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            },
            tick: Duration::from_millis(100),
            forward_stdin: true,
            echo_output: true,
            follow_resize: true,
            winner_dir: std::env::temp_dir().join(".arena-fights"),
        }
    }
}

/// Where monitor events go besides `tracing`.
#[derive(Default)]
pub struct EventSinks {
    pub log: Option<Arc<ExecutionLog>>,
    pub events: Option<mpsc::Sender<MonitorEvent>>,
}

impl EventSinks {
    fn emit(&self, event: MonitorEvent) {
        match &event {
            MonitorEvent::GatheringProgress { .. } | MonitorEvent::AgentsUpdated { .. } => {
                debug!(?event, "monitor event")
            }
            _ => info!(?event, "monitor event"),
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.log(event.clone()) {
                warn!(error = %e, "failed to write execution log");
            }
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Run the hosted session until the shell exits.
pub fn run_session(
    config: SessionConfig,
    monitor: Monitor,
    launcher: Arc<dyn FightLauncher>,
    sinks: EventSinks,
) -> Result<SessionResult> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(config.pty_size)
        .context("failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&config.program);
    for arg in &config.args {
        cmd.arg(arg);
    }
    cmd.cwd(&config.work_dir);

    info!(
        program = %config.program,
        work_dir = %config.work_dir.display(),
        "spawning shell in PTY"
    );

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .context("failed to spawn shell")?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone PTY reader")?;
    let writer: SharedWriter = Arc::new(Mutex::new(
        pair.master
            .take_writer()
            .context("failed to take PTY writer")?,
    ));
    let master: SharedMaster = Arc::new(Mutex::new(pair.master));

    let monitor = Arc::new(Mutex::new(monitor));
    let done = Arc::new(AtomicBool::new(false));
    let (action_tx, action_rx) = mpsc::channel::<Action>();

    let output_thread = {
        let monitor = Arc::clone(&monitor);
        let action_tx = action_tx.clone();
        let echo_output = config.echo_output;
        thread::spawn(move || {
            let mut stdout = std::io::stdout();
            let mut buf = [0u8; 4096];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("PTY read error (shell likely exited): {e}");
                        break;
                    }
                };
                let chunk = &buf[..n];
                if echo_output {
                    let _ = stdout.write_all(chunk);
                    let _ = stdout.flush();
                }
                let actions = lock(&monitor).on_output_bytes(chunk, Instant::now());
                for action in actions {
                    let _ = action_tx.send(action);
                }
            }
        })
    };

    if config.forward_stdin {
        let monitor = Arc::clone(&monitor);
        let action_tx = action_tx.clone();
        let writer = Arc::clone(&writer);
        // Blocks on stdin; left detached when the shell exits.
        thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut stdin_lock = stdin.lock();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stdin_lock.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let input = String::from_utf8_lossy(&buf[..n]);
                let outcome = lock(&monitor).on_input(&input, Instant::now());
                if !outcome.forward.is_empty() && write_session(&writer, &outcome.forward).is_err()
                {
                    break;
                }
                for action in outcome.actions {
                    let _ = action_tx.send(action);
                }
            }
        });
    }

    let ticker_thread = {
        let monitor = Arc::clone(&monitor);
        let action_tx = action_tx.clone();
        let done = Arc::clone(&done);
        let master = Arc::clone(&master);
        let tick = config.tick;
        let follow_resize = config.follow_resize;
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                thread::sleep(tick);
                if follow_resize {
                    if let Some(size) = terminal::query_size() {
                        if let Err(e) = sync_pty_size(lock(&master).as_ref(), size) {
                            debug!(error = %e, "failed to resize PTY");
                        }
                    }
                }
                let actions = lock(&monitor).tick(Instant::now());
                for action in actions {
                    let _ = action_tx.send(action);
                }
            }
        })
    };

    let dispatch_thread = {
        let writer = Arc::clone(&writer);
        let done = Arc::clone(&done);
        let tick = config.tick;
        let mut dispatcher = Dispatcher {
            writer,
            launcher,
            action_tx,
            sinks,
            winner_dir: config.winner_dir.clone(),
            last_fight: None,
        };
        thread::spawn(move || {
            loop {
                match action_rx.recv_timeout(tick) {
                    Ok(action) => dispatcher.dispatch(action),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if done.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    };

    let exit_status = child.wait().context("failed to wait for shell")?;
    info!(success = exit_status.success(), "shell exited");

    output_thread
        .join()
        .map_err(|_| anyhow::anyhow!("output thread panicked"))?;
    done.store(true, Ordering::Relaxed);
    ticker_thread
        .join()
        .map_err(|_| anyhow::anyhow!("ticker thread panicked"))?;
    dispatch_thread
        .join()
        .map_err(|_| anyhow::anyhow!("dispatch thread panicked"))?;

    Ok(SessionResult::Exited {
        code: Some(exit_status.exit_code()),
    })
}

/// Carries out monitor actions on the dispatch thread.
struct Dispatcher {
    writer: SharedWriter,
    launcher: Arc<dyn FightLauncher>,
    action_tx: mpsc::Sender<Action>,
    sinks: EventSinks,
    winner_dir: PathBuf,
    /// Most recent fight started from this session.
    last_fight: Option<FightId>,
}

impl Dispatcher {
    fn dispatch(&mut self, action: Action) {
        match action {
            Action::Write(keys) => {
                if let Err(e) = write_session(&self.writer, &keys) {
                    warn!(error = %e, "failed to write to session");
                }
            }
            Action::Launch { task, context } => {
                let launcher = Arc::clone(&self.launcher);
                let action_tx = self.action_tx.clone();
                thread::spawn(move || {
                    for action in launch_actions(launcher.as_ref(), task, context) {
                        let _ = action_tx.send(action);
                    }
                });
            }
            Action::ApplyWinner => {
                let Some(fight_id) = self.last_fight.clone() else {
                    self.sinks.emit(MonitorEvent::ApplyFailed {
                        error: "no fight has been started in this session".to_string(),
                    });
                    return;
                };
                let launcher = Arc::clone(&self.launcher);
                let action_tx = self.action_tx.clone();
                let dir = self.winner_dir.clone();
                thread::spawn(move || {
                    let stamp = chrono::Utc::now().timestamp_millis();
                    for action in apply_actions(launcher.as_ref(), &fight_id, &dir, stamp) {
                        let _ = action_tx.send(action);
                    }
                });
            }
            Action::Notify(event) => {
                if let MonitorEvent::FightTriggered { fight_id, .. } = &event {
                    self.last_fight = Some(fight_id.clone());
                }
                self.sinks.emit(event);
            }
        }
    }
}

/// Run one launch and turn its result into follow-up actions. Failures are
/// not retried.
pub fn launch_actions(
    launcher: &dyn FightLauncher,
    task: String,
    context: Option<String>,
) -> Vec<Action> {
    match launcher.launch(&task, context.as_deref()) {
        Ok(fight_id) => vec![Action::Notify(MonitorEvent::FightTriggered { fight_id, task })],
        Err(e) => {
            warn!(task = %task, error = %e, "failed to start fight");
            vec![
                Action::Notify(MonitorEvent::LaunchFailed {
                    task,
                    error: e.to_string(),
                }),
                Action::Write(LAUNCH_FAILED_NOTICE.to_string()),
            ]
        }
    }
}

/// Fetch the winner of `fight_id`, write it under `dir` and prompt the
/// assistant to apply it.
pub fn apply_actions(
    launcher: &dyn FightLauncher,
    fight_id: &str,
    dir: &Path,
    timestamp_millis: i64,
) -> Vec<Action> {
    let solution = match launcher.winner(fight_id) {
        Ok(Some(solution)) => solution,
        Ok(None) => {
            return vec![Action::Notify(MonitorEvent::ApplyFailed {
                error: format!("fight {fight_id} has no verdict yet"),
            })];
        }
        Err(e) => {
            warn!(fight_id, error = %e, "failed to look up fight verdict");
            return vec![Action::Notify(MonitorEvent::ApplyFailed {
                error: e.to_string(),
            })];
        }
    };
    match write_winner(dir, &solution.output, timestamp_millis) {
        Ok(path) => {
            info!(fight_id, path = %path.display(), "applying winning solution");
            vec![
                Action::Notify(MonitorEvent::SolutionApplied {
                    fight_id: fight_id.to_string(),
                    task: solution.task.clone(),
                    path: path.display().to_string(),
                }),
                Action::Write(apply_prompt(&path, &solution.task)),
            ]
        }
        Err(e) => {
            warn!(error = %e, "failed to write winner file");
            vec![Action::Notify(MonitorEvent::ApplyFailed {
                error: format!("{e:#}"),
            })]
        }
    }
}

/// Resize `master` to `size` unless it already has those dimensions.
fn sync_pty_size(master: &dyn MasterPty, size: PtySize) -> Result<bool> {
    let current = master.get_size()?;
    if (current.rows, current.cols) == (size.rows, size.cols) {
        return Ok(false);
    }
    master.resize(size)?;
    debug!(rows = size.rows, cols = size.cols, "resized PTY");
    Ok(true)
}

fn write_session(writer: &SharedWriter, data: &str) -> std::io::Result<()> {
    let mut w = lock(writer);
    w.write_all(data.as_bytes())?;
    w.flush()
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
