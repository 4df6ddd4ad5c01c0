//! Controlling-terminal helpers for the hosted session.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use crossterm::terminal;
use portable_pty::PtySize;
use tracing::{debug, warn};

const FALLBACK_ROWS: u16 = 24;
const FALLBACK_COLS: u16 = 80;

/// Puts the terminal into raw mode and restores it on drop.
///
/// A no-op when stdin is not a terminal.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        if !std::io::stdin().is_terminal() {
            debug!("stdin is not a terminal, leaving mode unchanged");
            return Ok(Self { active: false });
        }
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self { active: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = terminal::disable_raw_mode() {
                warn!(error = %e, "failed to restore terminal mode");
            }
        }
    }
}

/// Current size of the user's terminal, if there is one.
pub fn query_size() -> Option<PtySize> {
    terminal::size()
        .ok()
        .and_then(|(cols, rows)| pty_size(cols, rows))
}

/// Size of the user's terminal, falling back to 24x80.
pub fn current_size() -> PtySize {
    query_size().unwrap_or(PtySize {
        rows: FALLBACK_ROWS,
        cols: FALLBACK_COLS,
        pixel_width: 0,
        pixel_height: 0,
    })
}

fn pty_size(cols: u16, rows: u16) -> Option<PtySize> {
    (rows > 0 && cols > 0).then_some(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })
}
