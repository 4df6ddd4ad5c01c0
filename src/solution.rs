//! Handing a fight's winning output back to the assistant.
//!
//! The output is usually far too long to type into the session, so it is
//! written to a file and the assistant is asked to read and apply it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Write `output` to `<dir>/winner-<millis>.txt`, creating `dir` if needed.
pub fn write_winner(dir: &Path, output: &str, timestamp_millis: i64) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("winner-{timestamp_millis}.txt"));
    std::fs::write(&path, output)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Prompt typed into the session, Enter included.
pub fn apply_prompt(path: &Path, task: &str) -> String {
    let task = if task.trim().is_empty() {
        "see file contents"
    } else {
        task
    };
    format!(
        "Read the file {} and apply that implementation to the project. The task was: {task}\r",
        path.display()
    )
}
