//! Logical line reassembly for PTY output.
//!
//! The hosted shell delivers output in arbitrary chunks: a line can be split
//! across reads, an escape sequence can be split across reads, and with raw
//! byte reads even a UTF-8 code point can be split. `LineAssembler` holds the
//! incomplete tail between calls and emits only complete, control-free,
//! trimmed lines in arrival order.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Matches CSI sequences (ESC [ params intermediates final), OSC sequences
/// (ESC ] ... BEL or ST), and two-byte escapes (ESC + one char).
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-9;?<>=!]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]",
    )
    .unwrap()
});

/// Longest unterminated fragment held before it is emitted as a line, in
/// bytes. Full-screen redraws can go a long time without a newline.
pub const FRAGMENT_LIMIT: usize = 64 * 1024;

/// C0 controls left over after escape stripping (tab is kept).
static CONTROL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x08\x0a-\x1f\x7f]").unwrap());

/// Strip ANSI escape sequences from PTY output.
pub fn strip_ansi(input: &str) -> String {
    ANSI_RE.replace_all(input, "").to_string()
}

/// Strip escape sequences and stray control characters, then trim.
///
/// Malformed or truncated sequences lose their ESC byte with the other
/// controls, so nothing here can fail.
pub fn normalize_line(raw: &str) -> String {
    let stripped = strip_ansi(raw);
    CONTROL_RE.replace_all(&stripped, "").trim().to_string()
}

/// Reassembles complete logical lines from a chunked output stream.
#[derive(Debug, Default)]
pub struct LineAssembler {
    /// Raw text after the last newline, kept until its line completes.
    fragment: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending_bytes: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a decoded text chunk; returns the lines it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.fragment.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.fragment.find('\n') {
            let raw: String = self.fragment.drain(..=pos).collect();
            let line = normalize_line(&raw);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        if self.fragment.len() > FRAGMENT_LIMIT {
            debug!(bytes = self.fragment.len(), "flushing unterminated output fragment");
            let line = normalize_line(&std::mem::take(&mut self.fragment));
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Feed raw PTY bytes.
    ///
    /// An incomplete UTF-8 sequence at the end is held for the next call;
    /// invalid bytes elsewhere become U+FFFD.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut buf = std::mem::take(&mut self.pending_bytes);
        buf.extend_from_slice(bytes);

        let mut text = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push('\u{FFFD}');
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending_bytes = rest.to_vec();

        self.push(&text)
    }

    /// The held, not yet terminated fragment (raw, unstripped).
    #[cfg(test)]
    pub fn fragment(&self) -> &str {
        &self.fragment
    }
}
