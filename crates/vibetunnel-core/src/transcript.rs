//! Append-only asciicast v2 recorder with exact byte-offset tracking
//!
//! Every event line is written whole and flushed, so a reader never observes
//! a partial line. Output bytes are buffered until they form complete UTF-8
//! code points; a trailing incomplete code point is held for the next write.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, Result};

/// Escapes that clear visible history or scrollback. Consumers use the
/// offset of the last one to skip replay history the user cleared.
const PRUNING_SEQUENCES: &[&str] = &[
    "\x1b[H\x1b[2J",
    "\x1b[H\x1b[3J",
    "\x1b[2J",
    "\x1b[3J",
    "\x1bc",
    "\x1b[?1049h",
];

/// Byte accounting for the transcript file.
///
/// `written + pending == total` always holds: `written` is on disk,
/// `pending` is output held back for UTF-8 completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub written: u64,
    pub pending: u64,
    pub total: u64,
}

type PruneCallback = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Serialize)]
struct Header<'a> {
    version: u8,
    width: u16,
    height: u16,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a BTreeMap<String, String>>,
}

struct Inner {
    file: File,
    written: u64,
    pending: Vec<u8>,
    closed: bool,
}

/// Durable asciicast v2 writer for one session.
pub struct TranscriptWriter {
    path: PathBuf,
    opened_at: Instant,
    inner: Mutex<Inner>,
    prune_cb: Mutex<Option<PruneCallback>>,
}

impl TranscriptWriter {
    /// Create the transcript file (truncating any previous one), write the
    /// header line and start byte accounting after it.
    pub fn open(
        path: &Path,
        cols: u16,
        rows: u16,
        command: Option<&str>,
        title: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CoreError::TranscriptOpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| CoreError::TranscriptOpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let header = Header {
            version: 2,
            width: cols,
            height: rows,
            timestamp: chrono::Utc::now().timestamp(),
            command,
            title,
            env,
        };
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            opened_at: Instant::now(),
            inner: Mutex::new(Inner {
                file,
                written: line.len() as u64,
                pending: Vec::new(),
                closed: false,
            }),
            prune_cb: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a callback invoked with the absolute file offset at which
    /// the last pruning sequence of an event ends, after that event is
    /// durably written.
    pub fn on_pruning_sequence(&self, cb: impl Fn(u64) + Send + Sync + 'static) {
        *self.prune_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Record raw terminal output.
    ///
    /// Only the UTF-8-valid prefix of the accumulated bytes is emitted;
    /// invalid interior bytes become U+FFFD and a trailing incomplete code
    /// point is retained for the next call.
    pub fn write_output(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CoreError::TranscriptClosed);
        }

        inner.pending.extend_from_slice(bytes);
        let (text, rest) = split_utf8_prefix(&inner.pending);
        if text.is_empty() {
            return Ok(());
        }
        inner.pending = rest;
        self.emit_event(&mut inner, "o", &text)
    }

    /// Record input text delivered to the PTY.
    pub fn write_input(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CoreError::TranscriptClosed);
        }
        self.emit_event(&mut inner, "i", text)
    }

    /// Record a terminal resize as `"COLSxROWS"`.
    pub fn write_resize(&self, cols: u16, rows: u16) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CoreError::TranscriptClosed);
        }
        self.emit_event(&mut inner, "r", &format!("{cols}x{rows}"))
    }

    /// Record a marker event.
    pub fn write_marker(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CoreError::TranscriptClosed);
        }
        self.emit_event(&mut inner, "m", text)
    }

    /// Write the terminal `["exit", code, id]` line and flush.
    ///
    /// Any output still held for UTF-8 completion is emitted first, with
    /// replacement characters for bytes that never completed.
    pub fn write_exit(&self, exit_code: i32, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CoreError::TranscriptClosed);
        }

        self.flush_pending(&mut inner)?;

        let line = format!(
            "[\"exit\",{},{}]\n",
            exit_code,
            serde_json::to_string(session_id)?
        );
        inner.file.write_all(line.as_bytes())?;
        inner.file.flush()?;
        inner.written += line.len() as u64;
        Ok(())
    }

    /// Current byte accounting.
    pub fn position(&self) -> Position {
        let inner = self.inner.lock().unwrap();
        Position {
            written: inner.written,
            pending: inner.pending.len() as u64,
            total: inner.written + inner.pending.len() as u64,
        }
    }

    /// Flush buffers and close the file. All writes fail afterwards.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        self.flush_pending(&mut inner)?;
        inner.file.flush()?;
        inner.closed = true;
        debug!(path = %self.path.display(), written = inner.written, "transcript closed");
        Ok(())
    }

    fn flush_pending(&self, inner: &mut Inner) -> Result<()> {
        if inner.pending.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&inner.pending).into_owned();
        inner.pending.clear();
        self.emit_event(inner, "o", &text)
    }

    /// Serialize one event line, append it, flush, and report the pruning
    /// offset if the payload contains a recognized sequence.
    fn emit_event(&self, inner: &mut Inner, kind: &str, payload: &str) -> Result<()> {
        let t = self.opened_at.elapsed().as_secs_f64();
        let prefix = format!("[{t:.6},\"{kind}\",");
        let encoded = serde_json::to_string(payload)?;
        let start = inner.written;

        let mut line = String::with_capacity(prefix.len() + encoded.len() + 2);
        line.push_str(&prefix);
        line.push_str(&encoded);
        line.push_str("]\n");

        inner.file.write_all(line.as_bytes())?;
        inner.file.flush()?;
        inner.written += line.len() as u64;

        if let Some(end) = last_pruning_end(payload) {
            // Offset of the sequence end inside the JSON-encoded payload on
            // disk: encode the payload prefix and drop its closing quote.
            let encoded_prefix_len = serde_json::to_string(&payload[..end])?.len() as u64 - 1;
            let offset = start + prefix.len() as u64 + encoded_prefix_len;
            if let Some(cb) = self.prune_cb.lock().unwrap().as_ref() {
                cb(offset);
            }
        }
        Ok(())
    }
}

/// Split a byte buffer into its longest emittable UTF-8 text and the bytes
/// to retain. Invalid interior bytes are replaced with U+FFFD; only a
/// trailing incomplete code point is retained.
fn split_utf8_prefix(bytes: &[u8]) -> (String, Vec<u8>) {
    let mut text = String::new();
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                text.push_str(s);
                return (text, Vec::new());
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // Safety of unwrap: valid_up_to bytes are valid by contract.
                text.push_str(std::str::from_utf8(&rest[..valid]).unwrap());
                match e.error_len() {
                    Some(bad) => {
                        text.push('\u{FFFD}');
                        rest = &rest[valid + bad..];
                    }
                    None => {
                        // Incomplete code point at the end of the buffer.
                        return (text, rest[valid..].to_vec());
                    }
                }
            }
        }
    }
}

/// Byte index just past the last pruning sequence in `payload`, if any.
fn last_pruning_end(payload: &str) -> Option<usize> {
    PRUNING_SEQUENCES
        .iter()
        .filter_map(|seq| payload.rfind(seq).map(|at| at + seq.len()))
        .max()
}
