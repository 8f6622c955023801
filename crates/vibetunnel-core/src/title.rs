//! Terminal title handling
//!
//! Static mode injects an OSC 2 title describing the session into the host
//! stdout, only during output quiet periods so the sequence never lands
//! inside another escape. Filter mode strips child-produced title
//! sequences from the forwarded stream.

use std::path::Path;
use std::time::{Duration, Instant};

/// Minimum output silence before an injection is safe.
pub const QUIET_PERIOD: Duration = Duration::from_millis(50);
/// How often the injector checks for a safe window.
pub const INJECT_POLL: Duration = Duration::from_millis(10);
/// How often the desired title is recomputed.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Build the static title sequence: `ESC ] 2 ; name · cwd · cmd BEL`.
pub fn static_title_sequence(name: &str, cwd: &Path, argv0: &str) -> String {
    let cwd = abbreviate_home(cwd);
    let cmd = Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| argv0.to_string());
    format!("\x1b]2;{name} · {cwd} · {cmd}\x07")
}

fn abbreviate_home(path: &Path) -> String {
    let display = path.display().to_string();
    if let Some(home) = dirs::home_dir() {
        let home = home.display().to_string();
        if display == home {
            return "~".to_string();
        }
        if let Some(rest) = display.strip_prefix(&format!("{home}/")) {
            return format!("~/{rest}");
        }
    }
    display
}

/// Injection scheduling state for one session.
#[derive(Debug)]
pub struct TitleState {
    current: Option<String>,
    pending: Option<String>,
}

impl TitleState {
    pub fn new() -> Self {
        Self {
            current: None,
            pending: None,
        }
    }

    /// Queue `title` for injection if it differs from what is on screen.
    pub fn refresh(&mut self, title: String) {
        if self.current.as_deref() != Some(title.as_str()) {
            self.pending = Some(title);
        }
    }

    /// Take the pending title if the output stream has been quiet long
    /// enough for an injection to be safe.
    pub fn take_if_quiet(&mut self, last_write: Instant, now: Instant) -> Option<String> {
        if now.duration_since(last_write) < QUIET_PERIOD {
            return None;
        }
        let title = self.pending.take()?;
        self.current = Some(title.clone());
        Some(title)
    }
}

impl Default for TitleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Heuristic `cd` sniffing from input text, used to keep the static title's
/// directory current without querying the child.
pub fn sniff_cd(input: &str, current: &Path, home: &Path) -> Option<std::path::PathBuf> {
    for line in input.split(['\n', '\r']) {
        let line = line.trim();
        let arg = if line == "cd" {
            ""
        } else if let Some(rest) = line.strip_prefix("cd ") {
            rest.trim()
        } else {
            continue;
        };

        let arg = arg.trim_matches(|c| c == '\'' || c == '"');
        return Some(match arg {
            "" | "~" => home.to_path_buf(),
            "-" => return None, // previous dir is unknowable from here
            _ if arg.starts_with("~/") => home.join(&arg[2..]),
            _ if arg.starts_with('/') => arg.into(),
            _ => current.join(arg),
        });
    }
    None
}

/// Longest title sequence the filter will buffer while waiting for its
/// terminator; anything longer is passed through untouched.
const MAX_HELD: usize = 4096;

/// Stateful filter that removes OSC 0/1/2 title sequences from a byte
/// stream, holding partial sequences across chunk boundaries.
#[derive(Debug, Default)]
pub struct TitleFilter {
    held: Vec<u8>,
}

impl TitleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk, returning the bytes safe to forward.
    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.held);
        data.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            match title_sequence_at(&data[i..]) {
                Scan::NotTitle => {
                    out.push(data[i]);
                    i += 1;
                }
                Scan::Complete(len) => i += len,
                Scan::Partial => {
                    if data.len() - i > MAX_HELD {
                        // Unterminated for too long; stop filtering it.
                        out.extend_from_slice(&data[i..]);
                        return out;
                    }
                    // Might complete in the next chunk; hold it back.
                    self.held = data[i..].to_vec();
                    return out;
                }
            }
        }
        out
    }
}

impl TitleFilter {
    /// Give back whatever is still held at end of stream; an unfinished
    /// title sequence is forwarded as-is rather than lost.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }
}

enum Scan {
    NotTitle,
    /// A full title sequence of this byte length starts here.
    Complete(usize),
    /// A prefix of a title sequence runs to the end of the buffer.
    Partial,
}

/// Classify the bytes at the start of `data` against `ESC ] 0|1|2 ; … BEL`
/// (or `ESC \` terminated).
fn title_sequence_at(data: &[u8]) -> Scan {
    const PREFIX: &[&[u8]] = &[b"\x1b]0;", b"\x1b]1;", b"\x1b]2;"];

    if data[0] != 0x1b {
        return Scan::NotTitle;
    }

    let matches_prefix = PREFIX.iter().any(|p| {
        let common = p.len().min(data.len());
        data[..common] == p[..common]
    });
    if !matches_prefix {
        return Scan::NotTitle;
    }
    if data.len() < 4 {
        return Scan::Partial;
    }

    // Find the terminator: BEL or ESC backslash.
    let mut i = 4;
    while i < data.len() {
        match data[i] {
            0x07 => return Scan::Complete(i + 1),
            0x1b => {
                if i + 1 < data.len() {
                    return if data[i + 1] == b'\\' {
                        Scan::Complete(i + 2)
                    } else {
                        // Unterminated; give up filtering this one.
                        Scan::NotTitle
                    };
                }
                return Scan::Partial;
            }
            _ => i += 1,
        }
    }
    Scan::Partial
}
