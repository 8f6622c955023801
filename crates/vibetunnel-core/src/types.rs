//! Session data model: persisted metadata and runtime state shared with consumers

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityStatus;

/// Lifecycle status of a session. Progresses monotonically
/// `starting -> running -> exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Exited)
    }
}

/// Where a resize request originated; used for last-resize-wins arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeSource {
    Browser,
    Terminal,
}

/// Terminal title handling for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    #[default]
    None,
    /// Strip title sequences produced by the child.
    Filter,
    /// Inject a fixed title describing the session.
    Static,
}

impl FromStr for TitleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(TitleMode::None),
            "filter" => Ok(TitleMode::Filter),
            "static" => Ok(TitleMode::Static),
            other => Err(format!("unknown title mode: {other}")),
        }
    }
}

/// Session metadata persisted as `session.json` inside the session directory.
///
/// The directory is the source of truth across restarts; writes go through
/// [`crate::store::SessionStore::save`] which is atomic (temp + rename).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    /// Argv actually spawned, after alias and `$PATH` resolution.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_rows: Option<u16>,
    /// Byte offset in the transcript at which the most recent pruning
    /// sequence ends. Consumers skip replay history before this point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_clear_offset: Option<u64>,
    /// Build version that created the session.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    /// True when the session was spawned from inside another vt session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub attached_via_vt: bool,
}

impl SessionMeta {
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// The most recent resize applied to a session's PTY.
#[derive(Debug, Clone, Copy)]
pub struct LastResize {
    pub cols: u16,
    pub rows: u16,
    pub source: ResizeSource,
    pub at: Instant,
}

/// A session entry as returned by `list`/`get`: persisted metadata plus
/// the computed activity status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    #[serde(flatten)]
    pub meta: SessionMeta,
    pub activity: ActivityStatus,
}

/// Terminal dimensions, in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
    pub cols: u16,
    pub rows: u16,
}

impl WinSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}
