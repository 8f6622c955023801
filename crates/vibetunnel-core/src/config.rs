//! Environment-driven configuration for the session core

use std::path::PathBuf;

use crate::types::TitleMode;

/// Overrides the control root (default `~/.vibetunnel/control`).
pub const ENV_CONTROL_DIR: &str = "VIBETUNNEL_CONTROL_DIR";
/// Set in the child environment; signals an attached-via-vt spawn.
pub const ENV_SESSION_ID: &str = "VIBETUNNEL_SESSION_ID";
pub const ENV_TITLE_MODE: &str = "VIBETUNNEL_TITLE_MODE";
pub const ENV_LOG_LEVEL: &str = "VIBETUNNEL_LOG_LEVEL";
pub const ENV_DEBUG: &str = "VIBETUNNEL_DEBUG";

/// Default idle window for activity detection.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5000;

/// Resolve the control root: env override first, then `~/.vibetunnel/control`.
pub fn control_root() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_CONTROL_DIR) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".vibetunnel")
        .join("control")
}

/// Title mode from the environment, if set and valid.
pub fn title_mode_from_env() -> Option<TitleMode> {
    std::env::var(ENV_TITLE_MODE).ok()?.parse().ok()
}

/// Whether the current process is itself running inside a vt session.
pub fn attached_via_vt() -> bool {
    std::env::var(ENV_SESSION_ID).map_or(false, |v| !v.is_empty())
}

/// Log filter directive resolved from the environment.
///
/// `VIBETUNNEL_LOG_LEVEL` wins; `VIBETUNNEL_DEBUG=1` implies `debug`.
pub fn log_level_from_env() -> Option<String> {
    if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
        if !level.is_empty() {
            return Some(level);
        }
    }
    match std::env::var(ENV_DEBUG).ok().as_deref() {
        Some("1") | Some("true") => Some("debug".to_string()),
        _ => None,
    }
}

/// Build version stamped into session metadata.
pub fn build_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
