//! Error types for the session core

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the session core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),

    #[error("failed to allocate pseudo-terminal: {0}")]
    PtyAllocationFailed(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("terminal ioctl failed: {0}")]
    IoctlFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("socket path too long ({len} bytes, limit {limit}): {path}")]
    PathTooLong {
        path: String,
        len: usize,
        limit: usize,
    },

    #[error("failed to bind {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open transcript {path}: {source}")]
    TranscriptOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("transcript is closed")]
    TranscriptClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("session manager is shutting down")]
    Stopping,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Rewrite a spawn-time OS error into the user-facing taxonomy.
    pub fn from_spawn_errno(errno: i32, program: &str, cwd: &std::path::Path) -> Self {
        match errno {
            libc::ENOENT => {
                if !cwd.exists() {
                    CoreError::WorkingDirMissing(cwd.to_path_buf())
                } else {
                    CoreError::CommandNotFound(program.to_string())
                }
            }
            libc::EACCES => CoreError::PermissionDenied(format!(
                "'{program}' exists but is not executable"
            )),
            libc::ENXIO => {
                CoreError::PtyAllocationFailed("no pseudo-terminal device available".to_string())
            }
            _ => CoreError::SpawnFailed(format!(
                "'{program}' failed to start: {}",
                std::io::Error::from_raw_os_error(errno)
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errno_rewrites_to_user_facing_kinds() {
        let cwd = std::path::Path::new("/");
        assert!(matches!(
            CoreError::from_spawn_errno(libc::ENOENT, "nope", cwd),
            CoreError::CommandNotFound(_)
        ));
        assert!(matches!(
            CoreError::from_spawn_errno(libc::EACCES, "secret", cwd),
            CoreError::PermissionDenied(_)
        ));
        assert!(matches!(
            CoreError::from_spawn_errno(libc::ENXIO, "sh", cwd),
            CoreError::PtyAllocationFailed(_)
        ));
    }

    #[test]
    fn enoent_with_missing_cwd_reports_the_directory() {
        let cwd = std::path::Path::new("/definitely/not/a/real/dir");
        assert!(matches!(
            CoreError::from_spawn_errno(libc::ENOENT, "ls", cwd),
            CoreError::WorkingDirMissing(_)
        ));
    }
}
