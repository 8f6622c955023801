//! On-disk session layout under the control root
//!
//! One directory per session id holding `session.json` (atomic writes),
//! the `stdout` transcript and the `ipc.sock` endpoint. The directory is
//! the source of truth across restarts.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::types::{SessionMeta, SessionStatus};

/// Usable bytes in a `sockaddr_un` path on the most restrictive supported
/// platform (macOS: 104 including the terminating NUL).
pub const MAX_SOCKET_PATH: usize = 103;

pub const META_FILE: &str = "session.json";
pub const TRANSCRIPT_FILE: &str = "stdout";
pub const SOCKET_FILE: &str = "ipc.sock";

/// Synthetic exit code recorded when a `running` session's pid is gone.
pub const ZOMBIE_EXIT_CODE: i32 = 1;

/// Filesystem locations of one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub meta: PathBuf,
    pub transcript: PathBuf,
    pub socket: PathBuf,
}

impl SessionPaths {
    fn under(root: &Path, id: &str) -> Self {
        let dir = root.join(id);
        Self {
            meta: dir.join(META_FILE),
            transcript: dir.join(TRANSCRIPT_FILE),
            socket: dir.join(SOCKET_FILE),
            dir,
        }
    }
}

/// Manager for the on-disk layout of sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    version: String,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            version: crate::config::build_version().to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &str) -> SessionPaths {
        SessionPaths::under(&self.root, id)
    }

    /// Create the session directory, failing fast on an oversized socket
    /// path or a colliding id.
    pub fn create_dir(&self, id: &str) -> Result<SessionPaths> {
        let paths = self.paths(id);

        let socket = paths.socket.as_os_str();
        if socket.len() > MAX_SOCKET_PATH {
            return Err(CoreError::PathTooLong {
                path: paths.socket.display().to_string(),
                len: socket.len(),
                limit: MAX_SOCKET_PATH,
            });
        }

        if paths.dir.exists() {
            return Err(CoreError::SessionAlreadyExists(id.to_string()));
        }
        std::fs::create_dir_all(&paths.dir)?;
        Ok(paths)
    }

    /// Atomically persist metadata: write a temp file in the same directory,
    /// then rename over `session.json`. A concurrent reader sees either the
    /// old or the new complete document.
    pub async fn save(&self, meta: &SessionMeta) -> Result<()> {
        let paths = self.paths(&meta.id);
        let tmp = paths.dir.join(".session.json.tmp");
        let body = serde_json::to_string_pretty(meta)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &paths.meta).await?;
        Ok(())
    }

    /// Read and parse metadata for one session.
    pub async fn load(&self, id: &str) -> Result<SessionMeta> {
        let paths = self.paths(id);
        let body = match tokio::fs::read_to_string(&paths.meta).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::SessionNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&body)?)
    }

    /// Enumerate all sessions on disk.
    ///
    /// Entries whose recorded pid no longer exists but whose status says
    /// `running` are zombies: they are rewritten to `exited` with a
    /// synthetic exit code before being returned.
    pub async fn list(&self) -> Result<Vec<SessionMeta>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let mut meta = match self.load(&id).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(%id, "skipping unreadable session entry: {e}");
                    continue;
                }
            };

            if meta.status == SessionStatus::Running && !pid_alive(meta.pid) {
                info!(%id, pid = ?meta.pid, "rewriting zombie session to exited");
                meta.status = SessionStatus::Exited;
                meta.exit_code = Some(ZOMBIE_EXIT_CODE);
                meta.touch();
                if let Err(e) = self.save(&meta).await {
                    warn!(%id, "failed to persist zombie rewrite: {e}");
                }
            }
            sessions.push(meta);
        }

        sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(sessions)
    }

    /// Remove one session directory. Idempotent.
    pub async fn cleanup(&self, id: &str) -> Result<()> {
        let paths = self.paths(id);
        match tokio::fs::remove_dir_all(&paths.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every session whose metadata says `exited`. Returns the count.
    pub async fn cleanup_exited(&self) -> Result<usize> {
        let mut removed = 0;
        for meta in self.list().await? {
            if meta.status == SessionStatus::Exited {
                self.cleanup(&meta.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove sessions created by a different build version.
    /// Returns `(removed, kept)`.
    pub async fn cleanup_old_versions(&self) -> Result<(usize, usize)> {
        let mut removed = 0;
        let mut kept = 0;
        for meta in self.list().await? {
            if meta.version != self.version {
                debug!(id = %meta.id, version = %meta.version, "removing old-version session");
                self.cleanup(&meta.id).await?;
                removed += 1;
            } else {
                kept += 1;
            }
        }
        Ok((removed, kept))
    }

    /// Persist a new name for a session, uniqueified against every other
    /// session on disk with a ` (2)`, ` (3)`, … suffix.
    pub async fn update_name(&self, id: &str, name: &str) -> Result<String> {
        let taken: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.id != id)
            .map(|m| m.name)
            .collect();

        let unique = uniqueify(name, &taken);

        let mut meta = self.load(id).await?;
        meta.name = unique.clone();
        meta.touch();
        self.save(&meta).await?;
        Ok(unique)
    }
}

/// Pick `name`, or the first `name (n)` with `n >= 2` not already taken.
pub fn uniqueify(name: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == name) {
        return name.to_string();
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{name} ({n})");
        if !taken.iter().any(|t| *t == candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Whether a recorded pid still refers to a live process.
pub fn pid_alive(pid: Option<u32>) -> bool {
    match pid {
        // kill(pid, 0) probes existence without signalling. EPERM still
        // means the process exists.
        Some(pid) => unsafe {
            libc::kill(pid as i32, 0) == 0
                || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn meta(id: &str, name: &str, status: SessionStatus, pid: Option<u32>) -> SessionMeta {
        SessionMeta {
            id: id.into(),
            name: name.into(),
            command: vec!["/bin/sh".into()],
            working_dir: "/tmp".into(),
            status,
            started_at: Utc::now(),
            last_modified: Utc::now(),
            pid,
            exit_code: None,
            initial_cols: None,
            initial_rows: None,
            last_clear_offset: None,
            version: crate::config::build_version().into(),
            git_repo_path: None,
            git_branch: None,
            attached_via_vt: false,
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create_dir("s1").unwrap();
        store.save(&meta("s1", "one", SessionStatus::Starting, None)).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.name, "one");
        assert_eq!(loaded.status, SessionStatus::Starting);
        // No temp file left behind.
        assert!(!dir.path().join("s1/.session.json.tmp").exists());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("ghost").await,
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_dir_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create_dir("dup").unwrap();
        assert!(matches!(
            store.create_dir("dup"),
            Err(CoreError::SessionAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn oversized_socket_path_fails_fast() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let long_id = "x".repeat(MAX_SOCKET_PATH);
        assert!(matches!(
            store.create_dir(&long_id),
            Err(CoreError::PathTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn list_rewrites_zombies() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create_dir("z1").unwrap();
        // A pid far above any default pid_max.
        store
            .save(&meta("z1", "zombie", SessionStatus::Running, Some(3_999_999)))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SessionStatus::Exited);
        assert_eq!(listed[0].exit_code, Some(ZOMBIE_EXIT_CODE));

        // The rewrite is persisted.
        let reloaded = store.load("z1").await.unwrap();
        assert_eq!(reloaded.status, SessionStatus::Exited);
    }

    #[tokio::test]
    async fn live_pid_is_not_a_zombie() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create_dir("alive").unwrap();
        store
            .save(&meta(
                "alive",
                "me",
                SessionStatus::Running,
                Some(std::process::id()),
            ))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.create_dir("gone").unwrap();
        store.save(&meta("gone", "g", SessionStatus::Exited, None)).await.unwrap();

        store.cleanup("gone").await.unwrap();
        store.cleanup("gone").await.unwrap();
        assert!(matches!(
            store.load("gone").await,
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_exited_leaves_running_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        for (id, status, pid) in [
            ("a", SessionStatus::Exited, None),
            ("b", SessionStatus::Running, Some(std::process::id())),
        ] {
            store.create_dir(id).unwrap();
            store.save(&meta(id, id, status, pid)).await.unwrap();
        }

        let removed = store.cleanup_exited().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("b").await.is_ok());
        assert!(store.load("a").await.is_err());
    }

    #[tokio::test]
    async fn cleanup_old_versions_counts() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        store.create_dir("old").unwrap();
        let mut old = meta("old", "old", SessionStatus::Exited, None);
        old.version = "0.0.0-ancient".into();
        store.save(&old).await.unwrap();

        store.create_dir("new").unwrap();
        store.save(&meta("new", "new", SessionStatus::Exited, None)).await.unwrap();

        let (removed, kept) = store.cleanup_old_versions().await.unwrap();
        assert_eq!((removed, kept), (1, 1));
        assert!(store.load("new").await.is_ok());
    }

    #[tokio::test]
    async fn update_name_uniqueifies() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        for id in ["s1", "s2", "s3"] {
            store.create_dir(id).unwrap();
            store.save(&meta(id, id, SessionStatus::Running, Some(std::process::id())))
                .await
                .unwrap();
        }

        assert_eq!(store.update_name("s1", "work").await.unwrap(), "work");
        assert_eq!(store.update_name("s2", "work").await.unwrap(), "work (2)");
        assert_eq!(store.update_name("s3", "work").await.unwrap(), "work (3)");
        // Renaming the holder again keeps its own name free.
        assert_eq!(store.update_name("s1", "work").await.unwrap(), "work");
    }

    #[test]
    fn uniqueify_skips_taken_suffixes() {
        let taken = vec!["a".into(), "a (2)".into(), "a (4)".into()];
        assert_eq!(uniqueify("a", &taken), "a (3)");
        assert_eq!(uniqueify("b", &taken), "b");
    }
}
