//! Session lifecycle facade
//!
//! Owns the map of live sessions, the PTY allocator path, the cached IPC
//! client pool and the event bus. On-disk and in-memory state merge in
//! `list`/`get`; everything tears down through `shutdown`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::activity::{compute_activity, ActivityInput};
use crate::config;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::ipc::{ControlCommand, IpcClient, SignalSpec};
use crate::keys::key_sequence;
use crate::pty::{PtyProcess, SpawnSpec};
use crate::session::{
    OnExit, RenameRequest, Session, SessionInit, SessionOp, SessionTaskError,
};
use crate::spawn::resolve_command;
use crate::store::{pid_alive, uniqueify, SessionStore, ZOMBIE_EXIT_CODE};
use crate::transcript::TranscriptWriter;
use crate::types::{
    ResizeSource, SessionEntry, SessionMeta, SessionStatus, TitleMode, WinSize,
};

const RENAME_QUEUE_DEPTH: usize = 64;
const ERROR_QUEUE_DEPTH: usize = 64;
/// How long `kill` waits for IPC-delivered signals to take effect before
/// signalling the pid directly.
const IPC_KILL_WAIT: std::time::Duration = std::time::Duration::from_millis(3500);

/// Options for [`SessionManager::create`].
pub struct CreateOptions {
    /// Pre-seeded id; generated when absent. Must match `[A-Za-z0-9_-]+`.
    pub session_id: Option<String>,
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment entries for the child.
    pub env: Vec<(String, String)>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Mirror PTY output onto this process's stdout (forwarder mode).
    pub forward_to_stdout: bool,
    pub title_mode: TitleMode,
    pub git_repo_path: Option<String>,
    pub git_branch: Option<String>,
    pub on_exit: Option<OnExit>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            name: None,
            cwd: None,
            env: Vec::new(),
            cols: None,
            rows: None,
            forward_to_stdout: false,
            title_mode: TitleMode::None,
            git_repo_path: None,
            git_branch: None,
            on_exit: None,
        }
    }
}

/// Input for [`SessionManager::send_input`]: literal text or a symbolic key.
#[derive(Debug, Clone, Default)]
pub struct InputPayload {
    pub text: Option<String>,
    pub key: Option<String>,
}

/// Outcome of a successful create.
#[derive(Debug, Clone)]
pub struct CreateResult {
    pub id: String,
    pub meta: SessionMeta,
}

pub struct SessionManager {
    store: SessionStore,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    clients: Mutex<HashMap<String, IpcClient>>,
    events: EventBus,
    renames_tx: mpsc::Sender<RenameRequest>,
    errors_tx: mpsc::Sender<SessionTaskError>,
    stopping: AtomicBool,
}

impl SessionManager {
    /// Build a manager over the default control root
    /// (`$VIBETUNNEL_CONTROL_DIR` or `~/.vibetunnel/control`).
    pub fn with_default_root() -> Result<Arc<Self>> {
        Ok(Self::new(SessionStore::new(config::control_root())?))
    }

    pub fn new(store: SessionStore) -> Arc<Self> {
        let (renames_tx, renames_rx) = mpsc::channel(RENAME_QUEUE_DEPTH);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_DEPTH);

        let manager = Arc::new(Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            renames_tx,
            errors_tx,
            stopping: AtomicBool::new(false),
        });

        // Sessions hold only the channel, never the manager, so this weak
        // handle is the single back edge.
        spawn_feedback_loop(Arc::downgrade(&manager), renames_rx, errors_rx);
        manager
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Create a session: resolve the command, lay out the directory, open
    /// the transcript, spawn the PTY and start the session's tasks.
    pub async fn create(&self, argv: &[String], opts: CreateOptions) -> Result<CreateResult> {
        self.ensure_running()?;

        let resolved = resolve_command(argv).await;
        let id = match opts.session_id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        if self.sessions.read().await.contains_key(&id) {
            return Err(CoreError::SessionAlreadyExists(id));
        }

        let cwd = match opts.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };

        let name = {
            let requested = opts
                .name
                .map(|n| sanitize_name(&n))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| default_name(&resolved));
            let taken: Vec<String> = self
                .store
                .list()
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|m| m.name)
                .collect();
            uniqueify(&requested, &taken)
        };

        let size = match (opts.cols, opts.rows) {
            (Some(cols), Some(rows)) => Some(WinSize::new(cols, rows)),
            _ => None,
        };

        let paths = self.store.create_dir(&id)?;

        let mut meta = SessionMeta {
            id: id.clone(),
            name,
            command: resolved.clone(),
            working_dir: cwd.clone(),
            status: SessionStatus::Starting,
            started_at: Utc::now(),
            last_modified: Utc::now(),
            pid: None,
            exit_code: None,
            initial_cols: opts.cols,
            initial_rows: opts.rows,
            last_clear_offset: None,
            version: config::build_version().to_string(),
            git_repo_path: opts.git_repo_path,
            git_branch: opts.git_branch,
            attached_via_vt: config::attached_via_vt(),
        };

        let result = self
            .spawn_session(&paths.transcript, &mut meta, &resolved, size, opts.env, SessionTasks {
                forward_to_stdout: opts.forward_to_stdout,
                title_mode: opts.title_mode,
                on_exit: opts.on_exit,
            })
            .await;

        match result {
            Ok(session) => {
                self.sessions.write().await.insert(id.clone(), session);
                self.events.publish(SessionEvent::SessionStarted {
                    session_id: id.clone(),
                    name: meta.name.clone(),
                    command: resolved,
                });
                Ok(CreateResult { id, meta })
            }
            Err(e) => {
                // Spawn failures leave no trace on disk.
                let _ = self.store.cleanup(&id).await;
                Err(e)
            }
        }
    }

    async fn spawn_session(
        &self,
        transcript_path: &std::path::Path,
        meta: &mut SessionMeta,
        argv: &[String],
        size: Option<WinSize>,
        extra_env: Vec<(String, String)>,
        tasks: SessionTasks,
    ) -> Result<Arc<Session>> {
        self.store.save(meta).await?;

        let header_size = size.unwrap_or_else(|| WinSize::new(80, 24));
        let env_subset: std::collections::BTreeMap<String, String> = ["TERM", "SHELL"]
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();
        let transcript = TranscriptWriter::open(
            transcript_path,
            header_size.cols,
            header_size.rows,
            Some(&argv.join(" ")),
            Some(&meta.name),
            Some(&env_subset),
        )?;

        let mut env = vec![
            ("VIBETUNNEL_SESSION_ID".to_string(), meta.id.clone()),
            ("TERM".to_string(), "xterm-256color".to_string()),
        ];
        env.extend(extra_env);

        let pty = PtyProcess::spawn(SpawnSpec {
            argv: argv.to_vec(),
            env,
            cwd: meta.working_dir.clone(),
            size,
        })?;

        meta.status = SessionStatus::Running;
        meta.pid = Some(pty.pid());
        meta.touch();
        self.store.save(meta).await?;

        Session::start(SessionInit {
            meta: meta.clone(),
            store: self.store.clone(),
            pty,
            transcript,
            title_mode: tasks.title_mode,
            forward_to_stdout: tasks.forward_to_stdout,
            events: self.events.clone(),
            renames: self.renames_tx.clone(),
            errors: self.errors_tx.clone(),
            on_exit: tasks.on_exit,
        })
    }

    /// Deliver input text or a symbolic key. The in-memory PTY is
    /// preferred; otherwise the session's IPC socket is used.
    pub async fn send_input(&self, id: &str, payload: InputPayload) -> Result<()> {
        self.ensure_running()?;

        let text = match (&payload.key, &payload.text) {
            (Some(key), _) => key_sequence(key)
                .ok_or_else(|| CoreError::Other(format!("unknown key: {key}")))?
                .to_string(),
            (None, Some(text)) => text.clone(),
            (None, None) => return Ok(()),
        };

        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = session {
            session.mark_input();
            return session.enqueue(SessionOp::Input(text)).await;
        }

        self.ipc_send_stdin(id, &text).await
    }

    /// Browser-sourced resize (the authoritative source in arbitration).
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.resize_from(id, cols, rows, ResizeSource::Browser).await
    }

    /// Resize with an explicit source; the forwarder reports its hosting
    /// terminal through this with [`ResizeSource::Terminal`].
    pub async fn resize_from(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        source: ResizeSource,
    ) -> Result<()> {
        self.ensure_running()?;

        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = session {
            return session
                .enqueue(SessionOp::Resize { cols, rows, source })
                .await;
        }
        self.ipc_send_control(id, &ControlCommand::Resize { cols, rows })
            .await
    }

    /// Ask the session's PTY to match its hosting terminal's current size.
    /// A session we host ourselves has no outer terminal to defer to.
    pub async fn reset_size(&self, id: &str) -> Result<()> {
        self.ensure_running()?;

        if self.sessions.read().await.contains_key(id) {
            debug!(session = %id, "reset-size is a no-op for sessions we host");
            return Ok(());
        }
        self.ipc_send_control(id, &ControlCommand::ResetSize).await
    }

    /// Rename a session. The stored name is sanitized, uniqueified and
    /// persisted; the final name is returned and broadcast.
    pub async fn rename(&self, id: &str, name: &str) -> Result<String> {
        self.ensure_running()?;

        let sanitized = sanitize_name(name);
        if sanitized.is_empty() {
            return Err(CoreError::Other("empty session name".into()));
        }

        let unique = self.store.update_name(id, &sanitized).await?;
        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = session {
            session.apply_name(&unique).await?;
        }

        self.events.publish(SessionEvent::SessionNameChanged {
            session_id: id.to_string(),
            name: unique.clone(),
        });
        Ok(unique)
    }

    /// Kill a session: in-memory PTY first, IPC second, direct signal
    /// escalation against the recorded pid as the last resort.
    pub async fn kill(&self, id: &str, signal: Option<Signal>) -> Result<()> {
        self.ensure_running()?;
        let signal = signal.unwrap_or(Signal::SIGTERM);

        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = session {
            return session.enqueue(SessionOp::Kill(signal)).await;
        }

        let meta = self.load_checked(id).await?;
        if meta.status == SessionStatus::Exited {
            return Ok(());
        }

        let sent = self
            .ipc_send_control(
                id,
                &ControlCommand::Kill {
                    signal: Some(SignalSpec::Number(signal as i32)),
                },
            )
            .await
            .is_ok();

        let Some(pid) = meta.pid else {
            return Ok(());
        };

        if sent {
            // The owning process runs the escalation; verify it worked.
            let deadline = tokio::time::Instant::now() + IPC_KILL_WAIT;
            while tokio::time::Instant::now() < deadline {
                if !pid_alive(Some(pid)) {
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            warn!(session = %id, pid, "ipc kill did not land, signalling directly");
        }

        signal_with_escalation(pid, signal).await;
        Ok(())
    }

    /// Drop in-memory records whose exit processing has finished; the
    /// directory remains the durable trace.
    async fn reap_exited(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|id, session| {
            if session.has_exited() {
                debug!(session = %id, "dropping exited session record");
                false
            } else {
                true
            }
        });
    }

    /// All sessions, disk and memory merged, with computed activity.
    pub async fn list(&self) -> Result<Vec<SessionEntry>> {
        self.reap_exited().await;
        let now = Utc::now();
        let mut entries = Vec::new();

        for disk_meta in self.store.list().await? {
            let live = self.sessions.read().await.get(&disk_meta.id).cloned();
            let entry = match live {
                Some(session) => {
                    let meta = session.meta_snapshot().await;
                    let activity = session.activity(now).await;
                    SessionEntry { meta, activity }
                }
                None => {
                    let activity = compute_activity(ActivityInput {
                        status: disk_meta.status,
                        last_output_at: None,
                        last_input_at: None,
                        last_modified: Some(disk_meta.last_modified),
                        started_at: Some(disk_meta.started_at),
                        now,
                        idle_timeout_ms: config::DEFAULT_IDLE_TIMEOUT_MS,
                    });
                    SessionEntry {
                        meta: disk_meta,
                        activity,
                    }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// One session, or `NotFound`.
    pub async fn get(&self, id: &str) -> Result<SessionEntry> {
        self.reap_exited().await;
        let now = Utc::now();
        let session = self.sessions.read().await.get(id).cloned();
        if let Some(session) = session {
            return Ok(SessionEntry {
                meta: session.meta_snapshot().await,
                activity: session.activity(now).await,
            });
        }

        let meta = self.load_checked(id).await?;
        let activity = compute_activity(ActivityInput {
            status: meta.status,
            last_output_at: None,
            last_input_at: None,
            last_modified: Some(meta.last_modified),
            started_at: Some(meta.started_at),
            now,
            idle_timeout_ms: config::DEFAULT_IDLE_TIMEOUT_MS,
        });
        Ok(SessionEntry { meta, activity })
    }

    /// Kill everything in memory, drain exits, drop cached IPC clients.
    /// Further operations return `Stopping`.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session manager shutting down");

        let sessions: Vec<Arc<Session>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();

        for session in &sessions {
            let _ = session.enqueue(SessionOp::Kill(Signal::SIGTERM)).await;
        }
        for session in &sessions {
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                session.wait_exit(),
            )
            .await;
        }

        self.clients.lock().await.clear();
    }

    /// Load metadata and apply the zombie rewrite if its pid is gone.
    async fn load_checked(&self, id: &str) -> Result<SessionMeta> {
        let mut meta = self.store.load(id).await?;
        if meta.status == SessionStatus::Running && !pid_alive(meta.pid) {
            meta.status = SessionStatus::Exited;
            meta.exit_code = Some(ZOMBIE_EXIT_CODE);
            meta.touch();
            self.store.save(&meta).await?;
        }
        Ok(meta)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            Err(CoreError::Stopping)
        } else {
            Ok(())
        }
    }

    async fn ipc_send_stdin(&self, id: &str, text: &str) -> Result<()> {
        let socket = self.store.paths(id).socket;
        let mut pool = self.clients.lock().await;
        if let Some(client) = pool.get_mut(id) {
            if client.send_stdin(text).await.is_ok() {
                return Ok(());
            }
            pool.remove(id);
        }
        let mut client = IpcClient::connect(&socket).await.map_err(|_| {
            CoreError::SessionNotFound(id.to_string())
        })?;
        client.send_stdin(text).await?;
        pool.insert(id.to_string(), client);
        Ok(())
    }

    async fn ipc_send_control(&self, id: &str, cmd: &ControlCommand) -> Result<()> {
        let socket = self.store.paths(id).socket;
        let mut pool = self.clients.lock().await;
        if let Some(client) = pool.get_mut(id) {
            if client.send_control(cmd).await.is_ok() {
                return Ok(());
            }
            pool.remove(id);
        }
        let mut client = IpcClient::connect(&socket).await.map_err(|_| {
            CoreError::SessionNotFound(id.to_string())
        })?;
        client.send_control(cmd).await?;
        pool.insert(id.to_string(), client);
        Ok(())
    }
}

struct SessionTasks {
    forward_to_stdout: bool,
    title_mode: TitleMode,
    on_exit: Option<OnExit>,
}

/// Direct signal escalation against a bare pid, used when no process owns
/// the PTY anymore: SIGTERM, 500 ms polls, SIGKILL at 3 s.
async fn signal_with_escalation(pid: u32, signal: Signal) {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    let _ = nix::sys::signal::kill(pid, signal);
    if signal == Signal::SIGKILL {
        return;
    }

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if nix::sys::signal::kill(pid, None).is_err() {
            return;
        }
    }
    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
}

fn spawn_feedback_loop(
    manager: std::sync::Weak<SessionManager>,
    mut renames_rx: mpsc::Receiver<RenameRequest>,
    mut errors_rx: mpsc::Receiver<SessionTaskError>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                request = renames_rx.recv() => {
                    let Some(request) = request else { break };
                    let Some(manager) = manager.upgrade() else { break };
                    if let Err(e) = manager.rename(&request.session_id, &request.name).await {
                        debug!(session = %request.session_id, "ipc rename rejected: {e}");
                    }
                }
                error = errors_rx.recv() => {
                    let Some(error) = error else { break };
                    warn!(session = %error.session_id, "session task error: {}", error.message);
                }
            }
        }
    });
}

fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidSessionId(id.to_string()))
    }
}

/// Names are bounded and printable: control characters stripped, 256 chars.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .take(256)
        .collect::<String>()
        .trim()
        .to_string()
}

fn default_name(argv: &[String]) -> String {
    argv.first()
        .map(|p| {
            std::path::Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| p.clone())
        })
        .unwrap_or_else(|| "session".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_validated() {
        assert!(validate_session_id("abc-123_XYZ").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("slash/id").is_err());
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("plain"), "plain");
        assert_eq!(sanitize_name("with\x07bell\x1b[31m"), "withbell[31m");
        assert_eq!(sanitize_name("  padded  "), "padded");
        assert_eq!(sanitize_name(&"x".repeat(400)).len(), 256);
    }

    #[test]
    fn default_names_use_the_program_basename() {
        assert_eq!(default_name(&["/usr/bin/htop".into()]), "htop");
        assert_eq!(default_name(&["bash".into(), "-l".into()]), "bash");
        assert_eq!(default_name(&[]), "session");
    }
}
