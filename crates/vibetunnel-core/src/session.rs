//! Per-session runtime: task wiring around one PTY child
//!
//! Each session owns a small set of tasks: the output pump, the IPC
//! request bridge, the single input serializer (total FIFO order across
//! connections), the foreground tracker and, when forwarding, the stdout
//! writer and title injector. All of them observe the session's
//! cancellation token, and exit processing is idempotent because PTY EOF,
//! explicit kill and manager shutdown can race.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{compute_activity, ActivityInput, ActivityStatus};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::ipc::{IpcEndpoint, IpcRequest, MessageType};
use crate::pty::{terminal_size, ExitInfo, PtyProcess};
use crate::store::SessionStore;
use crate::title::{
    static_title_sequence, sniff_cd, TitleFilter, TitleState, INJECT_POLL, REFRESH_INTERVAL,
};
use crate::tracker::{
    fallback_foreground_pgid, lookup_pgid_command, CommandTracker, TrackerEvent, POLL_INTERVAL,
};
use crate::transcript::TranscriptWriter;
use crate::types::{LastResize, ResizeSource, SessionMeta, SessionStatus, TitleMode};
use crate::ipc::ControlCommand;

const OPS_QUEUE_DEPTH: usize = 256;
const STDOUT_QUEUE_DEPTH: usize = 64;
const IPC_QUEUE_DEPTH: usize = 128;

/// Grace window during which a browser-sourced resize outranks the
/// hosting terminal's.
const RESIZE_GRACE: std::time::Duration = std::time::Duration::from_secs(1);
/// Resizes closer together than this look like a feedback loop.
const RESIZE_LOOP_WINDOW: std::time::Duration = std::time::Duration::from_millis(100);

/// Monotonic-ish activity timestamps, written by the pump and the input
/// path, read by `list`/`get`.
#[derive(Debug, Default)]
pub struct ActivityClock {
    last_output: StdMutex<Option<DateTime<Utc>>>,
    last_input: StdMutex<Option<DateTime<Utc>>>,
}

impl ActivityClock {
    pub fn mark_output(&self) {
        *self.last_output.lock().unwrap() = Some(Utc::now());
    }

    pub fn mark_input(&self) {
        *self.last_input.lock().unwrap() = Some(Utc::now());
    }

    pub fn snapshot(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (
            *self.last_output.lock().unwrap(),
            *self.last_input.lock().unwrap(),
        )
    }
}

/// Operations drained by the session's input serializer, strictly FIFO by
/// arrival.
#[derive(Debug)]
pub enum SessionOp {
    Input(String),
    Resize {
        cols: u16,
        rows: u16,
        source: ResizeSource,
    },
    ResetSize,
    Kill(Signal),
    Status {
        reply: mpsc::Sender<Bytes>,
    },
}

/// Rename requested from inside a session (IPC `update-title`); handled by
/// the manager, which owns name uniqueness.
#[derive(Debug)]
pub struct RenameRequest {
    pub session_id: String,
    pub name: String,
}

/// An error surfaced from a session's background tasks.
#[derive(Debug)]
pub struct SessionTaskError {
    pub session_id: String,
    pub message: String,
}

pub type OnExit = Box<dyn FnOnce(i32) + Send + 'static>;

/// Everything needed to wire a freshly spawned session.
pub struct SessionInit {
    pub meta: SessionMeta,
    pub store: SessionStore,
    pub pty: PtyProcess,
    pub transcript: TranscriptWriter,
    pub title_mode: TitleMode,
    pub forward_to_stdout: bool,
    pub events: EventBus,
    pub renames: mpsc::Sender<RenameRequest>,
    pub errors: mpsc::Sender<SessionTaskError>,
    pub on_exit: Option<OnExit>,
}

/// One live session owned by the manager.
pub struct Session {
    pub id: String,
    pty: Arc<PtyProcess>,
    meta: Arc<RwLock<SessionMeta>>,
    endpoint: Arc<IpcEndpoint>,
    ops_tx: mpsc::Sender<SessionOp>,
    cancel: CancellationToken,
    clock: Arc<ActivityClock>,
    /// Entry guard for exit processing; flips first.
    finalizing: Arc<AtomicBool>,
    /// Set only after exit state is persisted and resources are released.
    exited: Arc<AtomicBool>,
    store: SessionStore,
}

impl Session {
    /// Bind the IPC endpoint and launch the session's tasks.
    pub fn start(init: SessionInit) -> Result<Arc<Self>> {
        let id = init.meta.id.clone();
        let cwd = Arc::new(StdMutex::new(init.meta.working_dir.clone()));
        let cancel = CancellationToken::new();
        let pty = Arc::new(init.pty);
        let transcript = Arc::new(init.transcript);
        let meta = Arc::new(RwLock::new(init.meta));
        let clock = Arc::new(ActivityClock::default());
        let finalizing = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let tracker = Arc::new(StdMutex::new(CommandTracker::new(pty.pid() as i32)));
        let last_resize: Arc<StdMutex<Option<LastResize>>> = Arc::new(StdMutex::new(None));
        let last_write = Arc::new(StdMutex::new(Instant::now()));
        let on_exit = Arc::new(StdMutex::new(init.on_exit));

        let (ops_tx, ops_rx) = mpsc::channel::<SessionOp>(OPS_QUEUE_DEPTH);
        let (ipc_tx, ipc_rx) = mpsc::channel::<IpcRequest>(IPC_QUEUE_DEPTH);

        let paths = init.store.paths(&id);
        let endpoint = Arc::new(IpcEndpoint::bind(&paths.socket, ipc_tx, cancel.child_token())?);

        // Pruning offsets flow from the transcript's sync callback into an
        // async task that persists them.
        let (prune_tx, prune_rx) = mpsc::unbounded_channel::<u64>();
        transcript.on_pruning_sequence(move |offset| {
            let _ = prune_tx.send(offset);
        });
        spawn_prune_task(
            id.clone(),
            prune_rx,
            meta.clone(),
            init.store.clone(),
            cancel.child_token(),
        );

        // IPC requests feed the serializer, preserving arrival order.
        spawn_ipc_bridge(
            id.clone(),
            ipc_rx,
            ops_tx.clone(),
            init.renames.clone(),
            clock.clone(),
            cancel.child_token(),
        );

        // Optional host-stdout forwarding, bounded so a slow terminal
        // never blocks transcript writes beyond the queue depth.
        let stdout_tx = if init.forward_to_stdout {
            Some(spawn_stdout_writer(
                init.title_mode,
                last_write.clone(),
                cancel.child_token(),
            ))
        } else {
            None
        };

        let session = Arc::new(Self {
            id: id.clone(),
            pty: pty.clone(),
            meta: meta.clone(),
            endpoint: endpoint.clone(),
            ops_tx,
            cancel: cancel.clone(),
            clock: clock.clone(),
            finalizing: finalizing.clone(),
            exited: exited.clone(),
            store: init.store.clone(),
        });

        spawn_output_pump(
            session.clone(),
            transcript.clone(),
            stdout_tx,
            tracker.clone(),
            init.events.clone(),
            init.errors.clone(),
            on_exit.clone(),
        );

        spawn_input_serializer(
            session.clone(),
            ops_rx,
            transcript.clone(),
            tracker.clone(),
            last_resize,
            cwd.clone(),
            init.title_mode,
            init.forward_to_stdout,
            init.errors,
        );

        spawn_tracker_poll(
            id.clone(),
            pty,
            tracker,
            init.events.clone(),
            cancel.child_token(),
        );

        if init.forward_to_stdout && init.title_mode == TitleMode::Static {
            spawn_title_injector(meta, cwd, last_write, cancel.child_token());
        }

        info!(session = %id, "session tasks started");
        Ok(session)
    }

    pub async fn meta_snapshot(&self) -> SessionMeta {
        self.meta.read().await.clone()
    }

    pub async fn enqueue(&self, op: SessionOp) -> Result<()> {
        self.ops_tx
            .send(op)
            .await
            .map_err(|_| CoreError::SessionNotFound(self.id.clone()))
    }

    pub fn mark_input(&self) {
        self.clock.mark_input();
    }

    pub fn client_count(&self) -> usize {
        self.endpoint.client_count()
    }

    pub fn broadcast(&self, msg_type: MessageType, payload: &[u8]) {
        self.endpoint.broadcast(msg_type, payload);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Wait until the child is gone and exit processing ran.
    pub async fn wait_exit(&self) -> ExitInfo {
        let info = self.pty.wait_exit().await;
        // Exit processing runs on the pump task; give it a beat.
        while !self.has_exited() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        info
    }

    /// Activity inputs for this live session.
    pub async fn activity(&self, now: DateTime<Utc>) -> ActivityStatus {
        let meta = self.meta.read().await;
        let (last_output, last_input) = self.clock.snapshot();
        compute_activity(ActivityInput {
            status: meta.status,
            last_output_at: last_output,
            last_input_at: last_input,
            last_modified: Some(meta.last_modified),
            started_at: Some(meta.started_at),
            now,
            idle_timeout_ms: crate::config::DEFAULT_IDLE_TIMEOUT_MS,
        })
    }

    /// Apply an already-uniqueified name. Called by the manager only.
    pub async fn apply_name(&self, name: &str) -> Result<()> {
        let mut meta = self.meta.write().await;
        meta.name = name.to_string();
        meta.touch();
        self.store.save(&meta).await
    }
}

fn spawn_prune_task(
    id: String,
    mut prune_rx: mpsc::UnboundedReceiver<u64>,
    meta: Arc<RwLock<SessionMeta>>,
    store: SessionStore,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let offset = tokio::select! {
                _ = cancel.cancelled() => break,
                offset = prune_rx.recv() => match offset {
                    Some(offset) => offset,
                    None => break,
                },
            };
            let snapshot = {
                let mut guard = meta.write().await;
                guard.last_clear_offset = Some(offset);
                guard.touch();
                guard.clone()
            };
            if let Err(e) = store.save(&snapshot).await {
                warn!(session = %id, "failed to persist clear offset: {e}");
            }
        }
    });
}

fn spawn_ipc_bridge(
    id: String,
    mut ipc_rx: mpsc::Receiver<IpcRequest>,
    ops_tx: mpsc::Sender<SessionOp>,
    renames: mpsc::Sender<RenameRequest>,
    clock: Arc<ActivityClock>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = ipc_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let op = match request {
                IpcRequest::Stdin(text) => {
                    // Stamped before the write lands so active/idle cannot
                    // oscillate around slow PTY writes.
                    clock.mark_input();
                    SessionOp::Input(text)
                }
                IpcRequest::Control(ControlCommand::Resize { cols, rows }) => SessionOp::Resize {
                    cols,
                    rows,
                    source: ResizeSource::Browser,
                },
                IpcRequest::Control(ControlCommand::Kill { signal }) => {
                    let signal = signal
                        .and_then(|s| s.to_signal())
                        .unwrap_or(Signal::SIGTERM);
                    SessionOp::Kill(signal)
                }
                IpcRequest::Control(ControlCommand::ResetSize) => SessionOp::ResetSize,
                IpcRequest::Control(ControlCommand::UpdateTitle { title }) => {
                    let _ = renames
                        .send(RenameRequest {
                            session_id: id.clone(),
                            name: title,
                        })
                        .await;
                    continue;
                }
                IpcRequest::Status { reply } => SessionOp::Status { reply },
            };

            if ops_tx.send(op).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_stdout_writer(
    title_mode: TitleMode,
    last_write: Arc<StdMutex<Instant>>,
    cancel: CancellationToken,
) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(STDOUT_QUEUE_DEPTH);
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut stdout = tokio::io::stdout();
        let mut filter = (title_mode == TitleMode::Filter).then(TitleFilter::new);
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            let bytes = match filter.as_mut() {
                Some(filter) => filter.filter(&chunk),
                None => chunk.to_vec(),
            };
            if bytes.is_empty() {
                continue;
            }
            if stdout.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
            *last_write.lock().unwrap() = Instant::now();
        }
        if let Some(mut filter) = filter {
            let tail = filter.finish();
            if !tail.is_empty() {
                let _ = stdout.write_all(&tail).await;
                let _ = stdout.flush().await;
            }
        }
    });
    tx
}

fn spawn_output_pump(
    session: Arc<Session>,
    transcript: Arc<TranscriptWriter>,
    stdout_tx: Option<mpsc::Sender<Bytes>>,
    tracker: Arc<StdMutex<CommandTracker>>,
    events: EventBus,
    errors: mpsc::Sender<SessionTaskError>,
    on_exit: Arc<StdMutex<Option<OnExit>>>,
) {
    let mut output_rx = session
        .pty
        .take_output()
        .expect("output channel taken exactly once, at wiring time");

    tokio::spawn(async move {
        let cancel = session.cancel.clone();
        let mut child_exit: Option<ExitInfo> = None;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = output_rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break, // PTY EOF
                },
                // The child can die while a grandchild keeps the slave
                // open; the session still ends with the child.
                info = session.pty.wait_exit(), if child_exit.is_none() => {
                    child_exit = Some(info);
                    break;
                }
            };

            if !forward_chunk(&session, &transcript, &stdout_tx, &events, &errors, chunk).await {
                break;
            }
        }

        // Drain output already buffered at exit time, bounded by a short
        // quiet window so a lingering slave holder cannot stall teardown.
        loop {
            match tokio::time::timeout(std::time::Duration::from_millis(250), output_rx.recv())
                .await
            {
                Ok(Some(chunk)) => {
                    if !forward_chunk(&session, &transcript, &stdout_tx, &events, &errors, chunk)
                        .await
                    {
                        break;
                    }
                }
                _ => break,
            }
        }

        let exit = match child_exit {
            Some(exit) => exit,
            None => session.pty.wait_exit().await,
        };
        finalize_session(&session, &transcript, &tracker, &events, exit, &on_exit).await;
    });
}

/// Record one output chunk and fan it out. Returns false when the pump
/// should stop.
async fn forward_chunk(
    session: &Arc<Session>,
    transcript: &TranscriptWriter,
    stdout_tx: &Option<mpsc::Sender<Bytes>>,
    events: &EventBus,
    errors: &mpsc::Sender<SessionTaskError>,
    chunk: Bytes,
) -> bool {
    if let Err(e) = transcript.write_output(&chunk) {
        let _ = errors
            .send(SessionTaskError {
                session_id: session.id.clone(),
                message: format!("transcript write failed: {e}"),
            })
            .await;
        return false;
    }
    session.clock.mark_output();

    if chunk.contains(&0x07) {
        events.publish(SessionEvent::Bell {
            session_id: session.id.clone(),
        });
    }

    if let Some(tx) = stdout_tx {
        // Await, never drop: the bounded queue is the explicit
        // backpressure between PTY draining and a slow terminal.
        if tx.send(chunk).await.is_err() {
            return false;
        }
    }
    true
}

/// Exit processing. Idempotent: PTY EOF, kill and shutdown can all get
/// here, only the first does the work.
async fn finalize_session(
    session: &Arc<Session>,
    transcript: &TranscriptWriter,
    tracker: &StdMutex<CommandTracker>,
    events: &EventBus,
    exit: ExitInfo,
    on_exit: &StdMutex<Option<OnExit>>,
) {
    if session.finalizing.swap(true, Ordering::SeqCst) {
        return;
    }

    tracker.lock().unwrap().set_exiting();

    if let Err(e) = transcript.write_exit(exit.code, &session.id) {
        debug!(session = %session.id, "exit line not written: {e}");
    }
    if let Err(e) = transcript.close() {
        debug!(session = %session.id, "transcript close: {e}");
    }

    let snapshot = {
        let mut meta = session.meta.write().await;
        meta.status = SessionStatus::Exited;
        meta.exit_code = Some(exit.code);
        meta.touch();
        meta.clone()
    };
    if let Err(e) = session.store.save(&snapshot).await {
        warn!(session = %session.id, "failed to persist exit: {e}");
    }

    events.publish(SessionEvent::SessionExited {
        session_id: session.id.clone(),
        exit_code: exit.code,
        signal: exit.signal,
    });

    session.endpoint.shutdown();
    session.cancel.cancel();

    if let Some(cb) = on_exit.lock().unwrap().take() {
        cb(exit.code);
    }

    // Flipped last: readers that see `exited` can rely on the persisted
    // metadata being final.
    session.exited.store(true, Ordering::SeqCst);
    info!(session = %session.id, code = exit.code, signal = ?exit.signal, "session exited");
}

#[allow(clippy::too_many_arguments)]
fn spawn_input_serializer(
    session: Arc<Session>,
    mut ops_rx: mpsc::Receiver<SessionOp>,
    transcript: Arc<TranscriptWriter>,
    tracker: Arc<StdMutex<CommandTracker>>,
    last_resize: Arc<StdMutex<Option<LastResize>>>,
    cwd: Arc<StdMutex<PathBuf>>,
    title_mode: TitleMode,
    forward_to_stdout: bool,
    errors: mpsc::Sender<SessionTaskError>,
) {
    tokio::spawn(async move {
        let cancel = session.cancel.clone();
        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => break,
                op = ops_rx.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };

            match op {
                SessionOp::Input(text) => {
                    if let Err(e) = transcript.write_input(&text) {
                        debug!(session = %session.id, "input not recorded: {e}");
                    }
                    if title_mode == TitleMode::Static {
                        let home = dirs::home_dir().unwrap_or_else(|| "/".into());
                        let maybe = {
                            let current = cwd.lock().unwrap().clone();
                            sniff_cd(&text, &current, &home)
                        };
                        if let Some(next) = maybe {
                            *cwd.lock().unwrap() = next;
                        }
                    }
                    if let Err(e) = session.pty.write(text.into_bytes()).await {
                        // Input failures go to the sender's side; the
                        // session only dies when the PTY itself is gone.
                        let _ = errors
                            .send(SessionTaskError {
                                session_id: session.id.clone(),
                                message: format!("pty write failed: {e}"),
                            })
                            .await;
                    }
                }
                SessionOp::Resize { cols, rows, source } => {
                    if !resize_allowed(&last_resize, cols, rows, source) {
                        debug!(session = %session.id, ?source, "resize discarded by arbitration");
                        continue;
                    }
                    if let Err(e) = session.pty.resize(cols, rows) {
                        warn!(session = %session.id, "resize failed: {e}");
                        continue;
                    }
                    let _ = transcript.write_resize(cols, rows);
                }
                SessionOp::ResetSize => {
                    // Only meaningful when a real terminal hosts this PTY.
                    if !forward_to_stdout {
                        continue;
                    }
                    let stdin = std::io::stdin();
                    let fd = <std::io::Stdin as std::os::fd::AsFd>::as_fd(&stdin);
                    match terminal_size(fd) {
                        Ok(size) => {
                            if let Err(e) = session.pty.resize(size.cols, size.rows) {
                                warn!(session = %session.id, "reset-size failed: {e}");
                            } else {
                                let _ = transcript.write_resize(size.cols, size.rows);
                            }
                        }
                        Err(e) => debug!(session = %session.id, "reset-size skipped: {e}"),
                    }
                }
                SessionOp::Kill(signal) => {
                    tracker.lock().unwrap().set_exiting();
                    if let Err(e) = session.pty.kill_with_escalation(signal).await {
                        warn!(session = %session.id, "kill failed: {e}");
                    }
                }
                SessionOp::Status { reply } => {
                    let meta = session.meta.read().await.clone();
                    let activity = session.activity(Utc::now()).await;
                    let body = serde_json::json!({
                        "meta": meta,
                        "activity": activity,
                    });
                    if let Ok(payload) = serde_json::to_vec(&body) {
                        let _ = reply
                            .send(crate::ipc::encode_frame(
                                MessageType::StatusResponse,
                                &payload,
                            ))
                            .await;
                    }
                }
            }
        }
    });
}

/// Last-resize-wins with a browser grace window: a terminal resize inside
/// one second of a browser resize is discarded. Rapid repeats are logged.
fn resize_allowed(
    last_resize: &StdMutex<Option<LastResize>>,
    cols: u16,
    rows: u16,
    source: ResizeSource,
) -> bool {
    let now = Instant::now();
    let mut guard = last_resize.lock().unwrap();

    if let Some(prev) = *guard {
        if source == ResizeSource::Terminal
            && prev.source == ResizeSource::Browser
            && now.duration_since(prev.at) < RESIZE_GRACE
        {
            return false;
        }
        if now.duration_since(prev.at) < RESIZE_LOOP_WINDOW {
            warn!(
                "rapid resize loop detected ({:?} apart)",
                now.duration_since(prev.at)
            );
        }
    }

    *guard = Some(LastResize {
        cols,
        rows,
        source,
        at: now,
    });
    true
}

fn spawn_tracker_poll(
    id: String,
    pty: Arc<PtyProcess>,
    tracker: Arc<StdMutex<CommandTracker>>,
    events: EventBus,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fg = pty
                .foreground_pgid()
                .or_else(|| fallback_foreground_pgid(pty.pid()));
            let event = tracker
                .lock()
                .unwrap()
                .observe(fg, lookup_pgid_command, Instant::now());

            match event {
                Some(TrackerEvent::Started { command, at }) => {
                    debug!(session = %id, %command, "command started");
                    events.publish(SessionEvent::CommandStarted {
                        session_id: id.clone(),
                        command,
                        at,
                    });
                }
                Some(TrackerEvent::Finished {
                    command,
                    exit_code,
                    duration,
                    at,
                }) => {
                    info!(session = %id, %command, ?duration, "command finished");
                    events.publish(SessionEvent::CommandFinished {
                        session_id: id.clone(),
                        command,
                        exit_code,
                        duration_ms: duration.as_millis() as u64,
                        at,
                    });
                }
                None => {}
            }
        }
    });
}

fn spawn_title_injector(
    meta: Arc<RwLock<SessionMeta>>,
    cwd: Arc<StdMutex<PathBuf>>,
    last_write: Arc<StdMutex<Instant>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut state = TitleState::new();
        let mut stdout = tokio::io::stdout();
        let mut inject_tick = tokio::time::interval(INJECT_POLL);
        let mut refresh_tick = tokio::time::interval(REFRESH_INTERVAL);
        inject_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh_tick.tick() => {
                    let (name, argv0) = {
                        let guard = meta.read().await;
                        (guard.name.clone(), guard.command.first().cloned().unwrap_or_default())
                    };
                    let dir = cwd.lock().unwrap().clone();
                    state.refresh(static_title_sequence(&name, &dir, &argv0));
                }
                _ = inject_tick.tick() => {
                    let quiet_since = *last_write.lock().unwrap();
                    if let Some(seq) = state.take_if_quiet(quiet_since, Instant::now()) {
                        if stdout.write_all(seq.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                        *last_write.lock().unwrap() = Instant::now();
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_resize_is_discarded_inside_browser_grace() {
        let last = StdMutex::new(None);
        assert!(resize_allowed(&last, 100, 30, ResizeSource::Browser));
        assert!(!resize_allowed(&last, 80, 24, ResizeSource::Terminal));
        // Browser resizes always apply.
        assert!(resize_allowed(&last, 90, 28, ResizeSource::Browser));
    }

    #[test]
    fn terminal_resize_applies_after_the_grace_window() {
        let last = StdMutex::new(None);
        assert!(resize_allowed(&last, 100, 30, ResizeSource::Browser));
        std::thread::sleep(RESIZE_GRACE + std::time::Duration::from_millis(50));
        assert!(resize_allowed(&last, 80, 24, ResizeSource::Terminal));
    }

    #[test]
    fn terminal_resizes_never_open_their_own_window() {
        let last = StdMutex::new(None);
        assert!(resize_allowed(&last, 100, 30, ResizeSource::Terminal));
        // A browser resize right after a terminal one is not blocked.
        assert!(resize_allowed(&last, 90, 28, ResizeSource::Browser));
    }

    #[test]
    fn activity_clock_snapshots_both_stamps() {
        let clock = ActivityClock::default();
        assert_eq!(clock.snapshot(), (None, None));
        clock.mark_output();
        clock.mark_input();
        let (out, input) = clock.snapshot();
        assert!(out.is_some());
        assert!(input.is_some());
    }
}
