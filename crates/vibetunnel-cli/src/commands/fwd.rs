//! The forwarder: run a command in a session while mirroring this terminal
//!
//! Creates the session with stdout forwarding, puts the hosting terminal in
//! raw mode, pumps stdin into the session and propagates window-size
//! changes as terminal-sourced resizes. Exits with the child's exit code.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use anyhow::{bail, Context, Result};
use nix::sys::termios::{self, SetArg};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use vibetunnel_core::config;
use vibetunnel_core::ipc::{ControlCommand, IpcClient};
use vibetunnel_core::pty::terminal_size;
use vibetunnel_core::{
    CreateOptions, InputPayload, ResizeSource, SessionManager, SessionStore, TitleMode,
};

pub struct FwdOptions {
    pub session_id: Option<String>,
    pub title_mode: Option<String>,
    pub update_title: Option<String>,
    pub command: Vec<String>,
}

pub async fn execute(opts: FwdOptions) -> Result<i32> {
    if let Some(title) = &opts.update_title {
        let id = opts
            .session_id
            .as_deref()
            .context("--update-title requires --session-id")?;
        update_title(id, title).await?;
        return Ok(0);
    }

    if opts.command.is_empty() {
        bail!("no command given; usage: vt fwd -- <command> [args…]");
    }

    let title_mode = match &opts.title_mode {
        Some(raw) => raw
            .parse::<TitleMode>()
            .map_err(|e| anyhow::anyhow!(e))?,
        None => config::title_mode_from_env().unwrap_or_default(),
    };

    let stdin = std::io::stdin();
    // The winsize ioctl doubles as the tty probe.
    let size = terminal_size(stdin.as_fd()).ok();
    let is_tty = size.is_some();

    let manager = SessionManager::with_default_root()?;
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<i32>();

    let created = manager
        .create(
            &opts.command,
            CreateOptions {
                session_id: opts.session_id,
                cols: size.map(|s| s.cols),
                rows: size.map(|s| s.rows),
                forward_to_stdout: true,
                title_mode,
                on_exit: Some(Box::new(move |code| {
                    let _ = exit_tx.send(code);
                })),
                ..Default::default()
            },
        )
        .await?;
    let id = created.id.clone();
    info!(session = %id, "forwarding session started");

    // Raw mode for the hosting terminal, restored on every exit path.
    let _raw_guard = is_tty.then(|| RawModeGuard::new(stdin.as_raw_fd())).transpose()?;

    spawn_stdin_pump(manager.clone(), id.clone());
    spawn_winch_listener(manager.clone(), id.clone());
    spawn_signal_listener(manager.clone(), id.clone());

    let code = exit_rx.await.unwrap_or(1);
    debug!(session = %id, code, "session finished");
    manager.shutdown().await;
    Ok(code)
}

/// `vt fwd --update-title <text> --session-id <id>`: IPC first, metadata
/// rewrite when the socket is gone.
async fn update_title(id: &str, title: &str) -> Result<()> {
    let store = SessionStore::new(config::control_root())?;
    let socket = store.paths(id).socket;

    match IpcClient::connect(&socket).await {
        Ok(mut client) => {
            client
                .send_control(&ControlCommand::UpdateTitle {
                    title: title.to_string(),
                })
                .await?;
            debug!(session = %id, "title update sent over ipc");
        }
        Err(e) => {
            debug!(session = %id, "socket unavailable ({e}), rewriting metadata");
            let name = store.update_name(id, title).await?;
            println!("renamed to {name}");
        }
    }
    Ok(())
}

fn spawn_stdin_pump(manager: std::sync::Arc<SessionManager>, id: String) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if manager
                        .send_input(
                            &id,
                            InputPayload {
                                text: Some(text),
                                key: None,
                            },
                        )
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!("stdin read error: {e}");
                    break;
                }
            }
        }
    });
}

fn spawn_winch_listener(manager: std::sync::Arc<SessionManager>, id: String) {
    tokio::spawn(async move {
        let Ok(mut winch) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        else {
            return;
        };
        while winch.recv().await.is_some() {
            let stdin = std::io::stdin();
            if let Ok(size) = terminal_size(stdin.as_fd()) {
                let _ = manager
                    .resize_from(&id, size.cols, size.rows, ResizeSource::Terminal)
                    .await;
            }
        }
    });
}

fn spawn_signal_listener(manager: std::sync::Arc<SessionManager>, id: String) {
    tokio::spawn(async move {
        let Ok(mut term) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        if term.recv().await.is_some() {
            info!(session = %id, "SIGTERM received, killing session");
            let _ = manager.kill(&id, None).await;
        }
    });
}

/// Puts an fd into raw mode; restores the original termios on drop.
struct RawModeGuard {
    fd: i32,
    original: termios::Termios,
}

impl RawModeGuard {
    fn new(fd: i32) -> Result<Self> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let original = termios::tcgetattr(borrowed)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, SetArg::TCSANOW, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = termios::tcsetattr(borrowed, SetArg::TCSANOW, &self.original);
    }
}
