//! PTY host: one child process attached to a pseudo-terminal
//!
//! Owns the master fd for the session's lifetime. Output is read on a
//! dedicated blocking thread and delivered over a bounded channel; the
//! kernel's PTY buffer provides backpressure upstream of that.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill as nix_kill, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvpe, fork, setsid, tcgetpgrp, ForkResult, Pid};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::types::WinSize;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);

/// Grace period before SIGTERM escalates to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);
/// Liveness poll interval during escalation.
const KILL_POLL: Duration = Duration::from_millis(500);
/// Wait for the kernel to reap after SIGKILL.
const KILL_REAP_WAIT: Duration = Duration::from_millis(100);

const OUTPUT_CHANNEL_DEPTH: usize = 256;
const READ_CHUNK: usize = 8192;

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<i32>,
}

/// What to spawn and in which environment.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Argv after alias and `$PATH` resolution; `argv[0]` is the program.
    pub argv: Vec<String>,
    /// Extra environment entries layered over the inherited environment.
    pub env: Vec<(String, String)>,
    pub cwd: std::path::PathBuf,
    /// Absent means "inherit the enclosing terminal's natural size".
    pub size: Option<WinSize>,
}

/// Allocate a PTY pair: CLOEXEC on the master, UTF-8 input mode on the
/// slave where the platform supports it.
pub fn open_pair(size: Option<WinSize>) -> Result<(OwnedFd, OwnedFd)> {
    let winsize = size.map(|s| Winsize {
        ws_row: s.rows,
        ws_col: s.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    });

    let pair = openpty(winsize.as_ref(), None)
        .map_err(|e| CoreError::PtyAllocationFailed(e.to_string()))?;

    fcntl(pair.master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| CoreError::IoctlFailed(format!("FD_CLOEXEC on master: {e}")))?;

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    {
        let slave_fd = pair.slave.as_fd();
        let mut termios =
            tcgetattr(slave_fd).map_err(|e| CoreError::IoctlFailed(format!("tcgetattr: {e}")))?;
        termios.input_flags |= InputFlags::IUTF8;
        tcsetattr(slave_fd, SetArg::TCSANOW, &termios)
            .map_err(|e| CoreError::IoctlFailed(format!("tcsetattr IUTF8: {e}")))?;
    }

    Ok((pair.master, pair.slave))
}

/// One spawned child with its controlling pseudo-terminal.
#[derive(Debug)]
pub struct PtyProcess {
    child: Pid,
    master: OwnedFd,
    writer: Arc<Mutex<File>>,
    output_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    argv: Vec<String>,
}

impl PtyProcess {
    /// Fork a child attached to a fresh PTY.
    ///
    /// In the child, before exec: signal dispositions reset to default, a
    /// new session is created, the slave becomes the controlling terminal,
    /// stdio is redirected onto it, and both PTY fds are closed.
    pub fn spawn(spec: SpawnSpec) -> Result<Self> {
        let program = spec
            .argv
            .first()
            .ok_or_else(|| CoreError::SpawnFailed("empty argv".into()))?
            .clone();

        if !spec.cwd.is_dir() {
            return Err(CoreError::WorkingDirMissing(spec.cwd.clone()));
        }
        preflight_program(&program, &spec.cwd)?;

        let (master, slave) = open_pair(spec.size)?;

        // Everything the child needs, built before fork: no allocation is
        // allowed between fork and exec.
        let prog_c = CString::new(program.clone())
            .map_err(|_| CoreError::SpawnFailed("argv contains NUL".into()))?;
        let argv_c: Vec<CString> = spec
            .argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| CoreError::SpawnFailed("argv contains NUL".into()))?;
        let envp_c = build_envp(&spec.env)?;
        let cwd_c = CString::new(spec.cwd.as_os_str().as_encoded_bytes())
            .map_err(|_| CoreError::SpawnFailed("cwd contains NUL".into()))?;

        let child = match unsafe { fork() }
            .map_err(|e| CoreError::SpawnFailed(format!("fork: {e}")))?
        {
            ForkResult::Parent { child } => child,
            ForkResult::Child => exec_child(
                &prog_c,
                &argv_c,
                &envp_c,
                &cwd_c,
                slave.as_raw_fd(),
                master.as_raw_fd(),
            ),
        };

        drop(slave);
        info!(pid = child.as_raw(), program = %program, "spawned pty child");

        // Writer: an owned dup so the reader thread and ioctls keep the
        // original master.
        let writer_fd = nix::unistd::dup(master.as_raw_fd())
            .map_err(|e| CoreError::SpawnFailed(format!("dup master: {e}")))?;
        let writer = Arc::new(Mutex::new(unsafe { File::from_raw_fd(writer_fd) }));

        let output_rx = start_reader(&master)?;
        let exit_rx = start_reaper(child);

        Ok(Self {
            child,
            master,
            writer,
            output_rx: Mutex::new(Some(output_rx)),
            exit_rx,
            argv: spec.argv,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.as_raw() as u32
    }

    /// Take the output channel. Yields raw bytes as the kernel delivers
    /// them; closes on EOF or read error.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.lock().unwrap().take()
    }

    /// Wait for the child to exit. Resolves exactly once per child; safe to
    /// call from multiple tasks.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = *rx.borrow() {
                return info;
            }
            if rx.changed().await.is_err() {
                // Reaper gone without reporting; treat as abnormal exit.
                return ExitInfo {
                    code: 1,
                    signal: None,
                };
            }
        }
    }

    /// Exit status if the child has already been reaped.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none() && nix_kill(self.child, None).is_ok()
    }

    /// Write input bytes to the master. Blocking writes run off the async
    /// runtime; callers serialize through the session's input FIFO.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = writer.lock().unwrap();
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Other(format!("pty write task: {e}")))?
    }

    /// Issue the window-size ioctl on the master.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { tiocswinsz(self.master.as_raw_fd(), &winsize) }
            .map_err(|e| CoreError::IoctlFailed(format!("TIOCSWINSZ: {e}")))?;
        Ok(())
    }

    /// Process group currently in the foreground of this PTY.
    pub fn foreground_pgid(&self) -> Option<i32> {
        tcgetpgrp(self.master.as_fd()).ok().map(Pid::as_raw)
    }

    /// Send a signal to the child only — never the process group, which may
    /// be shared with sibling sessions.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        match nix_kill(self.child, signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(CoreError::Other(format!(
                "kill {signal} pid {}: {e}",
                self.child
            ))),
        }
    }

    /// Kill with escalation: SIGTERM, poll every 500 ms, SIGKILL after 3 s,
    /// then a short reap wait. SIGKILL requests skip the grace period.
    /// A `tmux attach` child is first asked to detach gracefully.
    pub async fn kill_with_escalation(&self, signal: Signal) -> Result<()> {
        if signal == Signal::SIGKILL {
            self.kill(Signal::SIGKILL)?;
            tokio::time::sleep(KILL_REAP_WAIT).await;
            return Ok(());
        }

        if is_tmux_attach(&self.argv) && self.try_tmux_detach().await {
            return Ok(());
        }

        self.kill(signal)?;
        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(KILL_POLL).await;
            if !self.is_alive() {
                debug!(pid = self.pid(), "child exited within grace period");
                return Ok(());
            }
        }

        warn!(pid = self.pid(), "child survived {signal}, sending SIGKILL");
        self.kill(Signal::SIGKILL)?;
        tokio::time::sleep(KILL_REAP_WAIT).await;
        Ok(())
    }

    /// Graceful tmux detach: `C-b d`, then `:detach-client`. Returns true
    /// if the child went away without a signal.
    async fn try_tmux_detach(&self) -> bool {
        info!(pid = self.pid(), "tmux attach detected, detaching instead of killing");
        if self.write(b"\x02d".to_vec()).await.is_err() {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        if !self.is_alive() {
            return true;
        }

        if self.write(b":detach-client\n".to_vec()).await.is_err() {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        !self.is_alive()
    }
}

/// Probe the current terminal size of an arbitrary tty fd.
pub fn terminal_size(fd: BorrowedFd<'_>) -> Result<WinSize> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { tiocgwinsz(fd.as_raw_fd(), &mut winsize) }
        .map_err(|e| CoreError::IoctlFailed(format!("TIOCGWINSZ: {e}")))?;
    Ok(WinSize::new(winsize.ws_col, winsize.ws_row))
}

/// Validate the program before forking so spawn failures surface with the
/// user-facing taxonomy instead of a bare exit 127.
fn preflight_program(program: &str, cwd: &Path) -> Result<()> {
    if program.contains('/') {
        let path = Path::new(program);
        if !path.exists() {
            return Err(CoreError::from_spawn_errno(libc::ENOENT, program, cwd));
        }
        if nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_err() {
            return Err(CoreError::from_spawn_errno(libc::EACCES, program, cwd));
        }
    }
    Ok(())
}

fn build_envp(extra: &[(String, String)]) -> Result<Vec<CString>> {
    let mut merged: std::collections::BTreeMap<String, String> = std::env::vars().collect();
    for (k, v) in extra {
        merged.insert(k.clone(), v.clone());
    }
    merged
        .into_iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}"))
                .map_err(|_| CoreError::SpawnFailed("environment contains NUL".into()))
        })
        .collect()
}

/// Child-side setup between fork and exec. Only async-signal-safe calls.
fn exec_child(
    prog: &CString,
    argv: &[CString],
    envp: &[CString],
    cwd: &CString,
    slave_fd: i32,
    master_fd: i32,
) -> ! {
    unsafe {
        for sig in 1..32 {
            libc::signal(sig, libc::SIG_DFL);
        }

        libc::close(master_fd);

        if setsid().is_err() {
            libc::_exit(1);
        }
        if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
            libc::_exit(1);
        }

        if libc::dup2(slave_fd, 0) < 0
            || libc::dup2(slave_fd, 1) < 0
            || libc::dup2(slave_fd, 2) < 0
        {
            libc::_exit(1);
        }
        if slave_fd > 2 {
            libc::close(slave_fd);
        }

        if libc::chdir(cwd.as_ptr()) < 0 {
            libc::_exit(1);
        }
    }

    let _ = execvpe(prog, argv, envp);
    // exec only returns on failure; 127 is the conventional not-found code.
    unsafe { libc::_exit(127) }
}

/// Blocking reader thread: master -> bounded channel.
fn start_reader(master: &OwnedFd) -> Result<mpsc::Receiver<Bytes>> {
    let reader_fd = nix::unistd::dup(master.as_raw_fd())
        .map_err(|e| CoreError::SpawnFailed(format!("dup master for reader: {e}")))?;
    let mut reader = unsafe { File::from_raw_fd(reader_fd) };

    let (tx, rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_DEPTH);
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                // EIO is the normal "slave side closed" end on Linux.
                Err(e) => {
                    if e.raw_os_error() != Some(libc::EIO) {
                        debug!("pty read error: {e}");
                    }
                    break;
                }
            }
        }
    });
    Ok(rx)
}

/// Blocking reaper: waitpid -> watch channel, reported exactly once.
fn start_reaper(child: Pid) -> watch::Receiver<Option<ExitInfo>> {
    let (tx, rx) = watch::channel(None);
    tokio::task::spawn_blocking(move || {
        let info = match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => ExitInfo {
                code,
                signal: None,
            },
            Ok(WaitStatus::Signaled(_, sig, _)) => ExitInfo {
                code: 128 + sig as i32,
                signal: Some(sig as i32),
            },
            Ok(other) => {
                warn!(?other, "unexpected wait status");
                ExitInfo {
                    code: 1,
                    signal: None,
                }
            }
            Err(e) => {
                warn!("waitpid({child}): {e}");
                ExitInfo {
                    code: 1,
                    signal: None,
                }
            }
        };
        let _ = tx.send(Some(info));
    });
    rx
}

/// Whether the spawned command is a tmux attach, which gets the graceful
/// detach treatment on kill.
fn is_tmux_attach(argv: &[String]) -> bool {
    let Some(first) = argv.first() else {
        return false;
    };
    let program = Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    program == "tmux"
        && argv
            .iter()
            .skip(1)
            .any(|a| a == "attach" || a == "attach-session" || a == "a")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(argv: &[&str]) -> SpawnSpec {
        SpawnSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec![("TERM".into(), "xterm-256color".into())],
            cwd: std::env::temp_dir(),
            size: Some(WinSize::new(80, 24)),
        }
    }

    #[tokio::test]
    async fn echo_output_and_exit_code() {
        let pty = PtyProcess::spawn(spec(&["/bin/echo", "hello"])).unwrap();
        let mut rx = pty.take_output().unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("hello"), "got: {text:?}");

        let exit = pty.wait_exit().await;
        assert_eq!(exit.code, 0);
        assert_eq!(exit.signal, None);
    }

    #[tokio::test]
    async fn spawn_missing_command_is_rewritten() {
        let err = PtyProcess::spawn(spec(&["/no/such/binary"])).unwrap_err();
        assert!(matches!(err, CoreError::CommandNotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn spawn_missing_cwd_is_rewritten() {
        let mut s = spec(&["/bin/echo", "x"]);
        s.cwd = "/no/such/dir".into();
        let err = PtyProcess::spawn(s).unwrap_err();
        assert!(matches!(err, CoreError::WorkingDirMissing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn write_reaches_the_child() {
        let pty = PtyProcess::spawn(spec(&["/bin/cat"])).unwrap();
        let mut rx = pty.take_output().unwrap();

        pty.write(b"ping\n".to_vec()).await.unwrap();

        let mut seen = Vec::new();
        while let Some(chunk) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap()
        {
            seen.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&seen).contains("ping") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("ping"));

        pty.kill(Signal::SIGKILL).unwrap();
        let exit = pty.wait_exit().await;
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn resize_is_visible_to_the_child() {
        let pty = PtyProcess::spawn(spec(&["/bin/sleep", "5"])).unwrap();
        pty.resize(132, 43).unwrap();

        let winsize = {
            let mut ws = Winsize {
                ws_row: 0,
                ws_col: 0,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            unsafe { tiocgwinsz(pty.master.as_raw_fd(), &mut ws) }.unwrap();
            ws
        };
        assert_eq!((winsize.ws_col, winsize.ws_row), (132, 43));

        pty.kill(Signal::SIGKILL).unwrap();
        pty.wait_exit().await;
    }

    #[tokio::test]
    async fn sigterm_escalates_to_sigkill_within_bounds() {
        // A child that traps SIGTERM and sleeps.
        let pty = PtyProcess::spawn(spec(&[
            "/bin/sh",
            "-c",
            "trap '' TERM; sleep 10",
        ]))
        .unwrap();

        let started = std::time::Instant::now();
        pty.kill_with_escalation(Signal::SIGTERM).await.unwrap();
        let exit = pty.wait_exit().await;
        let elapsed = started.elapsed();

        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert!(elapsed >= Duration::from_secs(3), "escalated too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "escalated too late: {elapsed:?}");
    }

    #[tokio::test]
    async fn foreground_pgid_matches_child_at_start() {
        let pty = PtyProcess::spawn(spec(&["/bin/sleep", "5"])).unwrap();
        // The child called setsid + TIOCSCTTY, so it leads the fg group.
        let fg = pty.foreground_pgid();
        assert_eq!(fg, Some(pty.pid() as i32));
        pty.kill(Signal::SIGKILL).unwrap();
        pty.wait_exit().await;
    }

    #[test]
    fn tmux_attach_detection() {
        let to_vec = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(is_tmux_attach(&to_vec(&["tmux", "attach"])));
        assert!(is_tmux_attach(&to_vec(&["/usr/bin/tmux", "attach-session", "-t", "x"])));
        assert!(!is_tmux_attach(&to_vec(&["tmux", "new-session"])));
        assert!(!is_tmux_attach(&to_vec(&["vim"])));
    }
}
