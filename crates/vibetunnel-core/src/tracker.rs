//! Foreground-process tracking: command started / command finished
//!
//! Every 500 ms the session polls the PTY's foreground process group.
//! Moving away from the shell's group starts a command; returning to it
//! finishes one. Short-lived commands and shell builtins are suppressed,
//! except that anything with `claude` in its name always reports.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Poll cadence for the foreground group.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Minimum runtime before a finished command is worth announcing.
pub const MIN_NOTIFY_DURATION: Duration = Duration::from_secs(3);

const SHELL_BUILTINS: &[&str] = &["cd", "ls", "pwd", "echo", "export", "alias", "unset"];

/// A command currently holding the foreground.
#[derive(Debug, Clone)]
pub struct RunningCommand {
    pub pgid: i32,
    pub command: String,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

/// What one poll observed.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Started {
        command: String,
        at: DateTime<Utc>,
    },
    Finished {
        command: String,
        /// Best-effort; 0 when the kernel already reaped the group leader.
        exit_code: i32,
        duration: Duration,
        at: DateTime<Utc>,
    },
}

/// Per-session tracking state. Pure against its inputs: the poll loop
/// feeds it the observed foreground group and an argv lookup.
#[derive(Debug)]
pub struct CommandTracker {
    shell_pgid: i32,
    foreground: i32,
    current: Option<RunningCommand>,
    exiting: bool,
}

impl CommandTracker {
    /// `shell_pgid` is the child's process group at spawn: after setsid the
    /// child leads its own group, so this equals the child pid.
    pub fn new(shell_pgid: i32) -> Self {
        Self {
            shell_pgid,
            foreground: shell_pgid,
            current: None,
            exiting: false,
        }
    }

    /// Mark teardown; later observations produce no events.
    pub fn set_exiting(&mut self) {
        self.exiting = true;
    }

    pub fn current_command(&self) -> Option<&RunningCommand> {
        self.current.as_ref()
    }

    /// Feed one observation of the foreground group.
    pub fn observe(
        &mut self,
        fg: Option<i32>,
        lookup: impl FnOnce(i32) -> Option<String>,
        now: Instant,
    ) -> Option<TrackerEvent> {
        if self.exiting {
            return None;
        }
        let fg = fg?;
        if fg == self.foreground {
            return None;
        }

        let previous = self.foreground;
        self.foreground = fg;

        if fg == self.shell_pgid && previous != self.shell_pgid {
            let finished = self.current.take()?;
            let duration = now.duration_since(finished.started);
            if !should_notify(&finished.command, duration) {
                debug!(command = %finished.command, ?duration, "suppressing short command");
                return None;
            }
            return Some(TrackerEvent::Finished {
                command: finished.command,
                exit_code: 0,
                duration,
                at: Utc::now(),
            });
        }

        if previous == self.shell_pgid {
            let command = lookup(fg).unwrap_or_default();
            let started_at = Utc::now();
            self.current = Some(RunningCommand {
                pgid: fg,
                command: command.clone(),
                started: now,
                started_at,
            });
            return Some(TrackerEvent::Started {
                command,
                at: started_at,
            });
        }

        None
    }
}

/// Whether a finished command merits a notification: builtins never,
/// `claude` always, everything else only past the duration floor.
pub fn should_notify(command: &str, duration: Duration) -> bool {
    let name = leading_token(command);
    if SHELL_BUILTINS.contains(&name.as_str()) {
        return false;
    }
    if command.contains("claude") {
        return true;
    }
    duration >= MIN_NOTIFY_DURATION
}

fn leading_token(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or("");
    Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| first.to_string())
}

/// Fallback foreground detection for when the terminal will not say:
/// walk the process tree under `root` and report the process group of
/// the most recently started non-shell descendant.
#[cfg(target_os = "linux")]
pub fn fallback_foreground_pgid(root: u32) -> Option<i32> {
    #[derive(Debug)]
    struct Proc {
        pid: u32,
        ppid: u32,
        pgid: i32,
        comm: String,
        start_time: u64,
    }

    let mut procs = Vec::new();
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        // comm sits in parentheses and may itself contain spaces.
        let Some(close) = stat.rfind(')') else { continue };
        let comm = stat[stat.find('(').map(|i| i + 1).unwrap_or(0)..close].to_string();
        let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
        // After comm: state ppid pgrp …; starttime is the 20th field here.
        let (Some(ppid), Some(pgid), Some(start_time)) = (
            fields.get(1).and_then(|f| f.parse().ok()),
            fields.get(2).and_then(|f| f.parse().ok()),
            fields.get(19).and_then(|f| f.parse().ok()),
        ) else {
            continue;
        };
        procs.push(Proc {
            pid,
            ppid,
            pgid,
            comm,
            start_time,
        });
    }

    let mut frontier = vec![root];
    let mut descendants: Vec<&Proc> = Vec::new();
    while let Some(parent) = frontier.pop() {
        for proc in procs.iter().filter(|p| p.ppid == parent) {
            frontier.push(proc.pid);
            descendants.push(proc);
        }
    }

    descendants
        .into_iter()
        .filter(|p| !is_shell_comm(&p.comm))
        .max_by_key(|p| p.start_time)
        .map(|p| p.pgid)
        .or_else(|| procs.iter().find(|p| p.pid == root).map(|p| p.pgid))
}

#[cfg(not(target_os = "linux"))]
pub fn fallback_foreground_pgid(_root: u32) -> Option<i32> {
    None
}

#[cfg(target_os = "linux")]
fn is_shell_comm(comm: &str) -> bool {
    matches!(comm, "sh" | "bash" | "zsh" | "fish" | "dash" | "ksh")
}

/// Argv of a process group's leader, joined into a command line.
///
/// `/proc` is authoritative where it exists; elsewhere `ps` answers.
pub fn lookup_pgid_command(pgid: i32) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(raw) = std::fs::read(format!("/proc/{pgid}/cmdline")) {
            let joined = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            if !joined.is_empty() {
                return Some(joined);
            }
        }
    }

    let output = std::process::Command::new("ps")
        .args(["-o", "args=", "-p"])
        .arg(pgid.to_string())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let line = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHELL: i32 = 100;
    const CMD: i32 = 200;

    fn tick(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn command_start_and_long_finish_are_reported() {
        let t0 = Instant::now();
        let mut tracker = CommandTracker::new(SHELL);

        let started = tracker.observe(Some(CMD), |_| Some("sleep 4".into()), t0);
        assert!(matches!(
            started,
            Some(TrackerEvent::Started { ref command, .. }) if command == "sleep 4"
        ));

        let finished = tracker.observe(Some(SHELL), |_| None, t0 + tick(4000));
        match finished {
            Some(TrackerEvent::Finished {
                command,
                duration,
                exit_code,
                ..
            }) => {
                assert_eq!(command, "sleep 4");
                assert!(duration >= tick(4000));
                assert_eq!(exit_code, 0);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn short_commands_are_suppressed() {
        let t0 = Instant::now();
        let mut tracker = CommandTracker::new(SHELL);
        tracker.observe(Some(CMD), |_| Some("ls -la".into()), t0);
        assert!(tracker.observe(Some(SHELL), |_| None, t0 + tick(500)).is_none());
    }

    #[test]
    fn duration_floor_is_exactly_three_seconds() {
        assert!(!should_notify("make build", tick(2999)));
        assert!(should_notify("make build", tick(3000)));
    }

    #[test]
    fn claude_bypasses_the_duration_floor() {
        assert!(should_notify("claude --continue", tick(1)));
        assert!(should_notify("/usr/local/bin/claude", tick(1)));
    }

    #[test]
    fn builtins_never_notify() {
        for builtin in ["cd /tmp", "ls", "pwd", "echo hi", "export A=1", "alias x=y", "unset A"] {
            assert!(!should_notify(builtin, tick(10_000)), "{builtin}");
        }
    }

    #[test]
    fn no_event_between_two_foreign_groups() {
        let t0 = Instant::now();
        let mut tracker = CommandTracker::new(SHELL);
        tracker.observe(Some(CMD), |_| Some("vim".into()), t0);
        // Foreground hops to another non-shell group (a subprocess).
        assert!(tracker.observe(Some(300), |_| None, t0 + tick(100)).is_none());
        // Returning to the shell still closes out the original command.
        let finished = tracker.observe(Some(SHELL), |_| None, t0 + tick(5000));
        assert!(matches!(
            finished,
            Some(TrackerEvent::Finished { ref command, .. }) if command == "vim"
        ));
    }

    #[test]
    fn exiting_flag_suppresses_teardown_noise() {
        let t0 = Instant::now();
        let mut tracker = CommandTracker::new(SHELL);
        tracker.observe(Some(CMD), |_| Some("sleep 100".into()), t0);
        tracker.set_exiting();
        assert!(tracker.observe(Some(SHELL), |_| None, t0 + tick(9000)).is_none());
    }

    #[test]
    fn unchanged_foreground_is_quiet() {
        let t0 = Instant::now();
        let mut tracker = CommandTracker::new(SHELL);
        assert!(tracker.observe(Some(SHELL), |_| None, t0).is_none());
        assert!(tracker.observe(None, |_| None, t0).is_none());
    }

    #[test]
    fn lookup_finds_this_process() {
        let me = std::process::id() as i32;
        let cmd = lookup_pgid_command(me).expect("own cmdline");
        assert!(!cmd.is_empty());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn tree_walk_finds_a_spawned_descendant() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");

        // Give /proc a moment to reflect the new process.
        std::thread::sleep(Duration::from_millis(50));
        let pgid = fallback_foreground_pgid(std::process::id());
        assert!(pgid.is_some(), "no descendant found");

        let _ = child.kill();
        let _ = child.wait();
    }
}
