//! Command resolution for session creation
//!
//! `argv[0]` is resolved against the user's shell aliases first, then
//! `$PATH`; if neither matches, the whole command line is handed to the
//! user's login shell so shell functions and builtins still work.

use std::env;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

/// Returns the user's shell, falling back through the usual suspects.
pub async fn default_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    for shell in ["/bin/zsh", "/bin/bash", "/bin/sh"] {
        if tokio::fs::metadata(shell).await.is_ok() {
            return shell.to_string();
        }
    }
    String::from("sh")
}

/// Resolve the argv to spawn.
///
/// The returned vector is what actually gets exec'd and what is recorded
/// in session metadata.
pub async fn resolve_command(argv: &[String]) -> Vec<String> {
    if argv.is_empty() {
        return vec![default_shell().await];
    }

    let program = &argv[0];

    // Explicit paths are taken at face value; the PTY host validates them.
    if program.contains('/') {
        return argv.to_vec();
    }

    if let Some(expansion) = resolve_alias(program).await {
        debug!(%program, %expansion, "resolved via shell alias");
        if let Ok(mut expanded) = shell_words::split(&expansion) {
            expanded.extend(argv[1..].iter().cloned());
            return expanded;
        }
    }

    if let Ok(path) = which::which(program) {
        let mut resolved = vec![path.to_string_lossy().to_string()];
        resolved.extend(argv[1..].iter().cloned());
        return resolved;
    }

    // Unknown to us: let the login shell try (functions, builtins, plugins).
    let shell = default_shell().await;
    debug!(%program, %shell, "falling back to login shell");
    vec![
        shell,
        "-i".to_string(),
        "-c".to_string(),
        shell_words::join(argv),
    ]
}

/// Ask the user's interactive shell whether `name` is an alias.
///
/// Output format is `name='expansion'` (bash) or `name=expansion` (zsh);
/// anything unparseable is treated as no alias.
async fn resolve_alias(name: &str) -> Option<String> {
    let shell = default_shell().await;
    let shell_name = Path::new(&shell).file_name()?.to_str()?;
    if !matches!(shell_name, "bash" | "zsh") {
        return None;
    }

    let output = Command::new(&shell)
        .args(["-i", "-c"])
        .arg(format!("alias {name}"))
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next()?;
    let (_, rhs) = line.split_once('=')?;
    let rhs = rhs.trim();
    let rhs = rhs
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(rhs);
    if rhs.is_empty() {
        None
    } else {
        Some(rhs.to_string())
    }
}
