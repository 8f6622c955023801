//! `vt list` — sessions under the control root

use anyhow::Result;
use colored::Colorize;

use vibetunnel_core::{SessionManager, SessionStatus};

pub async fn execute(json: bool) -> Result<()> {
    let manager = SessionManager::with_default_root()?;
    let entries = manager.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<9} {:<8} {:<7} COMMAND",
        "ID", "NAME", "STATUS", "PID", "ACTIVE"
    );
    for entry in entries {
        let meta = &entry.meta;
        let status = match meta.status {
            SessionStatus::Starting => "starting".yellow(),
            SessionStatus::Running => "running".green(),
            SessionStatus::Exited => "exited".red(),
        };
        println!(
            "{:<38} {:<20} {:<9} {:<8} {:<7} {}",
            meta.id,
            truncate(&meta.name, 20),
            status,
            meta.pid.map(|p| p.to_string()).unwrap_or_default(),
            if entry.activity.is_active { "yes" } else { "no" },
            meta.command.join(" "),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{cut}…")
    }
}
